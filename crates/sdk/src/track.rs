// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Automatic tracking of function calls.
//!
//! [`Track`] wraps one call in a span. If a trace is current the span joins
//! it, nested under the current span; otherwise an implicit trace is created
//! for the call and delivered when it returns.
//!
//! There are four entry points, chosen by the caller's calling convention:
//!
//! | | infallible | `Result` |
//! |---|---|---|
//! | sync | [`Track::call`] | [`Track::try_call`] |
//! | async | [`Track::call_async`] | [`Track::try_call_async`] |
//!
//! Arguments registered with [`Track::arg`] become the span input; names
//! that look sensitive (`password`, `api_key`, `auth_token`, ...) are
//! replaced by `"[REDACTED]"`. The return value becomes the span output.
//! Errors and panics are recorded and then passed through unchanged.
//!
//! ```no_run
//! # fn demo(client: &sprintlens::Client) {
//! let sum = client
//!     .track("add")
//!     .arg("x", &2)
//!     .arg("y", &3)
//!     .call(|| 2 + 3);
//! assert_eq!(sum, 5);
//! # }
//! ```

use crate::client::Client;
use crate::context::{self, FutureExt as _};
use crate::span::{CancelOnDrop, Span};
use crate::trace::Trace;
use futures::FutureExt as _;
use serde::Serialize;
use serde_json::{Map, Value};
use sprintlens_core::payload::{self, PayloadLimits, REDACTED};
use sprintlens_core::{ErrorInfo, SpanType};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

/// One tracked call. Created by [`Client::track`] or [`crate::global::track`].
#[derive(Debug)]
pub struct Track {
    client: Client,
    name: String,
    span_type: SpanType,
    args: Map<String, Value>,
    tags: Vec<(String, String)>,
    metadata: Vec<(String, Value)>,
    capture_input: bool,
    capture_output: bool,
    limits: PayloadLimits,
}

// Span and trace of one tracked call.
struct Opened {
    span: Span,
    implicit: Option<Trace>,
}

// Delivers an implicit trace if the call never completes normally.
struct DeliverOnDrop {
    client: Client,
    trace: Option<Trace>,
}

impl DeliverOnDrop {
    fn disarm(mut self) -> Option<Trace> {
        self.trace.take()
    }
}

impl Drop for DeliverOnDrop {
    fn drop(&mut self) {
        if let Some(trace) = self.trace.take() {
            self.client.log_trace(&trace);
        }
    }
}

impl Track {
    pub fn new(client: &Client, name: impl Into<String>) -> Self {
        Self {
            client: client.clone(),
            name: name.into(),
            span_type: SpanType::Custom,
            args: Map::new(),
            tags: Vec::new(),
            metadata: Vec::new(),
            capture_input: true,
            capture_output: true,
            limits: client.config().payload_limits(),
        }
    }

    /// Record a named argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Self {
        let value = if payload::is_sensitive(name) {
            Value::String(REDACTED.to_string())
        } else {
            payload::redact_sensitive(payload::to_payload(value, self.limits))
        };
        self.args.insert(name.to_string(), value);
        self
    }

    pub fn span_type(mut self, span_type: SpanType) -> Self {
        self.span_type = span_type;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.push((key.into(), value.to_string()));
        self
    }

    pub fn metadata<T: Serialize + ?Sized>(mut self, key: impl Into<String>, value: &T) -> Self {
        self.metadata
            .push((key.into(), payload::to_payload(value, self.limits)));
        self
    }

    /// Whether the arguments are recorded as input. Defaults to `true`.
    pub fn capture_input(mut self, capture: bool) -> Self {
        self.capture_input = capture;
        self
    }

    /// Whether the return value is recorded as output. Defaults to `true`.
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    fn open(&self) -> Opened {
        let (trace, implicit) = match context::current_trace() {
            Some(trace) => (trace, None),
            None => {
                let trace = self.client.trace(self.name.clone());
                (trace.clone(), Some(trace))
            }
        };

        let mut builder = trace.span(self.name.clone()).span_type(self.span_type);
        if self.capture_input && !self.args.is_empty() {
            builder = builder.input(&self.args);
        }
        for (key, value) in &self.tags {
            builder = builder.tag(key.clone(), value);
        }
        for (key, value) in &self.metadata {
            builder = builder.metadata(key.clone(), value);
        }
        let span = builder.build();

        if let Some(trace) = &implicit {
            if let Some(input) = span.input() {
                trace.set_input(&input);
            }
        }
        Opened { span, implicit }
    }

    fn record_output<T: Serialize>(&self, span: &Span, value: &T) {
        if self.capture_output {
            span.set_output(value);
        }
    }

    /// Copy the span outcome onto the implicit trace.
    fn mirror(span: &Span, trace: &Trace) {
        if let Some(output) = span.output() {
            trace.set_output(&output);
        }
        if let Some(error) = span.error() {
            trace.set_error_info(error);
        }
    }

    /// Track a synchronous call.
    pub fn call<T, F>(self, f: F) -> T
    where
        T: Serialize,
        F: FnOnce() -> T,
    {
        self.run_sync(|| Ok::<T, std::convert::Infallible>(f()))
            .unwrap_or_else(|never| match never {})
    }

    /// Track a synchronous call returning `Result`; `Err` is recorded.
    pub fn try_call<T, E, F>(self, f: F) -> Result<T, E>
    where
        T: Serialize,
        E: std::error::Error,
        F: FnOnce() -> Result<T, E>,
    {
        self.run_sync(f)
    }

    fn run_sync<T, E, F>(self, f: F) -> Result<T, E>
    where
        T: Serialize,
        E: std::error::Error,
        F: FnOnce() -> Result<T, E>,
    {
        let Opened { span, implicit } = self.open();
        let deliver = DeliverOnDrop {
            client: self.client.clone(),
            trace: implicit,
        };

        let outcome = {
            let _trace_scope = deliver.trace.as_ref().map(Trace::enter);
            let guard = span.enter();
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            match &outcome {
                Ok(Ok(value)) => self.record_output(&span, value),
                Ok(Err(e)) => guard.record_error(e),
                Err(payload) => span.set_error_info(ErrorInfo::from_panic(&**payload)),
            }
            drop(guard);
            outcome
        };

        if let Some(trace) = deliver.disarm() {
            Self::mirror(&span, &trace);
            self.client.log_trace(&trace);
        }
        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Track an async call.
    pub async fn call_async<T, Fut>(self, fut: Fut) -> T
    where
        T: Serialize,
        Fut: Future<Output = T>,
    {
        match self
            .run_async(async { Ok::<T, std::convert::Infallible>(fut.await) })
            .await
        {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Track an async call returning `Result`; `Err` is recorded.
    pub async fn try_call_async<T, E, Fut>(self, fut: Fut) -> Result<T, E>
    where
        T: Serialize,
        E: std::error::Error,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_async(fut).await
    }

    async fn run_async<T, E, Fut>(self, fut: Fut) -> Result<T, E>
    where
        T: Serialize,
        E: std::error::Error,
        Fut: Future<Output = Result<T, E>>,
    {
        let Opened { span, implicit } = self.open();
        let deliver = DeliverOnDrop {
            client: self.client.clone(),
            trace: implicit,
        };

        let cx = span.scope_context();
        span.start();
        let cancel = CancelOnDrop::new(&span);
        let outcome = AssertUnwindSafe(fut.with_context(cx)).catch_unwind().await;
        cancel.disarm();
        match &outcome {
            Ok(Ok(value)) => self.record_output(&span, value),
            Ok(Err(e)) => span.set_error(e),
            Err(payload) => span.set_error_info(ErrorInfo::from_panic(&**payload)),
        }
        span.finish();

        if let Some(trace) = deliver.disarm() {
            Self::mirror(&span, &trace);
            trace.finish();
            trace.flush().await;
        }
        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
