// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Live spans.
//!
//! A [`Span`] is a cheap, clonable handle to one timed unit of work inside a
//! [`Trace`]. Spans are created through [`Trace::span`] and become "current"
//! while one of their scopes is active:
//!
//! - [`Span::enter`] / [`Span::in_scope`] for synchronous code,
//! - [`Span::in_scope_async`] / [`Span::try_in_scope_async`] for futures.
//!
//! Leaving a scope records a failure (if any), finishes the span and restores
//! the previously current span, exactly once, whatever the exit path.
//! Dropping an async scope before it completes marks the span `cancelled`.
//!
//! After [`Span::finish`] a span is frozen: later setters are ignored.

use crate::context::{self, Context, ContextGuard, FutureExt};
use crate::trace::{Trace, TraceInner};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sprintlens_core::payload::{self, PayloadLimits};
use sprintlens_core::record::duration_ms;
use sprintlens_core::{
    Cost, ErrorInfo, Metric, MetricValue, SpanId, SpanRecord, SpanType, Status, TokenUsage,
    TraceId,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

/// Handle to a span. Clones refer to the same span.
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

struct SpanInner {
    id: SpanId,
    trace_id: TraceId,
    parent_id: Option<SpanId>,
    name: String,
    created_at: DateTime<Utc>,
    limits: PayloadLimits,
    trace: Weak<TraceInner>,
    state: Mutex<SpanState>,
}

#[derive(Default)]
struct SpanState {
    span_type: SpanType,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    duration_ms: Option<f64>,
    status: Status,
    input: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
    tags: HashMap<String, String>,
    metadata: HashMap<String, serde_json::Value>,
    metrics: HashMap<String, Metric>,
    error: Option<ErrorInfo>,
    model: Option<String>,
    provider: Option<String>,
    version: Option<String>,
    tokens_usage: Option<TokenUsage>,
    cost: Option<Cost>,
}

/// Everything needed to create a span; assembled by the trace factory.
pub(crate) struct NewSpan {
    pub trace_id: TraceId,
    pub parent_id: Option<SpanId>,
    pub name: String,
    pub span_type: SpanType,
    pub limits: PayloadLimits,
    pub trace: Weak<TraceInner>,
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("trace_id", &self.inner.trace_id)
            .field("parent_id", &self.inner.parent_id)
            .field("status", &self.status())
            .finish()
    }
}

impl Span {
    pub(crate) fn new(new: NewSpan) -> Self {
        Self {
            inner: Arc::new(SpanInner {
                id: uuid::Uuid::new_v4().to_string(),
                trace_id: new.trace_id,
                parent_id: new.parent_id,
                name: new.name,
                created_at: Utc::now(),
                limits: new.limits,
                trace: new.trace,
                state: Mutex::new(SpanState {
                    span_type: new.span_type,
                    ..Default::default()
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SpanState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the state unless the span is already finished.
    fn update(&self, what: &str, f: impl FnOnce(&mut SpanState)) {
        let mut state = self.state();
        if state.end_time.is_some() {
            debug!(span_id = %self.inner.id, field = what, "Ignoring update on finished span");
            return;
        }
        f(&mut state);
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.inner.parent_id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn span_type(&self) -> SpanType {
        self.state().span_type
    }

    pub fn status(&self) -> Status {
        self.state().status
    }

    pub fn is_started(&self) -> bool {
        self.state().start_time.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.state().end_time.is_some()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state().end_time
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.state().duration_ms
    }

    pub fn error(&self) -> Option<ErrorInfo> {
        self.state().error.clone()
    }

    pub fn input(&self) -> Option<serde_json::Value> {
        self.state().input.clone()
    }

    pub fn output(&self) -> Option<serde_json::Value> {
        self.state().output.clone()
    }

    pub fn tokens_usage(&self) -> Option<TokenUsage> {
        self.state().tokens_usage.clone()
    }

    pub fn cost(&self) -> Option<Cost> {
        self.state().cost.clone()
    }

    /// Owning trace, while it is still alive.
    pub fn trace(&self) -> Option<Trace> {
        self.inner.trace.upgrade().map(Trace::from_inner)
    }

    /// Whether both handles refer to the same span.
    pub fn same_as(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Record the start time. Only the first call has an effect.
    pub fn start(&self) {
        let mut state = self.state();
        if state.start_time.is_none() {
            state.start_time = Some(Utc::now());
        }
    }

    /// Replace the input payload.
    pub fn set_input<T: Serialize + ?Sized>(&self, input: &T) {
        let value = payload::to_payload(input, self.inner.limits);
        self.update("input", |s| s.input = Some(value));
    }

    /// Replace the output payload.
    pub fn set_output<T: Serialize + ?Sized>(&self, output: &T) {
        let value = payload::to_payload(output, self.inner.limits);
        self.update("output", |s| s.output = Some(value));
    }

    pub fn set_span_type(&self, span_type: SpanType) {
        self.update("span_type", |s| s.span_type = span_type);
    }

    pub fn add_tag(&self, key: impl Into<String>, value: impl ToString) {
        let (key, value) = (key.into(), value.to_string());
        self.update("tags", |s| {
            s.tags.insert(key, value);
        });
    }

    pub fn add_tags<I, K, V>(&self, tags: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let tags: Vec<(String, String)> = tags
            .into_iter()
            .map(|(k, v)| (k.into(), v.to_string()))
            .collect();
        self.update("tags", |s| s.tags.extend(tags));
    }

    /// Set one metadata entry; the last write per key wins.
    pub fn set_metadata<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T) {
        let (key, value) = (key.into(), payload::to_payload(value, self.inner.limits));
        self.update("metadata", |s| {
            s.metadata.insert(key, value);
        });
    }

    /// Record a measurement; repeated names overwrite.
    pub fn add_metric(&self, name: impl Into<String>, value: impl Into<MetricValue>, unit: Option<&str>) {
        let (name, metric) = (name.into(), Metric::new(value, unit.map(str::to_string)));
        self.update("metrics", |s| {
            s.metrics.insert(name, metric);
        });
    }

    /// Describe the model behind a model-call span.
    pub fn set_model_info(&self, model: impl Into<String>, provider: Option<&str>, version: Option<&str>) {
        let model = model.into();
        self.update("model", |s| {
            s.model = Some(model);
            if let Some(p) = provider {
                s.provider = Some(p.to_string());
            }
            if let Some(v) = version {
                s.version = Some(v.to_string());
            }
        });
    }

    /// Record token usage; every counter is also exposed as a metric.
    ///
    /// A missing total is derived from prompt + completion.
    pub fn set_token_usage(&self, mut usage: TokenUsage) {
        if usage.total_tokens.is_none()
            && (usage.prompt_tokens.is_some() || usage.completion_tokens.is_some())
        {
            usage.total_tokens = Some(usage.total());
        }

        let mut counters: Vec<(String, u64)> = [
            ("prompt_tokens", usage.prompt_tokens),
            ("completion_tokens", usage.completion_tokens),
            ("total_tokens", usage.total_tokens),
        ]
        .into_iter()
        .filter_map(|(name, v)| v.map(|v| (name.to_string(), v)))
        .collect();
        counters.extend(usage.extra.iter().map(|(k, v)| (k.clone(), *v)));

        self.update("tokens_usage", |s| {
            for (name, value) in counters {
                s.metrics
                    .insert(name, Metric::new(value, Some("tokens".to_string())));
            }
            s.tokens_usage = Some(usage);
        });
    }

    /// Record the cost in USD.
    pub fn set_cost(&self, amount: f64) {
        self.set_cost_in(amount, "USD");
    }

    /// Record the cost; also exposed as the `cost` metric with the currency
    /// as its unit.
    pub fn set_cost_in(&self, amount: f64, currency: impl Into<String>) {
        let cost = Cost::new(amount, currency);
        self.update("cost", |s| {
            s.metrics
                .insert("cost".to_string(), Metric::new(amount, Some(cost.currency.clone())));
            s.cost = Some(cost);
        });
    }

    /// Record a failure. The span ends with status `error` from now on.
    pub fn set_error<E>(&self, err: &E)
    where
        E: std::error::Error + ?Sized,
    {
        self.set_error_info(ErrorInfo::from_error(err));
    }

    pub fn set_error_info(&self, info: ErrorInfo) {
        self.update("error", |s| {
            s.status = Status::Error;
            s.error = Some(info);
        });
    }

    /// Mark a still-running span as abandoned. Recorded errors take precedence.
    pub(crate) fn mark_cancelled(&self) {
        self.update("status", |s| {
            if s.status == Status::Running {
                s.status = Status::Cancelled;
            }
        });
    }

    /// Finalize timing and status. Returns `false` if already finished.
    pub fn finish(&self) -> bool {
        let mut state = self.state();
        if state.end_time.is_some() {
            return false;
        }
        let start = *state.start_time.get_or_insert(self.inner.created_at);
        let end = Utc::now().max(start);
        state.end_time = Some(end);
        state.duration_ms = Some(duration_ms(start, end));
        if state.status == Status::Running {
            state.status = Status::Completed;
        }

        debug!(
            span_id = %self.inner.id,
            trace_id = %self.inner.trace_id,
            name = %self.inner.name,
            status = %state.status,
            duration_ms = state.duration_ms.unwrap_or_default(),
            "Span finished"
        );
        true
    }

    /// Create a span nested under this one in the same trace.
    ///
    /// If the owning trace is gone, the child is created detached: it still
    /// records data but is not collected by any trace.
    pub fn create_child_span(&self, name: impl Into<String>, span_type: SpanType) -> Span {
        match self.trace() {
            Some(trace) => trace.span(name).span_type(span_type).parent(self).build(),
            None => {
                debug!(span_id = %self.inner.id, "Owning trace dropped; creating detached child span");
                Span::new(NewSpan {
                    trace_id: self.inner.trace_id.clone(),
                    parent_id: Some(self.inner.id.clone()),
                    name: name.into(),
                    span_type,
                    limits: self.inner.limits,
                    trace: Weak::new(),
                })
            }
        }
    }

    /// Context in which this span is the current span.
    pub(crate) fn scope_context(&self) -> Context {
        let mut cx = context::current();
        if let Some(trace) = self.trace() {
            let already_current = cx.trace().map(|t| t.id() == trace.id()).unwrap_or(false);
            if !already_current {
                cx = cx.with_trace(Some(trace));
            }
        }
        cx.with_span(self.clone())
    }

    /// Start the span and make it current until the guard is dropped.
    pub fn enter(&self) -> SpanGuard {
        self.start();
        let context = self.scope_context().attach();
        SpanGuard {
            span: self.clone(),
            context: Some(context),
        }
    }

    /// Run `f` with this span current.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.enter();
        f()
    }

    /// Run `f` with this span current, recording an `Err` as the span error.
    pub fn try_in_scope<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: std::error::Error,
    {
        let guard = self.enter();
        let result = f();
        if let Err(e) = &result {
            guard.record_error(e);
        }
        result
    }

    /// Await `fut` with this span current.
    pub async fn in_scope_async<F: Future>(&self, fut: F) -> F::Output {
        let cx = self.scope_context();
        self.start();
        let cancel = CancelOnDrop::new(self);
        let output = fut.with_context(cx).await;
        cancel.disarm();
        self.finish();
        output
    }

    /// Await `fut` with this span current, recording an `Err` as the span error.
    pub async fn try_in_scope_async<T, E, F>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        let cx = self.scope_context();
        self.start();
        let cancel = CancelOnDrop::new(self);
        let result = fut.with_context(cx).await;
        cancel.disarm();
        if let Err(e) = &result {
            self.set_error(e);
        }
        self.finish();
        result
    }

    /// Immutable snapshot for serialization.
    pub fn to_record(&self) -> SpanRecord {
        let state = self.state();
        SpanRecord {
            id: self.inner.id.clone(),
            trace_id: self.inner.trace_id.clone(),
            parent_id: self.inner.parent_id.clone(),
            name: self.inner.name.clone(),
            span_type: state.span_type,
            start_time: state.start_time.unwrap_or(self.inner.created_at),
            end_time: state.end_time,
            duration_ms: state.duration_ms,
            status: state.status,
            input: state.input.clone(),
            output: state.output.clone(),
            tags: state.tags.clone(),
            metadata: state.metadata.clone(),
            metrics: state.metrics.clone(),
            error: state.error.clone(),
            model: state.model.clone(),
            provider: state.provider.clone(),
            version: state.version.clone(),
            tokens_usage: state.tokens_usage.clone(),
            cost: state.cost.clone(),
        }
    }
}

/// Synchronous span scope. Dropping it finishes the span and restores the
/// previously current context.
///
/// A guard dropped while the thread is panicking records the panic as the
/// span error first.
#[must_use = "the span is finished as soon as the guard is dropped"]
pub struct SpanGuard {
    span: Span,
    context: Option<ContextGuard>,
}

impl fmt::Debug for SpanGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanGuard").field("span", &self.span).finish()
    }
}

impl SpanGuard {
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn record_error<E>(&self, err: &E)
    where
        E: std::error::Error + ?Sized,
    {
        self.span.set_error(err);
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if std::thread::panicking() && self.span.error().is_none() {
            self.span
                .set_error_info(ErrorInfo::new("panic", "span scope exited during a panic"));
        }
        self.span.finish();
        drop(self.context.take());
    }
}

/// Finishes a span as cancelled if the owning future is dropped early, or
/// as failed if it is dropped while a panic unwinds through it.
pub(crate) struct CancelOnDrop {
    span: Option<Span>,
}

impl CancelOnDrop {
    pub(crate) fn new(span: &Span) -> Self {
        Self {
            span: Some(span.clone()),
        }
    }

    pub(crate) fn disarm(mut self) {
        self.span = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(span) = self.span.take() else {
            return;
        };
        if std::thread::panicking() {
            if span.error().is_none() {
                span.set_error_info(ErrorInfo::new("panic", "span scope exited during a panic"));
            }
            span.finish();
        } else {
            span.mark_cancelled();
            if span.finish() {
                debug!(span_id = %span.id(), name = %span.name(), "Span cancelled");
            }
        }
    }
}
