// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Live traces.
//!
//! A [`Trace`] owns the spans of one logical operation. It is the span
//! factory ([`Trace::span`]), aggregates token and cost metrics when it
//! finishes, and hands a serialized snapshot to its [`Client`] exactly once.
//!
//! Scopes:
//!
//! - [`Trace::enter`] / [`Trace::in_scope`] make the trace current. Leaving
//!   them only restores the previous trace; call [`Trace::finish`] and
//!   [`Client::log_trace`] (or [`Trace::flush`]) yourself.
//! - [`Trace::in_scope_async`] additionally finishes and flushes the trace
//!   when the future completes.

use crate::client::Client;
use crate::config::DeliveryMode;
use crate::context::{self, ContextGuard, FutureExt};
use crate::span::{NewSpan, Span};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sprintlens_core::payload::{self, PayloadLimits};
use sprintlens_core::record::duration_ms;
use sprintlens_core::{
    ErrorInfo, Feedback, Metric, MetricValue, SpanId, SpanType, Status, TraceId, TraceRecord,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Handle to a trace. Clones refer to the same trace.
#[derive(Clone)]
pub struct Trace {
    inner: Arc<TraceInner>,
}

pub(crate) struct TraceInner {
    id: TraceId,
    name: String,
    project_name: String,
    limits: PayloadLimits,
    client: Option<Client>,
    flushed: AtomicBool,
    state: Mutex<TraceState>,
}

struct TraceState {
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    duration_ms: Option<f64>,
    status: Status,
    input: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
    tags: HashMap<String, String>,
    metadata: HashMap<String, serde_json::Value>,
    metrics: HashMap<String, Metric>,
    error: Option<ErrorInfo>,
    user_id: Option<String>,
    session_id: Option<String>,
    feedback: HashMap<String, Feedback>,
    scores: HashMap<String, f64>,
    spans: Vec<Span>,
    index: HashMap<SpanId, usize>,
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Trace")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("project_name", &self.inner.project_name)
            .field("status", &state.status)
            .field("spans", &state.spans.len())
            .finish()
    }
}

impl Trace {
    /// Start building a trace that is not bound to a client.
    ///
    /// Use [`Client::trace`] for traces that should be delivered.
    pub fn builder(name: impl Into<String>) -> TraceBuilder {
        TraceBuilder::new(name)
    }

    pub(crate) fn from_inner(inner: Arc<TraceInner>) -> Self {
        Self { inner }
    }

    fn state(&self) -> MutexGuard<'_, TraceState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, what: &str, f: impl FnOnce(&mut TraceState)) {
        let mut state = self.state();
        if state.end_time.is_some() {
            debug!(trace_id = %self.inner.id, field = what, "Ignoring update on finished trace");
            return;
        }
        f(&mut state);
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn project_name(&self) -> &str {
        &self.inner.project_name
    }

    pub fn client(&self) -> Option<&Client> {
        self.inner.client.as_ref()
    }

    pub fn status(&self) -> Status {
        self.state().status
    }

    pub fn is_finished(&self) -> bool {
        self.state().end_time.is_some()
    }

    pub fn is_flushed(&self) -> bool {
        self.inner.flushed.load(Ordering::SeqCst)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
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

    pub fn metric(&self, name: &str) -> Option<Metric> {
        self.state().metrics.get(name).cloned()
    }

    pub fn same_as(&self, other: &Trace) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_input<T: Serialize + ?Sized>(&self, input: &T) {
        let value = payload::to_payload(input, self.inner.limits);
        self.update("input", |s| s.input = Some(value));
    }

    /// Output may still be set after `finish` until the trace is flushed.
    pub fn set_output<T: Serialize + ?Sized>(&self, output: &T) {
        if self.is_flushed() {
            return;
        }
        let value = payload::to_payload(output, self.inner.limits);
        self.state().output = Some(value);
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

    pub fn set_metadata<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T) {
        let (key, value) = (key.into(), payload::to_payload(value, self.inner.limits));
        self.update("metadata", |s| {
            s.metadata.insert(key, value);
        });
    }

    pub fn add_metric(&self, name: impl Into<String>, value: impl Into<MetricValue>, unit: Option<&str>) {
        let (name, metric) = (name.into(), Metric::new(value, unit.map(str::to_string)));
        self.update("metrics", |s| {
            s.metrics.insert(name, metric);
        });
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        self.update("user_id", |s| s.user_id = Some(user_id));
    }

    pub fn set_session_id(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        self.update("session_id", |s| s.session_id = Some(session_id));
    }

    /// Record a failure. The trace finishes with status `error`.
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

    /// Attach a named quality annotation. Repeated names overwrite.
    ///
    /// Feedback usually arrives after the trace finished, so it is accepted
    /// until the trace is flushed.
    pub fn add_feedback<T: Serialize + ?Sized>(&self, name: impl Into<String>, value: &T) {
        self.add_feedback_with_metadata(name, value, HashMap::new());
    }

    pub fn add_feedback_with_metadata<T: Serialize + ?Sized>(
        &self,
        name: impl Into<String>,
        value: &T,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        if self.is_flushed() {
            debug!(trace_id = %self.inner.id, "Ignoring feedback on flushed trace");
            return;
        }
        let feedback = Feedback {
            value: payload::to_payload(value, self.inner.limits),
            metadata,
            timestamp: Utc::now(),
        };
        self.state().feedback.insert(name.into(), feedback);
    }

    /// Attach a named numeric score. Repeated names overwrite.
    pub fn add_score(&self, name: impl Into<String>, score: f64) {
        if self.is_flushed() {
            debug!(trace_id = %self.inner.id, "Ignoring score on flushed trace");
            return;
        }
        self.state().scores.insert(name.into(), score);
    }

    /// Create a span owned by this trace.
    ///
    /// Unless a parent is given, the innermost current span of this trace
    /// becomes the parent.
    pub fn span(&self, name: impl Into<String>) -> SpanBuilder {
        SpanBuilder {
            trace: self.clone(),
            name: name.into(),
            span_type: SpanType::default(),
            parent: None,
            input: None,
            tags: Vec::new(),
            metadata: Vec::new(),
            model: None,
        }
    }

    fn register(&self, span: &Span) {
        let mut state = self.state();
        let idx = state.spans.len();
        state.index.insert(span.id().to_string(), idx);
        state.spans.push(span.clone());
    }

    pub fn get_span(&self, id: &str) -> Option<Span> {
        let state = self.state();
        state.index.get(id).map(|&idx| state.spans[idx].clone())
    }

    /// Spans in creation order.
    pub fn get_spans(&self) -> Vec<Span> {
        self.state().spans.clone()
    }

    pub fn span_count(&self) -> usize {
        self.state().spans.len()
    }

    /// Finalize timing, status and aggregate metrics.
    ///
    /// Spans still open are finished first, including spans registered by
    /// other threads while this runs. Returns `false` if the trace was
    /// already finished.
    ///
    /// Costs are summed per currency. A single currency yields `total_cost`;
    /// mixed currencies yield one `total_cost_<currency>` metric each.
    pub fn finish(&self) -> bool {
        let mut forced = 0;
        let mut total_tokens = 0u64;
        let mut costs: BTreeMap<String, f64> = BTreeMap::new();
        let mut seen = 0;

        let mut state = loop {
            let batch = {
                let state = self.state();
                if state.end_time.is_some() {
                    return false;
                }
                if state.spans.len() == seen {
                    break state;
                }
                state.spans[seen..].to_vec()
            };
            seen += batch.len();
            for span in &batch {
                if span.finish() {
                    forced += 1;
                }
                if let Some(usage) = span.tokens_usage() {
                    total_tokens = total_tokens.saturating_add(usage.total());
                }
                if let Some(cost) = span.cost() {
                    *costs.entry(cost.currency).or_default() += cost.amount;
                }
            }
        };

        if forced > 0 {
            warn!(
                trace_id = %self.inner.id,
                open_spans = forced,
                "Trace finished with open spans; finishing them"
            );
        }

        let end = Utc::now().max(state.start_time);
        state.end_time = Some(end);
        state.duration_ms = Some(duration_ms(state.start_time, end));
        state.status = if state.error.is_some() {
            Status::Error
        } else {
            Status::Completed
        };
        if total_tokens > 0 {
            state.metrics.insert(
                "total_tokens".to_string(),
                Metric::new(total_tokens, Some("tokens".to_string())),
            );
        }
        costs.retain(|_, amount| *amount > 0.0);
        if costs.len() > 1 {
            warn!(
                trace_id = %self.inner.id,
                currencies = ?costs.keys().collect::<Vec<_>>(),
                "Spans report costs in several currencies; totals kept per currency"
            );
            for (currency, amount) in costs {
                state.metrics.insert(
                    format!("total_cost_{}", currency.to_lowercase()),
                    Metric::new(amount, Some(currency)),
                );
            }
        } else if let Some((currency, amount)) = costs.into_iter().next() {
            state
                .metrics
                .insert("total_cost".to_string(), Metric::new(amount, Some(currency)));
        }

        info!(
            trace_id = %self.inner.id,
            name = %self.inner.name,
            status = %state.status,
            spans = seen,
            total_tokens,
            duration_ms = state.duration_ms.unwrap_or_default(),
            "Trace finished"
        );
        true
    }

    /// Claim the single delivery of this trace. Returns `true` only once.
    pub(crate) fn mark_flushed(&self) -> bool {
        !self.inner.flushed.swap(true, Ordering::SeqCst)
    }

    /// Finish (if needed) and hand the trace to its client, once.
    ///
    /// In immediate mode this waits until the exporter has attempted
    /// delivery. Delivery failures are never reported here.
    pub async fn flush(&self) {
        let Some(client) = self.inner.client.clone() else {
            if self.mark_flushed() {
                self.finish();
                debug!(trace_id = %self.inner.id, "Trace has no client; nothing to deliver");
            }
            return;
        };
        if !client.log_trace(self) {
            return;
        }
        if client.config().mode == DeliveryMode::Immediate {
            client.flush().await;
        }
    }

    /// Make this trace current until the guard is dropped.
    pub fn enter(&self) -> TraceGuard {
        let context = context::current()
            .with_trace(Some(self.clone()))
            .attach();
        TraceGuard {
            trace: self.clone(),
            context: Some(context),
        }
    }

    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.enter();
        f()
    }

    /// Like [`Trace::in_scope`], recording an `Err` on the trace.
    pub fn try_in_scope<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: std::error::Error,
    {
        let _guard = self.enter();
        let result = f();
        if let Err(e) = &result {
            self.set_error(e);
        }
        result
    }

    /// Await `fut` with this trace current, then finish and flush.
    pub async fn in_scope_async<F: Future>(&self, fut: F) -> F::Output {
        let cx = context::current().with_trace(Some(self.clone()));
        let output = fut.with_context(cx).await;
        self.finish();
        self.flush().await;
        output
    }

    /// Await `fut` with this trace current.
    ///
    /// On `Ok` the trace is finished and flushed. On `Err` the error is
    /// recorded and the trace is left open for the caller.
    pub async fn try_in_scope_async<T, E, F>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        let cx = context::current().with_trace(Some(self.clone()));
        let result = fut.with_context(cx).await;
        match &result {
            Ok(_) => {
                self.finish();
                self.flush().await;
            }
            Err(e) => self.set_error(e),
        }
        result
    }

    /// Immutable snapshot of the trace and all of its spans.
    pub fn to_record(&self) -> TraceRecord {
        let (mut record, spans) = {
            let state = self.state();
            let record = TraceRecord {
                id: self.inner.id.clone(),
                name: self.inner.name.clone(),
                project_name: self.inner.project_name.clone(),
                project_id: None,
                start_time: state.start_time,
                end_time: state.end_time,
                duration_ms: state.duration_ms,
                status: state.status,
                input: state.input.clone(),
                output: state.output.clone(),
                tags: state.tags.clone(),
                metadata: state.metadata.clone(),
                metrics: state.metrics.clone(),
                error: state.error.clone(),
                user_id: state.user_id.clone(),
                session_id: state.session_id.clone(),
                feedback: state.feedback.clone(),
                scores: state.scores.clone(),
                spans: Vec::new(),
            };
            (record, state.spans.clone())
        };
        record.spans = spans.iter().map(Span::to_record).collect();
        record
    }
}

/// Builder for [`Trace`].
#[derive(Debug)]
pub struct TraceBuilder {
    id: Option<TraceId>,
    name: String,
    project_name: String,
    limits: PayloadLimits,
    client: Option<Client>,
    input: Option<serde_json::Value>,
    tags: HashMap<String, String>,
    metadata: HashMap<String, serde_json::Value>,
    user_id: Option<String>,
    session_id: Option<String>,
}

impl TraceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            project_name: "default".to_string(),
            limits: PayloadLimits::default(),
            client: None,
            input: None,
            tags: HashMap::new(),
            metadata: HashMap::new(),
            user_id: None,
            session_id: None,
        }
    }

    /// Use a caller-supplied id instead of a generated UUID.
    pub fn id(mut self, id: impl Into<TraceId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Bind to a client: delivery target, project name and payload limits.
    pub fn client(mut self, client: &Client) -> Self {
        self.project_name = client.config().project_name.clone();
        self.limits = client.config().payload_limits();
        self.client = Some(client.clone());
        self
    }

    pub fn project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }

    pub fn payload_limits(mut self, limits: PayloadLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn input<T: Serialize + ?Sized>(mut self, input: &T) -> Self {
        self.input = Some(payload::to_payload(input, self.limits));
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.insert(key.into(), value.to_string());
        self
    }

    pub fn metadata<T: Serialize + ?Sized>(mut self, key: impl Into<String>, value: &T) -> Self {
        self.metadata
            .insert(key.into(), payload::to_payload(value, self.limits));
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn build(self) -> Trace {
        let id = self
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        debug!(trace_id = %id, name = %self.name, project = %self.project_name, "Trace created");
        Trace::from_inner(Arc::new(TraceInner {
            id,
            name: self.name,
            project_name: self.project_name,
            limits: self.limits,
            client: self.client,
            flushed: AtomicBool::new(false),
            state: Mutex::new(TraceState {
                start_time: Utc::now(),
                end_time: None,
                duration_ms: None,
                status: Status::Running,
                input: self.input,
                output: None,
                tags: self.tags,
                metadata: self.metadata,
                metrics: HashMap::new(),
                error: None,
                user_id: self.user_id,
                session_id: self.session_id,
                feedback: HashMap::new(),
                scores: HashMap::new(),
                spans: Vec::new(),
                index: HashMap::new(),
            }),
        }))
    }
}

/// Builder returned by [`Trace::span`]. The span is registered with the
/// trace on [`SpanBuilder::build`] but not started.
#[derive(Debug)]
pub struct SpanBuilder {
    trace: Trace,
    name: String,
    span_type: SpanType,
    parent: Option<Option<Span>>,
    input: Option<serde_json::Value>,
    tags: Vec<(String, String)>,
    metadata: Vec<(String, serde_json::Value)>,
    model: Option<String>,
}

impl SpanBuilder {
    pub fn span_type(mut self, span_type: SpanType) -> Self {
        self.span_type = span_type;
        self
    }

    /// Explicit parent. Must belong to the same trace.
    pub fn parent(mut self, parent: &Span) -> Self {
        self.parent = Some(Some(parent.clone()));
        self
    }

    /// Create a root span even if a span is current.
    pub fn root(mut self) -> Self {
        self.parent = Some(None);
        self
    }

    pub fn input<T: Serialize + ?Sized>(mut self, input: &T) -> Self {
        self.input = Some(payload::to_payload(input, self.trace.inner.limits));
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.push((key.into(), value.to_string()));
        self
    }

    pub fn metadata<T: Serialize + ?Sized>(mut self, key: impl Into<String>, value: &T) -> Self {
        self.metadata
            .push((key.into(), payload::to_payload(value, self.trace.inner.limits)));
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn resolve_parent(&self) -> Option<SpanId> {
        let trace_id = self.trace.id();
        match &self.parent {
            Some(Some(parent)) if parent.trace_id() == trace_id => Some(parent.id().to_string()),
            Some(Some(parent)) => {
                warn!(
                    trace_id = %trace_id,
                    parent_id = %parent.id(),
                    parent_trace_id = %parent.trace_id(),
                    "Ignoring parent span from another trace"
                );
                None
            }
            Some(None) => None,
            None => context::current()
                .spans()
                .iter()
                .rev()
                .find(|s| s.trace_id() == trace_id)
                .map(|s| s.id().to_string()),
        }
    }

    pub fn build(self) -> Span {
        let parent_id = self.resolve_parent();
        let span = Span::new(NewSpan {
            trace_id: self.trace.id().to_string(),
            parent_id,
            name: self.name,
            span_type: self.span_type,
            limits: self.trace.inner.limits,
            trace: Arc::downgrade(&self.trace.inner),
        });
        if let Some(input) = self.input {
            span.set_input(&input);
        }
        if !self.tags.is_empty() {
            span.add_tags(self.tags);
        }
        for (key, value) in self.metadata {
            span.set_metadata(key, &value);
        }
        if let Some(model) = self.model {
            span.set_model_info(model, None, None);
        }
        self.trace.register(&span);
        span
    }
}

/// Synchronous trace scope. Dropping it restores the previously current
/// trace; it does not finish the trace.
#[must_use = "the trace stops being current as soon as the guard is dropped"]
pub struct TraceGuard {
    trace: Trace,
    context: Option<ContextGuard>,
}

impl fmt::Debug for TraceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceGuard").field("trace", &self.trace).finish()
    }
}

impl TraceGuard {
    pub fn trace(&self) -> &Trace {
        &self.trace
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        if std::thread::panicking() && self.trace.error().is_none() {
            self.trace
                .set_error_info(ErrorInfo::new("panic", "trace scope exited during a panic"));
        }
        drop(self.context.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprintlens_core::{Cost, TokenUsage};

    #[derive(Debug)]
    struct Timeout;

    impl fmt::Display for Timeout {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("upstream timed out")
        }
    }

    impl std::error::Error for Timeout {}

    #[test]
    fn test_span_defaults_parent_to_current_span() {
        context::clear();
        let trace = Trace::builder("parenting").build();
        let _t = trace.enter();
        let root = trace.span("root").build();
        assert!(root.parent_id().is_none());

        let _g = root.enter();
        let child = trace.span("child").build();
        assert_eq!(child.parent_id(), Some(root.id()));

        let detached = trace.span("detached").root().build();
        assert!(detached.parent_id().is_none());
    }

    #[test]
    fn test_foreign_parent_is_ignored() {
        let a = Trace::builder("a").build();
        let b = Trace::builder("b").build();
        let foreign = a.span("foreign").build();
        let span = b.span("local").parent(&foreign).build();
        assert!(span.parent_id().is_none());
        assert_eq!(span.trace_id(), b.id());
    }

    #[test]
    fn test_spans_keep_creation_order_and_lookup() {
        let trace = Trace::builder("order").build();
        let ids: Vec<String> = (0..5)
            .map(|i| trace.span(format!("s{}", i)).root().build().id().to_string())
            .collect();
        let listed: Vec<String> = trace.get_spans().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(listed, ids);
        assert_eq!(trace.get_span(&ids[3]).unwrap().name(), "s3");
        assert!(trace.get_span("missing").is_none());
    }

    #[test]
    fn test_finish_aggregates_metrics() {
        let trace = Trace::builder("aggregate").build();
        let a = trace.span("a").root().build();
        a.set_token_usage(TokenUsage {
            prompt_tokens: Some(10),
            completion_tokens: Some(5),
            ..Default::default()
        });
        a.set_cost(0.01);
        let b = trace.span("b").root().build();
        b.set_token_usage(TokenUsage {
            total_tokens: Some(20),
            ..Default::default()
        });
        b.set_cost(0.02);
        a.finish();

        assert!(trace.finish());
        assert!(b.is_finished());
        assert_eq!(trace.metric("total_tokens").unwrap().value, MetricValue::Integer(35));
        let cost = trace.metric("total_cost").unwrap();
        assert!((cost.value.as_f64().unwrap() - 0.03).abs() < 1e-9);
        assert_eq!(cost.unit.as_deref(), Some("USD"));
        assert_eq!(trace.to_record().spans[1].cost, Some(Cost::usd(0.02)));
    }

    #[test]
    fn test_finish_without_usage_adds_no_metrics() {
        let trace = Trace::builder("quiet").build();
        trace.span("a").build();
        trace.finish();
        assert!(trace.metric("total_tokens").is_none());
        assert!(trace.metric("total_cost").is_none());
    }

    #[test]
    fn test_mixed_currencies_are_totalled_separately() {
        let trace = Trace::builder("currencies").build();
        trace.span("a").root().build().set_cost_in(0.01, "USD");
        trace.span("b").root().build().set_cost_in(0.02, "EUR");
        trace.span("c").root().build().set_cost_in(0.03, "EUR");
        trace.finish();

        assert!(trace.metric("total_cost").is_none());
        let usd = trace.metric("total_cost_usd").unwrap();
        assert_eq!(usd.unit.as_deref(), Some("USD"));
        assert!((usd.value.as_f64().unwrap() - 0.01).abs() < 1e-9);
        let eur = trace.metric("total_cost_eur").unwrap();
        assert_eq!(eur.unit.as_deref(), Some("EUR"));
        assert!((eur.value.as_f64().unwrap() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_token_total_saturates() {
        let trace = Trace::builder("huge").build();
        for name in ["a", "b"] {
            trace.span(name).root().build().set_token_usage(TokenUsage {
                prompt_tokens: Some(u64::MAX),
                completion_tokens: Some(1),
                ..Default::default()
            });
        }
        assert!(trace.finish());
        assert_eq!(
            trace.metric("total_tokens").unwrap().value,
            MetricValue::Integer(i64::MAX)
        );
    }

    #[test]
    fn test_spans_registered_during_finish_are_finished() {
        for _ in 0..20 {
            let trace = Trace::builder("racing").build();
            let producer = {
                let trace = trace.clone();
                std::thread::spawn(move || {
                    let mut before_end = Vec::new();
                    while before_end.len() < 10_000 {
                        let span = trace.span("late").root().build();
                        if trace.is_finished() {
                            break;
                        }
                        before_end.push(span);
                    }
                    before_end
                })
            };
            std::thread::yield_now();
            trace.finish();
            let before_end = producer.join().unwrap();
            assert!(before_end.iter().all(Span::is_finished));
        }
    }

    #[test]
    fn test_finish_is_idempotent() {
        let trace = Trace::builder("twice").build();
        assert!(trace.finish());
        let (end, duration) = (trace.end_time(), trace.duration_ms());
        assert!(!trace.finish());
        assert_eq!(trace.end_time(), end);
        assert_eq!(trace.duration_ms(), duration);
        assert_eq!(trace.status(), Status::Completed);
    }

    #[test]
    fn test_error_wins_on_finish() {
        let trace = Trace::builder("failing").build();
        trace.set_error(&Timeout);
        trace.finish();
        assert_eq!(trace.status(), Status::Error);
        assert_eq!(trace.error().unwrap().error_type, "Timeout");
    }

    #[test]
    fn test_feedback_and_scores_overwrite() {
        let trace = Trace::builder("rated").build();
        trace.finish();
        trace.add_score("relevance", 0.4);
        trace.add_score("relevance", 0.9);
        trace.add_feedback("thumbs", &"down");
        trace.add_feedback("thumbs", &"up");
        let record = trace.to_record();
        assert_eq!(record.scores["relevance"], 0.9);
        assert_eq!(record.feedback["thumbs"].value, serde_json::json!("up"));
    }

    #[test]
    fn test_try_in_scope_records_error_and_restores() {
        context::clear();
        let trace = Trace::builder("sync").build();
        let result: Result<(), Timeout> = trace.try_in_scope(|| {
            assert!(context::current_trace().unwrap().same_as(&trace));
            Err(Timeout)
        });
        assert!(result.is_err());
        assert!(context::current_trace().is_none());
        assert_eq!(trace.status(), Status::Error);
        assert!(!trace.is_finished());
    }

    #[tokio::test]
    async fn test_async_scope_finishes_and_flushes() {
        let trace = Trace::builder("async").build();
        let value = trace
            .in_scope_async(async {
                tokio::task::yield_now().await;
                context::current_trace().map(|t| t.name().to_string())
            })
            .await;
        assert_eq!(value.as_deref(), Some("async"));
        assert!(trace.is_finished());
        assert!(trace.is_flushed());
        assert!(context::current_trace().is_none());
    }

    #[tokio::test]
    async fn test_async_scope_error_leaves_trace_open() {
        let trace = Trace::builder("async-err").build();
        let result: Result<(), Timeout> = trace.try_in_scope_async(async { Err(Timeout) }).await;
        assert!(result.is_err());
        assert!(!trace.is_finished());
        assert!(!trace.is_flushed());
        assert_eq!(trace.error().unwrap().message, "upstream timed out");
    }

    #[test]
    fn test_record_links_spans() {
        let trace = Trace::builder("record")
            .user_id("u-1")
            .session_id("s-1")
            .tag("env", "test")
            .build();
        let parent = trace.span("parent").build();
        let child = parent.create_child_span("child", SpanType::Retrieval);
        trace.finish();

        let record = trace.to_record();
        assert!(record.validate().is_empty());
        assert_eq!(record.spans.len(), 2);
        assert_eq!(record.spans[1].parent_id.as_deref(), Some(parent.id()));
        assert_eq!(record.spans[1].id, child.id());
        assert_eq!(record.user_id.as_deref(), Some("u-1"));
        assert_eq!(record.status, Status::Completed);
    }
}
