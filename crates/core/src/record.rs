// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire records sent to the collector.
//!
//! A [`TraceRecord`] is the finished, immutable snapshot of one logical
//! operation; it owns every [`SpanRecord`] produced inside it. Both are posted
//! to `POST <collector>/api/v1/traces`, either alone or as a JSON array.
//!
//! # Shape
//!
//! ```text
//! TraceRecord
//!   ├─ SpanRecord (parentId = null)        root span
//!   │    └─ SpanRecord (parentId = root)   child span
//!   └─ SpanRecord (parentId = null)
//! ```
//!
//! Keys are camelCase. Snake case aliases are accepted when parsing so that
//! records produced by older SDKs round-trip as well.

use crate::types::{Cost, ErrorInfo, Feedback, Metric, SpanType, Status, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Unique identifier of a trace.
pub type TraceId = String;

/// Unique identifier of a span.
pub type SpanId = String;

/// Duration between two instants in fractional milliseconds.
pub fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let delta = end.signed_duration_since(start);
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1000.0,
        None => delta.num_milliseconds() as f64,
    }
}

/// One timed unit of work inside a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanRecord {
    pub id: SpanId,
    #[serde(alias = "trace_id")]
    pub trace_id: TraceId,
    /// Enclosing span. `None` marks a root span of the trace.
    #[serde(default, alias = "parent_id")]
    pub parent_id: Option<SpanId>,
    pub name: String,
    #[serde(default, alias = "span_type")]
    pub span_type: SpanType,
    #[serde(alias = "start_time")]
    pub start_time: DateTime<Utc>,
    #[serde(default, alias = "end_time")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "duration_ms", alias = "duration")]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metrics: HashMap<String, Metric>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, alias = "token_usage", alias = "tokenUsage")]
    pub tokens_usage: Option<TokenUsage>,
    #[serde(default)]
    pub cost: Option<Cost>,
}

impl SpanRecord {
    /// Create a new builder.
    pub fn builder() -> SpanRecordBuilder {
        SpanRecordBuilder::default()
    }

    /// Whether this span has no parent inside its trace.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Total tokens consumed by this span, zero when unknown.
    pub fn total_tokens(&self) -> u64 {
        self.tokens_usage.as_ref().map(TokenUsage::total).unwrap_or(0)
    }

    /// Cost amount of this span, zero when unknown.
    pub fn cost_amount(&self) -> f64 {
        self.cost.as_ref().map(|c| c.amount).unwrap_or(0.0)
    }
}

/// Builder for [`SpanRecord`] instances.
///
/// Mostly useful for collectors, importers and tests; live instrumentation
/// goes through the SDK's span handles instead.
#[derive(Debug, Default)]
pub struct SpanRecordBuilder {
    id: Option<SpanId>,
    trace_id: Option<TraceId>,
    parent_id: Option<SpanId>,
    name: Option<String>,
    span_type: SpanType,
    status: Status,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    input: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
    tags: HashMap<String, String>,
    metadata: HashMap<String, serde_json::Value>,
    metrics: HashMap<String, Metric>,
    error: Option<ErrorInfo>,
    model: Option<String>,
    tokens_usage: Option<TokenUsage>,
    cost: Option<Cost>,
}

impl SpanRecordBuilder {
    /// Set span ID. If not set, a UUID v4 will be generated.
    pub fn id(mut self, id: impl Into<SpanId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set owning trace ID (required).
    pub fn trace_id(mut self, id: impl Into<TraceId>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    /// Set parent span ID.
    pub fn parent_id(mut self, id: impl Into<SpanId>) -> Self {
        self.parent_id = Some(id.into());
        self
    }

    /// Set span name (required).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn span_type(mut self, span_type: SpanType) -> Self {
        self.span_type = span_type;
        self
    }

    /// Set status (default: Running).
    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Set start time. Defaults to `Utc::now()` if not set.
    pub fn start_time(mut self, time: DateTime<Utc>) -> Self {
        self.start_time = Some(time);
        self
    }

    pub fn end_time(mut self, time: DateTime<Utc>) -> Self {
        self.end_time = Some(time);
        self
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn metric(mut self, name: impl Into<String>, metric: Metric) -> Self {
        self.metrics.insert(name.into(), metric);
        self
    }

    /// Record an error; the built span gets status `Error`.
    pub fn error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn tokens_usage(mut self, usage: TokenUsage) -> Self {
        self.tokens_usage = Some(usage);
        self
    }

    pub fn cost(mut self, cost: Cost) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Build the [`SpanRecord`]. Returns `Err` if required fields are missing.
    pub fn build(self) -> crate::Result<SpanRecord> {
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let trace_id = self
            .trace_id
            .ok_or_else(|| crate::Error::invalid_input("trace_id is required"))?;
        let name = self
            .name
            .ok_or_else(|| crate::Error::invalid_input("name is required"))?;
        let start_time = self.start_time.unwrap_or_else(Utc::now);

        if let Some(end) = self.end_time {
            if end < start_time {
                return Err(crate::Error::invalid_input(
                    "end_time must not precede start_time",
                ));
            }
        }
        if self.parent_id.as_deref() == Some(id.as_str()) {
            return Err(crate::Error::invalid_input("span cannot be its own parent"));
        }

        let status = if self.error.is_some() {
            Status::Error
        } else {
            self.status
        };

        Ok(SpanRecord {
            id,
            trace_id,
            parent_id: self.parent_id,
            name,
            span_type: self.span_type,
            start_time,
            end_time: self.end_time,
            duration_ms: self.end_time.map(|end| duration_ms(start_time, end)),
            status,
            input: self.input,
            output: self.output,
            tags: self.tags,
            metadata: self.metadata,
            metrics: self.metrics,
            error: self.error,
            model: self.model,
            provider: None,
            version: None,
            tokens_usage: self.tokens_usage,
            cost: self.cost,
        })
    }
}

/// A complete logical operation and every span recorded inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub id: TraceId,
    pub name: String,
    #[serde(alias = "project_name")]
    pub project_name: String,
    #[serde(default, alias = "project_id")]
    pub project_id: Option<String>,
    #[serde(alias = "start_time")]
    pub start_time: DateTime<Utc>,
    #[serde(default, alias = "end_time")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "duration_ms", alias = "duration")]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metrics: HashMap<String, Metric>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default, alias = "user_id")]
    pub user_id: Option<String>,
    #[serde(default, alias = "session_id")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub feedback: HashMap<String, Feedback>,
    #[serde(default)]
    pub scores: HashMap<String, f64>,
    /// Spans in creation order.
    #[serde(default)]
    pub spans: Vec<SpanRecord>,
}

impl TraceRecord {
    /// Look up a span by id.
    pub fn span(&self, id: &str) -> Option<&SpanRecord> {
        self.spans.iter().find(|s| s.id == id)
    }

    /// Direct children of the given span, in creation order.
    pub fn children_of<'a>(&'a self, parent_id: &'a str) -> impl Iterator<Item = &'a SpanRecord> {
        self.spans
            .iter()
            .filter(move |s| s.parent_id.as_deref() == Some(parent_id))
    }

    /// Spans without a parent.
    pub fn root_spans(&self) -> impl Iterator<Item = &SpanRecord> {
        self.spans.iter().filter(|s| s.is_root())
    }

    /// Check structural invariants of the record.
    ///
    /// Checks:
    /// - Every span belongs to this trace
    /// - Every parent id refers to a span of this trace
    /// - No duplicate span IDs
    ///
    /// Returns the list of violations; empty means the record is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut seen_ids = HashSet::new();
        for span in &self.spans {
            if !seen_ids.insert(span.id.as_str()) {
                errors.push(format!("Duplicate span_id: {}", span.id));
            }
        }

        for span in &self.spans {
            if span.trace_id != self.id {
                errors.push(format!(
                    "Span {} has trace_id {} but belongs to trace {}",
                    span.id, span.trace_id, self.id
                ));
            }
            if let Some(parent) = &span.parent_id {
                if !seen_ids.contains(parent.as_str()) {
                    errors.push(format!(
                        "Span {} references unknown parent {}",
                        span.id, parent
                    ));
                }
            }
        }

        errors
    }

    /// Encode as the collector's JSON body.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a collector JSON body holding a single trace.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn make_span(trace_id: &str, parent: Option<&str>) -> SpanRecord {
        let mut builder = SpanRecord::builder().trace_id(trace_id).name("step");
        if let Some(p) = parent {
            builder = builder.parent_id(p);
        }
        builder.build().unwrap()
    }

    fn make_trace(spans: Vec<SpanRecord>) -> TraceRecord {
        TraceRecord {
            id: "trace-1".to_string(),
            name: "workflow".to_string(),
            project_name: "demo".to_string(),
            project_id: None,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            status: Status::Running,
            input: None,
            output: None,
            tags: HashMap::new(),
            metadata: HashMap::new(),
            metrics: HashMap::new(),
            error: None,
            user_id: None,
            session_id: None,
            feedback: HashMap::new(),
            scores: HashMap::new(),
            spans,
        }
    }

    #[test]
    fn test_builder_generates_uuid_id() {
        let span = make_span("trace-1", None);
        assert!(Uuid::parse_str(&span.id).is_ok());
        assert!(span.is_root());
        assert_eq!(span.status, Status::Running);
    }

    #[test]
    fn test_builder_requires_trace_id() {
        let result = SpanRecord::builder().name("x").build();
        assert!(result.unwrap_err().to_string().contains("trace_id"));
    }

    #[test]
    fn test_builder_requires_name() {
        let result = SpanRecord::builder().trace_id("t").build();
        assert!(result.unwrap_err().to_string().contains("name"));
    }

    #[test]
    fn test_builder_rejects_end_before_start() {
        let start = Utc::now();
        let result = SpanRecord::builder()
            .trace_id("t")
            .name("x")
            .start_time(start)
            .end_time(start - Duration::seconds(1))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_self_parent() {
        let result = SpanRecord::builder()
            .id("s1")
            .parent_id("s1")
            .trace_id("t")
            .name("x")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_error_forces_error_status() {
        let span = SpanRecord::builder()
            .trace_id("t")
            .name("x")
            .status(Status::Completed)
            .error(ErrorInfo::new("ValueError", "boom"))
            .build()
            .unwrap();
        assert_eq!(span.status, Status::Error);
    }

    #[test]
    fn test_builder_computes_duration() {
        let start = Utc::now();
        let span = SpanRecord::builder()
            .trace_id("t")
            .name("x")
            .start_time(start)
            .end_time(start + Duration::milliseconds(250))
            .build()
            .unwrap();
        assert_eq!(span.duration_ms, Some(250.0));
    }

    #[test]
    fn test_validate_accepts_nested_spans() {
        let root = make_span("trace-1", None);
        let child = make_span("trace-1", Some(&root.id));
        let trace = make_trace(vec![root.clone(), child.clone()]);
        assert!(trace.validate().is_empty());
        assert_eq!(trace.children_of(&root.id).count(), 1);
        assert_eq!(trace.root_spans().count(), 1);
        assert_eq!(trace.span(&child.id).map(|s| s.name.as_str()), Some("step"));
    }

    #[test]
    fn test_validate_rejects_unknown_parent() {
        let orphan = make_span("trace-1", Some("missing"));
        let errors = make_trace(vec![orphan]).validate();
        assert!(errors.iter().any(|e| e.contains("unknown parent")));
    }

    #[test]
    fn test_validate_rejects_foreign_span() {
        let foreign = make_span("trace-2", None);
        let errors = make_trace(vec![foreign]).validate();
        assert!(errors.iter().any(|e| e.contains("trace-2")));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let a = make_span("trace-1", None);
        let mut b = make_span("trace-1", None);
        b.id = a.id.clone();
        let errors = make_trace(vec![a, b]).validate();
        assert!(errors.iter().any(|e| e.contains("Duplicate")));
    }

    #[test]
    fn test_wire_keys_are_camel_case() {
        let span = SpanRecord::builder()
            .trace_id("trace-1")
            .name("call")
            .span_type(SpanType::Llm)
            .tokens_usage(TokenUsage {
                prompt_tokens: Some(1),
                completion_tokens: Some(2),
                total_tokens: Some(3),
                ..Default::default()
            })
            .build()
            .unwrap();
        let value = serde_json::to_value(make_trace(vec![span])).unwrap();
        assert_eq!(value["projectName"], json!("demo"));
        assert!(value.get("startTime").is_some());
        let span = &value["spans"][0];
        assert_eq!(span["traceId"], json!("trace-1"));
        assert_eq!(span["spanType"], json!("llm"));
        assert_eq!(span["tokensUsage"]["totalTokens"], json!(3));
        assert!(span["parentId"].is_null());
    }

    #[test]
    fn test_parses_snake_case_body() {
        let body = json!({
            "id": "t1",
            "name": "legacy",
            "project_name": "demo",
            "start_time": "2025-01-01T00:00:00Z",
            "end_time": "2025-01-01T00:00:01Z",
            "duration": 1000.0,
            "status": "completed",
            "spans": [{
                "id": "s1",
                "trace_id": "t1",
                "parent_id": null,
                "name": "root",
                "start_time": "2025-01-01T00:00:00Z",
                "token_usage": {"prompt_tokens": 2, "completion_tokens": 3}
            }]
        });
        let trace = TraceRecord::from_json(&body.to_string()).unwrap();
        assert_eq!(trace.status, Status::Completed);
        assert_eq!(trace.duration_ms, Some(1000.0));
        assert_eq!(trace.spans[0].total_tokens(), 5);
        assert!(trace.validate().is_empty());
    }
}
