// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Data model for the Sprint Lens observability SDK.
//!
//! This crate holds everything that is shared between the live tracing
//! engine (`sprintlens`) and anything that consumes its output: the wire
//! records posted to the collector, the value types they carry, and the
//! payload sanitization rules applied to user data.
//!
//! # Modules
//!
//! - [`record`] - `TraceRecord` / `SpanRecord`, the collector wire shape
//! - [`types`] - statuses, span types, metrics, errors, token usage, cost
//! - [`payload`] - depth/size limits, truncation marking, redaction

#![warn(missing_debug_implementations, rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod error;
pub mod payload;
pub mod record;
pub mod types;

pub use error::{Error, Result};
pub use payload::PayloadLimits;
pub use record::{SpanId, SpanRecord, SpanRecordBuilder, TraceId, TraceRecord};
pub use types::{Cost, ErrorInfo, Feedback, Metric, MetricValue, SpanType, Status, TokenUsage};
