// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! # Sprint Lens
//!
//! Tracing SDK for LLM agents. It records traces (one logical operation)
//! made of nested spans (timed units of work), keeps track of which trace
//! and span are current for every thread and async task, and delivers
//! finished traces to a collector over HTTP in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ creates  ┌────────┐ span()  ┌────────┐
//! │  Client  │─────────▶│ Trace  │────────▶│  Span  │
//! └────┬─────┘          └───┬────┘         └───┬────┘
//!      │ log_trace          │ enter/in_scope   │ enter/in_scope
//!      ▼                    ▼                  ▼
//! ┌──────────┐        ┌──────────────────────────────┐
//! │ Exporter │        │ Context store (task table,   │
//! │ (thread) │        │ thread slot, carried context)│
//! └────┬─────┘        └──────────────────────────────┘
//!      │ Transport
//!      ▼
//!  collector  POST /api/v1/traces
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use sprintlens::{Client, ClientConfig, SpanType};
//!
//! # async fn run() -> sprintlens::Result<()> {
//! let client = Client::new(ClientConfig::new("http://localhost:3000").with_project("research"))?;
//! let trace = client.trace("answer-question");
//!
//! trace
//!     .in_scope_async(async {
//!         let retrieved = client
//!             .track("retrieve")
//!             .span_type(SpanType::Retrieval)
//!             .arg("query", "rust async")
//!             .call_async(async { vec!["doc-1", "doc-2"] })
//!             .await;
//!         retrieved.len()
//!     })
//!     .await;
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Instrumentation never changes the behavior of traced code: user errors
//! are recorded and passed through, delivery failures are logged and
//! retried. Only setup mistakes are returned as [`Error`].

#![warn(missing_debug_implementations, rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod context;
pub mod error;
mod exporter;
pub mod global;
pub mod provider;
pub mod span;
pub mod trace;
pub mod track;
pub mod transport;

pub use crate::client::Client;
pub use crate::config::{ClientConfig, DeliveryMode};
pub use crate::context::{Context, ContextGuard, FutureExt};
pub use crate::error::{Error, Result};
pub use crate::provider::{traced_completion, ChatMessage, Completion, LlmProvider, ProviderError, Usage};
pub use crate::span::{Span, SpanGuard};
pub use crate::trace::{SpanBuilder, Trace, TraceBuilder, TraceGuard};
pub use crate::track::Track;
pub use crate::transport::{DeliveryError, HttpTransport, MemoryTransport, Transport};

pub use sprintlens_core::{
    payload::PayloadLimits, Cost, ErrorInfo, Feedback, Metric, MetricValue, SpanRecord, SpanType,
    Status, TokenUsage, TraceRecord,
};
