// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Client configuration.
//!
//! Every field has a default, so an empty environment yields a client that
//! batches traces to `http://localhost:3000`. Environment variables use the
//! `SPRINTLENS_` prefix:
//!
//! ```text
//! SPRINTLENS_URL=https://lens.internal:8443
//! SPRINTLENS_API_KEY=...
//! SPRINTLENS_PROJECT_NAME=research-agent
//! SPRINTLENS_MODE=immediate
//! SPRINTLENS_BATCH_SIZE=25
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sprintlens_core::PayloadLimits;
use std::fmt;
use std::time::Duration;

/// Path of the trace ingestion endpoint, relative to the collector URL.
pub const TRACES_PATH: &str = "/api/v1/traces";

/// How finished traces are handed to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Buffer traces and send them in batches.
    Batched,
    /// Wake the exporter for every trace.
    Immediate,
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Batched
    }
}

/// Configuration for a [`crate::Client`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Collector base URL.
    pub url: String,
    /// Sent as `Authorization: Bearer <key>` when present.
    pub api_key: Option<String>,
    /// Project every trace is attached to.
    pub project_name: String,
    /// When false, traces are recorded but never exported.
    pub enabled: bool,
    pub mode: DeliveryMode,
    /// Traces per request, and the buffer size that triggers an early send.
    pub batch_size: usize,
    /// Interval of the background flush timer.
    pub flush_interval_ms: u64,
    /// Per-request HTTP timeout.
    pub timeout_ms: u64,
    /// Retries inside a single send attempt.
    pub max_retries: u32,
    /// Base delay of the in-request exponential backoff.
    pub retry_backoff_ms: u64,
    /// Buffer bound; the oldest traces are dropped beyond it.
    pub max_buffered_traces: usize,
    /// Encoded size ceiling for inputs, outputs and metadata values.
    pub max_payload_bytes: usize,
    /// Nesting ceiling for inputs, outputs and metadata values.
    pub max_payload_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let limits = PayloadLimits::default();
        Self {
            url: "http://localhost:3000".to_string(),
            api_key: None,
            project_name: "default".to_string(),
            enabled: true,
            mode: DeliveryMode::Batched,
            batch_size: 10,
            flush_interval_ms: 5_000,
            timeout_ms: 10_000,
            max_retries: 2,
            retry_backoff_ms: 100,
            max_buffered_traces: 1_000,
            max_payload_bytes: limits.max_bytes,
            max_payload_depth: limits.max_depth,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("project_name", &self.project_name)
            .field("enabled", &self.enabled)
            .field("mode", &self.mode)
            .field("batch_size", &self.batch_size)
            .field("flush_interval_ms", &self.flush_interval_ms)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_buffered_traces", &self.max_buffered_traces)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .field("max_payload_depth", &self.max_payload_depth)
            .finish()
    }
}

impl ClientConfig {
    /// Creates a config pointing at the given collector.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Load from `SPRINTLENS_*` environment variables, then validate.
    pub fn from_env() -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::Environment::with_prefix("SPRINTLENS").try_parsing(true))
            .build()?;
        let config: ClientConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_project(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = duration_to_ms(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_to_ms(timeout);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = duration_to_ms(backoff);
        self
    }

    pub fn with_max_buffered_traces(mut self, max: usize) -> Self {
        self.max_buffered_traces = max;
        self
    }

    pub fn with_payload_limits(mut self, limits: PayloadLimits) -> Self {
        self.max_payload_bytes = limits.max_bytes;
        self.max_payload_depth = limits.max_depth;
        self
    }

    /// Reject configurations the exporter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::invalid_config("url must not be empty"));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(Error::invalid_config(format!(
                "url must start with http:// or https://, got {}",
                self.url
            )));
        }
        if self.project_name.trim().is_empty() {
            return Err(Error::invalid_config("project_name must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_config("batch_size must be at least 1"));
        }
        if self.max_buffered_traces < self.batch_size {
            return Err(Error::invalid_config(format!(
                "max_buffered_traces ({}) must be >= batch_size ({})",
                self.max_buffered_traces, self.batch_size
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::invalid_config("flush_interval_ms must be positive"));
        }
        if self.max_payload_bytes == 0 || self.max_payload_depth == 0 {
            return Err(Error::invalid_config("payload limits must be positive"));
        }
        Ok(())
    }

    pub fn payload_limits(&self) -> PayloadLimits {
        PayloadLimits {
            max_bytes: self.max_payload_bytes,
            max_depth: self.max_payload_depth,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Full URL of the trace ingestion endpoint.
    pub fn traces_endpoint(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), TRACES_PATH)
    }
}

fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
