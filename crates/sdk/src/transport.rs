// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Delivery of trace batches to the collector.
//!
//! The exporter only sees the [`Transport`] trait. [`HttpTransport`] is the
//! production implementation; [`MemoryTransport`] keeps everything in memory
//! and is handy for tests and offline runs.

use crate::config::ClientConfig;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use sprintlens_core::TraceRecord;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Why a batch could not be delivered. Only ever logged.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Collector responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

/// Sends one batch of finished traces.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, batch: &[TraceRecord]) -> Result<(), DeliveryError>;
}

/// POSTs batches to `<url>/api/v1/traces`.
///
/// A single trace is sent as an object, several as an array. Each call makes
/// up to `max_retries + 1` attempts with exponential backoff between them.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    max_retries: u32,
    backoff: Duration,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("sprintlens-rust/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.traces_endpoint(),
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn encode(batch: &[TraceRecord]) -> Result<Vec<u8>, DeliveryError> {
        let body = match batch {
            [single] => serde_json::to_vec(single)?,
            _ => serde_json::to_vec(batch)?,
        };
        Ok(body)
    }

    async fn attempt(&self, body: Vec<u8>) -> Result<(), DeliveryError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &[TraceRecord]) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = Self::encode(batch)?;

        let mut attempt = 0;
        loop {
            match self.attempt(body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    let delay = self.backoff.saturating_mul(2u32.saturating_pow(attempt));
                    debug!(
                        endpoint = %self.endpoint,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying trace delivery"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Collects delivered batches in memory.
///
/// [`MemoryTransport::fail_next`] makes the next sends fail, which is how
/// delivery failures are simulated without a network.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    batches: Mutex<Vec<Vec<TraceRecord>>>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of `send` calls so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successfully delivered batches, in delivery order.
    pub fn batches(&self) -> Vec<Vec<TraceRecord>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All delivered traces, flattened.
    pub fn traces(&self) -> Vec<TraceRecord> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, batch: &[TraceRecord]) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeliveryError::Rejected("simulated failure".to_string()));
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sprintlens_core::Status;
    use std::collections::HashMap;

    fn record(name: &str) -> TraceRecord {
        TraceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            project_name: "test".to_string(),
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
            spans: Vec::new(),
        }
    }

    #[test]
    fn test_single_trace_is_encoded_as_object() {
        let body = HttpTransport::encode(&[record("one")]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value.is_object());
        assert_eq!(value["name"], "one");
    }

    #[test]
    fn test_batch_is_encoded_as_array() {
        let body = HttpTransport::encode(&[record("a"), record("b")]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_endpoint_from_config() {
        let transport = HttpTransport::new(&ClientConfig::new("http://collector:9000/")).unwrap();
        assert_eq!(transport.endpoint(), "http://collector:9000/api/v1/traces");
    }

    #[tokio::test]
    async fn test_memory_transport_fails_on_demand() {
        let transport = MemoryTransport::new();
        transport.fail_next(1);
        assert!(transport.send(&[record("x")]).await.is_err());
        assert!(transport.send(&[record("y")]).await.is_ok());
        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.traces().len(), 1);
        assert_eq!(transport.traces()[0].name, "y");
    }
}
