// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! The collector client: composition root for traces and their delivery.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::exporter::Exporter;
use crate::trace::{Trace, TraceBuilder};
use crate::track::Track;
use crate::transport::{HttpTransport, Transport};
use sprintlens_core::TraceRecord;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Creates traces and delivers them to the collector.
///
/// Cheap to clone; all clones share one exporter. The exporter drains its
/// buffer one last time when the last clone (including the ones held by
/// traces) is dropped, or explicitly through [`Client::shutdown`].
///
/// ```no_run
/// # async fn run() -> sprintlens::Result<()> {
/// use sprintlens::{Client, ClientConfig};
///
/// let client = Client::new(ClientConfig::new("http://localhost:3000").with_project("agents"))?;
/// let trace = client.trace("research");
/// trace
///     .in_scope_async(async {
///         // spans created here attach to `trace`
///     })
///     .await;
/// client.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    exporter: Exporter,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("exporter", &self.inner.exporter)
            .finish()
    }
}

impl Client {
    /// Validate `config` and start delivering over HTTP.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, transport)
    }

    /// Like [`Client::new`] with a custom transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let exporter = Exporter::start(&config, transport)?;
        info!(
            url = %config.url,
            project = %config.project_name,
            mode = ?config.mode,
            enabled = config.enabled,
            "Sprint Lens client started"
        );
        Ok(Self {
            inner: Arc::new(ClientInner { config, exporter }),
        })
    }

    /// Build a client from `SPRINTLENS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Create a trace bound to this client.
    pub fn trace(&self, name: impl Into<String>) -> Trace {
        self.trace_builder(name).build()
    }

    /// Builder for a trace bound to this client, for ids, users, sessions, tags.
    pub fn trace_builder(&self, name: impl Into<String>) -> TraceBuilder {
        Trace::builder(name).client(self)
    }

    /// Automatic tracking for one call.
    pub fn track(&self, name: impl Into<String>) -> Track {
        Track::new(self, name)
    }

    /// Finish `trace` if needed and queue it for delivery.
    ///
    /// Each trace is queued at most once; later calls (and calls after
    /// [`Trace::flush`]) return `false`.
    pub fn log_trace(&self, trace: &Trace) -> bool {
        if !trace.mark_flushed() {
            debug!(trace_id = %trace.id(), "Trace already handed to the collector client");
            return false;
        }
        trace.finish();
        self.log_record(trace.to_record());
        true
    }

    /// Queue an already-serialized trace.
    pub fn log_record(&self, record: TraceRecord) {
        if !self.inner.config.enabled {
            debug!(trace_id = %record.id, "Client disabled; trace not exported");
            return;
        }
        self.inner.exporter.enqueue(record);
    }

    /// Attempt delivery of everything buffered. Never fails; undelivered
    /// traces stay buffered.
    pub async fn flush(&self) {
        self.inner.exporter.flush().await;
    }

    /// Blocking [`Client::flush`] for code without an async runtime.
    ///
    /// Do not call this from inside an async task; use `flush().await`.
    pub fn flush_blocking(&self) {
        self.inner.exporter.flush_blocking();
    }

    /// Final drain. Traces logged afterwards are dropped.
    pub async fn shutdown(&self) {
        self.inner.exporter.shutdown().await;
        info!(remaining = self.buffered_len(), "Sprint Lens client shut down");
    }

    /// Traces waiting for delivery, including re-queued failures.
    pub fn buffered_len(&self) -> usize {
        self.inner.exporter.buffered_len()
    }
}
