// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Background delivery of finished traces.
//!
//! Traces are appended to a bounded in-memory buffer. A dedicated worker
//! thread (`sprintlens-exporter`, running its own single-threaded tokio
//! runtime) drains the buffer:
//!
//! - on every tick of the flush timer,
//! - when the buffer reaches `batch_size` (or on every trace in immediate
//!   mode),
//! - when a flush or shutdown is requested.
//!
//! A drain takes the whole buffer under the lock, releases it, and sends the
//! snapshot in chunks of `batch_size`. Chunks that fail are put back at the
//! front of the buffer and wait for the next timer tick; early wake-ups are
//! ignored until then. When the buffer would exceed `max_buffered_traces`
//! the oldest traces are dropped.

use crate::config::{ClientConfig, DeliveryMode};
use crate::transport::Transport;
use sprintlens_core::TraceRecord;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type Buffer = Arc<Mutex<VecDeque<TraceRecord>>>;

fn lock(buffer: &Buffer) -> MutexGuard<'_, VecDeque<TraceRecord>> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop the oldest entries beyond `max`. Returns how many were dropped.
fn enforce_bound(buffer: &mut VecDeque<TraceRecord>, max: usize) -> usize {
    let excess = buffer.len().saturating_sub(max);
    buffer.drain(..excess);
    excess
}

enum Ack {
    Async(oneshot::Sender<()>),
    Blocking(std::sync::mpsc::Sender<()>),
    None,
}

impl Ack {
    fn send(self) {
        match self {
            Ack::Async(tx) => {
                let _ = tx.send(());
            }
            Ack::Blocking(tx) => {
                let _ = tx.send(());
            }
            Ack::None => {}
        }
    }
}

enum Command {
    Wake,
    Flush(Ack),
    Shutdown(Ack),
}

/// Handle to the exporter worker. Dropping it asks the worker to drain the
/// buffer one last time and waits, at most `drain_timeout`, for it to exit.
pub(crate) struct Exporter {
    buffer: Buffer,
    commands: mpsc::UnboundedSender<Command>,
    worker: Option<JoinHandle<()>>,
    drain_timeout: Duration,
    batch_size: usize,
    max_buffered: usize,
    mode: DeliveryMode,
    closed: AtomicBool,
}

impl fmt::Debug for Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exporter")
            .field("buffered", &self.buffered_len())
            .field("batch_size", &self.batch_size)
            .field("max_buffered", &self.max_buffered)
            .field("mode", &self.mode)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

impl Exporter {
    /// Spawn the worker thread.
    pub(crate) fn start(config: &ClientConfig, transport: Arc<dyn Transport>) -> crate::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let buffer: Buffer = Arc::new(Mutex::new(VecDeque::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            buffer: Arc::clone(&buffer),
            transport,
            rx,
            batch_size: config.batch_size,
            max_buffered: config.max_buffered_traces,
            interval: config.flush_interval(),
            backing_off: false,
        };
        let handle = std::thread::Builder::new()
            .name("sprintlens-exporter".to_string())
            .spawn(move || runtime.block_on(worker.run()))?;

        Ok(Self {
            buffer,
            commands: tx,
            worker: Some(handle),
            drain_timeout: drain_timeout(config),
            batch_size: config.batch_size,
            max_buffered: config.max_buffered_traces,
            mode: config.mode,
            closed: AtomicBool::new(false),
        })
    }

    /// Buffer a finished trace.
    pub(crate) fn enqueue(&self, record: TraceRecord) {
        if self.closed.load(Ordering::SeqCst) {
            warn!(trace_id = %record.id, "Exporter is shut down; dropping trace");
            return;
        }

        let (len, dropped) = {
            let mut buffer = lock(&self.buffer);
            buffer.push_back(record);
            let dropped = enforce_bound(&mut buffer, self.max_buffered);
            (buffer.len(), dropped)
        };
        if dropped > 0 {
            warn!(
                dropped,
                max_buffered = self.max_buffered,
                "Trace buffer full; dropped oldest traces"
            );
        }

        if self.mode == DeliveryMode::Immediate || len >= self.batch_size {
            let _ = self.commands.send(Command::Wake);
        }
    }

    pub(crate) fn buffered_len(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Wait until everything buffered so far has been attempted once.
    pub(crate) async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Flush(Ack::Async(tx))).is_ok() {
            let _ = rx.await;
        }
    }

    /// Blocking variant of [`Exporter::flush`] for synchronous callers.
    pub(crate) fn flush_blocking(&self) {
        let (tx, rx) = std::sync::mpsc::channel();
        if self.commands.send(Command::Flush(Ack::Blocking(tx))).is_ok() {
            let _ = rx.recv();
        }
    }

    /// Final drain; the worker exits afterwards. Later traces are dropped.
    pub(crate) async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(Ack::Async(tx))).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Drop for Exporter {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(handle) = self.worker.take() else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            let _ = self.commands.send(Command::Shutdown(Ack::None));
            return;
        }

        let (tx, rx) = std::sync::mpsc::channel();
        if self.commands.send(Command::Shutdown(Ack::Blocking(tx))).is_err() {
            return;
        }
        match rx.recv_timeout(self.drain_timeout) {
            Ok(()) => {
                if handle.join().is_err() {
                    error!("Exporter thread panicked");
                }
            }
            Err(_) => warn!(
                timeout_ms = self.drain_timeout.as_millis() as u64,
                buffered = self.buffered_len(),
                "Final drain did not finish in time; detaching exporter"
            ),
        }
    }
}

/// Upper bound on one delivery attempt including in-request retries.
fn drain_timeout(config: &ClientConfig) -> Duration {
    let attempts = config.max_retries.saturating_add(1);
    let backoff = config
        .retry_backoff()
        .saturating_mul(2u32.saturating_pow(config.max_retries.min(16)));
    config
        .timeout()
        .saturating_mul(attempts)
        .saturating_add(backoff)
}

struct Worker {
    buffer: Buffer,
    transport: Arc<dyn Transport>,
    rx: mpsc::UnboundedReceiver<Command>,
    batch_size: usize,
    max_buffered: usize,
    interval: Duration,
    backing_off: bool,
}

impl Worker {
    async fn run(mut self) {
        debug!(interval_ms = self.interval.as_millis() as u64, "Exporter started");
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.backing_off = false;
                    self.drain().await;
                }
                command = self.rx.recv() => match command {
                    Some(Command::Wake) => {
                        if !self.backing_off {
                            self.drain().await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.drain().await;
                        ack.send();
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.drain().await;
                        ack.send();
                        break;
                    }
                    None => {
                        self.drain().await;
                        break;
                    }
                },
            }
        }

        let remaining = lock(&self.buffer).len();
        if remaining > 0 {
            error!(remaining, "Exporter stopped with undelivered traces");
        } else {
            info!("Exporter stopped");
        }
    }

    /// Send everything currently buffered. Returns `false` if a chunk failed.
    async fn drain(&mut self) -> bool {
        let mut pending: Vec<TraceRecord> = lock(&self.buffer).drain(..).collect();
        if pending.is_empty() {
            return true;
        }

        let mut start = 0;
        while start < pending.len() {
            let end = (start + self.batch_size).min(pending.len());
            match self.transport.send(&pending[start..end]).await {
                Ok(()) => {
                    debug!(count = end - start, "Delivered traces");
                    start = end;
                }
                Err(e) => {
                    let failed = pending.split_off(start);
                    warn!(
                        failed = failed.len(),
                        error = %e,
                        "Trace delivery failed; re-queued for the next cycle"
                    );
                    self.requeue(failed);
                    self.backing_off = true;
                    return false;
                }
            }
        }
        true
    }

    fn requeue(&self, failed: Vec<TraceRecord>) {
        let dropped = {
            let mut buffer = lock(&self.buffer);
            let mut restored: VecDeque<TraceRecord> = failed.into();
            restored.extend(buffer.drain(..));
            *buffer = restored;
            enforce_bound(&mut buffer, self.max_buffered)
        };
        if dropped > 0 {
            warn!(
                dropped,
                max_buffered = self.max_buffered,
                "Trace buffer full; dropped oldest traces"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
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
            status: Status::Completed,
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

    fn config() -> ClientConfig {
        ClientConfig::default()
            .with_batch_size(2)
            .with_max_buffered_traces(4)
            .with_flush_interval(Duration::from_secs(3600))
    }

    #[test]
    fn test_enforce_bound_drops_oldest() {
        let mut buffer: VecDeque<TraceRecord> = (0..5).map(|i| record(&i.to_string())).collect();
        assert_eq!(enforce_bound(&mut buffer, 3), 2);
        let names: Vec<&str> = buffer.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_flush_sends_in_batches() {
        let transport = Arc::new(MemoryTransport::new());
        let exporter = Exporter::start(&config().with_max_buffered_traces(10), transport.clone()).unwrap();
        for i in 0..5 {
            exporter.enqueue(record(&format!("t{}", i)));
        }
        exporter.flush().await;

        assert_eq!(exporter.buffered_len(), 0);
        assert_eq!(transport.traces().len(), 5);
        assert!(transport.batches().iter().all(|b| b.len() <= 2));
    }

    #[tokio::test]
    async fn test_failed_batch_is_requeued() {
        let transport = Arc::new(MemoryTransport::new());
        let exporter = Exporter::start(&config(), transport.clone()).unwrap();
        transport.fail_next(1);
        exporter.enqueue(record("a"));
        exporter.flush().await;

        assert_eq!(exporter.buffered_len(), 1);
        assert!(transport.traces().is_empty());

        exporter.flush().await;
        assert_eq!(exporter.buffered_len(), 0);
        assert_eq!(transport.traces()[0].name, "a");
    }

    #[tokio::test]
    async fn test_buffer_is_bounded_under_outage() {
        let transport = Arc::new(MemoryTransport::new());
        let exporter = Exporter::start(&config(), transport.clone()).unwrap();
        transport.fail_next(usize::MAX);
        for i in 0..10 {
            exporter.enqueue(record(&format!("t{}", i)));
        }
        exporter.flush().await;

        assert!(exporter.buffered_len() <= 4);
        assert!(transport.traces().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_closes() {
        let transport = Arc::new(MemoryTransport::new());
        let exporter = Exporter::start(&config(), transport.clone()).unwrap();
        exporter.enqueue(record("last"));
        exporter.shutdown().await;
        assert_eq!(transport.traces().len(), 1);

        exporter.enqueue(record("late"));
        assert_eq!(exporter.buffered_len(), 0);
    }

    #[test]
    fn test_flush_blocking() {
        let transport = Arc::new(MemoryTransport::new());
        let exporter = Exporter::start(&config(), transport.clone()).unwrap();
        exporter.enqueue(record("sync"));
        exporter.flush_blocking();
        assert_eq!(transport.traces().len(), 1);
    }

    #[test]
    fn test_drop_waits_for_final_drain() {
        let transport = Arc::new(MemoryTransport::new());
        let exporter = Exporter::start(&config(), transport.clone()).unwrap();
        exporter.enqueue(record("a"));
        exporter.enqueue(record("b"));
        exporter.enqueue(record("c"));
        drop(exporter);
        assert_eq!(transport.traces().len(), 3);
    }

    #[test]
    fn test_drain_timeout_covers_retries() {
        let config = ClientConfig::default()
            .with_timeout(Duration::from_secs(2))
            .with_retries(2, Duration::from_millis(100));
        assert_eq!(drain_timeout(&config), Duration::from_millis(6400));
    }
}
