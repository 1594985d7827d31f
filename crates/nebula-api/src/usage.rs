//! Asynchronous usage recording.
//!
//! Handlers enqueue [`UsageEvent`]s on a bounded channel without waiting. A
//! background worker drains the channel in batches into a [`UsageSink`]. A full
//! queue drops the event and counts it; sink failures are logged and counted.
//! Neither ever reaches the response path.

use nebuladb_core::{NebulaError, Result, UsageEvent};
use nebuladb_storage::UsageSink;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_BATCH_SIZE: usize = 64;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Usage queue configuration
#[derive(Debug, Clone)]
pub struct UsageConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

impl UsageConfig {
    pub fn from_env() -> Self {
        Self {
            queue_capacity: std::env::var("NEBULA_USAGE_QUEUE_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            batch_size: std::env::var("NEBULA_USAGE_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            shutdown_timeout_secs: std::env::var("NEBULA_USAGE_SHUTDOWN_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(NebulaError::ValidationError(
                "usage queue capacity must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(NebulaError::ValidationError(
                "usage batch size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Default)]
struct UsageCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of usage queue counters
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct UsageStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub written: u64,
    pub failed: u64,
    /// Accepted but not yet handed to the sink
    pub pending: u64,
    pub capacity: usize,
}

/// Cheap, cloneable handle for enqueuing usage events
#[derive(Debug, Clone)]
pub struct UsageRecorder {
    sender: mpsc::Sender<UsageEvent>,
    counters: Arc<UsageCounters>,
    capacity: usize,
}

impl UsageRecorder {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<UsageEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                counters: Arc::new(UsageCounters::default()),
                capacity,
            },
            receiver,
        )
    }

    /// Start the drain worker and return the recorder and its handle.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn UsageSink>, config: &UsageConfig) -> (Self, UsageWorkerHandle) {
        let (recorder, receiver) = Self::new(config.queue_capacity);
        let shutdown = Arc::new(Notify::new());
        let join = tokio::spawn(run_worker(
            receiver,
            sink,
            config.batch_size,
            recorder.counters.clone(),
            shutdown.clone(),
        ));
        info!(
            capacity = config.queue_capacity,
            batch_size = config.batch_size,
            "Usage recorder started"
        );
        (recorder, UsageWorkerHandle { shutdown, join })
    }

    /// Enqueue without waiting. Returns false when the event was dropped.
    pub fn record(&self, event: UsageEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.note_dropped(&event, "queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.note_dropped(&event, "recorder stopped");
                false
            }
        }
    }

    fn note_dropped(&self, event: &UsageEvent, reason: &str) {
        let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            event_type = %event.event_type,
            database_id = ?event.database_id,
            reason = reason,
            dropped_total = dropped,
            "Dropped usage event"
        );
        #[cfg(feature = "metrics")]
        crate::metrics::record_usage_dropped();
    }

    pub fn stats(&self) -> UsageStats {
        let enqueued = self.counters.enqueued.load(Ordering::Relaxed);
        let written = self.counters.written.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        UsageStats {
            enqueued,
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            written,
            failed,
            pending: enqueued.saturating_sub(written + failed),
            capacity: self.capacity,
        }
    }
}

/// Owner handle for the drain worker
#[derive(Debug)]
pub struct UsageWorkerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl UsageWorkerHandle {
    /// Stop accepting events, flush what is queued, and wait up to `timeout`.
    ///
    /// Returns true when the queue was fully drained in time.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.shutdown.notify_one();
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => {
                info!("Usage recorder drained");
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "Usage worker task failed");
                false
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Usage drain timed out");
                false
            }
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<UsageEvent>,
    sink: Arc<dyn UsageSink>,
    batch_size: usize,
    counters: Arc<UsageCounters>,
    shutdown: Arc<Notify>,
) {
    let mut batch = Vec::with_capacity(batch_size);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                receiver.close();
                while let Some(event) = receiver.recv().await {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        write_batch(sink.as_ref(), &mut batch, &counters).await;
                    }
                }
                write_batch(sink.as_ref(), &mut batch, &counters).await;
                break;
            }
            received = receiver.recv() => match received {
                Some(event) => {
                    batch.push(event);
                    while batch.len() < batch_size {
                        match receiver.try_recv() {
                            Ok(event) => batch.push(event),
                            Err(_) => break,
                        }
                    }
                    write_batch(sink.as_ref(), &mut batch, &counters).await;
                }
                None => {
                    write_batch(sink.as_ref(), &mut batch, &counters).await;
                    break;
                }
            },
        }
    }
    debug!("Usage worker stopped");
}

async fn write_batch(sink: &dyn UsageSink, batch: &mut Vec<UsageEvent>, counters: &UsageCounters) {
    if batch.is_empty() {
        return;
    }
    let size = batch.len() as u64;
    match sink.record_batch(batch).await {
        Ok(written) => {
            counters.written.fetch_add(size, Ordering::Relaxed);
            debug!(count = written, "Wrote usage batch");
        }
        Err(e) => {
            counters.failed.fetch_add(size, Ordering::Relaxed);
            error!(error = %e, count = size, "Failed to write usage batch");
        }
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nebuladb_core::UsageEventType;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<UsageEvent>>,
        batches: AtomicU64,
    }

    #[async_trait]
    impl UsageSink for CollectingSink {
        async fn record_batch(&self, events: &[UsageEvent]) -> Result<usize> {
            self.batches.fetch_add(1, Ordering::Relaxed);
            self.events.lock().await.extend_from_slice(events);
            Ok(events.len())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl UsageSink for FailingSink {
        async fn record_batch(&self, _events: &[UsageEvent]) -> Result<usize> {
            Err(NebulaError::Other("sink offline".to_string()))
        }
    }

    fn event(n: u64) -> UsageEvent {
        UsageEvent::new(
            Some("proj".to_string()),
            Some("db-1".to_string()),
            UsageEventType::ApiCall,
            json!({ "n": n }),
        )
    }

    #[tokio::test]
    async fn test_events_reach_sink_and_drain_on_shutdown() {
        let sink = Arc::new(CollectingSink::default());
        let (recorder, handle) = UsageRecorder::spawn(
            sink.clone(),
            &UsageConfig {
                queue_capacity: 256,
                batch_size: 8,
                shutdown_timeout_secs: 5,
            },
        );

        for n in 0..100 {
            assert!(recorder.record(event(n)));
        }
        assert!(handle.shutdown(Duration::from_secs(5)).await);

        let events = sink.events.lock().await;
        assert_eq!(events.len(), 100);
        assert_eq!(events[0].details["n"], 0);
        assert_eq!(events[99].details["n"], 99);

        let stats = recorder.stats();
        assert_eq!(stats.written, 100);
        assert_eq!(stats.pending, 0);
        assert!(sink.batches.load(Ordering::Relaxed) >= 100 / 8);

        // The worker is gone; further events are dropped and counted.
        assert!(!recorder.record(event(100)));
        assert_eq!(recorder.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (recorder, _receiver) = UsageRecorder::new(2);
        assert!(recorder.record(event(1)));
        assert!(recorder.record(event(2)));
        assert!(!recorder.record(event(3)));

        let stats = recorder.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.capacity, 2);
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted() {
        let (recorder, handle) = UsageRecorder::spawn(Arc::new(FailingSink), &UsageConfig::default());
        assert!(recorder.record(event(1)));
        assert!(recorder.record(event(2)));
        assert!(handle.shutdown(Duration::from_secs(5)).await);

        let stats = recorder.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.written, 0);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_config_validate() {
        assert!(UsageConfig::default().validate().is_ok());
        assert!(UsageConfig {
            batch_size: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
