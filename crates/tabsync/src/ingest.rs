//! Ingestion pipeline
//!
//! Accepted rows are persisted first, then appended to their source's queue.
//! One worker per source drains that queue in batches and forwards each batch
//! until the platform acknowledges it:
//!
//! ```text
//!   Idle --push/notice--> Accumulating --worker--> Forwarding --ok--> Idle | Accumulating
//!                                                      |  ^
//!                                                 fail v  | retry delay
//!                                                    Backoff
//! ```
//!
//! A batch is never dropped. Shutdown during backoff puts the batch back at
//! the head of the queue.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ForwardSettings;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::field::Instance;
use crate::forward::Forwarder;
use crate::registry::{Source, SourceRegistry};

/// Default number of instances per forward call
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default delay between forward attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Ingestion state of one source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IngestState {
    /// Nothing queued, nothing in flight
    Idle = 0,
    /// Rows queued, worker not yet forwarding them
    Accumulating = 1,
    /// A batch is in flight
    Forwarding = 2,
    /// Last attempt failed, waiting to retry
    Backoff = 3,
}

impl IngestState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Accumulating,
            2 => Self::Forwarding,
            3 => Self::Backoff,
            _ => Self::Idle,
        }
    }
}

/// Snapshot of a source's ingestion statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestStats {
    /// Rows written to the backing table
    pub rows_persisted: u64,
    /// Rows acknowledged by the platform
    pub rows_forwarded: u64,
    /// Successful forward calls
    pub batches_forwarded: u64,
    /// Failed forward attempts
    pub forward_failures: u64,
    /// Rows waiting in the queue
    pub queue_depth: usize,
    /// Current state
    pub state: IngestState,
}

#[derive(Debug, Default)]
struct AtomicIngestStats {
    rows_persisted: AtomicU64,
    rows_forwarded: AtomicU64,
    batches_forwarded: AtomicU64,
    forward_failures: AtomicU64,
}

/// Per-source queue of instances waiting to be forwarded.
///
/// Any number of producers may push; exactly one worker drains it.
#[derive(Debug)]
pub struct SourceQueue {
    pending: Mutex<VecDeque<Instance>>,
    wake: Notify,
    notice: AtomicBool,
    state: AtomicU8,
    stats: AtomicIngestStats,
}

impl Default for SourceQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceQueue {
    /// Create an empty queue in the `Idle` state
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            notice: AtomicBool::new(false),
            state: AtomicU8::new(IngestState::Idle as u8),
            stats: AtomicIngestStats::default(),
        }
    }

    /// Append an instance and wake the worker
    pub fn push(&self, instance: Instance) {
        self.pending.lock().push_back(instance);
        self.mark_accumulating();
        self.wake.notify_one();
    }

    /// Request a forward pass even if nothing is queued
    pub fn notice(&self) {
        self.notice.store(true, Ordering::Release);
        self.mark_accumulating();
        self.wake.notify_one();
    }

    /// Take up to `max` instances from the head of the queue.
    ///
    /// Returns `None` if nothing is queued and no notice is pending; a pending
    /// notice with an empty queue yields an empty batch.
    pub fn take_batch(&self, max: usize) -> Option<Vec<Instance>> {
        let noticed = self.notice.swap(false, Ordering::AcqRel);
        let mut pending = self.pending.lock();
        if pending.is_empty() && !noticed {
            return None;
        }
        let n = pending.len().min(max);
        Some(pending.drain(..n).collect())
    }

    /// Put a batch back at the head of the queue, keeping its order
    pub fn requeue_front(&self, batch: Vec<Instance>) {
        if batch.is_empty() {
            self.notice.store(true, Ordering::Release);
            return;
        }
        let mut pending = self.pending.lock();
        for instance in batch.into_iter().rev() {
            pending.push_front(instance);
        }
    }

    /// Number of queued instances
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Current state
    pub fn state(&self) -> IngestState {
        IngestState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: IngestState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn mark_accumulating(&self) {
        let _ = self.state.compare_exchange(
            IngestState::Idle as u8,
            IngestState::Accumulating as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Wait until woken by a push or notice
    pub async fn notified(&self) {
        self.wake.notified().await
    }

    /// Statistics snapshot
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            rows_persisted: self.stats.rows_persisted.load(Ordering::Relaxed),
            rows_forwarded: self.stats.rows_forwarded.load(Ordering::Relaxed),
            batches_forwarded: self.stats.batches_forwarded.load(Ordering::Relaxed),
            forward_failures: self.stats.forward_failures.load(Ordering::Relaxed),
            queue_depth: self.len(),
            state: self.state(),
        }
    }
}

/// Worker tuning
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Maximum instances per forward call
    pub batch_size: usize,
    /// Delay between failed attempts
    pub retry_delay: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl From<&ForwardSettings> for IngestSettings {
    fn from(settings: &ForwardSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }
}

/// Persists accepted rows and drives one forwarding worker per source
pub struct IngestPipeline {
    registry: Arc<SourceRegistry>,
    db: Database,
    forwarder: Arc<dyn Forwarder>,
    settings: IngestSettings,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestPipeline {
    /// Create a pipeline; workers start with [`IngestPipeline::start`]
    pub fn new(
        registry: Arc<SourceRegistry>,
        db: Database,
        forwarder: Arc<dyn Forwarder>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            registry,
            db,
            forwarder,
            settings,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// The registry this pipeline serves
    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Spawn one worker per source. Calling it again has no effect.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for source in self.registry.sources() {
            let worker = Worker {
                source: Arc::clone(source),
                forwarder: Arc::clone(&self.forwarder),
                settings: self.settings.clone(),
                cancel: self.cancel.child_token(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        info!(sources = workers.len(), "ingestion workers started");
    }

    /// Persist each instance in order and queue it for forwarding.
    ///
    /// Stops at the first write failure; instances before it stay persisted
    /// and queued. Returns the number of instances accepted.
    pub async fn push_instances(&self, source: &Source, instances: Vec<Instance>) -> Result<usize> {
        let mut accepted = 0;
        for instance in instances {
            if let Err(e) = self.db.insert(source, &instance).await {
                error!(
                    source = %source.public_key(),
                    table = %source.table(),
                    accepted,
                    error = %e,
                    "failed to persist instance"
                );
                return Err(e);
            }
            source
                .queue()
                .stats
                .rows_persisted
                .fetch_add(1, Ordering::Relaxed);
            source.queue().push(instance);
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Decode wire objects against the source's fields, then push them
    pub async fn push_wire(&self, source: &Source, objects: &[serde_json::Value]) -> Result<usize> {
        let instances = objects
            .iter()
            .map(|o| {
                Instance::from_wire(source.fields(), o)
                    .ok_or_else(|| Error::InvalidInstance("expected a JSON object".into()))
            })
            .collect::<Result<Vec<_>>>()?;
        self.push_instances(source, instances).await
    }

    /// Force a forward pass for `source` without adding rows
    pub fn notice_update(&self, source: &Source) {
        debug!(source = %source.public_key(), "update noticed");
        source.queue().notice();
    }

    /// Stop the workers and wait for them to exit.
    ///
    /// A worker finishes the forward call it is in; a batch waiting for a
    /// retry is put back on its queue.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "ingestion worker panicked");
            }
        }
        info!("ingestion workers stopped");
    }
}

impl Drop for IngestPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    source: Arc<Source>,
    forwarder: Arc<dyn Forwarder>,
    settings: IngestSettings,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let queue = self.source.queue();
        debug!(source = %self.source.public_key(), "ingestion worker running");

        'outer: loop {
            while let Some(batch) = queue.take_batch(self.settings.batch_size) {
                queue.set_state(IngestState::Forwarding);
                if !self.forward_until_acknowledged(&batch).await {
                    queue.requeue_front(batch);
                    break 'outer;
                }
                queue.set_state(if queue.is_empty() {
                    IngestState::Idle
                } else {
                    IngestState::Accumulating
                });
            }

            queue.set_state(IngestState::Idle);
            // A push between take_batch and here left a stored permit.
            if !queue.is_empty() {
                queue.mark_accumulating();
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = queue.notified() => {}
            }
        }

        debug!(
            source = %self.source.public_key(),
            queued = queue.len(),
            "ingestion worker stopped"
        );
    }

    /// Returns `false` if cancelled while waiting to retry
    async fn forward_until_acknowledged(&self, batch: &[Instance]) -> bool {
        let queue = self.source.queue();
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            match self.forwarder.forward(&self.source, batch).await {
                Ok(()) => {
                    queue.stats.batches_forwarded.fetch_add(1, Ordering::Relaxed);
                    queue
                        .stats
                        .rows_forwarded
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    debug!(
                        source = %self.source.public_key(),
                        batch = batch.len(),
                        attempt,
                        "batch forwarded"
                    );
                    return true;
                }
                Err(e) => {
                    queue.stats.forward_failures.fetch_add(1, Ordering::Relaxed);
                    queue.set_state(IngestState::Backoff);
                    warn!(
                        source = %self.source.public_key(),
                        batch = batch.len(),
                        attempt,
                        backoff_ms = self.settings.retry_delay.as_millis() as u64,
                        queue_depth = queue.len(),
                        error = %e,
                        "forward failed, retrying"
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(self.settings.retry_delay) => {}
                    }
                    queue.set_state(IngestState::Forwarding);
                }
            }
        }
    }
}
