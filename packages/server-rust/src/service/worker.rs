//! Background worker for periodic and on-demand tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc channel
//! via a `BackgroundRunnable` implementation, with periodic tick callbacks. The
//! host runs mutation log compaction on it.

use std::sync::Arc;

use async_trait::async_trait;
use hostlink_core::MutationId;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::network::session::SessionRegistry;
use crate::service::config::RetentionConfig;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
///
/// Implementors define how individual tasks are processed, what happens on each
/// periodic tick, and how to clean up on shutdown.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called periodically (on each tick interval). Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The worker spawns a tokio task that:
/// 1. Listens for tasks on the mpsc channel
/// 2. Calls `BackgroundRunnable::run()` for each task
/// 3. Periodically calls `BackgroundRunnable::on_tick()` at the configured interval
/// 4. Calls `BackgroundRunnable::shutdown()` when stopped
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the background worker with the given runnable and tick interval.
    ///
    /// Returns a `BackgroundWorker` handle that can be used to submit tasks
    /// and stop the worker. The channel capacity is fixed at 256.
    pub fn start(mut runnable: R, tick_interval_ms: u64) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(256);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut tick_interval =
                tokio::time::interval(std::time::Duration::from_millis(tick_interval_ms));
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            tick_interval.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break, // Channel closed.
                        }
                    }
                    _ = tick_interval.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submit a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped or the channel is full.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stop the worker gracefully, waiting for the worker task to complete.
    pub async fn stop(&mut self) {
        // Signal shutdown.
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Close the task channel.
        self.tx.take();
        // Wait for the worker task to finish.
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Log compaction
// ---------------------------------------------------------------------------

/// Tasks accepted by the compaction worker.
#[derive(Debug)]
pub enum CompactionTask {
    /// Run the retention policy now instead of waiting for the next tick.
    RunNow,
    /// Compact up to the given id, still bounded by the retention policy.
    UpTo(MutationId),
}

/// Highest mutation id that may be dropped from the log.
///
/// `floor` is the lowest cursor acknowledged by any connected session, or
/// `None` when no session is connected. Entries above the floor are kept
/// unless the log would exceed `max_retained`; the newest `min_retained`
/// entries are always kept.
#[must_use]
pub fn compaction_point(
    tail: MutationId,
    floor: Option<MutationId>,
    retention: &RetentionConfig,
) -> MutationId {
    let keep_min = tail.0.saturating_sub(retention.min_retained);
    let soft = floor.map_or(tail.0, |f| f.0.min(tail.0)).min(keep_min);
    let hard = tail.0.saturating_sub(retention.max_retained);
    MutationId(soft.max(hard))
}

/// Applies the retention policy to the host's mutation log.
pub struct CompactionRunnable {
    state: SharedState,
    sessions: Arc<SessionRegistry>,
    retention: RetentionConfig,
}

impl CompactionRunnable {
    #[must_use]
    pub fn new(state: SharedState, sessions: Arc<SessionRegistry>, retention: RetentionConfig) -> Self {
        Self {
            state,
            sessions,
            retention,
        }
    }

    async fn compact(&self, limit: Option<MutationId>) -> usize {
        let floor = self.sessions.min_acknowledged().await;
        let mut state = self.state.lock();
        let mut upto = compaction_point(state.tail(), floor, &self.retention);
        if let Some(limit) = limit {
            upto = upto.min(limit);
        }
        if upto <= state.log().base() {
            return 0;
        }
        let dropped = state.compact(upto);
        info!(
            dropped,
            base = %state.log().base(),
            tail = %state.tail(),
            "mutation log compacted"
        );
        dropped
    }
}

#[async_trait]
impl BackgroundRunnable for CompactionRunnable {
    type Task = CompactionTask;

    async fn run(&mut self, task: CompactionTask) {
        let limit = match task {
            CompactionTask::RunNow => None,
            CompactionTask::UpTo(id) => Some(id),
        };
        self.compact(limit).await;
    }

    async fn on_tick(&mut self) {
        self.compact(None).await;
    }

    async fn shutdown(&mut self) {
        debug!("compaction worker stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
