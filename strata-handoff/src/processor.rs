//! Per-destination write and replay pipeline.
//!
//! A `NodeProcessor` owns the durable queue for one destination node and a
//! dedicated background task that drains it to the node via the external
//! shard writer. Foreground writers append; the replay task delivers in
//! append order, backing off exponentially on retryable failures and
//! dropping poison records so they cannot wedge the queue.

use crate::config::HandoffConfig;
use crate::error::{HandoffError, Result};
use crate::metrics::HandoffMetrics;
use crate::queue::Queue;
use crate::record::ShardWrite;
use crate::traits::ShardWriter;
use crate::types::{NodeId, Point, ShardId};
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

/// Runs one destination's write+replay pipeline.
pub struct NodeProcessor {
    node_id: NodeId,
    dir: PathBuf,
    config: HandoffConfig,
    writer: Arc<dyn ShardWriter>,
    metrics: Arc<HandoffMetrics>,
    /// Unix millis of the last successful append or delivery. Atomic so the
    /// purge task can read it without the processor lock.
    last_modified_ms: Arc<AtomicU64>,
    wakeup: Arc<Notify>,
    state: Mutex<ProcessorState>,
}

#[derive(Default)]
struct ProcessorState {
    queue: Option<Arc<Queue>>,
    replay: Option<ReplayHandle>,
    closed: bool,
}

struct ReplayHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl NodeProcessor {
    /// Create a processor for `node_id` with its queue at `dir`.
    ///
    /// The processor does nothing until [`open`] is called.
    ///
    /// [`open`]: NodeProcessor::open
    pub fn new(
        node_id: NodeId,
        dir: impl Into<PathBuf>,
        writer: Arc<dyn ShardWriter>,
        config: HandoffConfig,
        metrics: Arc<HandoffMetrics>,
    ) -> Self {
        Self {
            node_id,
            dir: dir.into(),
            config,
            writer,
            metrics,
            last_modified_ms: Arc::new(AtomicU64::new(0)),
            wakeup: Arc::new(Notify::new()),
            state: Mutex::new(ProcessorState::default()),
        }
    }

    /// The destination node this processor serves.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Open the queue, recover its on-disk state, and start the replay task.
    ///
    /// Must be called within a tokio runtime. Fails with `AlreadyOpen` on a
    /// processor that is already open, and with `ProcessorClosed` on one
    /// that has been closed.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HandoffError::ProcessorClosed {
                node_id: self.node_id,
            });
        }
        if state.queue.is_some() {
            return Err(HandoffError::AlreadyOpen {
                node_id: self.node_id,
            });
        }

        let queue = Arc::new(Queue::open(
            &self.dir,
            self.config.segment_size,
            self.config.max_size,
            Arc::clone(&self.metrics),
        )?);

        // Seed liveness from what survives on disk so purge decisions hold
        // across restarts.
        let seed = queue
            .last_mod_time()
            .unwrap_or_else(|_| SystemTime::now());
        self.last_modified_ms
            .store(system_time_ms(seed), Ordering::Relaxed);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let ctx = ReplayContext {
            node_id: self.node_id,
            queue: Arc::clone(&queue),
            writer: Arc::clone(&self.writer),
            wakeup: Arc::clone(&self.wakeup),
            last_modified_ms: Arc::clone(&self.last_modified_ms),
            metrics: Arc::clone(&self.metrics),
            initial_backoff: self.config.retry_initial_backoff(),
            max_backoff: self.config.retry_max_backoff(),
            write_timeout: self.config.write_timeout(),
        };
        let task = tokio::spawn(replay_loop(ctx, shutdown_rx));

        state.queue = Some(queue);
        state.replay = Some(ReplayHandle {
            shutdown: shutdown_tx,
            task,
        });

        tracing::info!(node_id = %self.node_id, dir = %self.dir.display(), "processor opened");
        Ok(())
    }

    /// Encode `(shard_id, points)` and append it to the queue.
    pub fn write_shard(&self, shard_id: ShardId, points: &[Point]) -> Result<()> {
        let queue = {
            let state = self.state.lock();
            if state.closed {
                return Err(HandoffError::ProcessorClosed {
                    node_id: self.node_id,
                });
            }
            match &state.queue {
                Some(q) => Arc::clone(q),
                None => {
                    return Err(HandoffError::ProcessorClosed {
                        node_id: self.node_id,
                    })
                }
            }
        };

        let record = ShardWrite::new(shard_id, points.to_vec())
            .to_bytes()
            .map_err(|e| HandoffError::RecordEncode {
                cause: e.to_string(),
            })?;

        queue.append(&record)?;
        self.touch();
        self.wakeup.notify_one();
        Ok(())
    }

    /// The most recent of last successful append and last successful
    /// delivery (seeded from segment mtimes at open).
    pub fn last_modified(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.last_modified_ms.load(Ordering::Relaxed))
    }

    /// Current on-disk size of the queue in bytes. Zero when not open.
    pub fn queue_size(&self) -> u64 {
        let state = self.state.lock();
        state.queue.as_ref().map(|q| q.total_size()).unwrap_or(0)
    }

    /// Stop the replay task, wait for it, and close the queue.
    ///
    /// Further `write_shard` calls fail with `ProcessorClosed`. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let replay = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.replay.take()
        };

        if let Some(handle) = replay {
            let _ = handle.shutdown.send(());
            if let Err(e) = handle.task.await {
                tracing::error!(node_id = %self.node_id, error = %e, "replay task failed to join");
            }
        }

        let queue = self.state.lock().queue.clone();
        if let Some(queue) = queue {
            queue.close()?;
        }

        tracing::info!(node_id = %self.node_id, "processor closed");
        Ok(())
    }

    /// Delete all on-disk state. Only legal after [`close`].
    ///
    /// [`close`]: NodeProcessor::close
    pub fn purge(&self) -> Result<()> {
        let queue = {
            let state = self.state.lock();
            if !state.closed {
                return Err(HandoffError::PurgeBeforeClose {
                    node_id: self.node_id,
                });
            }
            state.queue.clone()
        };

        match queue {
            Some(queue) => queue.purge()?,
            None => {
                // Never opened; remove whatever exists on disk.
                if self.dir.exists() {
                    fs::remove_dir_all(&self.dir).map_err(|e| HandoffError::Io {
                        path: self.dir.clone(),
                        cause: e.to_string(),
                    })?;
                }
            }
        }

        self.metrics.incr_queues_purged();
        Ok(())
    }

    fn touch(&self) {
        self.last_modified_ms
            .store(system_time_ms(SystemTime::now()), Ordering::Relaxed);
    }
}

fn system_time_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Everything the replay task needs, detached from the processor so the task
/// owns its state outright.
struct ReplayContext {
    node_id: NodeId,
    queue: Arc<Queue>,
    writer: Arc<dyn ShardWriter>,
    wakeup: Arc<Notify>,
    last_modified_ms: Arc<AtomicU64>,
    metrics: Arc<HandoffMetrics>,
    initial_backoff: Duration,
    max_backoff: Duration,
    write_timeout: Duration,
}

impl ReplayContext {
    fn touch(&self) {
        self.last_modified_ms
            .store(system_time_ms(SystemTime::now()), Ordering::Relaxed);
    }
}

/// Drain the queue to the destination until shutdown.
///
/// Per-destination delivery order is append order: the head record is
/// retried until it succeeds, is permanently rejected, or its segment is
/// evicted underneath the cursor.
async fn replay_loop(ctx: ReplayContext, mut shutdown: oneshot::Receiver<()>) {
    let mut backoff = ctx.initial_backoff;

    loop {
        let head = match ctx.queue.head() {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!(node_id = %ctx.node_id, error = %e, "queue read failed, backing off");
                if !sleep_or_shutdown(&mut shutdown, backoff).await {
                    break;
                }
                backoff = next_backoff(backoff, ctx.max_backoff);
                continue;
            }
        };

        let Some(bytes) = head else {
            // Idle until a producer appends
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ctx.wakeup.notified() => continue,
            }
        };

        let write = match ShardWrite::from_bytes(&bytes) {
            Ok(write) => write,
            Err(e) => {
                let err = HandoffError::RecordDecode {
                    cause: e.to_string(),
                };
                tracing::warn!(node_id = %ctx.node_id, error = %err, "dropping undecodable record");
                ctx.metrics.incr_poison_dropped();
                if !advance_or_backoff(&ctx, &mut shutdown, &mut backoff).await {
                    break;
                }
                continue;
            }
        };

        let delivery = tokio::time::timeout(
            ctx.write_timeout,
            ctx.writer
                .write_shard(write.shard_id, ctx.node_id, &write.points),
        );
        let outcome = tokio::select! {
            _ = &mut shutdown => break,
            outcome = delivery => outcome,
        };

        match outcome {
            Ok(Ok(())) => {
                if !advance_or_backoff(&ctx, &mut shutdown, &mut backoff).await {
                    break;
                }
                ctx.touch();
                ctx.metrics.incr_delivery(write.points.len() as u64);
                backoff = ctx.initial_backoff;
                tracing::debug!(
                    node_id = %ctx.node_id,
                    shard_id = %write.shard_id,
                    points = write.points.len(),
                    "replayed record"
                );
            }
            Ok(Err(err)) if err.is_permanent() => {
                tracing::warn!(
                    node_id = %ctx.node_id,
                    shard_id = %write.shard_id,
                    error = %err,
                    "destination permanently rejected record, dropping"
                );
                ctx.metrics.incr_poison_dropped();
                if !advance_or_backoff(&ctx, &mut shutdown, &mut backoff).await {
                    break;
                }
                backoff = ctx.initial_backoff;
            }
            Ok(Err(err)) => {
                tracing::debug!(
                    node_id = %ctx.node_id,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "delivery failed, backing off"
                );
                ctx.metrics.incr_delivery_failure();
                if !sleep_or_shutdown(&mut shutdown, backoff).await {
                    break;
                }
                backoff = next_backoff(backoff, ctx.max_backoff);
            }
            Err(_elapsed) => {
                tracing::debug!(
                    node_id = %ctx.node_id,
                    timeout_ms = ctx.write_timeout.as_millis() as u64,
                    backoff_ms = backoff.as_millis() as u64,
                    "delivery timed out, backing off"
                );
                ctx.metrics.incr_delivery_failure();
                if !sleep_or_shutdown(&mut shutdown, backoff).await {
                    break;
                }
                backoff = next_backoff(backoff, ctx.max_backoff);
            }
        }
    }

    tracing::debug!(node_id = %ctx.node_id, "replay loop stopped");
}

/// Advance the head cursor; on failure, back off instead of spinning on the
/// same record. Returns false when shutdown fired during the backoff.
async fn advance_or_backoff(
    ctx: &ReplayContext,
    shutdown: &mut oneshot::Receiver<()>,
    backoff: &mut Duration,
) -> bool {
    match ctx.queue.advance() {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(node_id = %ctx.node_id, error = %e, "cursor advance failed, backing off");
            let alive = sleep_or_shutdown(shutdown, *backoff).await;
            *backoff = next_backoff(*backoff, ctx.max_backoff);
            alive
        }
    }
}

/// Sleep for `delay` unless shutdown fires first. Returns false on shutdown.
async fn sleep_or_shutdown(shutdown: &mut oneshot::Receiver<()>, delay: Duration) -> bool {
    tokio::select! {
        _ = &mut *shutdown => false,
        () = tokio::time::sleep(delay) => true,
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
