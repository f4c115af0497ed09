//! Hinted handoff service.
//!
//! Owns the set of node processors keyed by destination node ID: discovers
//! existing queues at startup, lazily creates one on the first write to a
//! new destination, and periodically purges queues whose destination has
//! left the cluster and whose data has aged out.

use crate::config::HandoffConfig;
use crate::error::{HandoffError, Result};
use crate::metrics::HandoffMetrics;
use crate::processor::NodeProcessor;
use crate::traits::{Membership, ShardWriter};
use crate::types::{NodeId, Point, ShardId};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;

/// The hinted handoff service.
pub struct HandoffService {
    config: HandoffConfig,
    writer: Arc<dyn ShardWriter>,
    membership: Arc<dyn Membership>,
    metrics: Arc<HandoffMetrics>,
    /// Reader-writer discipline: the write fast path takes the read lock
    /// only; lazy creation and purge take the write lock.
    processors: Arc<RwLock<HashMap<NodeId, Arc<NodeProcessor>>>>,
    lifecycle: parking_lot::Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    opened: bool,
    closed: bool,
    purge: Option<PurgeHandle>,
}

struct PurgeHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl HandoffService {
    /// Create a new service with its own metrics instance.
    pub fn new(
        config: HandoffConfig,
        writer: Arc<dyn ShardWriter>,
        membership: Arc<dyn Membership>,
    ) -> Self {
        Self::with_metrics(config, writer, membership, Arc::new(HandoffMetrics::new()))
    }

    /// Create a new service sharing an injected metrics instance.
    pub fn with_metrics(
        config: HandoffConfig,
        writer: Arc<dyn ShardWriter>,
        membership: Arc<dyn Membership>,
        metrics: Arc<HandoffMetrics>,
    ) -> Self {
        Self {
            config,
            writer,
            membership,
            metrics,
            processors: Arc::new(RwLock::new(HashMap::new())),
            lifecycle: parking_lot::Mutex::new(Lifecycle::default()),
        }
    }

    /// The service's metrics.
    pub fn metrics(&self) -> &Arc<HandoffMetrics> {
        &self.metrics
    }

    /// Open the service: discover existing queues and start the purge task.
    ///
    /// When handoff is disabled this succeeds without any other effect.
    pub async fn open(&self) -> Result<()> {
        {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return Err(HandoffError::ServiceClosed);
            }
            if lifecycle.opened {
                return Ok(());
            }
        }

        if !self.config.enabled {
            tracing::info!("hinted handoff disabled");
            self.lifecycle.lock().opened = true;
            return Ok(());
        }

        self.config
            .validate()
            .map_err(|cause| HandoffError::Config {
                field: "handoff".to_string(),
                cause,
            })?;

        tracing::info!(dir = %self.config.dir.display(), "starting hinted handoff service");
        fs::create_dir_all(&self.config.dir).map_err(|e| HandoffError::Io {
            path: self.config.dir.clone(),
            cause: format!("failed to create handoff directory: {e}"),
        })?;

        // One processor per existing node directory.
        let entries = fs::read_dir(&self.config.dir).map_err(|e| HandoffError::Io {
            path: self.config.dir.clone(),
            cause: format!("failed to read handoff directory: {e}"),
        })?;
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(node_id) = parse_node_dir_name(&name.to_string_lossy()) else {
                // Not a node ID? Skip it.
                continue;
            };

            let processor = Arc::new(NodeProcessor::new(
                node_id,
                entry.path(),
                Arc::clone(&self.writer),
                self.config.clone(),
                Arc::clone(&self.metrics),
            ));
            processor.open()?;
            self.processors.write().await.insert(node_id, processor);
            tracing::info!(node_id = %node_id, "recovered handoff queue");
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(purge_loop(
            Arc::clone(&self.processors),
            Arc::clone(&self.membership),
            self.config.max_age(),
            self.config.purge_interval(),
            shutdown_rx,
        ));
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.opened = true;
        lifecycle.purge = Some(PurgeHandle {
            shutdown: shutdown_tx,
            task,
        });

        Ok(())
    }

    /// Queue a shard write destined for node `owner`.
    ///
    /// The processor for `owner` is created on first use; the fast path for
    /// an existing processor only takes the map's read lock.
    pub async fn write_shard(
        &self,
        shard_id: ShardId,
        owner: NodeId,
        points: &[Point],
    ) -> Result<()> {
        if !self.config.enabled {
            return Err(HandoffError::Disabled);
        }
        if self.lifecycle.lock().closed {
            return Err(HandoffError::ServiceClosed);
        }

        self.metrics.incr_write_req(points.len() as u64);

        let existing = self.processors.read().await.get(&owner).cloned();
        if let Some(processor) = existing {
            return processor.write_shard(shard_id, points);
        }

        // Check again under the write lock; another writer may have won the
        // race to create this processor.
        let mut map = self.processors.write().await;
        if let Some(processor) = map.get(&owner).cloned() {
            drop(map);
            return processor.write_shard(shard_id, points);
        }

        let processor = Arc::new(NodeProcessor::new(
            owner,
            self.path_for_node(owner),
            Arc::clone(&self.writer),
            self.config.clone(),
            Arc::clone(&self.metrics),
        ));
        processor.open()?;
        map.insert(owner, Arc::clone(&processor));
        drop(map);
        tracing::info!(node_id = %owner, "created handoff queue");

        processor.write_shard(shard_id, points)
    }

    /// Node IDs with an active processor, in ascending order.
    pub async fn active_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.processors.read().await.keys().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    /// Close every processor and stop the purge task. Idempotent.
    ///
    /// Per-processor close errors are collected, not short-circuited; the
    /// first one is returned after all processors have been closed.
    pub async fn close(&self) -> Result<()> {
        let purge = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.closed = true;
            lifecycle.purge.take()
        };

        if let Some(handle) = purge {
            let _ = handle.shutdown.send(());
            if let Err(e) = handle.task.await {
                tracing::error!(error = %e, "purge task failed to join");
            }
        }

        let processors: Vec<Arc<NodeProcessor>> =
            self.processors.read().await.values().cloned().collect();

        let mut first_err = None;
        for processor in processors {
            if let Err(e) = processor.close().await {
                tracing::error!(node_id = %processor.node_id(), error = %e, "failed to close processor");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Directory for one node's handoff data.
    fn path_for_node(&self, node_id: NodeId) -> PathBuf {
        self.config.dir.join(format!("{:020}", node_id.as_u64()))
    }
}

/// Parse a child directory name as a node ID. Zero-padded and bare decimal
/// both parse; anything else is not a node directory.
fn parse_node_dir_name(name: &str) -> Option<NodeId> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok().map(NodeId::new)
}

/// Periodically retire processors for nodes that left the cluster.
async fn purge_loop(
    processors: Arc<RwLock<HashMap<NodeId, Arc<NodeProcessor>>>>,
    membership: Arc<dyn Membership>,
    max_age: Duration,
    interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::debug!("purge task stopped");
                return;
            }
            _ = ticker.tick() => {
                purge_inactive(&processors, membership.as_ref(), max_age).await;
            }
        }
    }
}

/// One purge pass.
///
/// A processor is retired only when the destination is no longer a member
/// *and* its data is older than `max_age`, both observed under the
/// exclusive map lock. An active node may have legitimate pending handoff
/// even after long silence; a departed-but-recent node may still come back.
async fn purge_inactive(
    processors: &RwLock<HashMap<NodeId, Arc<NodeProcessor>>>,
    membership: &dyn Membership,
    max_age: Duration,
) {
    let mut map = processors.write().await;
    let cutoff = SystemTime::now().checked_sub(max_age);

    let mut eligible = Vec::new();
    for (node_id, processor) in map.iter() {
        match membership.node(*node_id) {
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "membership unknown, skipping purge");
                continue;
            }
            Ok(Some(_)) => continue, // still a member
            Ok(None) => {}
        }

        let too_young = cutoff
            .map(|cutoff| processor.last_modified() >= cutoff)
            .unwrap_or(true);
        if too_young {
            continue;
        }

        eligible.push(*node_id);
    }

    for node_id in eligible {
        let Some(processor) = map.get(&node_id).cloned() else {
            continue;
        };
        if let Err(e) = processor.close().await {
            tracing::error!(node_id = %node_id, error = %e, "failed to close processor for purge");
            continue;
        }
        if let Err(e) = processor.purge() {
            tracing::error!(node_id = %node_id, error = %e, "failed to purge processor");
            continue;
        }
        map.remove(&node_id);
        tracing::info!(node_id = %node_id, "purged handoff queue for departed node");
    }
}
