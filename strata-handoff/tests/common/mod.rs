//! Shared test doubles for the handoff integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_handoff::{
    DeliveryError, HandoffConfig, Membership, MembershipError, NodeId, NodeInfo, Point, ShardId,
    ShardWriter, WriteShardFuture,
};

/// Scripted outcome for one shard writer call.
#[derive(Debug, Clone)]
pub enum WriterResponse {
    Ok,
    Retryable,
    Permanent,
}

/// One observed shard writer call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub shard_id: ShardId,
    pub destination: NodeId,
    pub points: Vec<Point>,
    pub at: tokio::time::Instant,
}

/// Shard writer that records every call and replays a scripted response
/// queue. Once the script runs dry every call succeeds.
#[derive(Default)]
pub struct RecordingWriter {
    calls: Mutex<Vec<RecordedCall>>,
    script: Mutex<VecDeque<WriterResponse>>,
}

impl RecordingWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_response(&self, response: WriterResponse) {
        self.script.lock().push_back(response);
    }

    pub fn push_responses(&self, count: usize, response: WriterResponse) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(response.clone());
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl ShardWriter for RecordingWriter {
    fn write_shard<'a>(
        &'a self,
        shard_id: ShardId,
        destination: NodeId,
        points: &'a [Point],
    ) -> WriteShardFuture<'a> {
        Box::pin(async move {
            self.calls.lock().push(RecordedCall {
                shard_id,
                destination,
                points: points.to_vec(),
                at: tokio::time::Instant::now(),
            });

            let response = self
                .script
                .lock()
                .pop_front()
                .unwrap_or(WriterResponse::Ok);
            match response {
                WriterResponse::Ok => Ok(()),
                WriterResponse::Retryable => Err(DeliveryError::Retryable {
                    cause: "connection refused".to_string(),
                }),
                WriterResponse::Permanent => Err(DeliveryError::Permanent {
                    cause: "malformed batch".to_string(),
                }),
            }
        })
    }
}

/// Membership directory backed by a mutable set of member IDs.
#[derive(Default)]
pub struct StaticMembership {
    members: Mutex<HashSet<u64>>,
    fail: AtomicBool,
}

impl StaticMembership {
    pub fn with_members(ids: &[u64]) -> Arc<Self> {
        let membership = Self::default();
        membership.members.lock().extend(ids.iter().copied());
        Arc::new(membership)
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_member(&self, id: u64, member: bool) {
        let mut members = self.members.lock();
        if member {
            members.insert(id);
        } else {
            members.remove(&id);
        }
    }

    /// Make every lookup fail, simulating an unreachable meta store.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Membership for StaticMembership {
    fn node(&self, id: NodeId) -> Result<Option<NodeInfo>, MembershipError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MembershipError {
                cause: "meta store unavailable".to_string(),
            });
        }
        if self.members.lock().contains(&id.as_u64()) {
            Ok(Some(NodeInfo {
                id,
                addr: format!("10.0.0.{}:8088", id.as_u64()),
            }))
        } else {
            Ok(None)
        }
    }
}

/// Small, fast configuration for tests.
pub fn test_config(dir: &Path) -> HandoffConfig {
    HandoffConfig::builder()
        .dir(dir)
        .segment_size(1024)
        .max_size(64 * 1024)
        .retry_backoff_ms(100, 1000)
        .write_timeout_ms(5_000)
        .purge_interval_ms(60_000)
        .build()
        .unwrap()
}

/// A point with a recognizable payload.
pub fn point(tag: &str) -> Point {
    Point::new(format!("cpu,host={tag} value=1 1000000000").into_bytes())
}

/// Install a test subscriber so `RUST_LOG=strata_handoff=debug` works when
/// debugging a failing test. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
