//! Strongly-typed identifiers and point payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a cluster member node.
///
/// Node IDs are assigned by the cluster membership directory and remain
/// stable for the lifetime of the node. Each destination node gets its own
/// handoff queue directory named after its ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Create a node ID from a raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// Identifier of a shard (a contiguous slice of the time-series keyspace).
///
/// The handoff core never inspects shard contents; the ID only travels with
/// the queued write so the shard writer can route the replayed points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(u64);

impl ShardId {
    /// Create a shard ID from a raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard_{}", self.0)
    }
}

/// One encoded time-series point.
///
/// Points arrive at the handoff service already serialized by the upstream
/// write path. The core treats them as opaque bytes; only the shard writer
/// on the receiving end interprets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point(Bytes);

impl Point {
    /// Wrap an encoded point payload.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The encoded payload.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Point {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Point {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}
