//! Contracts with the handoff service's external collaborators.
//!
//! The core does not deliver bytes over the network or track cluster
//! membership itself; it drives these two traits. Production wires in the
//! cluster RPC writer and the membership directory, tests wire in mocks.

use crate::error::{DeliveryError, MembershipError};
use crate::types::{NodeId, Point, ShardId};
use std::future::Future;
use std::pin::Pin;

/// Future returned by [`ShardWriter::write_shard`].
pub type WriteShardFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>>;

/// Delivers shard writes to a remote cluster node.
///
/// Implementations classify failures via [`DeliveryError`]: `Retryable` for
/// transport-level trouble, `Permanent` when the peer rejects the write
/// itself. The replay loop applies its own deadline to each call, so
/// implementations need not enforce one.
pub trait ShardWriter: Send + Sync {
    /// Write `points` for `shard_id` to the node `destination`.
    fn write_shard<'a>(
        &'a self,
        shard_id: ShardId,
        destination: NodeId,
        points: &'a [Point],
    ) -> WriteShardFuture<'a>;
}

/// Basic information about a cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// The node's cluster ID.
    pub id: NodeId,
    /// Address the node is reachable at.
    pub addr: String,
}

/// Read-only view of the cluster membership directory.
///
/// `Ok(Some(_))` means the node is still a member, `Ok(None)` means it has
/// departed, and `Err` means membership is unknown right now; the purge task
/// treats unknown as "do not purge this cycle".
pub trait Membership: Send + Sync {
    /// Look up a node by ID.
    fn node(&self, id: NodeId) -> Result<Option<NodeInfo>, MembershipError>;
}
