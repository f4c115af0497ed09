//! Strata hinted handoff.
//!
//! When a write's destination node is unreachable, the cluster write path
//! hands the write to this subsystem instead of failing it. The write is
//! persisted in a durable per-destination queue on local disk and replayed
//! once the destination comes back, giving the cluster at-least-once
//! delivery across transient peer failures without blocking foreground
//! writes.
//!
//! # Key Components
//!
//! - **[`Queue`]**: segmented append-only FIFO of opaque records with a
//!   bounded disk budget and a crash-safe head cursor
//! - **[`NodeProcessor`]**: one destination's write+replay pipeline with
//!   exponential backoff and poison-record handling
//! - **[`HandoffService`]**: owns the processor set; discovery at startup,
//!   lazy creation on first write, periodic purge of departed nodes
//!
//! # Example
//!
//! ```ignore
//! use strata_handoff::{HandoffConfig, HandoffService, NodeId, Point, ShardId};
//!
//! let config = HandoffConfig::builder().dir("/var/lib/strata/hh").build()?;
//! let service = HandoffService::new(config, shard_writer, membership);
//! service.open().await?;
//!
//! // Destination node 42 is down: queue the write locally.
//! service.write_shard(ShardId::new(7), NodeId::new(42), &points).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod record;
pub mod service;
pub mod traits;
pub mod types;

pub use config::{HandoffConfig, HandoffConfigBuilder};
pub use error::{DeliveryError, HandoffError, MembershipError, Result};
pub use metrics::{HandoffMetrics, MetricsSnapshot};
pub use processor::NodeProcessor;
pub use queue::Queue;
pub use record::ShardWrite;
pub use service::HandoffService;
pub use traits::{Membership, NodeInfo, ShardWriter, WriteShardFuture};
pub use types::{NodeId, Point, ShardId};
