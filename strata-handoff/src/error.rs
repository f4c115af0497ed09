//! Error types for the handoff subsystem.
//!
//! Errors carry the identifiers needed to act on them (node ID, file path,
//! byte offsets) and a stable code for log grepping. Foreground write errors
//! propagate to the caller unchanged; replay-side errors never leave the
//! processor and instead drive its retry state machine.

use crate::types::NodeId;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for handoff operations.
#[derive(Error, Debug)]
pub enum HandoffError {
    // =========================================================================
    // Queue Errors (E001-E099)
    // =========================================================================
    /// Failed to open a queue directory or recover its on-disk state.
    #[error("E001: Failed to open queue at {path}: {cause}")]
    QueueOpen {
        /// The queue directory that could not be opened.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// Write to a segment file failed.
    #[error("E002: Segment write failed at {path}: {cause}")]
    SegmentWrite {
        /// The segment file being written.
        path: PathBuf,
        /// Reason for the write failure.
        cause: String,
    },

    /// Read from a segment file failed.
    #[error("E003: Segment read failed at {path}: {cause}")]
    SegmentRead {
        /// The segment file being read.
        path: PathBuf,
        /// Reason for the read failure.
        cause: String,
    },

    /// A segment file holds bytes that do not parse as record frames.
    #[error("E004: Corrupt segment {path} at offset {offset}: {cause}")]
    CorruptSegment {
        /// The corrupt segment file.
        path: PathBuf,
        /// Byte offset at which framing broke down.
        offset: u64,
        /// Description of the corruption.
        cause: String,
    },

    /// Persisting the head cursor sidecar failed.
    #[error("E005: Failed to persist cursor at {path}: {cause}")]
    CursorPersist {
        /// The cursor sidecar path.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// The record cannot fit within the queue's disk budget even after
    /// evicting every sealed segment.
    #[error("E006: Queue disk budget exhausted: record of {requested} bytes, budget {max_size} bytes")]
    DiskFull {
        /// Size of the rejected record frame in bytes.
        requested: u64,
        /// The configured per-queue budget in bytes.
        max_size: u64,
    },

    /// Operation on a queue that has been closed.
    #[error("E007: Queue is closed")]
    QueueClosed,

    // =========================================================================
    // Record Codec Errors (E100-E199)
    // =========================================================================
    /// Encoding a shard write into a queue record failed.
    #[error("E101: Failed to encode shard write: {cause}")]
    RecordEncode {
        /// Reason for the encode failure.
        cause: String,
    },

    /// A queued record does not decode as a shard write.
    #[error("E102: Failed to decode queued record: {cause}")]
    RecordDecode {
        /// Reason for the decode failure.
        cause: String,
    },

    // =========================================================================
    // Processor Errors (E200-E299)
    // =========================================================================
    /// `open` called on a processor that is already open.
    #[error("E201: Processor for {node_id} is already open")]
    AlreadyOpen {
        /// The destination node.
        node_id: NodeId,
    },

    /// Operation on a processor that has been closed (or never opened).
    #[error("E202: Processor for {node_id} is closed")]
    ProcessorClosed {
        /// The destination node.
        node_id: NodeId,
    },

    /// `purge` called before `close`.
    #[error("E203: Processor for {node_id} must be closed before purge")]
    PurgeBeforeClose {
        /// The destination node.
        node_id: NodeId,
    },

    // =========================================================================
    // Service Errors (E300-E399)
    // =========================================================================
    /// Hinted handoff is disabled by configuration.
    #[error("E301: Hinted handoff is disabled")]
    Disabled,

    /// Operation on a service that has been closed.
    #[error("E302: Handoff service is closed")]
    ServiceClosed,

    /// Invalid configuration value.
    #[error("E303: Invalid configuration '{field}': {cause}")]
    Config {
        /// The configuration field with the invalid value.
        field: String,
        /// Description of why the value is invalid.
        cause: String,
    },

    // =========================================================================
    // I/O Errors (E900-E999)
    // =========================================================================
    /// File I/O error outside segment read/write paths.
    #[error("E901: I/O error at {path}: {cause}")]
    Io {
        /// The path where the I/O error occurred.
        path: PathBuf,
        /// Description of the I/O error.
        cause: String,
    },
}

impl HandoffError {
    /// Get the error code (e.g., "E001").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueOpen { .. } => "E001",
            Self::SegmentWrite { .. } => "E002",
            Self::SegmentRead { .. } => "E003",
            Self::CorruptSegment { .. } => "E004",
            Self::CursorPersist { .. } => "E005",
            Self::DiskFull { .. } => "E006",
            Self::QueueClosed => "E007",
            Self::RecordEncode { .. } => "E101",
            Self::RecordDecode { .. } => "E102",
            Self::AlreadyOpen { .. } => "E201",
            Self::ProcessorClosed { .. } => "E202",
            Self::PurgeBeforeClose { .. } => "E203",
            Self::Disabled => "E301",
            Self::ServiceClosed => "E302",
            Self::Config { .. } => "E303",
            Self::Io { .. } => "E901",
        }
    }

    /// Check if this error is retriable.
    ///
    /// Replay treats retriable queue errors as transient: it logs them and
    /// backs off instead of wedging or dropping data.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::SegmentWrite { .. }
                | Self::SegmentRead { .. }
                | Self::CursorPersist { .. }
                | Self::Io { .. }
        )
    }

    /// Check if this error is a lifecycle violation (closed/already-open).
    #[must_use]
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(
            self,
            Self::QueueClosed
                | Self::AlreadyOpen { .. }
                | Self::ProcessorClosed { .. }
                | Self::PurgeBeforeClose { .. }
                | Self::ServiceClosed
        )
    }
}

/// Result type alias using `HandoffError`.
pub type Result<T> = std::result::Result<T, HandoffError>;

/// Failure reported by the external shard writer for one delivery attempt.
///
/// The variant is the error taxonomy the replay loop branches on: retryable
/// failures cause backoff without advancing the head cursor, permanent
/// failures advance past the record and count a drop.
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    /// Transient failure (network, timeout, peer busy). Retried with backoff.
    #[error("retryable delivery failure: {cause}")]
    Retryable {
        /// Reason for the failure.
        cause: String,
    },

    /// Non-transient failure (peer rejects the write as malformed). The
    /// record is dropped so it cannot wedge the queue.
    #[error("permanent delivery failure: {cause}")]
    Permanent {
        /// Reason for the failure.
        cause: String,
    },
}

impl DeliveryError {
    /// Whether retrying this delivery can ever succeed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

/// Failure from the cluster membership directory.
///
/// An errored lookup means membership is unknown this cycle; the purge task
/// skips the candidate rather than guessing.
#[derive(Error, Debug, Clone)]
#[error("membership lookup failed: {cause}")]
pub struct MembershipError {
    /// Reason for the lookup failure.
    pub cause: String,
}
