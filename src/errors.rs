//! Error taxonomy for the attachment arbiter, mapped 1:1 onto the RPC
//! codes the outward interface exposes.

use thiserror::Error;

use crate::types::{NodeId, VolumeId};

/// The fixed set of RPC-facing error codes the arbiter ever returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterErrorCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Internal,
    Aborted,
}

impl ArbiterErrorCode {
    /// Wire-stable name, independent of whatever transport wraps it.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArbiterErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ArbiterErrorCode::NotFound => "NOT_FOUND",
            ArbiterErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ArbiterErrorCode::Internal => "INTERNAL",
            ArbiterErrorCode::Aborted => "ABORTED",
        }
    }
}

#[derive(Error, Debug)]
pub enum ArbiterError {
    #[error("missing or invalid field: {0}")]
    InvalidArgument(String),

    #[error("volume {0} not found in remote store")]
    VolumeNotFound(VolumeId),

    #[error(
        "volume {volume} is attached to node {holder}; node {requester} cannot attach (single-node-writer volume)"
    )]
    AttachmentConflict {
        volume: VolumeId,
        holder: NodeId,
        requester: NodeId,
    },

    #[error("volume {volume} already has two attached nodes; cannot add a third")]
    MigrationLimitExceeded { volume: VolumeId },

    #[error(
        "migration window for volume {volume} expired {elapsed_secs}s ago (bound {bound_secs}s); \
         detach the source node or raise migrationTimeoutSeconds and retry"
    )]
    MigrationTimedOut {
        volume: VolumeId,
        elapsed_secs: i64,
        bound_secs: i64,
    },

    #[error("device at {path} is busy: held by {processes:?}")]
    DeviceBusy {
        path: String,
        processes: Vec<String>,
    },

    #[error("another operation is already in progress on volume {0}")]
    Aborted(VolumeId),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ArbiterError {
    pub fn code(&self) -> ArbiterErrorCode {
        match self {
            ArbiterError::InvalidArgument(_) => ArbiterErrorCode::InvalidArgument,
            ArbiterError::VolumeNotFound(_) => ArbiterErrorCode::NotFound,
            ArbiterError::AttachmentConflict { .. } => ArbiterErrorCode::FailedPrecondition,
            ArbiterError::MigrationLimitExceeded { .. } => ArbiterErrorCode::FailedPrecondition,
            ArbiterError::MigrationTimedOut { .. } => ArbiterErrorCode::FailedPrecondition,
            ArbiterError::DeviceBusy { .. } => ArbiterErrorCode::FailedPrecondition,
            ArbiterError::Aborted(_) => ArbiterErrorCode::Aborted,
            ArbiterError::Internal(_) => ArbiterErrorCode::Internal,
        }
    }
}

pub type ArbiterResult<T> = Result<T, ArbiterError>;
