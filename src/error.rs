//! Error taxonomy for the collaboration core.
//!
//! Every rejection a caller can observe maps to exactly one variant here:
//! capacity rejections are user-facing, version conflicts demand a re-fetch
//! and retry at the application layer, and transient store failures are
//! surfaced to the immediate caller without internal retries.

use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum CollabError {
    /// The project's color palette is exhausted; acts as the concurrency cap.
    #[error("maximum of {max} concurrent users reached for this project")]
    CapacityExceeded { max: usize },

    #[error("access denied")]
    AccessDenied,

    #[error("{0} not found")]
    NotFound(&'static str),

    /// The submitted row version is stale; the caller must re-fetch and retry.
    #[error("row was modified by another user, refresh and try again")]
    VersionConflict,

    #[error("invalid value for column type '{column_type}': {reason}")]
    InvalidCellValue { column_type: String, reason: String },

    /// Duplicate watch registration; the caller must unsubscribe first.
    #[error("already subscribed")]
    AlreadySubscribed,

    /// Presence store or event bus unavailable; retry policy is the caller's.
    #[error("shared store unavailable: {0}")]
    TransientStore(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CollabError {
    /// Whether the error is a user-facing rejection rather than a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::AccessDenied
                | Self::VersionConflict
                | Self::InvalidCellValue { .. }
                | Self::AlreadySubscribed
        )
    }
}
