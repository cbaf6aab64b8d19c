use docket_primitives::ids::EntityRef;
use docket_primitives::mutation::FailureKind;
use thiserror::Error;

/// Failure reported to the caller of a mutation after it was rolled back.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum MutationError {
    #[error("network failure: {message}")]
    NetworkFailure { message: String },

    #[error("rejected: {message}")]
    ValidationRejected { message: String },

    #[error("{entity} changed on the server: {message}")]
    ConflictStale { entity: EntityRef, message: String },

    #[error("{} of {} items failed", .failed.len(), .committed.len() + .failed.len())]
    PartialBulkFailure {
        committed: Vec<EntityRef>,
        failed: Vec<BulkItemFailure>,
    },

    /// Settlement arrived for a mutation that is not pending.
    #[error("mutation is not pending")]
    UnknownMutation,

    /// The client was stopped before the mutation could run.
    #[error("mutation abandoned before it was submitted")]
    Abandoned,
}

impl MutationError {
    pub(crate) fn from_rejection(kind: FailureKind, entity: EntityRef, message: String) -> Self {
        match kind {
            FailureKind::Network => Self::NetworkFailure { message },
            FailureKind::Validation => Self::ValidationRejected { message },
            FailureKind::Conflict => Self::ConflictStale { entity, message },
        }
    }

    /// Only network failures may be retried as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkFailure { .. } => true,
            Self::PartialBulkFailure { failed, .. } => {
                failed.iter().all(|item| item.error.is_retryable())
            }
            Self::ValidationRejected { .. }
            | Self::ConflictStale { .. }
            | Self::UnknownMutation
            | Self::Abandoned => false,
        }
    }
}

/// One rolled back item of a bulk mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkItemFailure {
    pub entity: EntityRef,
    pub error: MutationError,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FetchError {
    #[error("query failed: {0}")]
    Failed(String),
    #[error("query answered with a snapshot of the wrong shape")]
    UnexpectedShape,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("transport closed")]
    Closed,
}
