//! Error taxonomy of the consumer pipeline

use crate::core::payloads::MalformedPayload;
use crate::infrastructure::broker::BrokerError;
use crate::infrastructure::cache::CacheError;
use crate::infrastructure::http::OutboundError;
use crate::infrastructure::repositories::RepositoryError;
use thiserror::Error;

/// Why a single delivery could not be processed. Any of these nacks the delivery without
/// requeueing it.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    CacheUnavailable(#[from] CacheError),

    #[error(transparent)]
    MalformedPayload(#[from] MalformedPayload),

    #[error("unknown message type")]
    UnrecognizedOperation,

    #[error("persistence failed: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("outbound request failed: {0}")]
    Outbound(#[from] OutboundError),
}

impl DispatchError {
    /// Whether the failure is about connectivity rather than the delivery itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::CacheUnavailable(_)
                | DispatchError::Persistence(RepositoryError::Unavailable(_))
        )
    }
}

/// Ends the current supervision cycle; the supervisor backs off and reconnects every queue.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("stores not ready: {0}")]
    NotReady(#[source] DispatchError),

    #[error("delivery stream of {0} ended")]
    StreamClosed(String),

    #[error("queue worker panicked: {0}")]
    WorkerPanicked(String),
}
