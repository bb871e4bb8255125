//! DI "Interfaces"

use crate::core::error::DispatchError;
use crate::infrastructure::settings::QueueRole;
use async_trait::async_trait;

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Processes one delivery body received on a queue with the given role.
    ///
    /// `Ok` means the delivery is to be acknowledged; any error negatively acknowledges it
    /// without requeueing.
    async fn handle(&self, queue: &str, role: QueueRole, body: &[u8]) -> Result<(), DispatchError>;

    /// Checks that the stores the handler writes to are reachable.
    async fn ready(&self) -> Result<(), DispatchError>;
}
