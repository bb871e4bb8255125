//! Infrastructure traits, used for DI on higher levels

use crate::infrastructure::broker::{BrokerError, Delivery};
use crate::infrastructure::cache::CacheError;
use crate::infrastructure::entities;
use crate::infrastructure::http::{OutboundError, OutboundRequest, WebhookEvent};
use crate::infrastructure::repositories::RepositoryError;
use async_trait::async_trait;

/// Durable relational store. Every write is an insert-or-update by primary key.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn ping(&self) -> Result<(), RepositoryError>;

    async fn upsert_chat(&self, chat: &entities::Chat) -> Result<(), RepositoryError>;

    async fn upsert_message(&self, message: &entities::Message) -> Result<(), RepositoryError>;

    async fn upsert_customer(&self, customer: &entities::Customer) -> Result<(), RepositoryError>;

    async fn list_webhooks(&self) -> Result<Vec<entities::Webhook>, RepositoryError>;
}

/// Key/value primitives of the chat-state cache.
///
/// Every method is a single atomic operation on the backing store; callers compose them
/// without transactions.
#[async_trait]
pub trait ChatCache: Send + Sync {
    async fn ping(&self) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// First element of the list stored at `key`.
    async fn head(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Overwrites the first element of the list stored at `key`.
    async fn replace_head(&self, key: &str, value: &str) -> Result<(), CacheError>;

    /// Appends `value` to the list stored at `key`.
    async fn push(&self, key: &str, value: &str) -> Result<(), CacheError>;

    /// Every element of the list stored at `key`, in insertion order.
    async fn range(&self, key: &str) -> Result<Vec<String>, CacheError>;

    /// Creates the list `key` holding only `value` unless `key` already exists, and adds
    /// `member` to the set `index` either way.
    ///
    /// Returns `true` if the list was created by this call.
    async fn create_indexed(
        &self,
        key: &str,
        value: &str,
        index: &str,
        member: &str,
    ) -> Result<bool, CacheError>;
}

/// Outbound HTTP calls made on behalf of queue payloads.
#[async_trait]
pub trait OutboundHttp: Send + Sync {
    /// Performs an arbitrary request described by an outgoing `sendRequest` payload.
    async fn send_request(&self, request: &OutboundRequest) -> Result<(), OutboundError>;

    /// Posts a chat event to a registered webhook.
    async fn post_webhook(&self, url: &str, event: &WebhookEvent) -> Result<(), OutboundError>;
}

/// Message broker able to open one independent subscription per queue.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. `None` means the broker closed the stream.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// Cancels the consumer and releases the underlying session.
    async fn close(self: Box<Self>);
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgment without requeue.
    async fn nack(&self) -> Result<(), BrokerError>;
}
