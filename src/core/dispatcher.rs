//! Routes decoded deliveries to the chat state store, the relational store and outbound HTTP.

use crate::core::chat_store::{ChatStateStore, NewChat};
use crate::core::error::DispatchError;
use crate::core::identity::ChatKey;
use crate::core::payloads::{self, IncomingEvent, IncomingMessage, Operation, StatusUpdate};
use crate::core::traits::DeliveryHandler;
use crate::infrastructure::entities::Message;
use crate::infrastructure::http::WebhookEvent;
use crate::infrastructure::settings::QueueRole;
use crate::infrastructure::traits::{ChatRepository, OutboundHttp};
use async_trait::async_trait;
use di::{Ref, injectable};
use log::{debug, info, warn};

#[injectable(DeliveryHandler)]
pub struct ChatDispatcher {
    store: Ref<ChatStateStore>,
    repository: Ref<dyn ChatRepository>,
    outbound: Ref<dyn OutboundHttp>,
}

impl ChatDispatcher {
    pub fn new(
        store: Ref<ChatStateStore>,
        repository: Ref<dyn ChatRepository>,
        outbound: Ref<dyn OutboundHttp>,
    ) -> Self {
        Self {
            store,
            repository,
            outbound,
        }
    }

    async fn incoming(&self, event: IncomingEvent) -> Result<(), DispatchError> {
        let seed = NewChat {
            participant: &event.identity,
            metadata: event.contact.as_ref(),
            instance_id: event.apikey.as_deref(),
        };

        let Some(message) = &event.message else {
            if event.contact.is_some() {
                let key = self.store.resolve_existing_key(&event.identity).await?;
                self.store.ensure_chat_exists(&key, seed).await?;
            } else {
                debug!(
                    "event for {} is neither a message nor a contact, nothing to do",
                    event.identity
                );
            }
            return Ok(());
        };

        let existing = self.store.resolve_existing_key(&event.identity).await?;
        self.store.reopen(&existing).await?;

        let key = self
            .store
            .append_message(&event.identity, &message.to_json().to_string(), seed)
            .await?;

        self.repository
            .upsert_message(&Message {
                id: message.id.clone(),
                from: message.from.clone(),
                to: message.to.clone(),
                text: message.text.clone(),
                delivered: false,
                chat_id: key.to_string(),
            })
            .await?;

        self.notify_webhooks(&key, &event.connection, message).await;
        Ok(())
    }

    /// Posts the message to every webhook subscribed to incoming messages on its connection.
    /// Failures are logged and never fail the delivery.
    async fn notify_webhooks(&self, key: &ChatKey, connection: &str, message: &IncomingMessage) {
        let webhooks = match self.repository.list_webhooks().await {
            Ok(webhooks) => webhooks,
            Err(e) => {
                warn!("couldn't load webhooks for chat {key}: {e}");
                return;
            }
        };
        let targets: Vec<_> = webhooks
            .into_iter()
            .filter(|hook| hook.accepts_incoming(connection))
            .collect();
        if targets.is_empty() {
            debug!("no webhook subscribed to messages on connection {connection:?}");
            return;
        }

        let record = match self.store.chat(key).await {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                warn!("couldn't read chat {key} for webhook payload: {e}");
                Default::default()
            }
        };
        let event = WebhookEvent {
            conn: connection.to_owned(),
            message: message.text.clone(),
            sent_by: message.from.clone(),
            department: record.department.unwrap_or_default(),
            agent: record.agent_id.unwrap_or_default(),
            tag: record.tags.unwrap_or_default(),
            is_open: record.is_active,
        };

        for hook in targets {
            let outbound = self.outbound.clone();
            let event = event.clone();
            debug!("notifying webhook {} ({})", hook.name, hook.url);
            tokio::spawn(async move {
                if let Err(e) = outbound.post_webhook(&hook.url, &event).await {
                    warn!("webhook {} failed: {e}", hook.name);
                }
            });
        }
    }

    async fn status_update(&self, update: StatusUpdate) -> Result<(), DispatchError> {
        let seed = NewChat {
            participant: &update.identity,
            metadata: None,
            instance_id: None,
        };
        let key = self
            .store
            .append_message(&update.identity, &update.message.to_string(), seed)
            .await?;
        debug!("logged sent message in chat {key}");
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandler for ChatDispatcher {
    async fn handle(&self, queue: &str, role: QueueRole, body: &[u8]) -> Result<(), DispatchError> {
        debug!("{queue}: received {}", String::from_utf8_lossy(body));

        let operation = payloads::classify(role, body)?;
        info!("{queue}: processing {}", operation.name());

        match operation {
            Operation::UpsertChat(chat) => self.repository.upsert_chat(&chat).await?,
            Operation::UpsertCustomer(customer) => {
                self.repository.upsert_customer(&customer).await?
            }
            Operation::UpsertMessage(message) => self.repository.upsert_message(&message).await?,
            Operation::SendRequest(request) => self.outbound.send_request(&request).await?,
            Operation::IncomingChatMessage(event) => self.incoming(event).await?,
            Operation::OutboundStatusUpdate(Some(update)) => self.status_update(update).await?,
            Operation::OutboundStatusUpdate(None) => {
                debug!("{queue}: status update without key or message, ignoring")
            }
            Operation::Unrecognized => return Err(DispatchError::UnrecognizedOperation),
        }
        Ok(())
    }

    async fn ready(&self) -> Result<(), DispatchError> {
        self.store.ping().await?;
        self.repository.ping().await?;
        Ok(())
    }
}
