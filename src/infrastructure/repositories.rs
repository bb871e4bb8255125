//! DB Repository abstractions

use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::entities::{Chat, Customer, Message, Webhook};
use crate::infrastructure::traits::ChatRepository;
use async_trait::async_trait;
use di::{Ref, injectable};
use log::error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database unreachable: {0}")]
    Unavailable(#[source] sqlx::Error),

    #[error("couldn't write {entity} `{id}`: {source}")]
    Write {
        entity: &'static str,
        id: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("couldn't read webhooks: {0}")]
    Read(#[source] sqlx::Error),
}

#[injectable(ChatRepository)]
pub struct DbChatRepository {
    connection: Ref<DatabaseConnection>,
}

impl DbChatRepository {
    pub fn new(connection: Ref<DatabaseConnection>) -> Self {
        Self { connection }
    }
}

fn write_error(entity: &'static str, id: &str) -> impl FnOnce(sqlx::Error) -> RepositoryError {
    let id = id.to_owned();
    move |source| {
        error!("couldn't upsert {entity} {id}: {source}");
        RepositoryError::Write { entity, id, source }
    }
}

#[async_trait]
impl ChatRepository for DbChatRepository {
    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1")
            .execute(&**self.connection)
            .await
            .map(|_| ())
            .map_err(RepositoryError::Unavailable)
    }

    async fn upsert_chat(&self, chat: &Chat) -> Result<(), RepositoryError> {
        let query = match &chat.tabulation {
            None => sqlx::query(
                "INSERT INTO chats (id, situation, is_active, agent_id, customer_id, instance_id) VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (id) DO UPDATE SET situation = $2, is_active = $3, agent_id = $4, customer_id = $5, instance_id = $6",
            )
            .bind(&chat.id)
            .bind(&chat.situation)
            .bind(chat.is_active)
            .bind(&chat.agent_id)
            .bind(&chat.customer_id)
            .bind(&chat.instance_id),
            Some(tabulation) => sqlx::query(
                "INSERT INTO chats (id, situation, is_active, agent_id, tabulation, customer_id, instance_id) VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (id) DO UPDATE SET situation = $2, is_active = $3, agent_id = $4, tabulation = $5, customer_id = $6, instance_id = $7",
            )
            .bind(&chat.id)
            .bind(&chat.situation)
            .bind(chat.is_active)
            .bind(&chat.agent_id)
            .bind(tabulation)
            .bind(&chat.customer_id)
            .bind(&chat.instance_id),
        };

        query
            .execute(&**self.connection)
            .await
            .map(|_| ())
            .map_err(write_error("chat", &chat.id))
    }

    async fn upsert_message(&self, message: &Message) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO messages (id, "from", "to", text, delivered, chat_id) VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (id) DO UPDATE SET "from" = $2, "to" = $3, text = $4, delivered = $5, chat_id = $6"#,
        )
        .bind(&message.id)
        .bind(&message.from)
        .bind(&message.to)
        .bind(&message.text)
        .bind(message.delivered)
        .bind(&message.chat_id)
        .execute(&**self.connection)
        .await
        .map(|_| ())
        .map_err(write_error("message", &message.id))
    }

    async fn upsert_customer(&self, customer: &Customer) -> Result<(), RepositoryError> {
        let query = match &customer.last_chat_id {
            None => sqlx::query(
                "INSERT INTO customers (id, name, number) VALUES ($1, $2, $3) ON CONFLICT (id) DO UPDATE SET name = $2, number = $3",
            )
            .bind(&customer.id)
            .bind(&customer.name)
            .bind(&customer.number),
            Some(last_chat_id) => sqlx::query(
                "INSERT INTO customers (id, name, number, last_chat_id) VALUES ($1, $2, $3, $4) ON CONFLICT (id) DO UPDATE SET name = $2, number = $3, last_chat_id = $4",
            )
            .bind(&customer.id)
            .bind(&customer.name)
            .bind(&customer.number)
            .bind(last_chat_id),
        };

        query
            .execute(&**self.connection)
            .await
            .map(|_| ())
            .map_err(write_error("customer", &customer.id))
    }

    async fn list_webhooks(&self) -> Result<Vec<Webhook>, RepositoryError> {
        sqlx::query_as(
            "SELECT id, name, url, is_global, conn, send_message, receive_message FROM webhook",
        )
        .fetch_all(&**self.connection)
        .await
        .map_err(RepositoryError::Read)
    }
}
