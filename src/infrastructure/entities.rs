//! Database entities

use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Chat {
    pub id: String,
    pub situation: String,
    pub is_active: bool,
    pub agent_id: Option<String>,
    pub tabulation: Option<String>,
    pub customer_id: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub text: String,
    pub delivered: bool,
    pub chat_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub number: String,
    pub last_chat_id: Option<String>,
}

/// A registered external endpoint notified about chat events.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Webhook {
    pub id: i32,
    pub name: String,
    pub url: String,
    pub is_global: bool,
    /// Connection (chat-platform instance) this hook is bound to, if any.
    pub conn: Option<String>,
    pub send_message: bool,
    pub receive_message: bool,
}

impl Webhook {
    /// Whether this hook wants an incoming message that arrived on connection `conn`.
    pub fn accepts_incoming(&self, conn: &str) -> bool {
        if !self.receive_message {
            return false;
        }
        match &self.conn {
            Some(bound) if !conn.is_empty() && bound != conn => self.is_global,
            _ => true,
        }
    }
}
