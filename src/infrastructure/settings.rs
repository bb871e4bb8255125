//! Environment configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_OUTGOING_QUEUE: &str = "outgoing_requests";
pub const DEFAULT_INCOMING_QUEUE: &str = "incoming_requests";
pub const DEFAULT_UPSERT_QUEUE: &str = "evolution.messages.upsert";
pub const DEFAULT_STATUS_QUEUE: &str = "evolution.send.message";

const DEFAULT_PREFETCH_COUNT: u16 = 50;
const DEFAULT_MAX_IN_FLIGHT: usize = 50;
const DEFAULT_RECONNECT_BACKOFF_SECS: u64 = 5;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// What kind of traffic a queue carries, which decides how its deliveries are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    /// Chat/customer/message upserts and outbound request triggers.
    Outgoing,
    /// Raw chat-platform events (messages and contact records).
    Incoming,
    /// Results of messages sent through the chat platform.
    StatusUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub name: String,
    pub role: QueueRole,
}

impl QueueBinding {
    pub fn new(name: impl Into<String>, role: QueueRole) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub rabbit_url: String,
    pub database_url: String,
    pub redis_url: String,
    pub queues: Vec<QueueBinding>,
    /// `0` leaves the broker default (no prefetch limit).
    pub prefetch_count: u16,
    /// `0` disables the per-queue in-flight limit.
    pub max_in_flight: usize,
    pub reconnect_backoff: Duration,
    pub db_max_connections: u32,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("`{0}` must be set")]
    Missing(&'static str),

    #[error("`{key}` is not a valid number: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl Settings {
    /// Reads settings from the process environment, loading `.env` first if there is one.
    pub fn from_env() -> Result<Self, SettingsError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| value(key).ok_or(SettingsError::Missing(key));
        let queue = |key: &str, default: &str| value(key).unwrap_or_else(|| default.to_owned());

        Ok(Settings {
            rabbit_url: required("RABBIT_URL")?,
            database_url: required("DB_URL")?,
            redis_url: required("REDIS_URL")?,
            queues: vec![
                QueueBinding::new(
                    queue("OUTGOING_QUEUE", DEFAULT_OUTGOING_QUEUE),
                    QueueRole::Outgoing,
                ),
                QueueBinding::new(
                    queue("INCOMING_QUEUE", DEFAULT_INCOMING_QUEUE),
                    QueueRole::Incoming,
                ),
                QueueBinding::new(
                    queue("UPSERT_QUEUE", DEFAULT_UPSERT_QUEUE),
                    QueueRole::Incoming,
                ),
                QueueBinding::new(
                    queue("STATUS_QUEUE", DEFAULT_STATUS_QUEUE),
                    QueueRole::StatusUpdate,
                ),
            ],
            prefetch_count: number(value("PREFETCH_COUNT"), "PREFETCH_COUNT", DEFAULT_PREFETCH_COUNT)?,
            max_in_flight: number(value("MAX_IN_FLIGHT"), "MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT)?,
            reconnect_backoff: Duration::from_secs(number(
                value("RECONNECT_BACKOFF_SECS"),
                "RECONNECT_BACKOFF_SECS",
                DEFAULT_RECONNECT_BACKOFF_SECS,
            )?),
            db_max_connections: number(
                value("DB_MAX_CONNECTIONS"),
                "DB_MAX_CONNECTIONS",
                DEFAULT_DB_MAX_CONNECTIONS,
            )?,
        })
    }
}

fn number<T: FromStr>(raw: Option<String>, key: &'static str, default: T) -> Result<T, SettingsError> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SettingsError::Invalid { key, value: raw }),
    }
}
