//! Chat state kept in the cache: one record and one ordered message log per chat, plus a
//! global index of known chats.
//!
//! Layout:
//! - `chat:<key>`: single-element list holding the JSON chat record
//! - `chat:<key>:messages`: append-only list of JSON messages
//! - `chats`: set of every chat key with a record

use crate::core::identity::{self, ChatKey};
use crate::core::payloads::{lenient_bool, lenient_opt_string, lenient_string};
use crate::infrastructure::cache::CacheError;
use crate::infrastructure::traits::ChatCache;
use di::{Ref, injectable};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value, json};

pub const CHAT_INDEX: &str = "chats";

pub const SITUATION_ENQUEUED: &str = "enqueued";
pub const SITUATION_FINISHED: &str = "finished";

/// Department of a reopened chat until an agent picks it up.
pub const AWAITING_AGENT: &str = "awaiting_agent";

pub fn record_key(key: &ChatKey) -> String {
    format!("chat:{key}")
}

pub fn messages_key(key: &ChatKey) -> String {
    format!("chat:{key}:messages")
}

/// Typed view over a cached chat record. Fields that are missing or of an unexpected type
/// read as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CachedChatRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub situation: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_active: bool,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub agent_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub tabulation: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub tags: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub department: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub instance_id: Option<String>,
}

impl CachedChatRecord {
    /// Whether a new inbound message has to reopen this chat first.
    pub fn is_closed(&self) -> bool {
        self.situation == SITUATION_FINISHED || !self.is_active
    }
}

/// What to seed a chat record with if the chat does not exist yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewChat<'a> {
    /// Participant identity the record's `number` is taken from.
    pub participant: &'a str,
    /// Complete record to store instead of a synthesized one.
    pub metadata: Option<&'a Value>,
    /// Instance the chat belongs to, used for synthesized records.
    pub instance_id: Option<&'a str>,
}

impl NewChat<'_> {
    fn record(&self, key: &ChatKey) -> String {
        if let Some(metadata) = self.metadata {
            return metadata.to_string();
        }
        json!({
            "id": key.as_str(),
            "situation": SITUATION_ENQUEUED,
            "is_active": true,
            "agent_id": null,
            "tabulation": null,
            "instance_id": self.instance_id.unwrap_or_default(),
            "number": ChatKey::new(self.participant).number(),
        })
        .to_string()
    }
}

#[injectable]
pub struct ChatStateStore {
    cache: Ref<dyn ChatCache>,
}

impl ChatStateStore {
    pub fn new(cache: Ref<dyn ChatCache>) -> Self {
        Self { cache }
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.cache.ping().await
    }

    /// Finds the key an existing chat for `candidate` is stored under, trying the identity as
    /// given, then its normalized form, then its legacy 8-digit form. Falls back to the
    /// normalized form when no chat exists.
    pub async fn resolve_existing_key(&self, candidate: &str) -> Result<ChatKey, CacheError> {
        let candidates = identity::alternate_forms(candidate)
            .into_iter()
            .chain(identity::legacy_form(candidate));
        for key in candidates {
            if self.cache.exists(&record_key(&key)).await? {
                debug!("resolved {candidate} to existing chat {key}");
                return Ok(key);
            }
        }
        Ok(identity::normalize(candidate))
    }

    /// Creates the chat record under `key` unless one exists, and makes sure the key is in the
    /// chat index either way. Returns `true` if this call created the record.
    pub async fn ensure_chat_exists(
        &self,
        key: &ChatKey,
        seed: NewChat<'_>,
    ) -> Result<bool, CacheError> {
        let created = self
            .cache
            .create_indexed(&record_key(key), &seed.record(key), CHAT_INDEX, key.as_str())
            .await?;
        if created {
            info!("created chat {key}");
        }
        Ok(created)
    }

    /// Appends a message to the log of the chat `identity` resolves to, creating the chat
    /// first if needed. Returns the key the message was stored under.
    pub async fn append_message(
        &self,
        identity: &str,
        message: &str,
        seed: NewChat<'_>,
    ) -> Result<ChatKey, CacheError> {
        let key = self.resolve_existing_key(identity).await?;
        self.ensure_chat_exists(&key, seed).await?;
        self.cache.push(&messages_key(&key), message).await?;
        debug!("appended message to chat {key}");
        Ok(key)
    }

    pub async fn chat(&self, key: &ChatKey) -> Result<Option<CachedChatRecord>, CacheError> {
        let Some(raw) = self.cache.head(&record_key(key)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("chat record {key} is not valid JSON: {e}");
                Ok(None)
            }
        }
    }

    pub async fn messages(&self, key: &ChatKey) -> Result<Vec<String>, CacheError> {
        self.cache.range(&messages_key(key)).await
    }

    /// Puts a finished or inactive chat back in the queue: situation `enqueued`, active, with
    /// agent, tabulation and tags cleared and the department set to [`AWAITING_AGENT`].
    /// Other fields of the record are kept as they are.
    ///
    /// This is a plain read-modify-write of the whole record. A concurrent rewrite of the same
    /// record between the read and the write is lost.
    ///
    /// Returns `true` if the record was rewritten.
    pub async fn reopen(&self, key: &ChatKey) -> Result<bool, CacheError> {
        let record_key = record_key(key);
        let Some(raw) = self.cache.head(&record_key).await? else {
            return Ok(false);
        };

        let (record, mut fields) = match (
            serde_json::from_str::<CachedChatRecord>(&raw),
            serde_json::from_str::<Map<String, Value>>(&raw),
        ) {
            (Ok(record), Ok(fields)) => (record, fields),
            _ => {
                warn!("chat record {key} can't be reopened, it is not a JSON object");
                return Ok(false);
            }
        };
        if !record.is_closed() {
            return Ok(false);
        }

        fields.insert("situation".to_owned(), SITUATION_ENQUEUED.into());
        fields.insert("is_active".to_owned(), true.into());
        fields.insert("agent_id".to_owned(), Value::Null);
        fields.insert("tabulation".to_owned(), Value::Null);
        fields.insert("tags".to_owned(), Value::Null);
        fields.insert("department".to_owned(), AWAITING_AGENT.into());

        self.cache
            .replace_head(&record_key, &Value::Object(fields).to_string())
            .await?;
        info!("reopened chat {key}");
        Ok(true)
    }
}
