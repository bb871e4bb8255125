//! Redis-backed chat state primitives

use crate::infrastructure::traits::ChatCache;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use thiserror::Error;

/// Creates the record list only when it is missing; index membership is enforced every time
/// so a record can never be left unindexed.
const CREATE_INDEXED_SCRIPT: &str = r#"
local created = 0
if redis.call('EXISTS', KEYS[1]) == 0 then
    redis.call('RPUSH', KEYS[1], ARGV[1])
    created = 1
end
redis.call('SADD', KEYS[2], ARGV[2])
return created
"#;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(#[source] RedisError),

    #[error("cache command {command} on `{key}` failed: {source}")]
    Command {
        command: &'static str,
        key: String,
        #[source]
        source: RedisError,
    },
}

fn command_error(command: &'static str, key: &str) -> impl FnOnce(RedisError) -> CacheError {
    let key = key.to_owned();
    move |source| CacheError::Command {
        command,
        key,
        source,
    }
}

pub struct RedisChatCache {
    manager: ConnectionManager,
    create_indexed: Script,
}

impl RedisChatCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url).map_err(CacheError::Unavailable)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(CacheError::Unavailable)?;
        Ok(Self {
            manager,
            create_indexed: Script::new(CREATE_INDEXED_SCRIPT),
        })
    }
}

#[async_trait]
impl ChatCache for RedisChatCache {
    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Unavailable)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        let exists: bool = conn
            .exists(key)
            .await
            .map_err(command_error("EXISTS", key))?;
        Ok(exists)
    }

    async fn head(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.manager.clone();
        let head: Option<String> = conn
            .lindex(key, 0)
            .await
            .map_err(command_error("LINDEX", key))?;
        Ok(head)
    }

    async fn replace_head(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .lset(key, 0, value)
            .await
            .map_err(command_error("LSET", key))?;
        Ok(())
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .rpush(key, value)
            .await
            .map_err(command_error("RPUSH", key))?;
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.manager.clone();
        let entries: Vec<String> = conn
            .lrange(key, 0, -1)
            .await
            .map_err(command_error("LRANGE", key))?;
        Ok(entries)
    }

    async fn create_indexed(
        &self,
        key: &str,
        value: &str,
        index: &str,
        member: &str,
    ) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        let created: i32 = self
            .create_indexed
            .key(key)
            .key(index)
            .arg(value)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error("EVALSHA", key))?;
        Ok(created == 1)
    }
}
