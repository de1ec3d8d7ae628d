//! Redis-backed session storage

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::{Session, SessionStorage};
use crate::error::Result;

/// Key namespace so pocket sessions coexist with other users of the instance
const KEY_PREFIX: &str = "pocket:session:";

/// Session storage shared across processes through Redis.
/// Sessions are stored as JSON strings under `pocket:session:{key}`.
pub struct RedisSessionStorage {
    client: redis::Client,
}

impl RedisSessionStorage {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl SessionStorage for RedisSessionStorage {
    async fn get(&self, key: &str) -> Result<Option<Session>> {
        let mut con = self.connection().await?;
        let raw: Option<String> = con.get(Self::storage_key(key)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, session: Session) -> Result<()> {
        let mut con = self.connection().await?;
        let json = serde_json::to_string(&session)?;
        let _: () = con.set(Self::storage_key(key), json).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut con = self.connection().await?;
        let removed: i64 = con.del(Self::storage_key(key)).await?;
        Ok(removed > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Session)>> {
        let mut con = self.connection().await?;
        let pattern = format!("{}{}*", KEY_PREFIX, prefix);

        let keys: Vec<String> = {
            let mut iter = con.scan_match::<_, String>(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = con.mget(&keys).await?;
        let mut sessions = Vec::new();
        for (key, value) in keys.into_iter().zip(values) {
            // A key can expire between SCAN and MGET; skip the hole.
            let Some(json) = value else { continue };
            let session: Session = serde_json::from_str(&json)?;
            sessions.push((key.trim_start_matches(KEY_PREFIX).to_string(), session));
        }
        Ok(sessions)
    }
}
