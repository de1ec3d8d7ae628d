//! In-process session storage

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Session, SessionStorage};
use crate::error::Result;

/// Guarded map, for tests and single-process deployments
#[derive(Default)]
pub struct InMemorySessionStorage {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for InMemorySessionStorage {
    async fn get(&self, key: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(key).cloned())
    }

    async fn set(&self, key: &str, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(key.to_string(), session);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Session)>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, session)| (key.clone(), session.clone()))
            .collect())
    }
}
