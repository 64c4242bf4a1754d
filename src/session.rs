use crate::storage::{KeyValueStore, StoreResult};
use std::sync::Arc;
use uuid::Uuid;

pub const TOKEN_KEY: &str = "session_token";
pub const CONNECTION_ID_KEY: &str = "ws_connection_id";

/// Auth session and realtime connection identity, persisted in a key/value store.
#[derive(Clone)]
pub struct Session {
    kv: Arc<dyn KeyValueStore>,
}

impl Session {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub async fn token(&self) -> StoreResult<Option<String>> {
        Ok(self
            .kv
            .get(TOKEN_KEY)
            .await?
            .filter(|t| !t.trim().is_empty()))
    }

    pub async fn set_token(&self, token: &str) -> StoreResult<()> {
        self.kv.set(TOKEN_KEY, token).await
    }

    pub async fn is_authenticated(&self) -> bool {
        matches!(self.token().await, Ok(Some(_)))
    }

    /// Stable id reused across reconnects; generated on first use.
    pub async fn connection_id(&self) -> StoreResult<String> {
        if let Some(id) = self.kv.get(CONNECTION_ID_KEY).await? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.kv.set(CONNECTION_ID_KEY, &id).await?;
        Ok(id)
    }

    pub async fn logout(&self) -> StoreResult<()> {
        self.kv.delete(TOKEN_KEY).await?;
        self.kv.delete(CONNECTION_ID_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;

    #[tokio::test]
    async fn connection_id_is_stable_until_logout() {
        let session = Session::new(Arc::new(MemoryKv::new()));
        session.set_token("tok").await.unwrap();
        assert!(session.is_authenticated().await);

        let first = session.connection_id().await.unwrap();
        assert_eq!(session.connection_id().await.unwrap(), first);
        assert!(Uuid::parse_str(&first).is_ok());

        session.logout().await.unwrap();
        assert!(!session.is_authenticated().await);
        assert_ne!(session.connection_id().await.unwrap(), first);
    }

    #[tokio::test]
    async fn blank_token_is_not_authenticated() {
        let session = Session::new(Arc::new(MemoryKv::new()));
        session.set_token("  ").await.unwrap();
        assert_eq!(session.token().await.unwrap(), None);
    }
}
