//! SQLite-backed [`SessionStore`].

use async_trait::async_trait;
use chrono::Utc;
use live_socket::{SessionError, SessionId, SessionStore};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::debug;

pub struct SqliteSessionStore {
    pool: SqlitePool,
    ttl_ms: i64,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    fn cutoff(&self) -> i64 {
        Utc::now().timestamp_millis().saturating_sub(self.ttl_ms)
    }
}

fn storage(err: sqlx::Error) -> SessionError {
    SessionError::Storage(err.to_string())
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, id: &SessionId) -> Result<Vec<u8>, SessionError> {
        let row: Option<(Vec<u8>, i64)> =
            sqlx::query_as("SELECT data, updated_at FROM sessions WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;

        let Some((data, updated_at)) = row else {
            return Err(SessionError::NotFound);
        };

        if updated_at < self.cutoff() {
            debug!(session = %id, "Session expired on load");
            self.expire(id).await?;
            return Err(SessionError::NotFound);
        }

        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp_millis())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        Ok(data)
    }

    async fn save(&self, id: &SessionId, state: Vec<u8>) -> Result<(), SessionError> {
        sqlx::query("INSERT OR REPLACE INTO sessions (id, data, updated_at) VALUES (?, ?, ?)")
            .bind(id.as_str())
            .bind(state)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn expire(&self, id: &SessionId) -> Result<(), SessionError> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, SessionError> {
        let result = sqlx::query("DELETE FROM sessions WHERE updated_at < ?")
            .bind(self.cutoff())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    async fn store(ttl: Duration) -> SqliteSessionStore {
        SqliteSessionStore::new(test_pool().await, ttl)
    }

    #[tokio::test]
    async fn test_load_unknown_is_not_found() {
        let store = store(Duration::from_secs(60)).await;
        let id = store.create().await.unwrap();
        assert_eq!(store.load(&id).await, Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = store(Duration::from_secs(60)).await;
        let id = SessionId::generate();
        store.save(&id, b"{\"temperature\":19.5}".to_vec()).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap(), b"{\"temperature\":19.5}");
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = store(Duration::from_secs(60)).await;
        let id = SessionId::generate();
        store.save(&id, b"one".to_vec()).await.unwrap();
        store.save(&id, b"two".to_vec()).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap(), b"two");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_expire_is_idempotent() {
        let store = store(Duration::from_secs(60)).await;
        let id = SessionId::generate();
        store.save(&id, b"x".to_vec()).await.unwrap();
        store.expire(&id).await.unwrap();
        store.expire(&id).await.unwrap();
        assert_eq!(store.load(&id).await, Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_ttl_elapsed_is_not_found() {
        let store = store(Duration::from_millis(20)).await;
        let id = SessionId::generate();
        store.save(&id, b"x".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.load(&id).await, Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = store(Duration::from_secs(60)).await;
        let fresh = SessionId::generate();
        let stale = SessionId::generate();
        store.save(&fresh, b"fresh".to_vec()).await.unwrap();
        store.save(&stale, b"stale".to_vec()).await.unwrap();

        sqlx::query("UPDATE sessions SET updated_at = 0 WHERE id = ?")
            .bind(stale.as_str())
            .execute(&store.pool)
            .await
            .unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.load(&fresh).await.is_ok());
        assert_eq!(store.load(&stale).await, Err(SessionError::NotFound));
    }
}
