//! Opaque credential blobs and OAuth `state` values, persisted in SQLite.

use crate::error::Result;
use crate::Provider;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use rand::Rng as _;
use rand::distr::Alphanumeric;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;

/// How long an authorization `state` stays redeemable.
const OAUTH_STATE_TTL_MINUTES: i64 = 15;

#[derive(Debug, Clone)]
pub struct TokenStore {
    pool: SqlitePool,
}

impl TokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load and decode the credential blob. A blob that no longer decodes is
    /// treated as absent so the caller reports "not connected".
    pub async fn load<T: DeserializeOwned>(&self, provider: Provider, user_id: &str) -> Result<Option<T>> {
        let blob: Option<String> = sqlx::query_scalar(
            "SELECT blob FROM provider_credentials WHERE provider = ? AND user_id = ?",
        )
        .bind(provider.as_str())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load provider credentials")?;

        Ok(blob.and_then(|blob| match serde_json::from_str(&blob) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(%provider, %error, "stored credentials are unreadable");
                None
            }
        }))
    }

    pub async fn save<T: Serialize>(&self, provider: Provider, user_id: &str, value: &T) -> Result<()> {
        let blob = serde_json::to_string(value).context("failed to serialize credentials")?;
        sqlx::query(
            r#"
            INSERT INTO provider_credentials (provider, user_id, blob, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(provider, user_id) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at
            "#,
        )
        .bind(provider.as_str())
        .bind(user_id)
        .bind(&blob)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to save provider credentials")?;

        Ok(())
    }

    pub async fn delete(&self, provider: Provider, user_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM provider_credentials WHERE provider = ? AND user_id = ?")
                .bind(provider.as_str())
                .bind(user_id)
                .execute(&self.pool)
                .await
                .context("failed to delete provider credentials")?;

        Ok(result.rows_affected() > 0)
    }

    /// Mint and persist a random `state` for an authorization request.
    pub async fn create_oauth_state(&self, provider: Provider, user_id: &str) -> Result<String> {
        let state: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        sqlx::query("INSERT INTO oauth_states (state, provider, user_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(&state)
            .bind(provider.as_str())
            .bind(user_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to save oauth state")?;

        Ok(state)
    }

    /// Redeem a `state` exactly once. Returns the user it was minted for, or
    /// `None` when it is unknown, expired, or for another provider.
    pub async fn consume_oauth_state(&self, provider: Provider, state: &str) -> Result<Option<String>> {
        let row: Option<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "DELETE FROM oauth_states WHERE state = ? RETURNING provider, user_id, created_at",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await
        .context("failed to consume oauth state")?;

        let cutoff = Utc::now() - chrono::Duration::minutes(OAUTH_STATE_TTL_MINUTES);
        Ok(row.and_then(|(stored_provider, user_id, created_at)| {
            (stored_provider == provider.as_str() && created_at >= cutoff).then_some(user_id)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Blob {
        token: String,
    }

    async fn setup_store() -> TokenStore {
        let db = Db::connect_in_memory().await.expect("in-memory sqlite");
        TokenStore::new(db.sqlite)
    }

    #[tokio::test]
    async fn blob_round_trips_and_overwrites() {
        let store = setup_store().await;
        assert!(store.load::<Blob>(Provider::Gmail, "admin").await.unwrap().is_none());

        store
            .save(Provider::Gmail, "admin", &Blob { token: "a".into() })
            .await
            .unwrap();
        store
            .save(Provider::Gmail, "admin", &Blob { token: "b".into() })
            .await
            .unwrap();

        let loaded: Blob = store.load(Provider::Gmail, "admin").await.unwrap().unwrap();
        assert_eq!(loaded.token, "b");
        assert!(store.delete(Provider::Gmail, "admin").await.unwrap());
    }

    #[tokio::test]
    async fn oauth_state_is_single_use() {
        let store = setup_store().await;
        let state = store.create_oauth_state(Provider::Gmail, "admin").await.unwrap();
        assert_eq!(state.len(), 32);

        assert_eq!(
            store.consume_oauth_state(Provider::Gmail, &state).await.unwrap().as_deref(),
            Some("admin")
        );
        assert!(store.consume_oauth_state(Provider::Gmail, &state).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oauth_state_is_provider_scoped() {
        let store = setup_store().await;
        let state = store.create_oauth_state(Provider::Gmail, "admin").await.unwrap();
        assert!(store.consume_oauth_state(Provider::Twilio, &state).await.unwrap().is_none());
    }
}
