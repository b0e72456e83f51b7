//! Root key stores which hold the per-macaroon signing secrets.

use super::error::{BakeryError, Result};
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

const ROOT_KEY_BYTES: usize = 24;

/// Identifier and secret pair handed out by [`RootKeyStore::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootKey {
    pub id: String,
    pub key: Vec<u8>,
}

/// Source of macaroon root keys.
///
/// `create` must generate and persist a key atomically, and `get` must observe keys created
/// by any process, since a macaroon minted on one node may be verified on another.
#[async_trait]
pub trait RootKeyStore: Send + Sync {
    async fn create(&self) -> Result<RootKey>;

    async fn get(&self, id: &str) -> Result<Vec<u8>>;

    fn generate_key(&self) -> Vec<u8> {
        let mut key = vec![0u8; ROOT_KEY_BYTES];
        OsRng.fill_bytes(&mut key);
        key
    }
}

/// Process-local store, suitable for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryRootKeyStore {
    keys: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryRootKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RootKeyStore for MemoryRootKeyStore {
    async fn create(&self) -> Result<RootKey> {
        let root_key = RootKey {
            id: Uuid::new_v4().to_string(),
            key: self.generate_key(),
        };
        self.keys
            .write()
            .await
            .insert(root_key.id.clone(), root_key.key.clone());
        Ok(root_key)
    }

    async fn get(&self, id: &str) -> Result<Vec<u8>> {
        self.keys
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BakeryError::UnknownRootKey(id.to_string()))
    }
}

/// Store backed by the `root_keys` table, shared by every node.
#[derive(Clone)]
pub struct PgRootKeyStore {
    pool: PgPool,
}

impl PgRootKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RootKeyStore for PgRootKeyStore {
    async fn create(&self) -> Result<RootKey> {
        let root_key = RootKey {
            id: Uuid::new_v4().to_string(),
            key: self.generate_key(),
        };
        sqlx::query("INSERT INTO root_keys (id, key, created_at) VALUES ($1, $2, now())")
            .bind(&root_key.id)
            .bind(&root_key.key)
            .execute(&self.pool)
            .await?;

        debug!(key_id = %root_key.id, "Created macaroon root key");
        Ok(root_key)
    }

    async fn get(&self, id: &str) -> Result<Vec<u8>> {
        sqlx::query_scalar::<_, Vec<u8>>("SELECT key FROM root_keys WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BakeryError::UnknownRootKey(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_returns_created_keys() {
        let store = MemoryRootKeyStore::new();
        let first = store.create().await.unwrap();
        let second = store.create().await.unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(first.key, second.key);
        assert_eq!(first.key.len(), ROOT_KEY_BYTES);
        assert_eq!(store.get(&first.id).await.unwrap(), first.key);
    }

    #[tokio::test]
    async fn memory_store_rejects_unknown_ids() {
        let store = MemoryRootKeyStore::new();
        assert!(matches!(
            store.get("missing").await,
            Err(BakeryError::UnknownRootKey(id)) if id == "missing"
        ));
    }
}
