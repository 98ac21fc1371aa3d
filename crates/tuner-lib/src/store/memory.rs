use super::{check_revision, decode_blob, encode_blob, stamped, ModelKey, ModelStore};
use crate::error::StoreError;
use crate::policy::PolicyState;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local blob store, used by simulations and tests
#[derive(Default)]
pub struct InMemoryModelStore {
    blobs: RwLock<HashMap<ModelKey, Vec<u8>>>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<ModelKey> {
        let mut keys: Vec<_> = self.blobs.read().await.keys().cloned().collect();
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        keys
    }
}

#[async_trait]
impl ModelStore for InMemoryModelStore {
    async fn load(&self, key: &ModelKey) -> Result<PolicyState, StoreError> {
        let blobs = self.blobs.read().await;
        let blob = blobs
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        decode_blob(key, blob)
    }

    async fn save(&self, key: &ModelKey, state: &PolicyState) -> Result<u64, StoreError> {
        let mut blobs = self.blobs.write().await;
        let stored = match blobs.get(key) {
            Some(blob) => Some(decode_blob(key, blob)?.revision),
            None => None,
        };
        let revision = check_revision(key, stored, state.revision)?;
        blobs.insert(key.clone(), encode_blob(&stamped(state, revision))?);
        Ok(revision)
    }
}
