//! Content-addressed blob storage

use crate::error::{AdapterError, AdapterResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier derived from the BLAKE3 hash of a blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    const PREFIX: &'static str = "b3";

    pub fn of(bytes: &[u8]) -> Self {
        Self(format!("{}{}", Self::PREFIX, blake3::hash(bytes).to_hex()))
    }

    pub fn parse(value: &str) -> AdapterResult<Self> {
        let digest = value
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| AdapterError::InvalidParams(format!("invalid content id '{}'", value)))?;
        if digest.len() != 64 || hex::decode(digest).is_err() {
            return Err(AdapterError::InvalidParams(format!("invalid content id '{}'", value)));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> AdapterResult<ContentId>;

    async fn get(&self, id: &ContentId) -> AdapterResult<Vec<u8>>;
}

#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<ContentId, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, bytes: Vec<u8>) -> AdapterResult<ContentId> {
        let id = ContentId::of(&bytes);
        self.blobs.write().entry(id.clone()).or_insert(bytes);
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> AdapterResult<Vec<u8>> {
        self.blobs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_blobs_share_an_id() {
        let store = MemoryContentStore::new();
        let first = store.put(b"flip".to_vec()).await.unwrap();
        let second = store.put(b"flip".to_vec()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&first).await.unwrap(), b"flip");
        assert_eq!(ContentId::parse(first.as_str()).unwrap(), first);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let store = MemoryContentStore::new();
        let err = store.get(&ContentId::of(b"nothing")).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotFound(_)));
        assert!(ContentId::parse("Qm123").is_err());
    }
}
