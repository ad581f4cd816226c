use crate::domain::ports::KeyValueStore;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, Vec<u8>>,
    lists: BTreeMap<String, Vec<Vec<u8>>>,
}

/// A thread-safe in-memory key/value store.
///
/// Both key spaces sit behind one `RwLock`, so compare-and-swap and list
/// appends are atomic with respect to each other. Cloning shares the data.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read().await;
        Ok(inner.records.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.records.insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.records.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        inner.records.insert(key.to_string(), value);
        Ok(true)
    }

    async fn append(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.lists.entry(key.to_string()).or_default().push(value);
        Ok(())
    }

    async fn append_unique(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let list = inner.lists.entry(key.to_string()).or_default();
        if list.contains(&value) {
            return Ok(false);
        }
        list.push(value);
        Ok(true)
    }

    async fn list(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.read().await;
        Ok(inner.lists.get(key).cloned().unwrap_or_default())
    }

    async fn replace_list(&self, key: &str, values: Vec<Vec<u8>>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.lists.insert(key.to_string(), values);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .lists
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
