use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use marcus_core::error::{CoreError, Result};
use marcus_core::store::{MemoryStore, StateStore};

/// StateStore wrapper that fails on demand, for persistence-rollback tests.
pub struct FlakyStore {
    inner: MemoryStore,
    injected: Mutex<VecDeque<CoreError>>,
    writes: Mutex<Vec<String>>,
}

impl Default for FlakyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            injected: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next write with `PersistenceFailure`.
    pub fn fail_next_write(&self) {
        self.injected
            .lock()
            .push_back(CoreError::PersistenceFailure("injected write failure".into()));
    }

    /// Keys written so far, in order.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    fn take_injected(&self) -> Result<()> {
        match self.injected.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.writes.lock().push(key.to_string());
        self.take_injected()?;
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.take_injected()?;
        self.inner.delete(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_failure_hits_exactly_one_write() {
        let store = FlakyStore::new();
        store.fail_next_write();
        assert!(store.put("k1", b"v".to_vec()).await.is_err());
        store.put("k2", b"v".to_vec()).await.unwrap();
        assert_eq!(store.writes(), vec!["k1", "k2"]);
        // The failed write left nothing behind.
        assert!(store.get("k1").await.unwrap().is_none());
        assert!(store.get("k2").await.unwrap().is_some());
    }
}
