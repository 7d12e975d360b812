use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, Result};

/// Durable store for assignments, leases, decisions, the artifact index,
/// registrations, and performance counters.
///
/// Keyed access with atomic single-key writes and range scans; no cross-key
/// transactions. Multi-field mutations pass through the core's serialization
/// point and are journaled as one record per key, so per-key atomicity is
/// all the backends have to give.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All pairs whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Persisted key layout. Everything is namespaced by record kind; ids never
/// contain '/' (enforced at creation), so prefixes cannot collide.
pub mod keys {
    pub const TASKS: &str = "tasks/";
    pub const LEASES: &str = "leases/";
    pub const ASSIGNMENTS: &str = "assignments/";
    pub const DECISIONS: &str = "decisions/";
    pub const ARTIFACTS: &str = "artifacts/";
    pub const AGENTS: &str = "agents/";

    pub fn task(id: &str) -> String {
        format!("{TASKS}{id}")
    }

    pub fn lease(task: &str) -> String {
        format!("{LEASES}{task}")
    }

    pub fn assignment(agent: &str) -> String {
        format!("{ASSIGNMENTS}{agent}")
    }

    pub fn decision(task: &str, id: u64) -> String {
        format!("{DECISIONS}{task}/{id:016}")
    }

    pub fn artifact(task: &str, id: u64) -> String {
        format!("{ARTIFACTS}{task}/{id:016}")
    }

    pub fn agent(id: &str) -> String {
        format!("{AGENTS}{id}")
    }
}

/// Serialize and write one record.
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| CoreError::PersistenceFailure(format!("encode {key}: {e}")))?;
    store.put(key, bytes).await
}

/// Read and decode one record.
pub async fn get_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::PersistenceFailure(format!("decode {key}: {e}")))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Decode every record under a prefix, in key order.
pub async fn scan_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    prefix: &str,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for (key, bytes) in store.scan_prefix(prefix).await? {
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::PersistenceFailure(format!("decode {key}: {e}")))?;
        out.push(value);
    }
    Ok(out)
}

/// Volatile store for tests and throwaway runs. Ordered map so scans come
/// back in key order like the durable backends.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
