use async_trait::async_trait;

use marcus_core::error::{CoreError, Result};
use marcus_core::store::StateStore;

/// Embedded key-value backend. Writes are flushed before a mutation returns,
/// honoring the durability contract of the serialization point.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) the store under the given directory.
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| CoreError::PersistenceFailure(format!("open sled at {path}: {e}")))?;
        tracing::info!(path, "embedded key-value store opened");
        Ok(Self { db })
    }

    fn map_err(context: &str, err: sled::Error) -> CoreError {
        CoreError::PersistenceFailure(format!("{context}: {err}"))
    }
}

#[async_trait]
impl StateStore for SledStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| Self::map_err("put", e))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| Self::map_err("flush", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(|e| Self::map_err("get", e))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| Self::map_err("delete", e))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| Self::map_err("flush", e))?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry.map_err(|e| Self::map_err("scan", e))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| CoreError::PersistenceFailure(format!("non-utf8 key: {e}")))?;
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }
}
