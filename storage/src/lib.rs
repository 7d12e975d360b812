//! Durable `StateStore` backends.
//!
//! Two implementations behind the same keyed abstraction: [`SledStore`] for
//! the embedded key-value backend (single-node) and [`SqliteStore`] for the
//! SQL backend. Selection happens once at startup from configuration.

mod sled_store;
mod sqlite;

use std::sync::Arc;

pub use sled_store::SledStore;
pub use sqlite::SqliteStore;

use marcus_core::config::PersistenceBackend;
use marcus_core::error::Result;
use marcus_core::store::StateStore;

/// Open the configured backend. `location` is a directory path for the
/// embedded store and a database URL (or file path) for SQLite.
pub async fn open_store(
    backend: PersistenceBackend,
    location: &str,
) -> Result<Arc<dyn StateStore>> {
    match backend {
        PersistenceBackend::EmbeddedKv => {
            let store = SledStore::open(location)?;
            Ok(Arc::new(store))
        }
        PersistenceBackend::Sql => {
            let store = SqliteStore::connect(location).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}
