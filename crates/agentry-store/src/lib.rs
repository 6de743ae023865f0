//! Agentry storage — durable append-only logs and catalogues over redb.
//!
//! One database file per hub. Typed wrappers are bound to a single owner:
//! [`ThreadStore`] to one agent instance, [`AgencyStore`] to one agency.
//! All mutating calls are durable before they return; reads after a restart
//! see exactly what was committed.

mod agency;
mod thread;

pub use agency::AgencyStore;
pub use thread::ThreadStore;

use agentry_core::{Error, Result};
use redb::Database;
use std::path::Path;
use std::sync::Arc;

/// Shared handle to the hub database.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) the hub database and ensure every table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path).map_err(Error::storage)?;
        let store = Self { db: Arc::new(db) };
        thread::ensure_tables(&store.db)?;
        agency::ensure_tables(&store.db)?;
        Ok(store)
    }

    /// Bind a store view to one agent instance.
    pub fn thread(&self, thread_id: impl Into<String>) -> ThreadStore {
        ThreadStore::new(self.db.clone(), thread_id.into())
    }

    /// Bind a store view to one agency.
    pub fn agency(&self, name: impl Into<String>) -> AgencyStore {
        AgencyStore::new(self.db.clone(), name.into())
    }

    pub(crate) fn database(&self) -> &Arc<Database> {
        &self.db
    }
}
