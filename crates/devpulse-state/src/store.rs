//! StateStore: redb-backed service registry.
//!
//! Provides typed operations over registered services. All values are
//! JSON-serialized into redb's `&[u8]` value column. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Capacity of the status-change broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe service registry backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<StatusChange>,
}

impl StateStore {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "registry opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory registry opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
        }
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    /// Insert or replace a service entry.
    pub fn register(&self, entry: &ServiceEntry) -> StateResult<()> {
        let mut entry = entry.clone();
        entry.last_checked_ms = epoch_millis();
        self.write_entry(&entry)?;
        debug!(service = %entry.name, status = %entry.status, "service registered");
        Ok(())
    }

    /// Remove a service. Returns true if it existed.
    pub fn unregister(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service = %name, existed, "service unregistered");
        Ok(existed)
    }

    /// Get a service entry by name.
    pub fn get_service(&self, name: &str) -> StateResult<Option<ServiceEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let entry: ServiceEntry =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// List all registered services, ordered by name.
    pub fn list_all(&self) -> StateResult<Vec<ServiceEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let svc: ServiceEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(svc);
        }
        Ok(results)
    }

    /// Update a service's lifecycle status.
    ///
    /// Fails with `NotFound` when the service is not registered.
    pub fn update_status(&self, name: &str, status: RunStatus) -> StateResult<()> {
        self.transition_status(name, |_| Some(status)).map(|_| ())
    }

    /// Conditionally move a service to the status `decide` picks for its
    /// current one; `None` leaves it alone. The read and the write share
    /// one write transaction.
    ///
    /// Returns the change, if there was one. Fails with `NotFound` when
    /// the service is not registered.
    pub fn transition_status(
        &self,
        name: &str,
        decide: impl FnOnce(RunStatus) -> Option<RunStatus>,
    ) -> StateResult<Option<StatusChange>> {
        let change = self.modify(name, |entry| {
            let from = entry.status;
            let to = decide(from).filter(|to| *to != from)?;
            entry.status = to;
            Some(StatusChange {
                name: name.to_string(),
                from,
                to,
            })
        })?;

        if let Some(change) = &change {
            debug!(service = %name, from = %change.from, to = %change.to, "service status changed");
            // No subscribers is fine.
            let _ = self.events.send(change.clone());
        }
        Ok(change)
    }

    /// Record the exit code and end time of a finished process.
    pub fn update_exit_info(&self, name: &str, exit_code: i32, ended_at_ms: u64) -> StateResult<()> {
        self.modify(name, |entry| {
            entry.exit_code = Some(exit_code);
            entry.ended_at_ms = Some(ended_at_ms);
        })
    }

    /// Read-modify-write a single entry inside one write transaction.
    fn modify<T>(&self, name: &str, f: impl FnOnce(&mut ServiceEntry) -> T) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let out;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let mut entry: ServiceEntry = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(name.to_string())),
            };
            out = f(&mut entry);
            entry.last_checked_ms = epoch_millis();
            let value = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }

    fn write_entry(&self, entry: &ServiceEntry) -> StateResult<()> {
        let value = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            table
                .insert(entry.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}
