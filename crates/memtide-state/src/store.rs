//! StateStore — redb-backed persistence for controller state.
//!
//! Both maps live in one redb file. `save` replaces the stored maps in a
//! single write transaction. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable, TableDefinition, TableHandle};
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => StateError::Locked(path.display().to_string()),
            other => StateError::Open(other.to_string()),
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Open the store at `path`, starting over if the file is unusable.
    ///
    /// An unreadable file is moved to `<path>.corrupt` and a fresh one is
    /// created. If that fails as well the controller keeps running on an
    /// in-memory store and nothing is persisted. A file locked by another
    /// process is left alone and reported as [`StateError::Locked`].
    pub fn open_or_reset(path: &Path) -> StateResult<Self> {
        let err = match Self::open(path) {
            Ok(store) => return Ok(store),
            Err(e @ StateError::Locked(_)) => return Err(e),
            Err(e) => e,
        };
        warn!(?path, error = %err, "state file unusable, starting with empty state");

        let aside = corrupt_path(path);
        if let Err(e) = std::fs::rename(path, &aside) {
            warn!(?path, error = %e, "could not move unusable state file aside");
        }
        match Self::open(path) {
            Ok(store) => Ok(store),
            Err(e) => {
                error!(?path, error = %e, "state will not be persisted");
                Self::open_in_memory()
            }
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(VM_CONTROL).map_err(map_err!(Table))?;
        txn.open_table(HOST_CONTROL).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Load all persisted state.
    ///
    /// Rows that no longer deserialize are skipped with a warning.
    pub fn load(&self) -> StateResult<ControlSnapshot> {
        let snapshot = ControlSnapshot {
            vms: self.read_table(VM_CONTROL)?.into_iter().collect(),
            hosts: self.read_table(HOST_CONTROL)?.into_iter().collect(),
        };
        debug!(
            vms = snapshot.vms.len(),
            hosts = snapshot.hosts.len(),
            "controller state loaded"
        );
        Ok(snapshot)
    }

    fn read_table<T: DeserializeOwned>(
        &self,
        def: TableDefinition<'static, u64, &'static [u8]>,
    ) -> StateResult<Vec<(u64, T)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            match serde_json::from_slice(value.value()) {
                Ok(parsed) => results.push((key.value(), parsed)),
                Err(e) => warn!(table = def.name(), key = key.value(), error = %e, "skipping unreadable row"),
            }
        }
        Ok(results)
    }

    /// Replace the persisted state with `snapshot`.
    ///
    /// Entries missing from the snapshot are removed, so a pruned VM does
    /// not come back on the next load.
    pub fn save(&self, snapshot: &ControlSnapshot) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(VM_CONTROL).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let k = key.value();
                if !snapshot.vms.contains_key(&k) {
                    stale.push(k);
                }
            }
            for key in stale {
                table.remove(key).map_err(map_err!(Write))?;
            }
            for (vm_id, state) in &snapshot.vms {
                let value = serde_json::to_vec(state).map_err(map_err!(Serialize))?;
                table
                    .insert(*vm_id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = txn.open_table(HOST_CONTROL).map_err(map_err!(Table))?;
            for (host_id, state) in &snapshot.hosts {
                let value = serde_json::to_vec(state).map_err(map_err!(Serialize))?;
                table
                    .insert(*host_id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            vms = snapshot.vms.len(),
            hosts = snapshot.hosts.len(),
            "controller state saved"
        );
        Ok(())
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}
