//! Registry store: the durable record of installed entities and flags.
//!
//! `registry.json` is replaced atomically on every save. Readers take a
//! shared lock on `registry.lock` and see a complete snapshot; writers take
//! the exclusive lock, reload the file, mutate and save before releasing.

mod journal;
mod state;

pub use journal::{Journal, JournalEntry};
pub use state::{Flag, Registry};

use log::debug;
use std::path::Path;
use std::time::Duration;

use crate::config::Paths;
use crate::error::{LypError, Result};
use crate::lock::{self, LockGuard};
use crate::model::{Entity, EntityId, Kind, ListEntry};
use crate::runtime::Runtime;

pub struct RegistryStore<'a, R: Runtime> {
    runtime: &'a R,
    paths: Paths,
    lock_timeout: Duration,
}

impl<'a, R: Runtime> RegistryStore<'a, R> {
    pub fn new(runtime: &'a R, paths: Paths, lock_timeout: Duration) -> Self {
        Self {
            runtime,
            paths,
            lock_timeout,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Consistent read-only view of the registry.
    #[tracing::instrument(skip(self))]
    pub fn snapshot(&self) -> Result<Registry> {
        let _lock = lock::acquire_shared(&self.paths.lock_file(), self.lock_timeout, "registry read")?;
        read_registry(self.runtime, &self.paths.registry_file())
    }

    /// Take the exclusive lock. The returned writer holds it until dropped.
    #[tracing::instrument(skip(self))]
    pub fn lock_for_write(&self) -> Result<RegistryWriter<'a, R>> {
        let lock = lock::acquire_exclusive(&self.paths.lock_file(), self.lock_timeout, "registry write")?;
        Ok(RegistryWriter {
            runtime: self.runtime,
            paths: self.paths.clone(),
            _lock: lock,
        })
    }

    /// Load fresh state under the exclusive lock, apply `f`, and save if it
    /// succeeded. On error nothing is written.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Registry) -> Result<T>) -> Result<T> {
        let writer = self.lock_for_write()?;
        let mut registry = writer.load()?;
        let value = f(&mut registry)?;
        writer.save(&registry)?;
        Ok(value)
    }

    pub fn list(&self, kind: Kind, pattern: Option<&str>, session: &str) -> Result<Vec<ListEntry>> {
        let pattern = pattern
            .map(|p| glob::Pattern::new(p).map_err(|_| LypError::InvalidSpecifier(p.to_string())))
            .transpose()?;
        Ok(self.snapshot()?.list(kind, pattern.as_ref(), session))
    }

    pub fn get(&self, id: &EntityId) -> Result<Entity> {
        self.snapshot()?
            .get(id)
            .ok_or_else(|| LypError::NotFound(id.to_string()))
    }

    pub fn set_flag(&self, id: &EntityId, flag: Flag, value: bool, session: &str) -> Result<()> {
        self.transaction(|registry| registry.set_flag(id, flag, value, session))
    }

    pub fn record(&self, entity: Entity) -> Result<()> {
        self.transaction(|registry| registry.record(entity))
    }

    pub fn remove(&self, id: &EntityId) -> Result<Entity> {
        self.transaction(|registry| registry.remove(id))
    }
}

/// Exclusive access to the registry and the journal.
pub struct RegistryWriter<'a, R: Runtime> {
    runtime: &'a R,
    paths: Paths,
    _lock: LockGuard,
}

impl<R: Runtime> RegistryWriter<'_, R> {
    pub fn load(&self) -> Result<Registry> {
        read_registry(self.runtime, &self.paths.registry_file())
    }

    #[tracing::instrument(skip(self, registry))]
    pub fn save(&self, registry: &Registry) -> Result<()> {
        let path = self.paths.registry_file();
        let registry_error = |source| LypError::Registry {
            path: path.clone(),
            source,
        };
        let json = serde_json::to_string_pretty(registry)
            .map_err(|e| registry_error(anyhow::Error::from(e)))?;
        self.runtime
            .write_atomic(&path, json.as_bytes())
            .map_err(registry_error)?;
        debug!("Saved registry to {:?}", path);
        Ok(())
    }

    pub fn journal(&self) -> Result<Journal> {
        let path = self.paths.journal_file();
        Journal::load(self.runtime, &path).map_err(|source| LypError::Registry { path, source })
    }

    pub fn save_journal(&self, journal: &Journal) -> Result<()> {
        let path = self.paths.journal_file();
        journal
            .save(self.runtime, &path)
            .map_err(|source| LypError::Registry { path, source })
    }

    /// Append an entry before moving anything.
    pub fn begin(&self, entry: JournalEntry) -> Result<()> {
        let mut journal = self.journal()?;
        journal.entries.push(entry);
        self.save_journal(&journal)
    }

    /// Drop an entry once its commit is durable.
    pub fn complete(&self, entry_id: &str) -> Result<()> {
        let mut journal = self.journal()?;
        journal.entries.retain(|e| e.id != entry_id);
        self.save_journal(&journal)
    }
}

/// Read `registry.json`. A missing file is an empty registry.
fn read_registry<R: Runtime>(runtime: &R, path: &Path) -> Result<Registry> {
    if !runtime.exists(path) {
        return Ok(Registry::default());
    }
    let registry_error = |source| LypError::Registry {
        path: path.to_path_buf(),
        source,
    };
    let content = runtime.read_to_string(path).map_err(registry_error)?;
    serde_json::from_str(&content).map_err(|e| registry_error(anyhow::Error::from(e)))
}
