//! Process-scoped database registry.
//!
//! The registry maps database names to open handles under one root
//! directory. Joins resolve their sibling databases through it, and
//! applications use it to share handles instead of reopening files.

use crate::config::Config;
use crate::database::Database;
use crate::error::CoreResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Open database handles, keyed by name, under one root directory.
pub struct Registry {
    root: PathBuf,
    databases: Mutex<HashMap<String, Arc<Database>>>,
}

impl Registry {
    /// Creates a registry rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            databases: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the handle for `name`, opening the database with default
    /// configuration on first use.
    pub fn database(&self, name: &str) -> CoreResult<Arc<Database>> {
        if let Some(db) = self.databases.lock().get(name) {
            return Ok(Arc::clone(db));
        }
        let db = Arc::new(Database::open(&self.root, name)?);
        self.databases
            .lock()
            .insert(name.to_string(), Arc::clone(&db));
        Ok(db)
    }

    /// Returns the handle for `name`, opening with `config` on first use.
    pub fn database_with_config(&self, name: &str, config: Config) -> CoreResult<Arc<Database>> {
        if let Some(db) = self.databases.lock().get(name) {
            return Ok(Arc::clone(db));
        }
        let db = Arc::new(Database::open_with_config(&self.root, name, config)?);
        self.databases
            .lock()
            .insert(name.to_string(), Arc::clone(&db));
        Ok(db)
    }

    /// Registers an already-open database under `name`.
    pub fn register(&self, name: impl Into<String>, db: Database) -> Arc<Database> {
        let db = Arc::new(db);
        self.databases.lock().insert(name.into(), Arc::clone(&db));
        db
    }

    /// Releases the handle for `name`. The database closes once the last
    /// outstanding `Arc` drops.
    pub fn release(&self, name: &str) -> bool {
        self.databases.lock().remove(name).is_some()
    }

    /// The registry's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}
