//! Database file layout and locking.
//!
//! All files of one database live next to each other under the root
//! directory, keyed by the database name:
//!
//! ```text
//! <root>/
//! ├─ <name>.nosql           # document data, one JSON object per line
//! ├─ <name>.nosql-tmp       # compaction staging file
//! ├─ <name>.nosql-counter2  # counter time-series file
//! ├─ <name>.nosql-log       # optional operation log
//! ├─ <name>.nosql-backup    # optional backup stream of pre-change lines
//! ├─ <name>.nosql-lock      # advisory lock for single-owner access
//! └─ <name>.meta            # JSON sidecar for freeform metadata
//! ```
//!
//! Tables use the `.table` extension with `-tmp`, `-counter2`, `-log`,
//! `-backup`, `-lock`, and `-meta` suffixed sidecars.
//!
//! The lock file ensures only one handle owns a database at a time; two
//! handles on the same files would corrupt each other's passes.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Flavor of a database, which decides its file extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    /// Free-form JSON documents (`.nosql`).
    Document,
    /// Fixed-schema rows (`.table`).
    Table,
}

impl DirKind {
    const fn extension(self) -> &'static str {
        match self {
            Self::Document => "nosql",
            Self::Table => "table",
        }
    }
}

/// Resolves and locks the file set of one database.
#[derive(Debug)]
pub struct DatabaseDir {
    root: PathBuf,
    name: String,
    kind: DirKind,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens the directory for a database, creating the root if needed and
    /// acquiring the advisory lock.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another handle holds the lock.
    pub fn open(root: &Path, name: &str, kind: DirKind) -> CoreResult<Self> {
        std::fs::create_dir_all(root)?;

        let lock_path = root.join(format!("{name}.{}-lock", kind.extension()));
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            root: root.to_path_buf(),
            name: name.to_string(),
            kind,
            _lock_file: lock_file,
        })
    }

    fn suffixed(&self, suffix: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}{suffix}", self.name, self.kind.extension()))
    }

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path to the data file.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.suffixed("")
    }

    /// Path to the compaction staging file.
    #[must_use]
    pub fn tmp_path(&self) -> PathBuf {
        self.suffixed("-tmp")
    }

    /// Path to the counter file.
    #[must_use]
    pub fn counter_path(&self) -> PathBuf {
        self.suffixed("-counter2")
    }

    /// Path to the operation log sidecar.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.suffixed("-log")
    }

    /// Path to the backup sidecar.
    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        self.suffixed("-backup")
    }

    /// Path to the metadata sidecar.
    #[must_use]
    pub fn meta_path(&self) -> PathBuf {
        match self.kind {
            DirKind::Document => self.root.join(format!("{}.meta", self.name)),
            DirKind::Table => self.suffixed("-meta"),
        }
    }

    /// Deletes every file of this database except the lock file.
    ///
    /// Missing files are ignored; the first real failure is returned.
    pub fn delete_all(&self) -> CoreResult<()> {
        for path in [
            self.data_path(),
            self.tmp_path(),
            self.counter_path(),
            self.log_path(),
            self.backup_path(),
            self.meta_path(),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Atomically replaces the data file with the staging file.
    pub fn promote_tmp(&self) -> CoreResult<()> {
        std::fs::rename(self.tmp_path(), self.data_path())?;
        Ok(())
    }
}
