//! Freeform metadata sidecar.

use crate::error::CoreResult;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// A JSON key-value sidecar stored next to the data file.
///
/// User code writes whatever it wants here; the engine only loads it at open
/// and flushes it back when dirty. Saves go through a temporary file and an
/// atomic rename.
#[derive(Debug)]
pub struct Meta {
    path: PathBuf,
    values: Map<String, Value>,
    dirty: bool,
}

impl Meta {
    /// Loads the sidecar, or starts empty when it does not exist.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let values = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            values,
            dirty: false,
        })
    }

    /// Returns a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Sets a value, marking the sidecar dirty.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
        self.dirty = true;
    }

    /// Removes a value, marking the sidecar dirty when it existed.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Whether there are unflushed changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes the sidecar to disk if dirty.
    pub fn flush(&mut self) -> CoreResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push("-tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, serde_json::to_string(&Value::Object(self.values.clone()))?)?;
        std::fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn starts_empty_when_missing() {
        let temp = tempdir().unwrap();
        let meta = Meta::load(&temp.path().join("db.meta")).unwrap();
        assert!(meta.get("anything").is_none());
        assert!(!meta.is_dirty());
    }

    #[test]
    fn set_flush_reload() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db.meta");

        let mut meta = Meta::load(&path).unwrap();
        meta.set("version", json!(3));
        meta.set("owner", json!("ops"));
        assert!(meta.is_dirty());
        meta.flush().unwrap();
        assert!(!meta.is_dirty());

        let reloaded = Meta::load(&path).unwrap();
        assert_eq!(reloaded.get("version"), Some(&json!(3)));
        assert_eq!(reloaded.get("owner"), Some(&json!("ops")));
    }

    #[test]
    fn remove_marks_dirty_only_when_present() {
        let temp = tempdir().unwrap();
        let mut meta = Meta::load(&temp.path().join("db.meta")).unwrap();

        assert!(meta.remove("missing").is_none());
        assert!(!meta.is_dirty());

        meta.set("k", json!(1));
        meta.flush().unwrap();
        assert_eq!(meta.remove("k"), Some(json!(1)));
        assert!(meta.is_dirty());
    }

    #[test]
    fn corrupt_sidecar_resets_to_empty() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db.meta");
        std::fs::write(&path, "{not json").unwrap();

        let meta = Meta::load(&path).unwrap();
        assert!(!meta.is_dirty());
        assert!(meta.get("k").is_none());
    }
}
