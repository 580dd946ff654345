//! One-shot batched appends.

use crate::error::StorageResult;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Appends a pre-assembled batch of bytes to a file, creating it if needed.
///
/// The append phase concatenates many encoded lines into one buffer and
/// calls this once per batch, so concurrent submissions share a single
/// write.
pub fn append_file(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn append_creates_and_extends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.txt");

        append_file(&path, b"a\nb\n").unwrap();
        append_file(&path, b"c\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\nc\n");
    }

    #[test]
    fn empty_batch_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.txt");

        append_file(&path, b"").unwrap();
        assert!(!path.exists());
    }
}
