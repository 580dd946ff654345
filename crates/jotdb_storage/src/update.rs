//! Update sessions: forward streaming with concurrent writes.

use crate::error::{StorageError, StorageResult};
use crate::reader::LineStream;
use crate::record::{LineRecord, Scan};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Take, Write};
use std::path::Path;

/// Appended bytes are buffered and flushed once this many accumulate.
const TAIL_FLUSH_THRESHOLD: usize = 256 * 1024;

/// Write half of an [`UpdateSession`].
///
/// In-place writes must land entirely inside the file region that existed
/// when the session was opened and must not change a record's byte length;
/// everything new goes through the buffered append path and lands past the
/// original end of file.
pub struct SessionWriter {
    file: File,
    original_len: u64,
    tail: Vec<u8>,
    appended: u64,
}

impl SessionWriter {
    /// Returns the file length at the time the session was opened.
    #[must_use]
    pub fn original_len(&self) -> u64 {
        self.original_len
    }

    /// Overwrites bytes at `position` inside the original file region.
    ///
    /// The caller guarantees the range covers an existing record and does
    /// not cross a line boundary.
    pub fn write_at(&mut self, bytes: &[u8], position: u64) -> StorageResult<()> {
        let end = position.saturating_add(bytes.len() as u64);
        if end > self.original_len {
            return Err(StorageError::WriteOutOfBounds {
                position,
                len: bytes.len(),
                size: self.original_len,
            });
        }
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Buffers bytes for appending to end-of-file.
    ///
    /// The buffer is flushed when it crosses an internal threshold and at
    /// session completion.
    pub fn append(&mut self, bytes: &[u8]) -> StorageResult<()> {
        self.tail.extend_from_slice(bytes);
        if self.tail.len() >= TAIL_FLUSH_THRESHOLD {
            self.flush_tail()?;
        }
        Ok(())
    }

    /// Returns the number of bytes appended so far, flushed or not.
    #[must_use]
    pub fn appended(&self) -> u64 {
        self.appended + self.tail.len() as u64
    }

    fn flush_tail(&mut self) -> StorageResult<()> {
        if self.tail.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&self.tail)?;
        self.appended += self.tail.len() as u64;
        self.tail.clear();
        Ok(())
    }

    /// Flushes the tail buffer and the underlying file.
    pub fn close(self) -> StorageResult<u64> {
        self.finish()
    }

    fn finish(mut self) -> StorageResult<u64> {
        self.flush_tail()?;
        self.file.flush()?;
        Ok(self.original_len + self.appended)
    }
}

/// A forward streaming pass that can overwrite lines in place and append
/// new lines to the tail of the same file.
///
/// The read side is a snapshot of the file as it was at open: appended lines
/// are never observed by the ongoing pass, and positions always refer to the
/// original byte layout.
pub struct UpdateSession {
    stream: LineStream<Take<File>>,
    writer: SessionWriter,
}

impl UpdateSession {
    /// Opens an update session, creating the file if it is missing.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let original_len = file.metadata()?.len();

        // Separate read handle, bounded to the original length so the pass
        // never observes its own appends even after an early tail flush.
        let stream = LineStream::new(File::open(path)?.take(original_len));

        Ok(Self {
            stream,
            writer: SessionWriter {
                file,
                original_len,
                tail: Vec::new(),
                appended: 0,
            },
        })
    }

    /// Runs the pass, delivering each batch together with the write half.
    ///
    /// Returns the final file length after the tail buffer is flushed.
    pub fn run<F>(mut self, mut f: F) -> StorageResult<u64>
    where
        F: FnMut(&mut SessionWriter, &[LineRecord]) -> Scan,
    {
        loop {
            let batch = self.stream.next_batch()?;
            if batch.is_empty() {
                break;
            }
            if f(&mut self.writer, &batch) == Scan::Stop {
                break;
            }
        }
        self.writer.finish()
    }

    /// Consumes the session without streaming, returning the write half.
    ///
    /// Used by passes that only need tail appends (and the append batching
    /// they come with).
    #[must_use]
    pub fn into_writer(self) -> SessionWriter {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_file(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("data.txt");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn in_place_overwrite_preserves_layout() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "aaaa\nbbbb\ncccc\n");

        UpdateSession::open(&path)
            .unwrap()
            .run(|writer, batch| {
                for record in batch {
                    if record.text == "bbbb" {
                        writer.write_at(b"BBBB", record.position).unwrap();
                    }
                }
                Scan::Continue
            })
            .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "aaaa\nBBBB\ncccc\n");
    }

    #[test]
    fn tombstone_single_byte() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "+|a\n+|b\n");

        UpdateSession::open(&path)
            .unwrap()
            .run(|writer, batch| {
                for record in batch {
                    if record.text.ends_with('b') {
                        writer.write_at(b"-", record.position).unwrap();
                    }
                }
                Scan::Continue
            })
            .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "+|a\n-|b\n");
    }

    #[test]
    fn appends_land_past_original_eof() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "one\n");

        let len = UpdateSession::open(&path)
            .unwrap()
            .run(|writer, batch| {
                for _ in batch {
                    writer.append(b"two\n").unwrap();
                }
                Scan::Continue
            })
            .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
        assert_eq!(len, 8);
    }

    #[test]
    fn appended_lines_not_seen_by_ongoing_pass() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a\nb\n");

        let mut seen = 0;
        UpdateSession::open(&path)
            .unwrap()
            .run(|writer, batch| {
                for _ in batch {
                    seen += 1;
                    writer.append(b"extra\n").unwrap();
                }
                Scan::Continue
            })
            .unwrap();

        assert_eq!(seen, 2);
    }

    #[test]
    fn write_past_original_region_rejected() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "abc\n");

        UpdateSession::open(&path)
            .unwrap()
            .run(|writer, _| {
                let err = writer.write_at(b"xxxx", 2).unwrap_err();
                assert!(matches!(err, StorageError::WriteOutOfBounds { .. }));
                Scan::Stop
            })
            .unwrap();
    }

    #[test]
    fn open_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.txt");

        let session = UpdateSession::open(&path).unwrap();
        let mut writer = session.into_writer();
        writer.append(b"first\n").unwrap();
        writer.close().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "first\n");
    }
}
