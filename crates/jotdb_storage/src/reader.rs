//! Forward line streaming.

use crate::error::StorageResult;
use crate::record::{LineRecord, Scan};
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::Path;

/// Default number of lines delivered per batch callback.
pub const DEFAULT_BATCH: usize = 64;

/// Streams a byte source forward, one LF-terminated line at a time.
///
/// Lines are delivered in batches together with their byte offsets into the
/// source, so callers can later overwrite a line in place. The final line is
/// delivered even when the source does not end with a newline.
///
/// A `LineStream` over a missing file is empty rather than an error; readers
/// surviving a missing file see a zero-batch stream.
pub struct LineStream<R> {
    inner: Option<BufReader<R>>,
    position: u64,
    batch_size: usize,
}

impl<R: Read> LineStream<R> {
    /// Creates a stream over an external byte source.
    pub fn new(source: R) -> Self {
        Self {
            inner: Some(BufReader::new(source)),
            position: 0,
            batch_size: DEFAULT_BATCH,
        }
    }

    /// Creates an empty stream.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: None,
            position: 0,
            batch_size: DEFAULT_BATCH,
        }
    }

    /// Sets the number of lines per batch.
    #[must_use]
    pub fn with_batch_size(mut self, lines: usize) -> Self {
        self.batch_size = lines.max(1);
        self
    }

    /// Reads the next batch of lines.
    ///
    /// Returns an empty vector at end of stream.
    pub fn next_batch(&mut self) -> StorageResult<Vec<LineRecord>> {
        let Some(reader) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::with_capacity(self.batch_size);
        let mut buf = String::new();

        while batch.len() < self.batch_size {
            buf.clear();
            let read = reader.read_line(&mut buf)?;
            if read == 0 {
                self.inner = None;
                break;
            }

            let position = self.position;
            self.position += read as u64;

            let mut text = std::mem::take(&mut buf);
            if text.ends_with('\n') {
                text.pop();
            }

            batch.push(LineRecord {
                position,
                length: text.len(),
                text,
            });
        }

        Ok(batch)
    }

    /// Drives the stream to completion, delivering batches to `f`.
    ///
    /// The callback may return [`Scan::Stop`] to terminate early.
    pub fn for_each_batch<F>(mut self, mut f: F) -> StorageResult<()>
    where
        F: FnMut(&[LineRecord]) -> Scan,
    {
        loop {
            let batch = self.next_batch()?;
            if batch.is_empty() {
                return Ok(());
            }
            if f(&batch) == Scan::Stop {
                return Ok(());
            }
        }
    }

    /// Drives the stream to completion, delivering lines one at a time.
    pub fn for_each<F>(self, mut f: F) -> StorageResult<()>
    where
        F: FnMut(&LineRecord) -> Scan,
    {
        self.for_each_batch(|batch| {
            for record in batch {
                if f(record) == Scan::Stop {
                    return Scan::Stop;
                }
            }
            Scan::Continue
        })
    }
}

impl LineStream<File> {
    /// Opens a forward stream over a file.
    ///
    /// A missing file yields an empty stream.
    pub fn open(path: &Path) -> StorageResult<Self> {
        match File::open(path) {
            Ok(file) => Ok(Self::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::empty()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Forward line streaming over a file.
pub type LineReader = LineStream<File>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    fn collect(path: &Path) -> Vec<LineRecord> {
        let mut out = Vec::new();
        LineReader::open(path)
            .unwrap()
            .for_each(|r| {
                out.push(r.clone());
                Scan::Continue
            })
            .unwrap();
        out
    }

    #[test]
    fn forward_lines_with_positions() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "data.txt", "alpha\nbeta\ngamma\n");

        let lines = collect(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].text, "alpha");
        assert_eq!(lines[0].position, 0);
        assert_eq!(lines[0].length, 5);
        assert_eq!(lines[1].position, 6);
        assert_eq!(lines[2].position, 11);
    }

    #[test]
    fn final_line_without_newline() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "data.txt", "one\ntwo");

        let lines = collect(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].text, "two");
        assert_eq!(lines[1].position, 4);
    }

    #[test]
    fn missing_file_is_empty_stream() {
        let dir = tempdir().unwrap();
        let lines = collect(&dir.path().join("nope.txt"));
        assert!(lines.is_empty());
    }

    #[test]
    fn stop_sentinel_terminates_early() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "data.txt", "a\nb\nc\n");

        let mut seen = 0;
        LineReader::open(&path)
            .unwrap()
            .for_each(|_| {
                seen += 1;
                Scan::Stop
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn external_source_stream() {
        let source = std::io::Cursor::new(b"x\ny\n".to_vec());
        let mut out = Vec::new();
        LineStream::new(source)
            .for_each(|r| {
                out.push(r.text.clone());
                Scan::Continue
            })
            .unwrap();
        assert_eq!(out, vec!["x", "y"]);
    }

    #[test]
    fn batches_respect_configured_size() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "data.txt", "1\n2\n3\n4\n5\n");

        let mut sizes = Vec::new();
        LineReader::open(&path)
            .unwrap()
            .with_batch_size(2)
            .for_each_batch(|batch| {
                sizes.push(batch.len());
                Scan::Continue
            })
            .unwrap();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
