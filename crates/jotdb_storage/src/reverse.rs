//! Reverse line streaming.

use crate::error::StorageResult;
use crate::record::{LineRecord, Scan};
use std::fs::File;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

/// Default block size for reverse reads.
const DEFAULT_BLOCK: usize = 64 * 1024;

/// Streams a file from EOF to BOF, one LF-terminated line at a time.
///
/// The reader pulls fixed-size blocks from the tail of the file and keeps a
/// rolling carry buffer for the line fragment that crosses the current block
/// boundary. Lines longer than the block size are assembled across blocks.
///
/// Positions reported in [`LineRecord`]s are the same byte offsets a forward
/// pass would report, so reverse readers can drive in-place writes too.
pub struct ReverseLineReader {
    file: Option<File>,
    len: u64,
    block_size: usize,
}

fn make_record(base: u64, bytes: &[u8], from: usize, to: usize) -> StorageResult<LineRecord> {
    let text = String::from_utf8(bytes[from..to].to_vec())
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "line is not valid UTF-8"))?;
    Ok(LineRecord {
        position: base + from as u64,
        length: to - from,
        text,
    })
}

impl ReverseLineReader {
    /// Opens a reverse stream over a file.
    ///
    /// A missing file yields an empty stream.
    pub fn open(path: &Path) -> StorageResult<Self> {
        match File::open(path) {
            Ok(file) => {
                let len = file.metadata()?.len();
                Ok(Self {
                    file: Some(file),
                    len,
                    block_size: DEFAULT_BLOCK,
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self {
                file: None,
                len: 0,
                block_size: DEFAULT_BLOCK,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Sets the block size used for tail reads.
    #[must_use]
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes.max(16);
        self
    }

    /// Drives the stream to completion, delivering batches to `f`.
    ///
    /// Each batch holds the lines of one tail block in reverse file order.
    /// The callback may return [`Scan::Stop`] to terminate early.
    pub fn for_each_batch<F>(self, mut f: F) -> StorageResult<()>
    where
        F: FnMut(&[LineRecord]) -> Scan,
    {
        let Some(mut file) = self.file else {
            return Ok(());
        };

        let mut pos = self.len;
        // Fragment of a line whose start lies before `pos`; holds the bytes
        // at file offsets [pos, pos + carry.len()).
        let mut carry: Vec<u8> = Vec::new();
        let mut pending = false;

        while pos > 0 {
            let start = pos.saturating_sub(self.block_size as u64);
            let block_len = (pos - start) as usize;

            let mut combined = vec![0u8; block_len];
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut combined)?;
            combined.extend_from_slice(&carry);

            let newlines: Vec<usize> = combined
                .iter()
                .enumerate()
                .filter_map(|(i, b)| (*b == b'\n').then_some(i))
                .collect();

            let mut batch = Vec::new();

            match newlines.first().copied() {
                None => {
                    if start == 0 {
                        batch.push(make_record(start, &combined, 0, combined.len())?);
                        pending = false;
                        carry.clear();
                    } else {
                        carry = combined;
                        pending = true;
                        pos = start;
                        continue;
                    }
                }
                Some(first_nl) => {
                    // Trailing segment: complete whenever a fragment was
                    // pending, or when the file lacks a final newline.
                    let last_nl = *newlines.last().unwrap_or(&first_nl);
                    if pending || last_nl + 1 < combined.len() {
                        batch.push(make_record(start, &combined, last_nl + 1, combined.len())?);
                    }
                    // Interior segments, last to first.
                    for pair in newlines.windows(2).rev() {
                        batch.push(make_record(start, &combined, pair[0] + 1, pair[1])?);
                    }
                    if start == 0 {
                        batch.push(make_record(start, &combined, 0, first_nl)?);
                        pending = false;
                        carry.clear();
                    } else {
                        carry = combined[..first_nl].to_vec();
                        pending = true;
                    }
                }
            }

            pos = start;

            if !batch.is_empty() && f(&batch) == Scan::Stop {
                return Ok(());
            }
        }

        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("data.txt");
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    fn collect(path: &Path, block: usize) -> Vec<LineRecord> {
        let mut out = Vec::new();
        ReverseLineReader::open(path)
            .unwrap()
            .with_block_size(block)
            .for_each(|r| {
                out.push(r.clone());
                Scan::Continue
            })
            .unwrap();
        out
    }

    #[test]
    fn reverse_order_with_positions() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "alpha\nbeta\ngamma\n");

        let lines = collect(&path, DEFAULT_BLOCK);
        let texts: Vec<&str> = lines.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["gamma", "beta", "alpha"]);
        assert_eq!(lines[0].position, 11);
        assert_eq!(lines[1].position, 6);
        assert_eq!(lines[2].position, 0);
    }

    #[test]
    fn positions_match_forward_pass() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "one\ntwo\nthree\nfour\n");

        let mut forward = Vec::new();
        crate::LineReader::open(&path)
            .unwrap()
            .for_each(|r| {
                forward.push(r.clone());
                Scan::Continue
            })
            .unwrap();

        let mut reverse = collect(&path, 8);
        reverse.reverse();
        assert_eq!(forward, reverse);
    }

    #[test]
    fn line_longer_than_block() {
        let dir = tempdir().unwrap();
        let long = "x".repeat(200);
        let path = write_file(&dir, &format!("short\n{long}\ntail\n"));

        let lines = collect(&path, 32);
        let texts: Vec<&str> = lines.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["tail", long.as_str(), "short"]);
        assert_eq!(lines[1].position, 6);
    }

    #[test]
    fn missing_trailing_newline() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a\nb");

        let lines = collect(&path, DEFAULT_BLOCK);
        let texts: Vec<&str> = lines.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "a"]);
    }

    #[test]
    fn empty_interior_line_preserved() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a\n\nb\n");

        let lines = collect(&path, DEFAULT_BLOCK);
        let texts: Vec<&str> = lines.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "", "a"]);
    }

    #[test]
    fn tiny_blocks_cross_boundaries() {
        let dir = tempdir().unwrap();
        let expected: Vec<String> = (0..12).map(|i| format!("line-{i:04}")).collect();
        let path = write_file(&dir, &(expected.join("\n") + "\n"));

        for block in [16, 17, 19, 23, 64] {
            let mut lines: Vec<String> =
                collect(&path, block).into_iter().map(|r| r.text).collect();
            lines.reverse();
            assert_eq!(lines, expected, "block={block}");
        }
    }

    #[test]
    fn missing_file_is_empty_stream() {
        let dir = tempdir().unwrap();
        let lines = collect(&dir.path().join("nope.txt"), DEFAULT_BLOCK);
        assert!(lines.is_empty());
    }

    #[test]
    fn stop_sentinel_terminates_early() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a\nb\nc\n");

        let mut seen = 0;
        ReverseLineReader::open(&path)
            .unwrap()
            .for_each(|_| {
                seen += 1;
                Scan::Stop
            })
            .unwrap();
        assert_eq!(seen, 1);
    }
}
