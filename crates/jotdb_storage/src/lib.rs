//! # JotDB Storage
//!
//! Line-oriented streaming file engine for JotDB.
//!
//! This crate provides the lowest-level I/O layer of the database. It knows
//! nothing about documents, schemas, or queries - it streams whole lines with
//! byte positions and performs the two kinds of writes the engine needs:
//! exact-length in-place overwrites and buffered tail appends.
//!
//! ## Components
//!
//! - [`LineReader`] / [`LineStream`] - forward streaming, also over external
//!   byte sources
//! - [`ReverseLineReader`] - EOF-to-BOF streaming with a rolling carry buffer
//! - [`UpdateSession`] - forward streaming plus in-place and appended writes
//! - [`append_file`] - one-shot batched appends
//!
//! ## Invariants
//!
//! - Line boundary is LF; lines are UTF-8
//! - Positions are byte offsets into the file as it was when the pass opened
//! - In-place writes never change a record's byte length; appended writes
//!   land past the original end of file
//! - A missing file reads as an empty stream

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod append;
mod error;
mod reader;
mod record;
mod reverse;
mod update;

pub use append::append_file;
pub use error::{StorageError, StorageResult};
pub use reader::{LineReader, LineStream, DEFAULT_BATCH};
pub use record::{LineRecord, Scan};
pub use reverse::ReverseLineReader;
pub use update::{SessionWriter, UpdateSession};
