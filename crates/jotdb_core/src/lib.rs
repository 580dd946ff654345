//! # JotDB Core
//!
//! An embedded, file-backed document database engine.
//!
//! JotDB stores semi-structured records in append-only text files: one
//! JSON object per line for document databases, pipe-delimited rows under
//! a typed schema for tables. Deletes tombstone a line's leading byte,
//! same-length updates rewrite in place, and `clean` compacts. Every
//! database runs one worker thread that serializes its operations and
//! batches concurrent submissions into shared streaming passes.
//!
//! ```rust,ignore
//! use jotdb_core::{Database, Modify, Query};
//! use serde_json::json;
//!
//! let db = Database::open(root, "users")?;
//! db.insert(json!({"id": "A", "n": 1})).wait()?;
//! db.insert(json!({"id": "B", "n": 2})).wait()?;
//!
//! let big = db.find(Query::new().where_("n", ">", 1)).wait()?;
//! db.update(
//!     Query::new().where_("id", "==", "A"),
//!     Modify::Merge(json!({"+n": 10})),
//! )
//! .wait()?;
//! ```
//!
//! ## Crate layout
//!
//! - [`Database`] / [`Table`] - the engine facades
//! - [`Query`] - predicate builder and result options
//! - [`Counter`] - compact per-key time-series accumulator
//! - [`EventFeed`] - typed multi-listener operation events
//! - [`Registry`] - process-scoped name-to-handle map, used by joins

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod counter;
mod database;
mod dir;
mod error;
mod events;
mod meta;
mod query;
mod registry;
mod scheduler;
mod stats;
mod table;

pub use config::Config;
pub use counter::{Counter, CounterGroup, CounterKind, CounterQuery, CounterSlice, MmaPart};
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use events::{DatabaseEvent, EventFeed, EventKind};
pub use query::{
    CompareOp, DatePart, JoinSpec, LikeWhere, Listing, Query, ScalarKind, ScalarResult, SortSpec,
};
pub use registry::Registry;
pub use scheduler::{Modify, Pending};
pub use stats::DatabaseStats;
pub use table::Table;

pub use jotdb_codec::{ColumnType, Schema};
