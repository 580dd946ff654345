//! Per-database operation counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a database's operation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DatabaseStats {
    /// Documents appended.
    pub inserted: u64,
    /// Documents rewritten by update passes.
    pub updated: u64,
    /// Documents tombstoned.
    pub removed: u64,
    /// Live documents evaluated by read passes.
    pub read: u64,
    /// Corrupt lines skipped by passes.
    pub skipped_lines: u64,
    /// Tombstoned lines seen by passes.
    pub tombstones_seen: u64,
    /// Streaming passes run.
    pub passes: u64,
}

/// Live counters, updated by the worker thread.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    inserted: AtomicU64,
    updated: AtomicU64,
    removed: AtomicU64,
    read: AtomicU64,
    skipped_lines: AtomicU64,
    tombstones_seen: AtomicU64,
    passes: AtomicU64,
}

impl StatsCounters {
    pub fn add_inserted(&self, n: u64) {
        self.inserted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_updated(&self, n: u64) {
        self.updated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_removed(&self, n: u64) {
        self.removed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_read(&self, n: u64) {
        self.read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_skipped(&self, n: u64) {
        self.skipped_lines.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tombstones(&self, n: u64) {
        self.tombstones_seen.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DatabaseStats {
        DatabaseStats {
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            read: self.read.load(Ordering::Relaxed),
            skipped_lines: self.skipped_lines.load(Ordering::Relaxed),
            tombstones_seen: self.tombstones_seen.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = StatsCounters::default();
        counters.add_inserted(3);
        counters.add_inserted(2);
        counters.add_skipped(1);
        counters.add_pass();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.inserted, 5);
        assert_eq!(snapshot.skipped_lines, 1);
        assert_eq!(snapshot.passes, 1);
        assert_eq!(snapshot.read, 0);
    }
}
