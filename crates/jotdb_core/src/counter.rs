//! Per-key time-series counter engine.
//!
//! Counters accumulate in RAM and flush into a compact text file, one line
//! per `<kind><year><id>` key:
//!
//! ```text
//! sum2026views=41;0612=30;0613=11
//! mma2026load=2X90;0612=2X85;0613=5X90
//! ```
//!
//! The value right after `=` is the head aggregate; the `MMdd=` buckets
//! break it down by day. A key's head always equals the reduction of its
//! bucket list. `mma` cells hold a `minXmax` pair.

use crate::error::CoreResult;
use crate::events::{DatabaseEvent, EventFeed, EventKind};
use chrono::{Datelike, Utc};
use jotdb_storage::{LineReader, Scan};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counter aggregation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    /// Running sum.
    Sum,
    /// Min/max pair.
    Mma,
}

impl CounterKind {
    const fn token(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mma => "mma",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "sum" => Some(Self::Sum),
            // Legacy files spelled the pair aggregates out.
            "mma" | "min" | "max" => Some(Self::Mma),
            _ => None,
        }
    }
}

/// Which side of an `mma` pair a read extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmaPart {
    /// The minimum.
    Min,
    /// The maximum.
    Max,
    /// The midpoint of the pair.
    Avg,
}

/// Granularity of a counter read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterGroup {
    /// Head aggregates only.
    Head,
    /// One slice per key year.
    Yearly,
    /// One slice per `YYYYMM` bucket group.
    Monthly,
    /// One slice per `YYYYMMDD` bucket.
    Daily,
}

/// A counter read request.
#[derive(Debug, Clone)]
pub struct CounterQuery {
    /// Restrict to these ids; `None` reads all ids and, in head mode,
    /// reduces across them.
    pub ids: Option<Vec<String>>,
    /// Aggregation kind to read.
    pub kind: CounterKind,
    /// For `mma` reads, which side of the pair.
    pub part: MmaPart,
    /// Granularity.
    pub group: CounterGroup,
    /// Restrict to a year.
    pub year: Option<i32>,
    /// Restrict to a month.
    pub month: Option<u32>,
    /// Restrict to a day of month.
    pub day: Option<u32>,
}

impl CounterQuery {
    /// Head-aggregate read of one kind.
    #[must_use]
    pub fn head(kind: CounterKind) -> Self {
        Self {
            ids: None,
            kind,
            part: MmaPart::Max,
            group: CounterGroup::Head,
            year: None,
            month: None,
            day: None,
        }
    }

    /// Restricts the read to one id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids = Some(vec![id.into()]);
        self
    }

    /// Restricts the read to a set of ids.
    #[must_use]
    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Sets the granularity.
    #[must_use]
    pub const fn group(mut self, group: CounterGroup) -> Self {
        self.group = group;
        self
    }

    /// Sets the `mma` extraction part.
    #[must_use]
    pub const fn part(mut self, part: MmaPart) -> Self {
        self.part = part;
        self
    }

    /// Restricts to a year.
    #[must_use]
    pub const fn year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    /// Restricts to a month.
    #[must_use]
    pub const fn month(mut self, month: u32) -> Self {
        self.month = Some(month);
        self
    }

    /// Restricts to a day of month.
    #[must_use]
    pub const fn day(mut self, day: u32) -> Self {
        self.day = Some(day);
        self
    }
}

/// One row of a counter read result.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CounterSlice {
    /// Counter id; `None` for the all-ids reduction.
    pub id: Option<String>,
    /// Key year; `None` when reduced across years.
    pub year: Option<i32>,
    /// Bucket month for monthly and daily slices.
    pub month: Option<u32>,
    /// Bucket day for daily slices.
    pub day: Option<u32>,
    /// Extracted value.
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Sum(i64),
    Mma(i64, i64),
}

impl Aggregate {
    fn render(self) -> String {
        match self {
            Self::Sum(v) => v.to_string(),
            Self::Mma(min, max) => format!("{min}X{max}"),
        }
    }

    fn parse(kind: CounterKind, cell: &str) -> Self {
        match kind {
            CounterKind::Sum => Self::Sum(cell.parse().unwrap_or(0)),
            CounterKind::Mma => match cell.split_once('X') {
                Some((min, max)) => {
                    Self::Mma(min.parse().unwrap_or(0), max.parse().unwrap_or(0))
                }
                None => {
                    let v = cell.parse().unwrap_or(0);
                    Self::Mma(v, v)
                }
            },
        }
    }

    fn merge(self, delta: Delta) -> Self {
        match (self, delta) {
            (Self::Sum(v), Delta::Sum(d)) => Self::Sum(v + d),
            (Self::Mma(min, max), Delta::Mma(lo, hi)) => Self::Mma(
                lo.map_or(min, |lo| min.min(lo)),
                hi.map_or(max, |hi| max.max(hi)),
            ),
            (existing, _) => existing,
        }
    }

    fn extract(self, part: MmaPart) -> f64 {
        match self {
            Self::Sum(v) => v as f64,
            Self::Mma(min, max) => match part {
                MmaPart::Min => min as f64,
                MmaPart::Max => max as f64,
                MmaPart::Avg => (min + max) as f64 / 2.0,
            },
        }
    }

    fn reduce(self, other: Self) -> Self {
        match (self, other) {
            (Self::Sum(a), Self::Sum(b)) => Self::Sum(a + b),
            (Self::Mma(a, b), Self::Mma(c, d)) => Self::Mma(a.min(c), b.max(d)),
            (left, _) => left,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Delta {
    Sum(i64),
    Mma(Option<i64>, Option<i64>),
}

impl Delta {
    fn into_aggregate(self) -> Aggregate {
        match self {
            Self::Sum(d) => Aggregate::Sum(d),
            Self::Mma(lo, hi) => {
                let value = lo.or(hi).unwrap_or(0);
                Aggregate::Mma(lo.unwrap_or(value), hi.unwrap_or(value))
            }
        }
    }

    fn absorb(&mut self, other: Delta) {
        match (self, other) {
            (Self::Sum(a), Self::Sum(b)) => *a += b,
            (Self::Mma(lo, hi), Self::Mma(lo2, hi2)) => {
                *lo = match (*lo, lo2) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                *hi = match (*hi, hi2) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
            _ => {}
        }
    }
}

#[derive(Debug)]
struct CounterLine {
    kind: CounterKind,
    year: i32,
    id: String,
    head: Aggregate,
    buckets: Vec<(String, Aggregate)>,
}

impl CounterLine {
    fn parse(line: &str) -> Option<Self> {
        let (key, rest) = line.split_once('=')?;
        if key.len() < 8 {
            return None;
        }
        let kind = CounterKind::parse(&key[..3])?;
        let year: i32 = key[3..7].parse().ok()?;
        let id = key[7..].to_string();

        let mut cells = rest.split(';');
        let head = Aggregate::parse(kind, cells.next()?);
        let mut buckets = Vec::new();
        for cell in cells {
            if let Some((bucket, value)) = cell.split_once('=') {
                buckets.push((bucket.to_string(), Aggregate::parse(kind, value)));
            }
        }

        Some(Self {
            kind,
            year,
            id,
            head,
            buckets,
        })
    }

    fn render(&self) -> String {
        let mut out = format!(
            "{}{}{}={}",
            self.kind.token(),
            self.year,
            self.id,
            self.head.render()
        );
        for (bucket, value) in &self.buckets {
            out.push(';');
            out.push_str(bucket);
            out.push('=');
            out.push_str(&value.render());
        }
        out
    }

    fn merge(&mut self, delta: Delta, bucket_key: &str) {
        self.head = self.head.merge(delta);
        match self.buckets.iter_mut().find(|(b, _)| b == bucket_key) {
            Some((_, value)) => *value = value.merge(delta),
            None => {
                let aggregate = delta.into_aggregate();
                // Bucket keys stay lexicographically sorted.
                let at = self
                    .buckets
                    .iter()
                    .position(|(b, _)| b.as_str() > bucket_key)
                    .unwrap_or(self.buckets.len());
                self.buckets.insert(at, (bucket_key.to_string(), aggregate));
            }
        }
    }
}

#[derive(Default)]
struct CounterState {
    pending: HashMap<(CounterKind, i32, String), Delta>,
    removed: HashSet<String>,
    dirty_since: Option<Instant>,
}

/// The counter engine of one database.
///
/// Mutations land in a RAM cache and are merged into the counter file by
/// [`Counter::flush`]; the owning database flushes on a debounce interval
/// and at close.
pub struct Counter {
    path: PathBuf,
    state: Mutex<CounterState>,
    flush_after: Duration,
    feed: Arc<EventFeed>,
}

impl Counter {
    pub(crate) fn new(path: &Path, flush_after: Duration, feed: Arc<EventFeed>) -> Self {
        Self {
            path: path.to_path_buf(),
            state: Mutex::new(CounterState::default()),
            flush_after,
            feed,
        }
    }

    fn today() -> (i32, String) {
        let now = Utc::now();
        (now.year(), format!("{:02}{:02}", now.month(), now.day()))
    }

    fn record(&self, kind: CounterKind, id: &str, delta: Delta) {
        let (year, _) = Self::today();
        let mut state = self.state.lock();
        state
            .pending
            .entry((kind, year, id.to_string()))
            .and_modify(|existing| existing.absorb(delta))
            .or_insert(delta);
        state.removed.remove(id);
        if state.dirty_since.is_none() {
            state.dirty_since = Some(Instant::now());
        }
    }

    /// Adds `n` to the running sum of `id`.
    ///
    /// Emits `Hit` for the write and `Sum` for the changed aggregate, the
    /// way `min`/`max` name theirs.
    pub fn hit(&self, id: &str, n: i64) {
        self.record(CounterKind::Sum, id, Delta::Sum(n));
        self.feed.emit(DatabaseEvent::with_payload(
            EventKind::Hit,
            1,
            json!({"id": id, "value": n}),
        ));
        self.feed.emit(DatabaseEvent::with_payload(
            EventKind::Sum,
            1,
            json!({"id": id, "value": n}),
        ));
    }

    /// Records a minimum candidate for `id`.
    pub fn min(&self, id: &str, n: i64) {
        self.record(CounterKind::Mma, id, Delta::Mma(Some(n), None));
        self.feed.emit(DatabaseEvent::with_payload(
            EventKind::Min,
            1,
            json!({"id": id, "value": n}),
        ));
    }

    /// Records a maximum candidate for `id`.
    pub fn max(&self, id: &str, n: i64) {
        self.record(CounterKind::Mma, id, Delta::Mma(None, Some(n)));
        self.feed.emit(DatabaseEvent::with_payload(
            EventKind::Max,
            1,
            json!({"id": id, "value": n}),
        ));
    }

    /// Drops every line of `id` at the next flush.
    pub fn remove(&self, id: &str) {
        let mut state = self.state.lock();
        let id = id.to_string();
        state.pending.retain(|(_, _, key), _| *key != id);
        state.removed.insert(id);
        if state.dirty_since.is_none() {
            state.dirty_since = Some(Instant::now());
        }
    }

    /// Whether the debounce interval has elapsed since the first unflushed
    /// mutation.
    #[must_use]
    pub fn needs_flush(&self) -> bool {
        self.state
            .lock()
            .dirty_since
            .is_some_and(|since| since.elapsed() >= self.flush_after)
    }

    /// Whether any mutations are waiting in RAM.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        !state.pending.is_empty() || !state.removed.is_empty()
    }

    /// Merges pending mutations into the counter file.
    ///
    /// Existing lines stream through untouched unless their key has a
    /// pending delta; new keys are appended; removed ids are dropped. The
    /// file is replaced by rename.
    pub fn flush(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.pending.is_empty() && state.removed.is_empty() {
            state.dirty_since = None;
            return Ok(());
        }

        let pending = std::mem::take(&mut state.pending);
        let removed = std::mem::take(&mut state.removed);
        state.dirty_since = None;

        match self.write_merged(&pending, &removed) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "counter flush complete");
                Ok(())
            }
            Err(e) => {
                // Put the mutations back so nothing is lost.
                state.pending = pending;
                state.removed = removed;
                state.dirty_since = Some(Instant::now());
                Err(e)
            }
        }
    }

    fn write_merged(
        &self,
        pending: &HashMap<(CounterKind, i32, String), Delta>,
        removed: &HashSet<String>,
    ) -> CoreResult<()> {
        let (_, bucket_key) = Self::today();
        let mut unseen: HashMap<_, _> = pending.clone();
        let mut out = String::new();

        LineReader::open(&self.path)?.for_each(|record| {
            if record.text.is_empty() {
                return Scan::Continue;
            }
            match CounterLine::parse(&record.text) {
                Some(mut line) => {
                    if removed.contains(&line.id) {
                        return Scan::Continue;
                    }
                    let key = (line.kind, line.year, line.id.clone());
                    if let Some(delta) = unseen.remove(&key) {
                        line.merge(delta, &bucket_key);
                        out.push_str(&line.render());
                    } else {
                        out.push_str(&record.text);
                    }
                }
                None => out.push_str(&record.text),
            }
            out.push('\n');
            Scan::Continue
        })?;

        // Keys that had no line yet, in deterministic order.
        let mut fresh: Vec<_> = unseen.into_iter().collect();
        fresh.sort_by(|((ka, ya, ia), _), ((kb, yb, ib), _)| {
            (ka.token(), ya, ia).cmp(&(kb.token(), yb, ib))
        });
        for ((kind, year, id), delta) in fresh {
            let line = CounterLine {
                kind,
                year,
                id,
                head: delta.into_aggregate(),
                buckets: vec![(bucket_key.clone(), delta.into_aggregate())],
            };
            out.push_str(&line.render());
            out.push('\n');
        }

        let tmp = {
            let mut p = self.path.clone().into_os_string();
            p.push("-flush");
            PathBuf::from(p)
        };
        std::fs::write(&tmp, out.as_bytes())?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load_lines(&self, query: &CounterQuery) -> CoreResult<Vec<CounterLine>> {
        let mut lines = Vec::new();
        LineReader::open(&self.path).and_then(|reader| {
            reader.for_each(|record| {
                if let Some(line) = CounterLine::parse(&record.text) {
                    if line.kind != query.kind {
                        return Scan::Continue;
                    }
                    if query.year.is_some_and(|y| y != line.year) {
                        return Scan::Continue;
                    }
                    if let Some(ids) = &query.ids {
                        if !ids.iter().any(|id| *id == line.id) {
                            return Scan::Continue;
                        }
                    }
                    lines.push(line);
                }
                Scan::Continue
            })
        })?;
        Ok(lines)
    }

    /// Reads counter values at the requested granularity.
    pub fn read(&self, query: &CounterQuery) -> CoreResult<Vec<CounterSlice>> {
        let lines = self.load_lines(query)?;
        let part = query.part;

        let bucket_selected = |bucket: &str| {
            let month: u32 = bucket.get(..2).and_then(|m| m.parse().ok()).unwrap_or(0);
            let day: u32 = bucket.get(2..4).and_then(|d| d.parse().ok()).unwrap_or(0);
            (query.month.map_or(true, |m| m == month), month, day)
        };

        let mut slices = Vec::new();
        match query.group {
            CounterGroup::Head => {
                if query.ids.is_none() {
                    // All-mode: reduce across every id of the kind.
                    let mut total: Option<Aggregate> = None;
                    for line in &lines {
                        total = Some(match total {
                            Some(t) => t.reduce(line.head),
                            None => line.head,
                        });
                    }
                    if let Some(total) = total {
                        slices.push(CounterSlice {
                            id: None,
                            year: None,
                            month: None,
                            day: None,
                            value: total.extract(part),
                        });
                    }
                } else {
                    // Per-id reduction across years.
                    let mut per_id: Vec<(String, Aggregate)> = Vec::new();
                    for line in &lines {
                        match per_id.iter_mut().find(|(id, _)| *id == line.id) {
                            Some((_, agg)) => *agg = agg.reduce(line.head),
                            None => per_id.push((line.id.clone(), line.head)),
                        }
                    }
                    for (id, agg) in per_id {
                        slices.push(CounterSlice {
                            id: Some(id),
                            year: None,
                            month: None,
                            day: None,
                            value: agg.extract(part),
                        });
                    }
                }
            }
            CounterGroup::Yearly => {
                for line in &lines {
                    slices.push(CounterSlice {
                        id: Some(line.id.clone()),
                        year: Some(line.year),
                        month: None,
                        day: None,
                        value: line.head.extract(part),
                    });
                }
            }
            CounterGroup::Monthly => {
                for line in &lines {
                    let mut months: Vec<(u32, Aggregate)> = Vec::new();
                    for (bucket, value) in &line.buckets {
                        let (selected, month, _) = bucket_selected(bucket);
                        if !selected {
                            continue;
                        }
                        match months.iter_mut().find(|(m, _)| *m == month) {
                            Some((_, agg)) => *agg = agg.reduce(*value),
                            None => months.push((month, *value)),
                        }
                    }
                    for (month, agg) in months {
                        slices.push(CounterSlice {
                            id: Some(line.id.clone()),
                            year: Some(line.year),
                            month: Some(month),
                            day: None,
                            value: agg.extract(part),
                        });
                    }
                }
            }
            CounterGroup::Daily => {
                for line in &lines {
                    for (bucket, value) in &line.buckets {
                        let (selected, month, day) = bucket_selected(bucket);
                        if !selected || query.day.is_some_and(|d| d != day) {
                            continue;
                        }
                        slices.push(CounterSlice {
                            id: Some(line.id.clone()),
                            year: Some(line.year),
                            month: Some(month),
                            day: Some(day),
                            value: value.extract(part),
                        });
                    }
                }
            }
        }

        Ok(slices)
    }

    /// Returns the top `top` ids by aggregate value.
    ///
    /// Uses in-place insertion into a bounded buffer; equal values never
    /// displace earlier arrivals.
    pub fn stats(
        &self,
        top: usize,
        kind: CounterKind,
        part: MmaPart,
        year: Option<i32>,
        month: Option<u32>,
        day: Option<u32>,
    ) -> CoreResult<Vec<(String, f64)>> {
        // stats always scans every id; year filtering happens at load.
        let query = CounterQuery {
            ids: None,
            kind,
            part,
            group: CounterGroup::Head,
            year,
            month,
            day,
        };
        let lines = self.load_lines(&query)?;

        // Aggregate per id before extraction, keyed by bucket when a month
        // or day filter narrows the read.
        let mut per_id: Vec<(String, Aggregate)> = Vec::new();
        for line in &lines {
            let aggregate = if month.is_some() || day.is_some() {
                let mut acc: Option<Aggregate> = None;
                for (bucket, value) in &line.buckets {
                    let bm: u32 = bucket.get(..2).and_then(|m| m.parse().ok()).unwrap_or(0);
                    let bd: u32 = bucket.get(2..4).and_then(|d| d.parse().ok()).unwrap_or(0);
                    if month.map_or(true, |m| m == bm) && day.map_or(true, |d| d == bd) {
                        acc = Some(match acc {
                            Some(a) => a.reduce(*value),
                            None => *value,
                        });
                    }
                }
                match acc {
                    Some(a) => a,
                    None => continue,
                }
            } else {
                line.head
            };

            match per_id.iter_mut().find(|(id, _)| *id == line.id) {
                Some((_, existing)) => *existing = existing.reduce(aggregate),
                None => per_id.push((line.id.clone(), aggregate)),
            }
        }

        let mut ranked: Vec<(String, f64)> = Vec::with_capacity(top + 1);
        for (id, aggregate) in per_id {
            let value = aggregate.extract(part);
            let at = ranked
                .iter()
                .position(|(_, existing)| value > *existing)
                .unwrap_or(ranked.len());
            if at < top {
                ranked.insert(at, (id, value));
                ranked.truncate(top);
            }
        }

        self.feed
            .emit(DatabaseEvent::bare(EventKind::Stats, ranked.len()));
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn counter(dir: &tempfile::TempDir) -> Counter {
        Counter::new(
            &dir.path().join("db.nosql-counter2"),
            Duration::from_secs(30),
            Arc::new(EventFeed::new()),
        )
    }

    #[test]
    fn hits_merge_into_sum_head_and_today_bucket() {
        let dir = tempdir().unwrap();
        let c = counter(&dir);

        c.hit("p", 3);
        c.hit("p", 2);
        c.hit("q", 1);
        c.flush().unwrap();

        let slices = c.read(&CounterQuery::head(CounterKind::Sum).id("p")).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].value, 5.0);

        let daily = c
            .read(&CounterQuery::head(CounterKind::Sum).id("p").group(CounterGroup::Daily))
            .unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].value, 5.0);
        let (year, bucket) = Counter::today();
        assert_eq!(daily[0].year, Some(year));
        assert_eq!(daily[0].month, bucket[..2].parse().ok());
    }

    #[test]
    fn repeated_flushes_accumulate() {
        let dir = tempdir().unwrap();
        let c = counter(&dir);

        c.hit("p", 3);
        c.flush().unwrap();
        c.hit("p", 4);
        c.flush().unwrap();

        let slices = c.read(&CounterQuery::head(CounterKind::Sum).id("p")).unwrap();
        assert_eq!(slices[0].value, 7.0);
    }

    #[test]
    fn untouched_lines_stream_through_unmodified() {
        let dir = tempdir().unwrap();
        let c = counter(&dir);

        c.hit("stable", 10);
        c.flush().unwrap();
        let before = std::fs::read_to_string(dir.path().join("db.nosql-counter2")).unwrap();

        c.hit("other", 1);
        c.flush().unwrap();
        let after = std::fs::read_to_string(dir.path().join("db.nosql-counter2")).unwrap();

        let stable_line = before.lines().find(|l| l.contains("stable")).unwrap();
        assert!(after.lines().any(|l| l == stable_line));
    }

    #[test]
    fn mma_head_tracks_min_and_max() {
        let dir = tempdir().unwrap();
        let c = counter(&dir);

        c.min("load", 5);
        c.max("load", 90);
        c.min("load", 2);
        c.flush().unwrap();

        let read = |part| {
            c.read(&CounterQuery::head(CounterKind::Mma).id("load").part(part))
                .unwrap()[0]
                .value
        };
        assert_eq!(read(MmaPart::Min), 2.0);
        assert_eq!(read(MmaPart::Max), 90.0);
        assert_eq!(read(MmaPart::Avg), 46.0);
    }

    #[test]
    fn remove_drops_lines_at_flush() {
        let dir = tempdir().unwrap();
        let c = counter(&dir);

        c.hit("gone", 5);
        c.hit("kept", 1);
        c.flush().unwrap();

        c.remove("gone");
        c.flush().unwrap();

        assert!(c
            .read(&CounterQuery::head(CounterKind::Sum).id("gone"))
            .unwrap()
            .is_empty());
        assert_eq!(
            c.read(&CounterQuery::head(CounterKind::Sum).id("kept")).unwrap()[0].value,
            1.0
        );
    }

    #[test]
    fn all_mode_reduces_across_ids() {
        let dir = tempdir().unwrap();
        let c = counter(&dir);

        c.hit("a", 3);
        c.hit("b", 4);
        c.flush().unwrap();

        let slices = c.read(&CounterQuery::head(CounterKind::Sum)).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].id, None);
        assert_eq!(slices[0].value, 7.0);
    }

    #[test]
    fn head_equals_bucket_reduction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.nosql-counter2");
        // Hand-written file with several buckets.
        std::fs::write(&path, "sum2026views=41;0612=30;0613=11\n").unwrap();
        let c = Counter::new(&path, Duration::from_secs(30), Arc::new(EventFeed::new()));

        let daily = c
            .read(&CounterQuery::head(CounterKind::Sum).id("views").group(CounterGroup::Daily))
            .unwrap();
        let total: f64 = daily.iter().map(|s| s.value).sum();
        let head = c.read(&CounterQuery::head(CounterKind::Sum).id("views")).unwrap()[0].value;
        assert_eq!(total, head);
    }

    #[test]
    fn monthly_slices_group_by_bucket_month() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.nosql-counter2");
        std::fs::write(&path, "sum2026v=60;0530=10;0612=30;0613=20\n").unwrap();
        let c = Counter::new(&path, Duration::from_secs(30), Arc::new(EventFeed::new()));

        let monthly = c
            .read(&CounterQuery::head(CounterKind::Sum).id("v").group(CounterGroup::Monthly))
            .unwrap();
        assert_eq!(monthly.len(), 2);
        assert_eq!(monthly[0].month, Some(5));
        assert_eq!(monthly[0].value, 10.0);
        assert_eq!(monthly[1].month, Some(6));
        assert_eq!(monthly[1].value, 50.0);
    }

    #[test]
    fn stats_ranks_with_stable_ties() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.nosql-counter2");
        std::fs::write(
            &path,
            "sum2026a=5;0101=5\nsum2026b=9;0101=9\nsum2026c=5;0101=5\nsum2026d=1;0101=1\n",
        )
        .unwrap();
        let c = Counter::new(&path, Duration::from_secs(30), Arc::new(EventFeed::new()));

        let top = c
            .stats(3, CounterKind::Sum, MmaPart::Max, None, None, None)
            .unwrap();
        let ids: Vec<&str> = top.iter().map(|(id, _)| id.as_str()).collect();
        // b first, then a before c: the later equal value does not displace
        // the earlier one.
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn debounce_gates_needs_flush() {
        let dir = tempdir().unwrap();
        let c = Counter::new(
            &dir.path().join("c2"),
            Duration::from_millis(0),
            Arc::new(EventFeed::new()),
        );
        assert!(!c.needs_flush());
        c.hit("x", 1);
        assert!(c.needs_flush());
        c.flush().unwrap();
        assert!(!c.needs_flush());
    }

    #[test]
    fn events_emitted_for_counter_writes() {
        let dir = tempdir().unwrap();
        let feed = Arc::new(EventFeed::new());
        let hits = feed.subscribe_kind(EventKind::Hit);
        let sums = feed.subscribe_kind(EventKind::Sum);
        let mins = feed.subscribe_kind(EventKind::Min);
        let c = Counter::new(&dir.path().join("c2"), Duration::from_secs(30), feed);

        c.hit("p", 2);
        c.min("load", 5);

        assert_eq!(hits.recv().unwrap().payload.unwrap()["id"], "p");
        assert_eq!(sums.recv().unwrap().payload.unwrap()["value"], 2);
        assert_eq!(mins.recv().unwrap().payload.unwrap()["id"], "load");
    }
}
