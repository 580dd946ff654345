//! Database facade and the passes behind it.
//!
//! A [`Database`] owns the data file, its sidecars, and one worker thread
//! that drains the pending queues (see [`crate::scheduler`]). User calls
//! enqueue a job and return a [`Pending`] completion handle; the worker
//! performs one streaming pass per drained batch.

use crate::config::Config;
use crate::counter::Counter;
use crate::dir::{DatabaseDir, DirKind};
use crate::error::{CoreError, CoreResult};
use crate::events::{DatabaseEvent, EventFeed, EventKind};
use crate::meta::Meta;
use crate::query::{
    compile, fingerprint, CompiledQuery, Listing, Query, ScalarKind, ScalarResult, SortSpec,
};
use crate::scheduler::{
    completion, resolved, AppendJob, ExclusiveJob, Modify, Pending, Phase, Queues, ReadDone,
    ReadJob, RemoveJob, StreamJob, UpdateJob,
};
use crate::stats::{DatabaseStats, StatsCounters};
use chrono::Utc;
use jotdb_codec::{decode_document, decode_row, encode_document, encode_row, Schema};
use jotdb_storage::{
    append_file, LineReader, LineRecord, LineStream, ReverseLineReader, Scan, SessionWriter,
    UpdateSession,
};
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

enum Flavor {
    Document,
    Table(RwLock<Option<Schema>>),
}

pub(crate) struct Inner {
    dir: DatabaseDir,
    config: Config,
    flavor: Flavor,
    queues: Mutex<Queues>,
    work_ready: Condvar,
    closed: AtomicBool,
    feed: Arc<EventFeed>,
    counter: Counter,
    meta: Mutex<Meta>,
    cache: Mutex<HashMap<String, Arc<CompiledQuery>>>,
    stats: StatsCounters,
}

/// An embedded, file-backed document database.
///
/// Open one with [`Database::open`]; submit operations and wait on the
/// returned [`Pending`] handles:
///
/// ```rust,ignore
/// let db = Database::open(root, "users")?;
/// db.insert(json!({"id": "A", "n": 1})).wait()?;
/// let found = db.find(Query::new().where_("n", ">", 0)).wait()?;
/// ```
///
/// All operations against one database are serialized by its worker
/// thread; concurrent submissions of the same kind share a single
/// streaming pass over the data file.
pub struct Database {
    inner: Arc<Inner>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Database {
    /// Opens a document database under `root`, creating files on first
    /// write.
    pub fn open(root: &Path, name: &str) -> CoreResult<Self> {
        Self::open_with_config(root, name, Config::default())
    }

    /// Opens a document database with custom configuration.
    pub fn open_with_config(root: &Path, name: &str, config: Config) -> CoreResult<Self> {
        Self::open_kind(root, name, config, DirKind::Document)
    }

    pub(crate) fn open_kind(
        root: &Path,
        name: &str,
        config: Config,
        kind: DirKind,
    ) -> CoreResult<Self> {
        let dir = DatabaseDir::open(root, name, kind)?;
        let meta = Meta::load(&dir.meta_path())?;
        let feed = Arc::new(EventFeed::new());
        let counter = Counter::new(&dir.counter_path(), config.counter_flush, Arc::clone(&feed));

        let flavor = match kind {
            DirKind::Document => Flavor::Document,
            DirKind::Table => {
                let schema = Self::load_schema(&dir, &config)?;
                Flavor::Table(RwLock::new(schema))
            }
        };

        let inner = Arc::new(Inner {
            dir,
            config,
            flavor,
            queues: Mutex::new(Queues::default()),
            work_ready: Condvar::new(),
            closed: AtomicBool::new(false),
            feed,
            counter,
            meta: Mutex::new(meta),
            cache: Mutex::new(HashMap::new()),
            stats: StatsCounters::default(),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name(format!("jotdb-{name}"))
            .spawn(move || worker_inner.worker_loop())?;

        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    /// Reads the persisted schema header, falling back to the configured
    /// definition.
    fn load_schema(dir: &DatabaseDir, config: &Config) -> CoreResult<Option<Schema>> {
        let mut header = None;
        LineReader::open(&dir.data_path())?.for_each(|record| {
            header = Some(record.text.clone());
            Scan::Stop
        })?;

        match header {
            Some(line) if !line.is_empty() => Ok(Some(Schema::parse(&line)?)),
            _ => match &config.schema {
                Some(definition) => Ok(Some(Schema::parse(definition)?)),
                None => Ok(None),
            },
        }
    }

    // ------------------------------------------------------------------
    // Write operations
    // ------------------------------------------------------------------

    /// Appends a document.
    pub fn insert(&self, doc: Value) -> Pending<usize> {
        if let Err(e) = self.inner.ensure_writable() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.inner.submit(|q| q.append.push(AppendJob { doc, done }));
        pending
    }

    /// Updates every document matching `query`.
    pub fn update(&self, query: Query, modify: Modify) -> Pending<usize> {
        self.update_job(query, modify, None)
    }

    /// Updates matching documents, inserting `fallback` when nothing
    /// matched.
    pub fn upsert(&self, query: Query, modify: Modify, fallback: Value) -> Pending<usize> {
        self.update_job(query, modify, Some(fallback))
    }

    fn update_job(
        &self,
        query: Query,
        modify: Modify,
        insert_fallback: Option<Value>,
    ) -> Pending<usize> {
        if let Err(e) = self.inner.ensure_writable() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.inner.submit(|q| {
            q.update.push(UpdateJob {
                query,
                modify,
                insert_fallback,
                done,
            });
        });
        pending
    }

    /// Tombstones every document matching `query`.
    pub fn remove(&self, query: Query) -> Pending<usize> {
        if let Err(e) = self.inner.ensure_writable() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.inner.submit(|q| q.remove.push(RemoveJob { query, done }));
        pending
    }

    // ------------------------------------------------------------------
    // Read operations
    // ------------------------------------------------------------------

    fn read_job(&self, query: Query, done: ReadDone, reverse: bool) {
        self.inner.submit(|q| {
            let job = ReadJob { query, done };
            if reverse {
                q.read_reverse.push(job);
            } else {
                q.read.push(job);
            }
        });
    }

    /// Returns every matching document, oldest first.
    pub fn find(&self, query: Query) -> Pending<Vec<Value>> {
        if let Err(e) = self.inner.ensure_open() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.read_job(query, ReadDone::Documents(done), false);
        pending
    }

    /// Returns every matching document, newest first.
    pub fn find_reverse(&self, query: Query) -> Pending<Vec<Value>> {
        if let Err(e) = self.inner.ensure_open() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.read_job(query, ReadDone::Documents(done), true);
        pending
    }

    /// Returns the first matching document, stopping the scan at the
    /// match.
    pub fn one(&self, query: Query) -> Pending<Option<Value>> {
        if let Err(e) = self.inner.ensure_open() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.read_job(query.first(), ReadDone::First(done), false);
        pending
    }

    /// Returns the last-written matching document.
    pub fn one_reverse(&self, query: Query) -> Pending<Option<Value>> {
        if let Err(e) = self.inner.ensure_open() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.read_job(query.first(), ReadDone::First(done), true);
        pending
    }

    /// Counts matching documents.
    pub fn count(&self, query: Query) -> Pending<usize> {
        if let Err(e) = self.inner.ensure_open() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.read_job(query, ReadDone::Count(done), false);
        pending
    }

    /// Runs a scalar reduction over matching documents.
    pub fn scalar(&self, query: Query, kind: ScalarKind, field: Option<&str>) -> Pending<ScalarResult> {
        if let Err(e) = self.inner.ensure_open() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.read_job(query.scalar(kind, field), ReadDone::Scalar(done), false);
        pending
    }

    /// Returns a paginated page of matching documents.
    pub fn listing(&self, query: Query) -> Pending<Listing> {
        if let Err(e) = self.inner.ensure_open() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.read_job(query.listing(), ReadDone::Listing(done), false);
        pending
    }

    /// Evaluates a query against an external byte source with the data
    /// file's line format.
    pub fn stream(&self, query: Query, source: Box<dyn Read + Send>) -> Pending<Vec<Value>> {
        if let Err(e) = self.inner.ensure_open() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.inner.submit(|q| {
            q.stream.push(StreamJob {
                query,
                source,
                done,
            });
        });
        pending
    }

    /// Runs `query` and resolves its joins against sibling databases from
    /// `registry`. Blocks until both passes complete.
    pub fn find_joined(
        &self,
        query: Query,
        registry: &crate::registry::Registry,
    ) -> CoreResult<Vec<Value>> {
        let joins = query.joins.clone();
        let mut docs = self.find(query).wait()?;

        for spec in &joins {
            let sibling = registry.database(&spec.database)?;
            let keys: Vec<Value> = docs
                .iter()
                .filter_map(|doc| doc.get(&spec.local).cloned())
                .filter(|v| !v.is_null())
                .collect();
            let foreign = sibling
                .find(Query::new().in_(&spec.foreign, keys))
                .wait()?;

            for doc in &mut docs {
                let key = doc.get(&spec.local).cloned().unwrap_or(Value::Null);
                let matched: Vec<Value> = if key.is_null() {
                    Vec::new()
                } else {
                    foreign
                        .iter()
                        .filter(|f| {
                            f.get(&spec.foreign)
                                .is_some_and(|v| crate::query::value_eq(v, &key))
                        })
                        .cloned()
                        .collect()
                };

                let joined = if let Some((kind, field)) = &spec.scalar {
                    scalar_of(&matched, *kind, field.as_deref())
                } else if spec.first {
                    matched.into_iter().next().unwrap_or(Value::Null)
                } else {
                    Value::Array(matched)
                };

                if let Some(fields) = doc.as_object_mut() {
                    fields.insert(spec.field.clone(), joined);
                }
            }
        }

        Ok(docs)
    }

    // ------------------------------------------------------------------
    // Exclusive operations
    // ------------------------------------------------------------------

    fn exclusive(&self, job_of: impl FnOnce(crate::scheduler::Completion<usize>) -> ExclusiveJob) -> Pending<usize> {
        if let Err(e) = self.inner.ensure_writable() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        let job = job_of(done);
        self.inner.submit(|q| q.exclusive.push(job));
        pending
    }

    /// Deletes the data file; tables re-emit their schema header.
    pub fn clear(&self) -> Pending<usize> {
        self.exclusive(ExclusiveJob::Clear)
    }

    /// Rewrites the data file without tombstoned lines. The only
    /// compaction path.
    pub fn clean(&self) -> Pending<usize> {
        self.exclusive(ExclusiveJob::Clean)
    }

    /// Deletes the database's files and closes it.
    pub fn drop_database(&self) -> Pending<usize> {
        self.exclusive(ExclusiveJob::Drop)
    }

    /// Copies the data file to `target`. Resolves to the copied byte
    /// count.
    pub fn backup(&self, target: &Path) -> Pending<u64> {
        if let Err(e) = self.inner.ensure_open() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        let target = target.to_path_buf();
        self.inner
            .submit(|q| q.exclusive.push(ExclusiveJob::Backup(target, done)));
        pending
    }

    /// Replaces the data file from `source`.
    pub fn restore(&self, source: &Path) -> Pending<usize> {
        if let Err(e) = self.inner.ensure_writable() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        let source = source.to_path_buf();
        self.inner
            .submit(|q| q.exclusive.push(ExclusiveJob::Restore(source, done)));
        pending
    }

    /// Runs `f` with the scheduler halted; no other operation overlaps it.
    pub fn lock<F>(&self, f: F) -> Pending<usize>
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(e) = self.inner.ensure_open() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.inner
            .submit(|q| q.exclusive.push(ExclusiveJob::Lock(Box::new(f), done)));
        pending
    }

    pub(crate) fn extend_schema(&self, schema: Schema) -> Pending<usize> {
        if let Err(e) = self.inner.ensure_writable() {
            return resolved(Err(e));
        }
        let (done, pending) = completion();
        self.inner
            .submit(|q| q.exclusive.push(ExclusiveJob::Extend(schema, done)));
        pending
    }

    // ------------------------------------------------------------------
    // Sidecars and introspection
    // ------------------------------------------------------------------

    /// The counter engine of this database.
    #[must_use]
    pub fn counter(&self) -> &Counter {
        &self.inner.counter
    }

    /// The event feed of this database.
    #[must_use]
    pub fn events(&self) -> &EventFeed {
        &self.inner.feed
    }

    /// Reads a metadata value.
    #[must_use]
    pub fn meta_get(&self, key: &str) -> Option<Value> {
        self.inner.meta.lock().get(key).cloned()
    }

    /// Writes a metadata value; flushed on the next idle tick and at
    /// close.
    pub fn meta_set(&self, key: impl Into<String>, value: Value) {
        self.inner.meta.lock().set(key, value);
    }

    /// Operation counters.
    #[must_use]
    pub fn stats(&self) -> DatabaseStats {
        self.inner.stats.snapshot()
    }

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.dir.name()
    }

    /// Whether the database has been dropped or closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn schema(&self) -> Option<Schema> {
        match &self.inner.flavor {
            Flavor::Document => None,
            Flavor::Table(schema) => schema.read().clone(),
        }
    }

    /// Flushes sidecars and stops the worker. Queued operations complete
    /// first.
    pub fn close(mut self) -> CoreResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> CoreResult<()> {
        {
            let mut queues = self.inner.queues.lock();
            queues.shutdown = true;
            self.inner.work_ready.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if !self.is_closed() {
            self.inner.counter.flush()?;
            self.inner.meta.lock().flush()?;
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn now_stamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M").to_string()
}

/// Scalar reduction over already-collected documents, used by joins.
fn scalar_of(docs: &[Value], kind: ScalarKind, field: Option<&str>) -> Value {
    let mut acc = ScalarAcc::new(kind, field.map(str::to_string));
    for doc in docs {
        acc.push(doc);
    }
    match acc.finish(docs.len()) {
        ScalarResult::Count(n) => Value::from(n),
        ScalarResult::Sum(v) => Value::from(v),
        ScalarResult::Min(v) | ScalarResult::Max(v) => v.unwrap_or(Value::Null),
        ScalarResult::Avg(v) => v.map(Value::from).unwrap_or(Value::Null),
        ScalarResult::Group(map) => {
            let mut out = Map::new();
            for (key, count) in map {
                out.insert(key, Value::from(count));
            }
            Value::Object(out)
        }
    }
}

/// Streaming scalar accumulator.
struct ScalarAcc {
    kind: ScalarKind,
    field: Option<String>,
    sum: f64,
    numeric: usize,
    min: Option<Value>,
    max: Option<Value>,
    group: BTreeMap<String, usize>,
}

impl ScalarAcc {
    fn new(kind: ScalarKind, field: Option<String>) -> Self {
        Self {
            kind,
            field,
            sum: 0.0,
            numeric: 0,
            min: None,
            max: None,
            group: BTreeMap::new(),
        }
    }

    fn push(&mut self, doc: &Value) {
        let Some(field) = &self.field else { return };
        let Some(value) = doc.get(field) else { return };

        match self.kind {
            ScalarKind::Count => {}
            ScalarKind::Sum | ScalarKind::Avg => {
                if let Some(n) = value.as_f64() {
                    self.sum += n;
                    self.numeric += 1;
                }
            }
            ScalarKind::Min => {
                let replace = match &self.min {
                    Some(current) => {
                        crate::query::value_cmp(value, current) == Some(CmpOrdering::Less)
                    }
                    None => true,
                };
                if replace {
                    self.min = Some(value.clone());
                }
            }
            ScalarKind::Max => {
                let replace = match &self.max {
                    Some(current) => {
                        crate::query::value_cmp(value, current) == Some(CmpOrdering::Greater)
                    }
                    None => true,
                };
                if replace {
                    self.max = Some(value.clone());
                }
            }
            ScalarKind::Group => {
                let key = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                *self.group.entry(key).or_insert(0) += 1;
            }
        }
    }

    fn finish(self, count: usize) -> ScalarResult {
        match self.kind {
            ScalarKind::Count => ScalarResult::Count(count),
            ScalarKind::Sum => ScalarResult::Sum(self.sum),
            ScalarKind::Min => ScalarResult::Min(self.min),
            ScalarKind::Max => ScalarResult::Max(self.max),
            ScalarKind::Avg => ScalarResult::Avg(if self.numeric > 0 {
                Some(self.sum / self.numeric as f64)
            } else {
                None
            }),
            ScalarKind::Group => ScalarResult::Group(self.group),
        }
    }
}

/// Per-reader state inside one streaming pass.
struct Reader {
    compiled: Arc<CompiledQuery>,
    take: Option<usize>,
    skip: usize,
    first: bool,
    sort: Option<SortSpec>,
    listing: bool,
    empty_error: Option<String>,
    scalar: Option<ScalarAcc>,
    done: Option<ReadDone>,
    docs: Vec<Value>,
    count: usize,
    satisfied: bool,
}

impl Reader {
    fn build(inner: &Inner, job: ReadJob) -> Result<Self, ()> {
        let mut query = job.query;
        query.seal();
        let compiled = match inner.compile_cached(&query) {
            Ok(compiled) => compiled,
            Err(e) => {
                job.done.fail(e);
                return Err(());
            }
        };
        let scalar = query
            .scalar
            .as_ref()
            .map(|(kind, field)| ScalarAcc::new(*kind, field.clone()));

        Ok(Self {
            compiled,
            take: query.take,
            skip: query.skip,
            first: query.first,
            sort: query.sort.clone(),
            listing: query.listing,
            empty_error: query.empty_error.clone(),
            scalar,
            done: Some(job.done),
            docs: Vec::new(),
            count: 0,
            satisfied: false,
        })
    }

    fn inline_sort(&self) -> Option<(&str, bool)> {
        if self.take.is_none() {
            return None;
        }
        match &self.sort {
            Some(SortSpec::Field { name, asc }) => Some((name, *asc)),
            _ => None,
        }
    }

    fn process(&mut self, doc: &Value) {
        if self.satisfied || !self.compiled.matches(doc) {
            return;
        }
        self.count += 1;

        if let Some(acc) = &mut self.scalar {
            acc.push(doc);
            return;
        }

        let projected = self.compiled.project(doc);

        if self.first {
            self.docs = vec![projected];
            self.satisfied = true;
            return;
        }

        let inline = self.inline_sort().map(|(field, asc)| (field.to_string(), asc));
        if let Some((field, asc)) = inline {
            let cap = self.skip + self.take.unwrap_or(0);
            insert_sorted(&mut self.docs, projected, &field, asc, cap);
            return;
        }

        // Unsorted reads with a page bound stop collecting once the page
        // is full; matches keep counting for listings.
        if self.sort.is_none() && !self.listing {
            if let Some(take) = self.take {
                if self.docs.len() >= self.skip + take {
                    return;
                }
            }
        }
        self.docs.push(projected);
    }

    fn finalize(mut self) {
        let Some(done) = self.done.take() else { return };
        let count = self.count;

        if let Some(acc) = self.scalar.take() {
            let result = acc.finish(count);
            match done {
                ReadDone::Scalar(done) => done.done(Ok(result)),
                ReadDone::Count(done) => done.done(Ok(count)),
                other => other.fail(CoreError::invalid_operation("scalar reply mismatch")),
            }
            return;
        }

        let mut docs = std::mem::take(&mut self.docs);

        match &self.sort {
            Some(SortSpec::Field { name, asc }) => {
                if self.inline_sort().is_none() {
                    sort_docs(&mut docs, name, *asc);
                }
            }
            Some(SortSpec::Random) => {
                use rand::seq::SliceRandom;
                docs.shuffle(&mut rand::thread_rng());
            }
            Some(SortSpec::Custom(cmp)) => {
                docs.sort_by(|a, b| cmp(a, b));
            }
            None => {}
        }

        if self.skip > 0 {
            docs.drain(..self.skip.min(docs.len()));
        }
        if let Some(take) = self.take {
            docs.truncate(take);
        }

        if let Some(message) = &self.empty_error {
            if docs.is_empty() {
                done.fail(CoreError::empty_result(message.clone()));
                return;
            }
        }

        match done {
            ReadDone::Documents(done) => done.done(Ok(docs)),
            ReadDone::First(done) => done.done(Ok(docs.into_iter().next())),
            ReadDone::Count(done) => done.done(Ok(count)),
            ReadDone::Listing(done) => {
                let limit = self.take.unwrap_or_else(|| count.max(1));
                let limit = limit.max(1);
                let page = self.skip / limit + 1;
                let pages = count.div_ceil(limit);
                done.done(Ok(Listing {
                    page,
                    pages,
                    limit,
                    count,
                    items: docs,
                }));
            }
            ReadDone::Scalar(done) => {
                done.done(Ok(ScalarResult::Count(count)));
            }
        }
    }

    fn fail(mut self, err: CoreError) {
        if let Some(done) = self.done.take() {
            done.fail(err);
        }
    }
}

fn sort_key<'d>(doc: &'d Value, field: &str) -> Option<&'d Value> {
    doc.as_object().and_then(|fields| fields.get(field))
}

fn compare_by_field(a: &Value, b: &Value, field: &str, asc: bool) -> CmpOrdering {
    let ordering = match (sort_key(a, field), sort_key(b, field)) {
        (Some(x), Some(y)) => crate::query::value_cmp(x, y).unwrap_or(CmpOrdering::Equal),
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    };
    if asc {
        ordering
    } else {
        ordering.reverse()
    }
}

fn sort_docs(docs: &mut [Value], field: &str, asc: bool) {
    docs.sort_by(|a, b| compare_by_field(a, b, field, asc));
}

/// Insert into a buffer kept sorted by `field`, bounded to `cap` entries.
fn insert_sorted(docs: &mut Vec<Value>, doc: Value, field: &str, asc: bool, cap: usize) {
    let at = docs
        .iter()
        .position(|existing| compare_by_field(&doc, existing, field, asc) == CmpOrdering::Less)
        .unwrap_or(docs.len());
    if at >= cap {
        return;
    }
    docs.insert(at, doc);
    docs.truncate(cap);
}

impl Inner {
    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.config.read_only {
            Err(CoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn submit(&self, f: impl FnOnce(&mut Queues)) {
        let mut queues = self.queues.lock();
        f(&mut queues);
        self.work_ready.notify_one();
    }

    fn is_table(&self) -> bool {
        matches!(self.flavor, Flavor::Table(_))
    }

    fn table_schema(&self) -> CoreResult<Schema> {
        match &self.flavor {
            Flavor::Document => Err(CoreError::invalid_operation("not a table")),
            Flavor::Table(schema) => schema.read().clone().ok_or(CoreError::SchemaMissing),
        }
    }

    fn is_live(&self, line: &str) -> bool {
        match &self.flavor {
            Flavor::Document => jotdb_codec::is_live_line(line),
            Flavor::Table(_) => matches!(line.as_bytes().first(), Some(b'+') | Some(b'*')),
        }
    }

    fn decode_line(&self, line: &str, keys: Option<&[String]>) -> CoreResult<Option<Value>> {
        match &self.flavor {
            Flavor::Document => Ok(decode_document(line)),
            Flavor::Table(_) => {
                let schema = self.table_schema()?;
                Ok(decode_row(&schema, line, keys))
            }
        }
    }

    fn encode_line(&self, doc: &Value) -> CoreResult<String> {
        match &self.flavor {
            Flavor::Document => {
                if !doc.is_object() {
                    return Err(jotdb_codec::CodecError::NotAnObject.into());
                }
                Ok(encode_document(doc))
            }
            Flavor::Table(_) => {
                let schema = self.table_schema()?;
                Ok(encode_row(&schema, doc)?)
            }
        }
    }

    /// Tables need the header line before the first row lands.
    fn ensure_data_file(&self) -> CoreResult<()> {
        if !self.is_table() {
            return Ok(());
        }
        let path = self.dir.data_path();
        let empty = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        if empty {
            let schema = self.table_schema()?;
            std::fs::write(&path, format!("{}\n", schema.header()))?;
        }
        Ok(())
    }

    fn compile_cached(&self, query: &Query) -> CoreResult<Arc<CompiledQuery>> {
        match fingerprint(query) {
            Some(key) => {
                if let Some(cached) = self.cache.lock().get(&key) {
                    return Ok(Arc::clone(cached));
                }
                let compiled = Arc::new(compile(query)?);
                self.cache.lock().insert(key, Arc::clone(&compiled));
                Ok(compiled)
            }
            None => Ok(Arc::new(compile(query)?)),
        }
    }

    fn log_op(&self, op: &str, count: usize) {
        if !self.config.log {
            return;
        }
        let line = format!("{} | {:<8} | {}\n", now_stamp(), op, count);
        let _ = append_file(&self.dir.log_path(), line.as_bytes());
    }

    fn backup_original(&self, line: &str) {
        if !self.config.backup {
            return;
        }
        let entry = format!("{} | {:<20} | {}\n", now_stamp(), self.config.backup_user, line);
        let _ = append_file(&self.dir.backup_path(), entry.as_bytes());
    }

    // ------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------

    fn worker_loop(self: Arc<Self>) {
        enum Tick {
            Run(Phase),
            Idle,
            Exit,
        }

        loop {
            let tick = {
                let mut queues = self.queues.lock();
                match queues.next_phase() {
                    Some(phase) => Tick::Run(phase),
                    None if queues.shutdown => Tick::Exit,
                    None => {
                        let _ = self
                            .work_ready
                            .wait_for(&mut queues, Duration::from_millis(200));
                        match queues.next_phase() {
                            Some(phase) => Tick::Run(phase),
                            None if queues.shutdown => Tick::Exit,
                            None => Tick::Idle,
                        }
                    }
                }
            };

            match tick {
                Tick::Run(phase) => self.run_phase(phase),
                Tick::Idle => self.idle_maintenance(),
                Tick::Exit => break,
            }
        }

        self.queues.lock().fail_all();
    }

    fn idle_maintenance(&self) {
        if self.counter.needs_flush() {
            if let Err(e) = self.counter.flush() {
                tracing::warn!(error = %e, "counter flush failed");
            }
        }
        let mut meta = self.meta.lock();
        if meta.is_dirty() {
            if let Err(e) = meta.flush() {
                tracing::warn!(error = %e, "meta flush failed");
            }
        }
    }

    fn run_phase(&self, phase: Phase) {
        if self.closed.load(Ordering::SeqCst) {
            fail_phase(phase);
            return;
        }
        self.stats.add_pass();
        match phase {
            Phase::Exclusive(job) => self.exclusive_pass(job),
            Phase::Append(jobs) => self.append_pass(jobs),
            Phase::Update(jobs) => self.update_pass(jobs),
            Phase::Remove(jobs) => self.remove_pass(jobs),
            Phase::Read(jobs) => self.read_pass(jobs, false),
            Phase::ReadReverse(jobs) => self.read_pass(jobs, true),
            Phase::Stream(jobs) => self.stream_pass(jobs),
        }
    }

    // ------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------

    fn append_pass(&self, jobs: Vec<AppendJob>) {
        if let Err(e) = self.ensure_data_file() {
            let shared = Arc::new(e);
            for job in jobs {
                job.done.done(Err(CoreError::Batch(Arc::clone(&shared))));
            }
            return;
        }

        let total = jobs.len();
        let mut inserted = 0usize;
        let mut encoded: Vec<(String, AppendJob)> = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.encode_line(&job.doc) {
                Ok(line) => encoded.push((line, job)),
                Err(e) => job.done.done(Err(e)),
            }
        }

        let path = self.dir.data_path();
        while !encoded.is_empty() {
            let end = self.config.append_buffer.max(1).min(encoded.len());
            let mut buffer = String::new();
            for (line, _) in &encoded[..end] {
                buffer.push_str(line);
                buffer.push('\n');
            }

            match append_file(&path, buffer.as_bytes()) {
                Ok(()) => {
                    for (_, job) in encoded.drain(..end) {
                        self.feed.emit(DatabaseEvent::with_payload(
                            EventKind::Insert,
                            1,
                            job.doc.clone(),
                        ));
                        job.done.done(Ok(1));
                        inserted += 1;
                    }
                }
                Err(e) => {
                    // Every job of the failed batch gets the same error.
                    let shared = Arc::new(CoreError::from(e));
                    for (_, job) in encoded.drain(..end) {
                        job.done.done(Err(CoreError::Batch(Arc::clone(&shared))));
                    }
                }
            }
        }

        if inserted > 0 {
            self.stats.add_inserted(inserted as u64);
            self.feed
                .emit(DatabaseEvent::bare(EventKind::Change, inserted));
        }
        self.log_op("insert", total);
    }

    fn update_pass(&self, jobs: Vec<UpdateJob>) {
        struct Job {
            compiled: Arc<CompiledQuery>,
            modify: Modify,
            first: bool,
            insert_fallback: Option<Value>,
            done: Option<crate::scheduler::Completion<usize>>,
            count: usize,
            satisfied: bool,
        }

        if let Err(e) = self.ensure_data_file() {
            let shared = Arc::new(e);
            for job in jobs {
                job.done.done(Err(CoreError::Batch(Arc::clone(&shared))));
            }
            return;
        }

        let mut prepared = Vec::with_capacity(jobs.len());
        for job in jobs {
            let mut query = job.query;
            query.seal();
            match self.compile_cached(&query) {
                Ok(compiled) => prepared.push(Job {
                    compiled,
                    modify: job.modify,
                    first: query.first,
                    insert_fallback: job.insert_fallback,
                    done: Some(job.done),
                    count: 0,
                    satisfied: false,
                }),
                Err(e) => job.done.done(Err(e)),
            }
        }
        if prepared.is_empty() {
            return;
        }

        let mut mutated_total = 0usize;
        let mut pass_err: Option<CoreError> = None;

        let session = match UpdateSession::open(&self.dir.data_path()) {
            Ok(session) => session,
            Err(e) => {
                let shared = Arc::new(CoreError::from(e));
                for mut job in prepared {
                    if let Some(done) = job.done.take() {
                        done.done(Err(CoreError::Batch(Arc::clone(&shared))));
                    }
                }
                return;
            }
        };

        let header_at_zero = self.is_table();
        let run = session.run(|writer, batch| {
            for record in batch {
                if header_at_zero && record.position == 0 {
                    continue;
                }
                if !self.is_live(&record.text) {
                    self.stats.add_tombstones(1);
                    continue;
                }
                let mut doc = match self.decode_line(&record.text, None) {
                    Ok(Some(doc)) => doc,
                    Ok(None) => {
                        self.stats.add_skipped(1);
                        tracing::warn!(position = record.position, "skipping corrupt line");
                        continue;
                    }
                    Err(e) => {
                        pass_err = Some(e);
                        return Scan::Stop;
                    }
                };

                let mut mutated = false;
                let mut merged = false;
                for job in prepared.iter_mut().filter(|j| !j.satisfied) {
                    if !job.compiled.matches(&doc) {
                        continue;
                    }
                    let changed = apply_modify(&mut doc, &job.modify);
                    mutated |= changed;
                    merged |= changed && matches!(job.modify, Modify::Merge(_));
                    job.count += 1;
                    if job.first {
                        job.satisfied = true;
                    }
                }

                if mutated {
                    self.backup_original(&record.text);
                    if let Err(e) = self.rewrite_line(writer, record, &doc) {
                        pass_err = Some(e);
                        return Scan::Stop;
                    }
                    mutated_total += 1;
                    let kind = if merged {
                        EventKind::Modify
                    } else {
                        EventKind::Update
                    };
                    self.feed
                        .emit(DatabaseEvent::with_payload(kind, 1, doc.clone()));
                }

                if prepared.iter().all(|j| j.satisfied) {
                    return Scan::Stop;
                }
            }
            Scan::Continue
        });

        let err = pass_err.or_else(|| run.err().map(CoreError::from));
        if let Some(e) = err {
            let shared = Arc::new(e);
            for job in prepared.iter_mut() {
                if let Some(done) = job.done.take() {
                    done.done(Err(CoreError::Batch(Arc::clone(&shared))));
                }
            }
            return;
        }

        // Upsert fallbacks for jobs that matched nothing.
        for job in &mut prepared {
            if job.count > 0 {
                continue;
            }
            let Some(fallback) = job.insert_fallback.take() else {
                continue;
            };
            let appended = self.encode_line(&fallback).and_then(|line| {
                append_file(&self.dir.data_path(), format!("{line}\n").as_bytes())
                    .map_err(CoreError::from)
            });
            match appended {
                Ok(()) => {
                    job.count = 1;
                    self.stats.add_inserted(1);
                    self.feed
                        .emit(DatabaseEvent::with_payload(EventKind::Insert, 1, fallback));
                }
                Err(e) => {
                    if let Some(done) = job.done.take() {
                        done.done(Err(e));
                    }
                }
            }
        }

        let total: usize = prepared
            .iter()
            .filter(|j| j.done.is_some())
            .map(|j| j.count)
            .sum();
        for job in prepared.iter_mut() {
            if let Some(done) = job.done.take() {
                done.done(Ok(job.count));
            }
        }

        if mutated_total > 0 {
            self.stats.add_updated(mutated_total as u64);
            self.feed
                .emit(DatabaseEvent::bare(EventKind::Change, mutated_total));
        }
        self.log_op("update", total);
    }

    fn rewrite_line(
        &self,
        writer: &mut SessionWriter,
        record: &LineRecord,
        doc: &Value,
    ) -> CoreResult<()> {
        let encoded = self.encode_line(doc)?;
        if encoded.len() == record.length {
            writer.write_at(encoded.as_bytes(), record.position)?;
        } else {
            writer.write_at(b"-", record.position)?;
            writer.append(format!("{encoded}\n").as_bytes())?;
        }
        Ok(())
    }

    fn remove_pass(&self, jobs: Vec<RemoveJob>) {
        struct Job {
            compiled: Arc<CompiledQuery>,
            first: bool,
            done: crate::scheduler::Completion<usize>,
            count: usize,
            satisfied: bool,
        }

        let mut prepared = Vec::with_capacity(jobs.len());
        for job in jobs {
            let mut query = job.query;
            query.seal();
            match self.compile_cached(&query) {
                Ok(compiled) => prepared.push(Job {
                    compiled,
                    first: query.first,
                    done: job.done,
                    count: 0,
                    satisfied: false,
                }),
                Err(e) => job.done.done(Err(e)),
            }
        }
        if prepared.is_empty() {
            return;
        }

        let mut removed_total = 0usize;
        let mut pass_err: Option<CoreError> = None;

        let session = match UpdateSession::open(&self.dir.data_path()) {
            Ok(session) => session,
            Err(e) => {
                let shared = Arc::new(CoreError::from(e));
                for job in prepared {
                    job.done.done(Err(CoreError::Batch(Arc::clone(&shared))));
                }
                return;
            }
        };

        let header_at_zero = self.is_table();
        let run = session.run(|writer, batch| {
            for record in batch {
                if header_at_zero && record.position == 0 {
                    continue;
                }
                if !self.is_live(&record.text) {
                    self.stats.add_tombstones(1);
                    continue;
                }
                let doc = match self.decode_line(&record.text, None) {
                    Ok(Some(doc)) => doc,
                    Ok(None) => {
                        self.stats.add_skipped(1);
                        continue;
                    }
                    Err(e) => {
                        pass_err = Some(e);
                        return Scan::Stop;
                    }
                };

                let mut hit = false;
                for job in prepared.iter_mut().filter(|j| !j.satisfied) {
                    if !job.compiled.matches(&doc) {
                        continue;
                    }
                    hit = true;
                    job.count += 1;
                    if job.first {
                        job.satisfied = true;
                    }
                }

                if hit {
                    self.backup_original(&record.text);
                    if let Err(e) = writer.write_at(b"-", record.position) {
                        pass_err = Some(e.into());
                        return Scan::Stop;
                    }
                    removed_total += 1;
                    self.feed
                        .emit(DatabaseEvent::with_payload(EventKind::Remove, 1, doc));
                }

                if prepared.iter().all(|j| j.satisfied) {
                    return Scan::Stop;
                }
            }
            Scan::Continue
        });

        let err = pass_err.or_else(|| run.err().map(CoreError::from));
        if let Some(e) = err {
            let shared = Arc::new(e);
            for job in prepared {
                job.done.done(Err(CoreError::Batch(Arc::clone(&shared))));
            }
            return;
        }

        let total: usize = prepared.iter().map(|j| j.count).sum();
        for job in prepared {
            job.done.done(Ok(job.count));
        }

        if removed_total > 0 {
            self.stats.add_removed(removed_total as u64);
            self.feed
                .emit(DatabaseEvent::bare(EventKind::Change, removed_total));
        }
        self.log_op("remove", total);
    }

    /// Columns a table pass must decode; `None` decodes everything.
    fn decode_keys(&self, queries: &[Query]) -> Option<Vec<String>> {
        if !self.is_table() {
            return None;
        }
        let mut keys: Vec<String> = Vec::new();
        for query in queries {
            let referenced = query.referenced_fields()?;
            keys.extend(referenced);
            if let Some((_, Some(field))) = &query.scalar {
                keys.push(field.clone());
            }
            if let Some(name) = query.sort_field() {
                keys.push(name.to_string());
            }
            for join in &query.joins {
                keys.push(join.local.clone());
            }
            if query.scalar.is_some() {
                continue;
            }
            match &query.keep {
                Some(keep) => keys.extend(keep.iter().cloned()),
                // A document-returning reader without a keep list needs
                // every column.
                None => return None,
            }
        }
        keys.sort();
        keys.dedup();
        Some(keys)
    }

    fn read_pass(&self, jobs: Vec<ReadJob>, reverse: bool) {
        let queries: Vec<Query> = jobs
            .iter()
            .map(|job| {
                let mut q = job.query.clone();
                q.seal();
                q
            })
            .collect();

        let mut readers = Vec::with_capacity(jobs.len());
        for job in jobs {
            if let Ok(reader) = Reader::build(self, job) {
                readers.push(reader);
            }
        }
        if readers.is_empty() {
            return;
        }

        let keys = self.decode_keys(&queries);
        let mut pass_err: Option<CoreError> = None;
        let mut seen = 0u64;

        let header_at_zero = self.is_table();
        let mut visit = |record: &LineRecord| -> Scan {
            if record.text.is_empty() {
                return Scan::Continue;
            }
            if header_at_zero && record.position == 0 {
                return Scan::Continue;
            }
            if !self.is_live(&record.text) {
                self.stats.add_tombstones(1);
                return Scan::Continue;
            }
            let doc = match self.decode_line(&record.text, keys.as_deref()) {
                Ok(Some(doc)) => doc,
                Ok(None) => {
                    self.stats.add_skipped(1);
                    tracing::warn!(position = record.position, "skipping corrupt line");
                    return Scan::Continue;
                }
                Err(e) => {
                    pass_err = Some(e);
                    return Scan::Stop;
                }
            };
            seen += 1;
            for reader in readers.iter_mut() {
                reader.process(&doc);
            }
            if readers.iter().all(|r| r.satisfied) {
                return Scan::Stop;
            }
            Scan::Continue
        };

        let path = self.dir.data_path();
        let result = if reverse {
            ReverseLineReader::open(&path).and_then(|r| r.for_each(|rec| visit(rec)))
        } else {
            LineReader::open(&path).and_then(|r| r.for_each(|rec| visit(rec)))
        };

        self.stats.add_read(seen);

        let err = pass_err.or_else(|| result.err().map(CoreError::from));
        if let Some(e) = err {
            let shared = Arc::new(e);
            for reader in readers {
                reader.fail(CoreError::Batch(Arc::clone(&shared)));
            }
            return;
        }

        for reader in readers {
            reader.finalize();
        }
    }

    fn stream_pass(&self, jobs: Vec<StreamJob>) {
        for job in jobs {
            let read_job = ReadJob {
                query: job.query,
                done: ReadDone::Documents(job.done),
            };
            let Ok(mut reader) = Reader::build(self, read_job) else {
                continue;
            };

            let mut pass_err: Option<CoreError> = None;
            let result = LineStream::new(job.source).for_each(|record| {
                if record.text.is_empty() || !self.is_live(&record.text) {
                    return Scan::Continue;
                }
                match self.decode_line(&record.text, None) {
                    Ok(Some(doc)) => {
                        reader.process(&doc);
                        if reader.satisfied {
                            return Scan::Stop;
                        }
                    }
                    Ok(None) => self.stats.add_skipped(1),
                    Err(e) => {
                        pass_err = Some(e);
                        return Scan::Stop;
                    }
                }
                Scan::Continue
            });

            match pass_err.or_else(|| result.err().map(CoreError::from)) {
                Some(e) => reader.fail(e),
                None => reader.finalize(),
            }
        }
    }

    // ------------------------------------------------------------------
    // Exclusive passes
    // ------------------------------------------------------------------

    fn exclusive_pass(&self, job: ExclusiveJob) {
        match job {
            ExclusiveJob::Clear(done) => done.done(self.clear_now()),
            ExclusiveJob::Clean(done) => done.done(self.clean_now()),
            ExclusiveJob::Drop(done) => done.done(self.drop_now()),
            ExclusiveJob::Backup(target, done) => done.done(self.backup_now(&target)),
            ExclusiveJob::Restore(source, done) => done.done(self.restore_now(&source)),
            ExclusiveJob::Lock(f, done) => {
                f();
                done.done(Ok(0));
            }
            ExclusiveJob::Extend(schema, done) => done.done(self.extend_now(schema)),
        }
    }

    fn clear_now(&self) -> CoreResult<usize> {
        match std::fs::remove_file(self.dir.data_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.ensure_data_file()?;
        self.feed.emit(DatabaseEvent::bare(EventKind::Clear, 0));
        self.log_op("clear", 0);
        Ok(0)
    }

    fn clean_now(&self) -> CoreResult<usize> {
        use std::io::Write;

        let tmp_path = self.dir.tmp_path();
        let mut out = std::io::BufWriter::new(std::fs::File::create(&tmp_path)?);

        if self.is_table() {
            let schema = self.table_schema()?;
            writeln!(out, "{}", schema.header())?;
        }

        let mut kept = 0usize;
        LineReader::open(&self.dir.data_path())?.for_each(|record| {
            if self.is_live(&record.text) {
                // Write errors surface through the flush below.
                if writeln!(out, "{}", record.text).is_ok() {
                    kept += 1;
                }
            }
            Scan::Continue
        })?;

        out.flush()?;
        drop(out);
        self.dir.promote_tmp()?;

        self.feed.emit(DatabaseEvent::bare(EventKind::Clean, kept));
        self.log_op("clean", kept);
        Ok(kept)
    }

    fn drop_now(&self) -> CoreResult<usize> {
        self.dir.delete_all()?;
        self.feed.detach_all();
        self.cache.lock().clear();
        self.closed.store(true, Ordering::SeqCst);
        let mut queues = self.queues.lock();
        queues.shutdown = true;
        self.work_ready.notify_one();
        Ok(0)
    }

    fn backup_now(&self, target: &Path) -> CoreResult<u64> {
        let data = self.dir.data_path();
        if data.exists() {
            Ok(std::fs::copy(&data, target)?)
        } else {
            std::fs::write(target, b"")?;
            Ok(0)
        }
    }

    fn restore_now(&self, source: &Path) -> CoreResult<usize> {
        std::fs::copy(source, self.dir.data_path())?;

        // A restored table may carry a different header.
        if let Flavor::Table(schema) = &self.flavor {
            let mut header = None;
            LineReader::open(&self.dir.data_path())?.for_each(|record| {
                header = Some(record.text.clone());
                Scan::Stop
            })?;
            if let Some(line) = header {
                *schema.write() = Some(Schema::parse(&line)?);
            }
        }

        self.feed.emit(DatabaseEvent::bare(EventKind::Change, 0));
        Ok(0)
    }

    fn extend_now(&self, new_schema: Schema) -> CoreResult<usize> {
        use std::io::Write;

        let Flavor::Table(schema_slot) = &self.flavor else {
            return Err(CoreError::invalid_operation("not a table"));
        };

        let old_schema = schema_slot.read().clone();
        let tmp_path = self.dir.tmp_path();
        let mut out = std::io::BufWriter::new(std::fs::File::create(&tmp_path)?);
        writeln!(out, "{}", new_schema.header())?;

        let mut rows = 0usize;
        if let Some(old_schema) = &old_schema {
            let mut convert_err: Option<CoreError> = None;
            LineReader::open(&self.dir.data_path())?.for_each(|record| {
                let Some(doc) = decode_row(old_schema, &record.text, None) else {
                    return Scan::Continue;
                };
                match encode_row(&new_schema, &doc) {
                    Ok(line) => {
                        if writeln!(out, "{line}").is_ok() {
                            rows += 1;
                        }
                        Scan::Continue
                    }
                    Err(e) => {
                        convert_err = Some(e.into());
                        Scan::Stop
                    }
                }
            })?;
            if let Some(e) = convert_err {
                return Err(e);
            }
        }

        out.flush()?;
        drop(out);
        self.dir.promote_tmp()?;
        *schema_slot.write() = Some(new_schema);
        self.log_op("extend", rows);
        Ok(rows)
    }
}

fn fail_phase(phase: Phase) {
    match phase {
        Phase::Exclusive(job) => match job {
            ExclusiveJob::Clear(done)
            | ExclusiveJob::Clean(done)
            | ExclusiveJob::Drop(done)
            | ExclusiveJob::Lock(_, done)
            | ExclusiveJob::Restore(_, done)
            | ExclusiveJob::Extend(_, done) => done.done(Err(CoreError::Closed)),
            ExclusiveJob::Backup(_, done) => done.done(Err(CoreError::Closed)),
        },
        Phase::Append(jobs) => {
            for job in jobs {
                job.done.done(Err(CoreError::Closed));
            }
        }
        Phase::Update(jobs) => {
            for job in jobs {
                job.done.done(Err(CoreError::Closed));
            }
        }
        Phase::Remove(jobs) => {
            for job in jobs {
                job.done.done(Err(CoreError::Closed));
            }
        }
        Phase::Read(jobs) | Phase::ReadReverse(jobs) => {
            for job in jobs {
                job.done.fail(CoreError::Closed);
            }
        }
        Phase::Stream(jobs) => {
            for job in jobs {
                job.done.done(Err(CoreError::Closed));
            }
        }
    }
}

/// Applies a modifier; returns whether the document changed.
fn apply_modify(doc: &mut Value, modify: &Modify) -> bool {
    match modify {
        Modify::Replace(new) => {
            if doc == new {
                false
            } else {
                *doc = new.clone();
                true
            }
        }
        Modify::With(f) => f(doc),
        Modify::Merge(merge) => {
            let Some(merge) = merge.as_object() else {
                return false;
            };
            let Some(fields) = doc.as_object_mut() else {
                return false;
            };

            let mut changed = false;
            for (key, value) in merge {
                let op = key.chars().next().filter(|c| "+-*/".contains(*c));
                match op {
                    Some(op) if key.len() > 1 => {
                        let field = &key[1..];
                        let current = fields.get(field).and_then(Value::as_f64).unwrap_or(0.0);
                        let operand = value.as_f64().unwrap_or(0.0);
                        let next = match op {
                            '+' => current + operand,
                            '-' => current - operand,
                            '*' => current * operand,
                            '/' => {
                                if operand == 0.0 {
                                    current
                                } else {
                                    current / operand
                                }
                            }
                            _ => unreachable!(),
                        };
                        fields.insert(field.to_string(), number_value(next));
                        changed = true;
                    }
                    _ => {
                        if fields.get(key) != Some(value) {
                            fields.insert(key.clone(), value.clone());
                            changed = true;
                        }
                    }
                }
            }
            changed
        }
    }
}

/// Keeps whole results integral so re-encoded lines stay compact.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_sets_and_operates() {
        let mut doc = json!({"id": "x", "n": 10, "name": "old"});
        let changed = apply_modify(
            &mut doc,
            &Modify::Merge(json!({"name": "new", "+n": 5})),
        );
        assert!(changed);
        assert_eq!(doc, json!({"id": "x", "n": 15, "name": "new"}));
    }

    #[test]
    fn merge_multiply_is_multiplication() {
        let mut doc = json!({"n": 6});
        apply_modify(&mut doc, &Modify::Merge(json!({"*n": 7})));
        assert_eq!(doc, json!({"n": 42}));
    }

    #[test]
    fn merge_divide_ignores_zero_divisor() {
        let mut doc = json!({"n": 6});
        apply_modify(&mut doc, &Modify::Merge(json!({"/n": 0})));
        assert_eq!(doc, json!({"n": 6}));

        apply_modify(&mut doc, &Modify::Merge(json!({"/n": 2})));
        assert_eq!(doc, json!({"n": 3}));
    }

    #[test]
    fn merge_missing_field_starts_at_zero() {
        let mut doc = json!({});
        apply_modify(&mut doc, &Modify::Merge(json!({"-n": 4})));
        assert_eq!(doc, json!({"n": -4}));
    }

    #[test]
    fn merge_without_changes_reports_unchanged() {
        let mut doc = json!({"a": 1});
        let changed = apply_modify(&mut doc, &Modify::Merge(json!({"a": 1})));
        assert!(!changed);
    }

    #[test]
    fn replace_detects_no_op() {
        let mut doc = json!({"a": 1});
        assert!(!apply_modify(&mut doc, &Modify::Replace(json!({"a": 1}))));
        assert!(apply_modify(&mut doc, &Modify::Replace(json!({"a": 2}))));
        assert_eq!(doc, json!({"a": 2}));
    }

    #[test]
    fn fractional_results_stay_fractional() {
        let mut doc = json!({"n": 5});
        apply_modify(&mut doc, &Modify::Merge(json!({"/n": 2})));
        assert_eq!(doc, json!({"n": 2.5}));
    }

    #[test]
    fn insert_sorted_keeps_bound() {
        let mut docs = Vec::new();
        for n in [5, 1, 9, 3, 7] {
            insert_sorted(&mut docs, json!({"n": n}), "n", true, 3);
        }
        let ns: Vec<i64> = docs.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![1, 3, 5]);

        let mut docs = Vec::new();
        for n in [5, 1, 9, 3, 7] {
            insert_sorted(&mut docs, json!({"n": n}), "n", false, 2);
        }
        let ns: Vec<i64> = docs.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![9, 7]);
    }

    #[test]
    fn scalar_of_group_counts_values() {
        let docs = vec![
            json!({"kind": "a"}),
            json!({"kind": "b"}),
            json!({"kind": "a"}),
        ];
        let grouped = scalar_of(&docs, ScalarKind::Group, Some("kind"));
        assert_eq!(grouped, json!({"a": 2, "b": 1}));
    }
}
