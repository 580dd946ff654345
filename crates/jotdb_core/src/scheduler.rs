//! Operation scheduling: pending queues, job descriptors, and completion
//! handles.
//!
//! Every database runs one worker thread that drains these queues. One
//! queue is drained per tick, as a whole batch, in a fixed priority:
//! exclusive operations (drop, backup, restore, clear, clean, lock,
//! extend) first, then the writing queues (append, update, remove), then
//! the reading queues (forward, reverse, external stream). Batching means
//! N concurrent submissions against the same file share one streaming
//! pass.

use crate::error::{CoreError, CoreResult};
use crate::query::{Listing, Query, ScalarResult};
use jotdb_codec::Schema;
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Completion handle for a submitted operation.
///
/// Operations are queued when submitted and resolve when their batch's
/// pass finishes. Dropping a `Pending` without waiting is allowed; the
/// operation still runs.
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<CoreResult<T>>,
}

impl<T> Pending<T> {
    /// Blocks until the operation completes.
    pub fn wait(self) -> CoreResult<T> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(CoreError::Closed),
        }
    }

    /// Blocks until the operation completes or the timeout elapses.
    ///
    /// Returns `None` on timeout; the operation keeps running.
    pub fn wait_timeout(self, timeout: Duration) -> Option<CoreResult<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(CoreError::Closed)),
        }
    }
}

/// Write half of a [`Pending`].
#[derive(Debug)]
pub(crate) struct Completion<T> {
    tx: Sender<CoreResult<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn done(self, result: CoreResult<T>) {
        // A dropped Pending is a tolerated missing callback.
        let _ = self.tx.send(result);
    }
}

pub(crate) fn completion<T>() -> (Completion<T>, Pending<T>) {
    let (tx, rx) = mpsc::channel();
    (Completion { tx }, Pending { rx })
}

/// Resolves a pending operation immediately, without queueing.
pub(crate) fn resolved<T>(result: CoreResult<T>) -> Pending<T> {
    let (done, pending) = completion();
    done.done(result);
    pending
}

pub(crate) struct AppendJob {
    pub doc: Value,
    pub done: Completion<usize>,
}

/// How an update pass rewrites a matching document.
#[derive(Clone)]
pub enum Modify {
    /// Merge fields into the document. Keys with a `+`, `-`, `*`, or `/`
    /// prefix apply the arithmetic operator to the existing field instead
    /// of replacing it.
    Merge(Value),
    /// Replace the whole document.
    Replace(Value),
    /// Rewrite through a caller function; returns whether it changed the
    /// document.
    With(Arc<dyn Fn(&mut Value) -> bool + Send + Sync>),
}

impl std::fmt::Debug for Modify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Merge(v) => write!(f, "Merge({v})"),
            Self::Replace(v) => write!(f, "Replace({v})"),
            Self::With(_) => write!(f, "With(..)"),
        }
    }
}

pub(crate) struct UpdateJob {
    pub query: Query,
    pub modify: Modify,
    pub insert_fallback: Option<Value>,
    pub done: Completion<usize>,
}

pub(crate) struct RemoveJob {
    pub query: Query,
    pub done: Completion<usize>,
}

/// Typed reply channel of a read job.
pub(crate) enum ReadDone {
    Documents(Completion<Vec<Value>>),
    First(Completion<Option<Value>>),
    Count(Completion<usize>),
    Scalar(Completion<ScalarResult>),
    Listing(Completion<Listing>),
}

impl ReadDone {
    pub(crate) fn fail(self, err: CoreError) {
        match self {
            Self::Documents(done) => done.done(Err(err)),
            Self::First(done) => done.done(Err(err)),
            Self::Count(done) => done.done(Err(err)),
            Self::Scalar(done) => done.done(Err(err)),
            Self::Listing(done) => done.done(Err(err)),
        }
    }
}

pub(crate) struct ReadJob {
    pub query: Query,
    pub done: ReadDone,
}

pub(crate) struct StreamJob {
    pub query: Query,
    pub source: Box<dyn Read + Send>,
    pub done: Completion<Vec<Value>>,
}

/// Operations that run with every other queue blocked.
pub(crate) enum ExclusiveJob {
    Clear(Completion<usize>),
    Clean(Completion<usize>),
    Drop(Completion<usize>),
    Backup(PathBuf, Completion<u64>),
    Restore(PathBuf, Completion<usize>),
    Lock(Box<dyn FnOnce() + Send>, Completion<usize>),
    Extend(Schema, Completion<usize>),
}

/// One tick's worth of work, drained as a batch.
pub(crate) enum Phase {
    Exclusive(ExclusiveJob),
    Append(Vec<AppendJob>),
    Update(Vec<UpdateJob>),
    Remove(Vec<RemoveJob>),
    Read(Vec<ReadJob>),
    ReadReverse(Vec<ReadJob>),
    Stream(Vec<StreamJob>),
}

/// The pending queues of one database.
#[derive(Default)]
pub(crate) struct Queues {
    pub exclusive: Vec<ExclusiveJob>,
    pub append: Vec<AppendJob>,
    pub update: Vec<UpdateJob>,
    pub remove: Vec<RemoveJob>,
    pub read: Vec<ReadJob>,
    pub read_reverse: Vec<ReadJob>,
    pub stream: Vec<StreamJob>,
    pub shutdown: bool,
}

impl Queues {
    /// Whether any work is queued.
    pub fn has_work(&self) -> bool {
        !self.exclusive.is_empty()
            || !self.append.is_empty()
            || !self.update.is_empty()
            || !self.remove.is_empty()
            || !self.read.is_empty()
            || !self.read_reverse.is_empty()
            || !self.stream.is_empty()
    }

    /// Takes the next phase to run, by priority. Exclusive jobs run one at
    /// a time; every other queue drains whole.
    pub fn next_phase(&mut self) -> Option<Phase> {
        if !self.exclusive.is_empty() {
            return Some(Phase::Exclusive(self.exclusive.remove(0)));
        }
        if !self.append.is_empty() {
            return Some(Phase::Append(std::mem::take(&mut self.append)));
        }
        if !self.update.is_empty() {
            return Some(Phase::Update(std::mem::take(&mut self.update)));
        }
        if !self.remove.is_empty() {
            return Some(Phase::Remove(std::mem::take(&mut self.remove)));
        }
        if !self.read.is_empty() {
            return Some(Phase::Read(std::mem::take(&mut self.read)));
        }
        if !self.read_reverse.is_empty() {
            return Some(Phase::ReadReverse(std::mem::take(&mut self.read_reverse)));
        }
        if !self.stream.is_empty() {
            return Some(Phase::Stream(std::mem::take(&mut self.stream)));
        }
        None
    }

    /// Fails every queued job; used after the database closes.
    pub fn fail_all(&mut self) {
        for job in self.exclusive.drain(..) {
            match job {
                ExclusiveJob::Clear(done)
                | ExclusiveJob::Clean(done)
                | ExclusiveJob::Drop(done)
                | ExclusiveJob::Lock(_, done)
                | ExclusiveJob::Extend(_, done) => done.done(Err(CoreError::Closed)),
                ExclusiveJob::Backup(_, done) => done.done(Err(CoreError::Closed)),
                ExclusiveJob::Restore(_, done) => done.done(Err(CoreError::Closed)),
            }
        }
        for job in self.append.drain(..) {
            job.done.done(Err(CoreError::Closed));
        }
        for job in self.update.drain(..) {
            job.done.done(Err(CoreError::Closed));
        }
        for job in self.remove.drain(..) {
            job.done.done(Err(CoreError::Closed));
        }
        for job in self.read.drain(..).chain(self.read_reverse.drain(..)) {
            job.done.fail(CoreError::Closed);
        }
        for job in self.stream.drain(..) {
            job.done.done(Err(CoreError::Closed));
        }
    }
}
