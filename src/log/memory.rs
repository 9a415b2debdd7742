//! In-process operation logs.

use super::{ChangeLog, OperationFilter, StoreConnector, WatchSession};
use crate::error::{FeedError, Result};
use crate::types::{
    ChangeEvent, CursorPosition, NewRecord, OperationKind, Record, RecordChanges, RecordId,
    Sequence,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Poll timestamps kept for inspection.
const POLL_HISTORY: usize = 1024;

/// Retained log contents.
///
/// `events[i].sequence == first_retained + i` always holds.
struct LogState {
    events: VecDeque<ChangeEvent>,
    first_retained: Sequence,
    head: Sequence,
    documents: HashMap<RecordId, Record>,
}

struct Inner {
    name: String,
    state: RwLock<LogState>,
    /// Sessions currently open.
    open_sessions: AtomicUsize,
    /// Sessions ever opened.
    sessions_opened: AtomicU64,
    /// Polls across all sessions.
    polls: AtomicU64,
    /// When the most recent polls happened, oldest first.
    poll_times: Mutex<VecDeque<Instant>>,
    /// Injected failure for the next `watch`.
    watch_failure: Mutex<Option<String>>,
    /// Injected failure for the next poll.
    poll_failure: Mutex<Option<String>>,
}

/// A single in-memory collection and its operation log.
///
/// Clones share the same log.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

impl MemoryLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: RwLock::new(LogState {
                    events: VecDeque::new(),
                    first_retained: Sequence(1),
                    head: Sequence(0),
                    documents: HashMap::new(),
                }),
                open_sessions: AtomicUsize::new(0),
                sessions_opened: AtomicU64::new(0),
                polls: AtomicU64::new(0),
                poll_times: Mutex::new(VecDeque::with_capacity(POLL_HISTORY)),
                watch_failure: Mutex::new(None),
                poll_failure: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // --- Document Operations ---

    /// Insert a new record, appending a create event.
    pub fn insert(&self, input: NewRecord) -> Result<Record> {
        let mut state = self.inner.state.write();
        let sequence = state.head.next();
        let record = input.into_record(sequence)?;

        if state.documents.contains_key(&record.id) {
            return Err(FeedError::RecordExists(record.id));
        }

        state.documents.insert(record.id.clone(), record.clone());
        Self::push(&mut state, OperationKind::Create, record.id.clone(), Some(record.clone()));
        Ok(record)
    }

    /// Update an existing record, appending an update event.
    pub fn update(&self, id: &RecordId, changes: &RecordChanges) -> Result<Record> {
        let mut state = self.inner.state.write();
        let updated = state
            .documents
            .get(id)
            .ok_or_else(|| FeedError::RecordNotFound(id.clone()))?
            .with_changes(changes);
        updated.validate()?;

        state.documents.insert(id.clone(), updated.clone());
        Self::push(&mut state, OperationKind::Update, id.clone(), Some(updated.clone()));
        Ok(updated)
    }

    /// Delete a record, appending a delete event.
    pub fn delete(&self, id: &RecordId) -> Result<()> {
        let mut state = self.inner.state.write();
        if state.documents.remove(id).is_none() {
            return Err(FeedError::RecordNotFound(id.clone()));
        }
        Self::push(&mut state, OperationKind::Delete, id.clone(), None);
        Ok(())
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.inner.state.read().documents.get(id).cloned()
    }

    /// Sequence of the newest event (zero when empty).
    pub fn head(&self) -> Sequence {
        self.inner.state.read().head
    }

    fn push(
        state: &mut LogState,
        kind: OperationKind,
        record_id: RecordId,
        document: Option<Record>,
    ) {
        let sequence = state.head.next();
        state.events.push_back(ChangeEvent {
            sequence,
            kind,
            record_id,
            document,
        });
        state.head = sequence;
    }

    /// Discard events older than `sequence`, as log retention would.
    pub fn truncate_before(&self, sequence: Sequence) {
        let mut state = self.inner.state.write();
        while let Some(front) = state.events.front() {
            if front.sequence >= sequence {
                break;
            }
            state.events.pop_front();
        }
        let earliest = sequence.min(state.head.next()).max(state.first_retained);
        state.first_retained = earliest;
    }

    // --- Instrumentation ---

    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> u64 {
        self.inner.polls.load(Ordering::SeqCst)
    }

    /// Times of the last polls (at most 1024).
    pub fn poll_times(&self) -> Vec<Instant> {
        self.inner.poll_times.lock().iter().copied().collect()
    }

    /// Make the next `watch` call fail with a connection error.
    pub fn fail_next_watch(&self, message: impl Into<String>) {
        *self.inner.watch_failure.lock() = Some(message.into());
    }

    /// Make the next poll on any session fail with a connection error.
    pub fn fail_next_poll(&self, message: impl Into<String>) {
        *self.inner.poll_failure.lock() = Some(message.into());
    }
}

impl ChangeLog for MemoryLog {
    fn watch(&self, filter: OperationFilter) -> Result<Box<dyn WatchSession>> {
        if let Some(message) = self.inner.watch_failure.lock().take() {
            return Err(FeedError::Connection(message));
        }

        let next = self.inner.state.read().head.next();
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(collection = %self.inner.name, next = next.0, "Watch session opened");

        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            filter,
            next,
        }))
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    filter: OperationFilter,
    next: Sequence,
}

impl WatchSession for MemorySession {
    fn next_batch(&mut self) -> Result<Vec<ChangeEvent>> {
        self.inner.polls.fetch_add(1, Ordering::SeqCst);
        {
            let mut times = self.inner.poll_times.lock();
            if times.len() == POLL_HISTORY {
                times.pop_front();
            }
            times.push_back(Instant::now());
        }

        if let Some(message) = self.inner.poll_failure.lock().take() {
            return Err(FeedError::Connection(message));
        }

        let state = self.inner.state.read();
        if self.next < state.first_retained {
            return Err(FeedError::CursorInvalidated {
                position: self.next,
                earliest: state.first_retained,
            });
        }

        let skip = (self.next.0 - state.first_retained.0) as usize;
        let batch = state
            .events
            .iter()
            .skip(skip)
            .filter(|event| self.filter.matches(event.kind))
            .cloned()
            .collect();

        self.next = state.head.next();
        Ok(batch)
    }

    fn position(&self) -> CursorPosition {
        CursorPosition {
            next: self.next,
            offset: 0,
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(collection = %self.inner.name, next = self.next.0, "Watch session closed");
    }
}

/// In-process store holding named collections.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, MemoryLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a collection.
    pub fn collection(&self, name: &str) -> MemoryLog {
        if let Some(log) = self.collections.read().get(name) {
            return log.clone();
        }
        self.collections
            .write()
            .entry(name.to_string())
            .or_insert_with(|| MemoryLog::new(name))
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreConnector for MemoryStore {
    /// The connection string is ignored; only existing collections connect.
    fn connect(&self, _connection: &str, collection: &str) -> Result<Arc<dyn ChangeLog>> {
        let log = self
            .collections
            .read()
            .get(collection)
            .cloned()
            .ok_or_else(|| FeedError::CollectionNotFound(collection.to_string()))?;
        Ok(Arc::new(log))
    }
}
