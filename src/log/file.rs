//! File-backed operation log.
//!
//! Each collection is a single append-only `<collection>.oplog` file inside
//! the store directory. Entries are framed as:
//!
//! ```text
//! magic(4) | version(1) | kind(1) | sequence(8) | body_len(4) | body | crc32(4)
//! ```
//!
//! The body is the MessagePack-encoded record id and document. The checksum
//! covers header and body. A writer appends whole entries with a single
//! write; watchers may still observe a partially written tail entry, which
//! they treat as "not yet available" rather than corruption.

use super::{ChangeLog, OperationFilter, StoreConnector, WatchSession};
use crate::error::{FeedError, Result};
use crate::types::{
    ChangeEvent, CursorPosition, NewRecord, OperationKind, Record, RecordChanges, RecordId,
    Sequence,
};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes for log entries.
const LOG_MAGIC: &[u8; 4] = b"OPL\0";

/// Current entry format version.
const LOG_VERSION: u8 = 1;

/// Entry header size.
const ENTRY_HEADER_SIZE: usize = 4 + 1 + 1 + 8 + 4; // magic + version + kind + sequence + body_len

/// Trailing checksum size.
const CHECKSUM_SIZE: usize = 4;

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"FST\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const LOG_EXTENSION: &str = "oplog";

/// File store configuration.
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Store directory.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync every N appends (0 and 1 both mean every append).
    pub sync_interval: u64,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            create_if_missing: true,
            sync_interval: 100,
        }
    }
}

#[derive(Serialize)]
struct EntryBodyRef<'a> {
    record_id: &'a RecordId,
    document: Option<&'a Record>,
}

#[derive(Deserialize)]
struct EntryBody {
    record_id: RecordId,
    document: Option<Record>,
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Frame an event as a log entry.
fn encode_entry(event: &ChangeEvent) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(&EntryBodyRef {
        record_id: &event.record_id,
        document: event.document.as_ref(),
    })?;

    let mut entry = Vec::with_capacity(ENTRY_HEADER_SIZE + body.len() + CHECKSUM_SIZE);
    entry.extend_from_slice(LOG_MAGIC);
    entry.push(LOG_VERSION);
    entry.push(event.kind.to_byte());
    entry.extend_from_slice(&event.sequence.0.to_le_bytes());
    entry.extend_from_slice(&(body.len() as u32).to_le_bytes());
    entry.extend_from_slice(&body);

    let checksum = crc32fast::hash(&entry);
    entry.extend_from_slice(&checksum.to_le_bytes());

    Ok(entry)
}

/// Decode the entry at the start of `buf`.
///
/// Returns the event and its framed size, or `None` if `buf` ends before the
/// entry does.
fn decode_entry(buf: &[u8]) -> Result<Option<(ChangeEvent, usize)>> {
    if buf.len() < ENTRY_HEADER_SIZE {
        return Ok(None);
    }

    if &buf[..4] != LOG_MAGIC {
        return Err(FeedError::InvalidFormat("Invalid entry magic".into()));
    }
    if buf[4] != LOG_VERSION {
        return Err(FeedError::InvalidFormat(format!(
            "Unsupported log version: {}",
            buf[4]
        )));
    }

    let kind = OperationKind::from_byte(buf[5])
        .ok_or_else(|| FeedError::InvalidFormat(format!("Unknown operation kind: {}", buf[5])))?;
    let sequence = Sequence(read_u64(&buf[6..14]));
    let body_len = read_u32(&buf[14..18]) as usize;

    let body_end = ENTRY_HEADER_SIZE + body_len;
    let total = body_end + CHECKSUM_SIZE;
    if buf.len() < total {
        return Ok(None);
    }

    let stored = read_u32(&buf[body_end..total]);
    let computed = crc32fast::hash(&buf[..body_end]);
    if stored != computed {
        return Err(FeedError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let body: EntryBody = rmp_serde::from_slice(&buf[ENTRY_HEADER_SIZE..body_end])?;

    Ok(Some((
        ChangeEvent {
            sequence,
            kind,
            record_id: body.record_id,
            document: body.document,
        },
        total,
    )))
}

/// Find the end of the last complete entry and its sequence.
///
/// Only headers are read; bodies are skipped.
fn scan_tail(file: &mut File) -> Result<(u64, Sequence)> {
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(0))?;

    let mut offset = 0u64;
    let mut last = Sequence(0);
    let mut header = [0u8; ENTRY_HEADER_SIZE];

    while offset + ENTRY_HEADER_SIZE as u64 <= len {
        reader.read_exact(&mut header)?;
        if &header[..4] != LOG_MAGIC {
            return Err(FeedError::InvalidFormat("Invalid entry magic".into()));
        }

        let sequence = Sequence(read_u64(&header[6..14]));
        let body_len = read_u32(&header[14..18]) as u64;
        let end = offset + ENTRY_HEADER_SIZE as u64 + body_len + CHECKSUM_SIZE as u64;
        if end > len {
            break;
        }

        reader.seek_relative((body_len + CHECKSUM_SIZE as u64) as i64)?;
        offset = end;
        last = sequence;
    }

    Ok((offset, last))
}

fn log_path(dir: &Path, collection: &str) -> Result<PathBuf> {
    if collection.is_empty()
        || collection.starts_with('.')
        || collection.contains(|c: char| c == '/' || c == '\\')
    {
        return Err(FeedError::InvalidOperation(format!(
            "Invalid collection name: {:?}",
            collection
        )));
    }
    Ok(dir.join(format!("{}.{}", collection, LOG_EXTENSION)))
}

fn open_session(
    collection: &str,
    path: &Path,
    filter: OperationFilter,
    tail: Option<(u64, Sequence)>,
) -> Result<Box<dyn WatchSession>> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FeedError::CollectionNotFound(collection.to_string()),
        _ => FeedError::Io(e),
    })?;

    let (offset, last) = match tail {
        Some(tail) => tail,
        None => scan_tail(&mut file)?,
    };

    tracing::debug!(
        collection = %collection,
        offset = offset,
        next = last.next().0,
        "Watch session opened"
    );

    Ok(Box::new(FileSession {
        collection: collection.to_string(),
        file,
        filter,
        offset,
        next: last.next(),
        buf: Vec::new(),
    }))
}

/// Watch session over an `.oplog` file.
struct FileSession {
    collection: String,
    file: File,
    filter: OperationFilter,
    offset: u64,
    next: Sequence,
    buf: Vec<u8>,
}

impl WatchSession for FileSession {
    fn next_batch(&mut self) -> Result<Vec<ChangeEvent>> {
        let len = self.file.metadata()?.len();
        if len < self.offset {
            return Err(FeedError::LogTruncated {
                offset: self.offset,
                len,
            });
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        self.file.seek(SeekFrom::Start(self.offset))?;
        self.buf.clear();
        Read::by_ref(&mut self.file)
            .take(len - self.offset)
            .read_to_end(&mut self.buf)?;

        let mut consumed = 0usize;
        let mut batch = Vec::new();
        while let Some((event, size)) = decode_entry(&self.buf[consumed..])? {
            consumed += size;
            if event.sequence < self.next {
                return Err(FeedError::CursorInvalidated {
                    position: self.next,
                    earliest: event.sequence,
                });
            }
            self.next = event.sequence.next();
            if self.filter.matches(event.kind) {
                batch.push(event);
            }
        }

        self.offset += consumed as u64;
        Ok(batch)
    }

    fn position(&self) -> CursorPosition {
        CursorPosition {
            next: self.next,
            offset: self.offset,
        }
    }
}

impl Drop for FileSession {
    fn drop(&mut self) {
        tracing::debug!(
            collection = %self.collection,
            offset = self.offset,
            "Watch session closed"
        );
    }
}

/// Writer-side state of one collection log.
///
/// `size`, `head` and `documents` always describe exactly the complete
/// entries in the file, whether or not they have been synced.
struct Writer {
    file: File,
    head: Sequence,
    size: u64,
    writes_since_sync: u64,
    documents: HashMap<RecordId, Record>,
    #[cfg(test)]
    sync_fault: Option<std::io::ErrorKind>,
}

impl Writer {
    /// Write one entry and apply it to the document set.
    ///
    /// A failed write cuts the file back to the last complete entry, so
    /// watchers never see an entry the caller was told failed.
    fn append(
        &mut self,
        kind: OperationKind,
        record_id: RecordId,
        document: Option<Record>,
    ) -> Result<Sequence> {
        let event = ChangeEvent {
            sequence: self.head.next(),
            kind,
            record_id,
            document,
        };
        let entry = encode_entry(&event)?;

        let written = self
            .file
            .seek(SeekFrom::Start(self.size))
            .and_then(|_| self.file.write_all(&entry));
        if let Err(e) = written {
            if let Err(rollback) = self.file.set_len(self.size) {
                tracing::error!(
                    error = %rollback,
                    size = self.size,
                    "Failed to cut back partial entry"
                );
            }
            return Err(e.into());
        }

        self.size += entry.len() as u64;
        self.head = event.sequence;
        self.writes_since_sync += 1;

        match event.document {
            Some(document) => {
                self.documents.insert(event.record_id, document);
            }
            None => {
                self.documents.remove(&event.record_id);
            }
        }

        Ok(event.sequence)
    }

    fn sync_if_due(&mut self, sync_interval: u64) -> Result<()> {
        if self.writes_since_sync >= sync_interval {
            self.sync()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        #[cfg(test)]
        if let Some(kind) = self.sync_fault.take() {
            return Err(std::io::Error::new(kind, "injected sync failure").into());
        }

        self.file.sync_data()?;
        self.writes_since_sync = 0;
        Ok(())
    }
}

/// Operation log of one collection, owned by the writing process.
pub struct OpLog {
    name: String,
    path: PathBuf,
    writer: Mutex<Writer>,
    sync_interval: u64,
}

impl OpLog {
    /// Open or create the log, replaying it to rebuild the document set.
    ///
    /// A torn entry at the tail (crash mid-append) is cut off.
    fn open(name: &str, path: PathBuf, sync_interval: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut documents = HashMap::new();
        let mut head = Sequence(0);
        let mut consumed = 0usize;
        while let Some((event, size)) = decode_entry(&bytes[consumed..])? {
            consumed += size;
            head = event.sequence;
            match event.document {
                Some(document) => {
                    documents.insert(event.record_id, document);
                }
                None => {
                    documents.remove(&event.record_id);
                }
            }
        }

        if consumed < bytes.len() {
            tracing::warn!(
                collection = %name,
                valid_bytes = consumed,
                file_bytes = bytes.len(),
                "Discarding incomplete tail entry"
            );
            file.set_len(consumed as u64)?;
            file.sync_all()?;
        }

        Ok(Self {
            name: name.to_string(),
            path,
            writer: Mutex::new(Writer {
                file,
                head,
                size: consumed as u64,
                writes_since_sync: 0,
                documents,
                #[cfg(test)]
                sync_fault: None,
            }),
            sync_interval: sync_interval.max(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a new record, appending a create entry.
    ///
    /// An `Io` error from the periodic sync is returned after the entry was
    /// written: the record exists (and is visible to watchers) but may not be
    /// durable yet.
    pub fn insert(&self, input: NewRecord) -> Result<Record> {
        let mut writer = self.writer.lock();
        let record = input.into_record(writer.head.next())?;

        if writer.documents.contains_key(&record.id) {
            return Err(FeedError::RecordExists(record.id));
        }

        writer.append(OperationKind::Create, record.id.clone(), Some(record.clone()))?;
        writer.sync_if_due(self.sync_interval)?;

        Ok(record)
    }

    /// Update an existing record, appending an update entry.
    pub fn update(&self, id: &RecordId, changes: &RecordChanges) -> Result<Record> {
        let mut writer = self.writer.lock();
        let updated = writer
            .documents
            .get(id)
            .ok_or_else(|| FeedError::RecordNotFound(id.clone()))?
            .with_changes(changes);
        updated.validate()?;

        writer.append(OperationKind::Update, id.clone(), Some(updated.clone()))?;
        writer.sync_if_due(self.sync_interval)?;

        Ok(updated)
    }

    /// Delete a record, appending a delete entry.
    pub fn delete(&self, id: &RecordId) -> Result<()> {
        let mut writer = self.writer.lock();
        if !writer.documents.contains_key(id) {
            return Err(FeedError::RecordNotFound(id.clone()));
        }

        writer.append(OperationKind::Delete, id.clone(), None)?;
        writer.sync_if_due(self.sync_interval)
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.writer.lock().documents.get(id).cloned()
    }

    /// Sequence of the newest entry (zero when empty).
    pub fn head(&self) -> Sequence {
        self.writer.lock().head
    }

    /// Force pending appends to disk.
    pub fn sync(&self) -> Result<()> {
        self.writer.lock().sync()
    }
}

impl ChangeLog for OpLog {
    fn watch(&self, filter: OperationFilter) -> Result<Box<dyn WatchSession>> {
        let tail = {
            let writer = self.writer.lock();
            (writer.size, writer.head)
        };
        open_session(&self.name, &self.path, filter, Some(tail))
    }
}

/// A directory of collection logs, opened for writing.
///
/// Holds an exclusive lock on the directory; watchers in other processes use
/// [`FileConnector`] and need no lock.
pub struct FileStore {
    config: FileStoreConfig,
    _lock_file: File,
    collections: Mutex<HashMap<String, Arc<OpLog>>>,
}

impl FileStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: FileStoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::verify_manifest(&config.path)?;
        } else if config.create_if_missing {
            fs::create_dir_all(&config.path)?;
            Self::write_manifest(&config.path)?;
        } else {
            return Err(FeedError::NotInitialized(config.path.display().to_string()));
        }

        let lock_file = Self::acquire_lock(&config.path)?;

        Ok(Self {
            config,
            _lock_file: lock_file,
            collections: Mutex::new(HashMap::new()),
        })
    }

    /// Get or open a collection log.
    pub fn collection(&self, name: &str) -> Result<Arc<OpLog>> {
        let mut collections = self.collections.lock();
        if let Some(log) = collections.get(name) {
            return Ok(Arc::clone(log));
        }

        let path = log_path(&self.config.path, name)?;
        let log = Arc::new(OpLog::open(name, path, self.config.sync_interval)?);
        collections.insert(name.to_string(), Arc::clone(&log));

        tracing::info!(collection = %name, head = log.head().0, "Collection opened");
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Sync every open collection.
    pub fn sync(&self) -> Result<()> {
        for log in self.collections.lock().values() {
            log.sync()?;
        }
        Ok(())
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(FeedError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| FeedError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

/// Read-only watcher over a collection log in another process' store.
struct LogWatcher {
    collection: String,
    path: PathBuf,
}

impl ChangeLog for LogWatcher {
    fn watch(&self, filter: OperationFilter) -> Result<Box<dyn WatchSession>> {
        open_session(&self.collection, &self.path, filter, None)
    }
}

/// Connects to file stores; the connection string is the store directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileConnector;

impl StoreConnector for FileConnector {
    fn connect(&self, connection: &str, collection: &str) -> Result<Arc<dyn ChangeLog>> {
        let dir = Path::new(connection);
        if !dir.join("MANIFEST").exists() {
            return Err(FeedError::Connection(format!(
                "{} is not a store directory",
                connection
            )));
        }
        FileStore::verify_manifest(dir)?;

        let path = log_path(dir, collection)?;
        if !path.exists() {
            return Err(FeedError::CollectionNotFound(collection.to_string()));
        }

        Ok(Arc::new(LogWatcher {
            collection: collection.to_string(),
            path,
        }))
    }
}
