//! Watchable operation logs.
//!
//! A collection's operation log is an ordered, append-only sequence of
//! [`ChangeEvent`]s. Consumers open a [`WatchSession`] positioned at the
//! current tail and poll it for batches of newer events.
//!
//! Two backends are provided:
//! - [`MemoryStore`]: in-process collections, used to drive the feed
//!   deterministically in tests
//! - [`FileStore`]: one append-only `.oplog` file per collection

mod file;
mod memory;

pub use file::{FileConnector, FileStore, FileStoreConfig, OpLog};
pub use memory::{MemoryLog, MemoryStore};

use crate::error::Result;
use crate::types::{ChangeEvent, CursorPosition, OperationKind};
use std::sync::Arc;

/// Restricts which operation kinds a watch session surfaces.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationFilter {
    /// Allowed kinds (None = all kinds).
    kinds: Option<Vec<OperationKind>>,
}

impl OperationFilter {
    /// Surface every operation.
    pub fn all() -> Self {
        Self { kinds: None }
    }

    /// Surface only record creation.
    pub fn creates_only() -> Self {
        Self::kinds(vec![OperationKind::Create])
    }

    /// Surface the given kinds.
    pub fn kinds(kinds: Vec<OperationKind>) -> Self {
        Self { kinds: Some(kinds) }
    }

    pub fn matches(&self, kind: OperationKind) -> bool {
        match self.kinds {
            Some(ref kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

/// A collection's operation log that can be watched.
pub trait ChangeLog: Send + Sync {
    /// Open a session positioned at the current tail of the log.
    fn watch(&self, filter: OperationFilter) -> Result<Box<dyn WatchSession>>;
}

/// A live cursor over a log.
///
/// Dropping the session releases whatever it holds open.
pub trait WatchSession: Send {
    /// Events past the cursor that match the session filter, in log order.
    ///
    /// Returns an empty batch when nothing new is available; the cursor
    /// still advances past non-matching events.
    fn next_batch(&mut self) -> Result<Vec<ChangeEvent>>;

    /// Current resume position.
    fn position(&self) -> CursorPosition;
}

/// Resolves a connection string and collection name into a log.
pub trait StoreConnector: Send + Sync {
    fn connect(&self, connection: &str, collection: &str) -> Result<Arc<dyn ChangeLog>>;
}
