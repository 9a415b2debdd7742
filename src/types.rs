//! Core types for the change feed.

use crate::error::{FeedError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned record identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// Generate an identifier for a record created at log position `sequence`.
    ///
    /// Layout matches a 12-byte object id: 4 bytes of unix seconds followed by
    /// the 8-byte sequence, hex encoded.
    pub fn generate(created_on: DateTime<Utc>, sequence: Sequence) -> Self {
        // Seconds outside the u32 range clamp to its bounds.
        let seconds = created_on.timestamp().clamp(0, i64::from(u32::MAX)) as u32;
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..].copy_from_slice(&sequence.0.to_be_bytes());
        RecordId(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId(s)
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an operation in a collection's log.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

/// A committed document, the unit of propagation.
///
/// Field names on the wire are camelCase (`createdBy`, `createdOn`) and
/// `createdOn` is RFC 3339 in UTC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub created_by: String,
    pub created_on: DateTime<Utc>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
}

impl Record {
    /// Check the required fields are present.
    pub fn validate(&self) -> Result<()> {
        if self.id.0.is_empty() {
            return Err(FeedError::InvalidRecord("id must not be empty".into()));
        }
        if self.created_by.trim().is_empty() {
            return Err(FeedError::InvalidRecord("createdBy must not be empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(FeedError::InvalidRecord("title must not be empty".into()));
        }
        if self.content.is_empty() {
            return Err(FeedError::InvalidRecord("content must not be empty".into()));
        }
        Ok(())
    }

    /// Apply field changes, returning the resulting document.
    pub fn with_changes(&self, changes: &RecordChanges) -> Record {
        let mut updated = self.clone();
        if let Some(ref title) = changes.title {
            updated.title = title.clone();
        }
        if let Some(ref description) = changes.description {
            updated.description = description.clone();
        }
        if let Some(ref content) = changes.content {
            updated.content = content.clone();
        }
        updated
    }
}

/// Input for inserting a record (id and timestamp optional).
#[derive(Clone, Debug, Default)]
pub struct NewRecord {
    pub id: Option<RecordId>,
    pub created_by: String,
    pub created_on: Option<DateTime<Utc>>,
    pub title: String,
    pub description: String,
    pub content: String,
}

impl NewRecord {
    pub fn new(created_by: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<RecordId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_created_on(mut self, created_on: DateTime<Utc>) -> Self {
        self.created_on = Some(created_on);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Resolve into a validated record committed at `sequence`.
    pub fn into_record(self, sequence: Sequence) -> Result<Record> {
        let created_on = self.created_on.unwrap_or_else(Utc::now);
        let id = self
            .id
            .unwrap_or_else(|| RecordId::generate(created_on, sequence));

        let record = Record {
            id,
            created_by: self.created_by,
            created_on,
            title: self.title,
            description: self.description,
            content: self.content,
        };
        record.validate()?;
        Ok(record)
    }
}

/// Field changes for an update operation.
#[derive(Clone, Debug, Default)]
pub struct RecordChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
}

impl RecordChanges {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

/// Kind of operation recorded in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            OperationKind::Create => 0,
            OperationKind::Update => 1,
            OperationKind::Delete => 2,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(OperationKind::Create),
            1 => Some(OperationKind::Update),
            2 => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

/// An entry of the operation log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub sequence: Sequence,
    pub kind: OperationKind,
    pub record_id: RecordId,
    /// Full resulting document (None for deletes).
    pub document: Option<Record>,
}

impl ChangeEvent {
    /// Take the document if this event created it.
    pub fn into_created(self) -> Option<Record> {
        match self.kind {
            OperationKind::Create => self.document,
            _ => None,
        }
    }
}

/// How far a watch session has consumed the log.
///
/// `offset` is the byte offset for file-backed logs and zero otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CursorPosition {
    /// Next sequence the session will read.
    pub next: Sequence,
    pub offset: u64,
}
