//! Subscription types for live record delivery.

use super::manager::Registry;
use crate::error::{FeedError, Result};
use crate::types::Record;
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Server→client messages.
///
/// JSON form: `{"type":"RecordCreated","record":{...}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeedMessage {
    /// A record was created in the watched collection.
    RecordCreated { record: Record },
}

impl FeedMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| FeedError::Deserialization(e.to_string()))
    }

    pub fn record(&self) -> &Record {
        match self {
            FeedMessage::RecordCreated { record } => record,
        }
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A live delivery target.
///
/// Dropping the handle unsubscribes it. Once unsubscribed, already queued
/// messages can still be drained, after which receives report disconnection.
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) receiver: Receiver<FeedMessage>,
    pub(crate) dropped: Arc<AtomicU64>,
    pub(crate) registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Receive the next message (blocking).
    pub fn recv(&self) -> std::result::Result<FeedMessage, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<FeedMessage, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<FeedMessage, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Underlying channel, for `select!`.
    pub fn receiver(&self) -> &Receiver<FeedMessage> {
        &self.receiver
    }

    /// Messages discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Messages waiting to be received.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Remove this subscription from its broadcaster. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewRecord, Sequence};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_record_created_wire_format() {
        let record = NewRecord::new("Admin", "My first blog post")
            .with_id("1")
            .with_created_on(Utc.with_ymd_and_hms(2020, 2, 26, 0, 0, 0).unwrap())
            .with_description("A short description")
            .with_content("My very first blog post")
            .into_record(Sequence(1))
            .unwrap();
        let message = FeedMessage::RecordCreated { record };

        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "RecordCreated");
        assert_eq!(json["record"]["id"], "1");
        assert_eq!(json["record"]["createdBy"], "Admin");
        assert_eq!(json["record"]["createdOn"], "2020-02-26T00:00:00Z");

        let parsed = FeedMessage::from_json(&message.to_json().unwrap()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let result = FeedMessage::from_json(r#"{"type":"RecordDeleted","id":"1"}"#);
        assert!(result.is_err());
    }
}
