//! # Chronicle Feed
//!
//! Live fan-out of newly created records from a change-notifying store to
//! connected clients.
//!
//! ## Core Concepts
//!
//! - **Change log**: A store collection that can be watched from "now"
//! - **Change feed**: A cancellable, back-off polling stream of created records
//! - **Supervisor**: Background worker forwarding the feed to subscribers
//! - **Broadcaster**: Non-blocking fan-out with bounded per-subscriber queues
//!
//! ## Example
//!
//! ```ignore
//! use chronicle_feed::{Broadcaster, FeedConfig, FeedSupervisor, FileConnector};
//! use std::sync::Arc;
//!
//! let config = FeedConfig::from_env()?;
//! let broadcaster = Broadcaster::from_config(&config);
//! let supervisor = FeedSupervisor::new(config, Arc::new(FileConnector), broadcaster.clone());
//! supervisor.start()?;
//!
//! let subscription = broadcaster.subscribe();
//! while let Ok(message) = subscription.recv() {
//!     println!("{}", message.to_json()?);
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod feed;
pub mod log;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use cancel::CancellationToken;
pub use client::{LocalView, SubscriberClient};
pub use config::FeedConfig;
pub use error::{FeedError, Result};
pub use feed::{ChangeFeed, ChangeFeedReader, FeedOutcome, FeedSupervisor, PollOutcome};
pub use log::{
    ChangeLog, FileConnector, FileStore, FileStoreConfig, MemoryLog, MemoryStore, OpLog,
    OperationFilter, StoreConnector, WatchSession,
};
pub use subscriptions::{Broadcaster, FeedMessage, Subscription, SubscriptionId};
pub use transport::{pump, FeedConnection, LineConnection, PumpExit, FEED_PATH};
pub use types::{
    ChangeEvent, CursorPosition, NewRecord, OperationKind, Record, RecordChanges, RecordId,
    Sequence,
};
