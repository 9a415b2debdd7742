//! Fan-out of created records to live subscribers.
//!
//! Subscriptions provide:
//! - Delivery of records published after registration (no replay)
//! - Per-subscriber ordering identical to publish order
//! - Bounded queues that drop the oldest message instead of blocking
//! - Implicit unsubscribe when the handle is dropped
//!
//! # Example
//!
//! ```ignore
//! let broadcaster = Broadcaster::new(256);
//! let subscription = broadcaster.subscribe();
//!
//! loop {
//!     match subscription.recv() {
//!         Ok(FeedMessage::RecordCreated { record }) => println!("New post: {}", record.title),
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::Broadcaster;
pub use types::{FeedMessage, Subscription, SubscriptionId};
