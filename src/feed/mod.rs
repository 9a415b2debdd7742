//! Change feed: reading the operation log and forwarding new records.
//!
//! ```text
//!   ChangeLog ──watch──► ChangeFeed ──records──► FeedSupervisor ──publish──► Broadcaster
//!             (cursor, fixed-delay retry)        (creates only)            (fan-out)
//! ```
//!
//! The supervisor owns one reader on a dedicated thread. A single
//! [`CancellationToken`](crate::CancellationToken) stops the supervisor, wakes
//! the reader out of its retry delay and releases the watch session.

mod reader;
mod supervisor;

pub use reader::{ChangeFeed, ChangeFeedReader, PollOutcome};
pub use supervisor::{FeedOutcome, FeedSupervisor};
