//! Turns a watch session into an endless, pull-based sequence of records.

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::log::{ChangeLog, OperationFilter, WatchSession};
use crate::types::{CursorPosition, Record};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Result of one poll step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// This many records were queued for delivery.
    Delivered(usize),
    /// Nothing new; the retry delay elapsed without cancellation.
    Idle,
    /// Cancellation fired; the session has been released.
    Cancelled,
}

/// Opens change feeds over a log.
pub struct ChangeFeedReader {
    log: Arc<dyn ChangeLog>,
    retry_delay: Duration,
}

impl ChangeFeedReader {
    pub fn new(log: Arc<dyn ChangeLog>, retry_delay: Duration) -> Self {
        Self { log, retry_delay }
    }

    /// Open a watch session at the log tail and wrap it in a feed.
    ///
    /// Failing to open the session is returned as is; it is not retried.
    pub fn produce(
        &self,
        filter: OperationFilter,
        cancel: CancellationToken,
    ) -> Result<ChangeFeed> {
        let session = self.log.watch(filter)?;
        Ok(ChangeFeed {
            session: Some(session),
            pending: VecDeque::new(),
            cancel,
            retry_delay: self.retry_delay,
            idle_polls: 0,
        })
    }
}

/// Lazy, infinite sequence of records from one watch session.
///
/// Iteration ends (`None`) only after cancellation or after a fatal error has
/// been yielded. The session is released on every exit path, including when
/// the feed is dropped mid-iteration.
pub struct ChangeFeed {
    session: Option<Box<dyn WatchSession>>,
    pending: VecDeque<Record>,
    cancel: CancellationToken,
    retry_delay: Duration,
    idle_polls: u64,
}

impl ChangeFeed {
    /// Run one poll: fetch a batch, or wait out the retry delay if empty.
    pub fn poll(&mut self) -> Result<PollOutcome> {
        if self.cancel.is_cancelled() {
            self.close();
            return Ok(PollOutcome::Cancelled);
        }

        let polled = match self.session.as_mut() {
            Some(session) => session.next_batch(),
            // Closed after an earlier fatal error or cancellation.
            None => return Ok(PollOutcome::Cancelled),
        };

        let batch = match polled {
            Ok(batch) => batch,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };

        if batch.is_empty() {
            self.idle_polls += 1;
            if self.cancel.wait_timeout(self.retry_delay) {
                self.close();
                return Ok(PollOutcome::Cancelled);
            }
            return Ok(PollOutcome::Idle);
        }

        let before = self.pending.len();
        self.pending
            .extend(batch.into_iter().filter_map(|event| event.document));
        Ok(PollOutcome::Delivered(self.pending.len() - before))
    }

    /// Release the watch session. Further iteration yields nothing.
    pub fn close(&mut self) {
        self.pending.clear();
        self.session = None;
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Resume position of the open session.
    pub fn position(&self) -> Option<CursorPosition> {
        self.session.as_ref().map(|s| s.position())
    }

    /// Polls that found nothing new.
    pub fn idle_polls(&self) -> u64 {
        self.idle_polls
    }
}

impl Iterator for ChangeFeed {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cancel.is_cancelled() {
                self.close();
                return None;
            }

            if let Some(record) = self.pending.pop_front() {
                return Some(Ok(record));
            }

            match self.poll() {
                Ok(PollOutcome::Cancelled) => return None,
                Ok(PollOutcome::Idle) | Ok(PollOutcome::Delivered(_)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use crate::log::MemoryLog;
    use crate::types::{NewRecord, RecordChanges};
    use std::thread;
    use std::time::Instant;

    fn post(title: &str) -> NewRecord {
        NewRecord::new("Admin", title).with_content("body")
    }

    fn reader(log: &MemoryLog, delay_ms: u64) -> ChangeFeedReader {
        ChangeFeedReader::new(Arc::new(log.clone()), Duration::from_millis(delay_ms))
    }

    #[test]
    fn test_yields_in_log_order_across_batches() {
        let log = MemoryLog::new("posts");
        let mut feed = reader(&log, 10)
            .produce(OperationFilter::creates_only(), CancellationToken::new())
            .unwrap();

        log.insert(post("a")).unwrap();
        log.insert(post("b")).unwrap();
        assert_eq!(feed.next().unwrap().unwrap().title, "a");

        log.insert(post("c")).unwrap();
        assert_eq!(feed.next().unwrap().unwrap().title, "b");
        assert_eq!(feed.next().unwrap().unwrap().title, "c");
    }

    #[test]
    fn test_empty_poll_waits_then_resumes() {
        let log = MemoryLog::new("posts");
        let delay = Duration::from_millis(40);
        let mut feed = reader(&log, 40)
            .produce(OperationFilter::creates_only(), CancellationToken::new())
            .unwrap();

        let start = Instant::now();
        assert_eq!(feed.poll().unwrap(), PollOutcome::Idle);
        assert!(start.elapsed() >= delay);
        assert_eq!(feed.idle_polls(), 1);

        log.insert(post("late")).unwrap();
        assert_eq!(feed.poll().unwrap(), PollOutcome::Delivered(1));
        assert_eq!(feed.next().unwrap().unwrap().title, "late");
    }

    #[test]
    fn test_consecutive_empty_polls_spaced_by_delay() {
        let log = MemoryLog::new("posts");
        let delay = Duration::from_millis(25);
        let mut feed = reader(&log, 25)
            .produce(OperationFilter::creates_only(), CancellationToken::new())
            .unwrap();

        for _ in 0..3 {
            assert_eq!(feed.poll().unwrap(), PollOutcome::Idle);
        }

        let times = log.poll_times();
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= delay);
        }
    }

    #[test]
    fn test_non_create_operations_filtered() {
        let log = MemoryLog::new("posts");
        let existing = log.insert(post("existing")).unwrap();
        let mut feed = reader(&log, 10)
            .produce(OperationFilter::creates_only(), CancellationToken::new())
            .unwrap();

        log.update(&existing.id, &RecordChanges::title("edited")).unwrap();
        log.delete(&existing.id).unwrap();
        assert_eq!(feed.poll().unwrap(), PollOutcome::Idle);

        log.insert(post("fresh")).unwrap();
        assert_eq!(feed.next().unwrap().unwrap().title, "fresh");
    }

    #[test]
    fn test_cancel_during_wait_ends_cleanly() {
        let log = MemoryLog::new("posts");
        let cancel = CancellationToken::new();
        let feed = reader(&log, 10_000)
            .produce(OperationFilter::creates_only(), cancel.clone())
            .unwrap();
        assert_eq!(log.open_sessions(), 1);

        let handle = thread::spawn(move || {
            let mut feed = feed;
            let item = feed.next().map(|r| r.is_ok());
            (item, feed.is_open())
        });

        thread::sleep(Duration::from_millis(30));
        cancel.cancel();

        let (item, open) = handle.join().unwrap();
        assert_eq!(item, None);
        assert!(!open);
        assert_eq!(log.open_sessions(), 0);
    }

    #[test]
    fn test_watch_failure_propagates() {
        let log = MemoryLog::new("posts");
        log.fail_next_watch("connection refused");

        let result =
            reader(&log, 10).produce(OperationFilter::creates_only(), CancellationToken::new());
        assert!(matches!(result, Err(FeedError::Connection(_))));
        assert_eq!(log.open_sessions(), 0);
    }

    #[test]
    fn test_session_error_yielded_once_then_ends() {
        let log = MemoryLog::new("posts");
        let mut feed = reader(&log, 10)
            .produce(OperationFilter::creates_only(), CancellationToken::new())
            .unwrap();

        log.fail_next_poll("socket closed");
        assert!(matches!(feed.next(), Some(Err(FeedError::Connection(_)))));
        assert!(feed.next().is_none());
        assert_eq!(log.open_sessions(), 0);
    }

    #[test]
    fn test_dropping_feed_releases_session() {
        let log = MemoryLog::new("posts");
        let feed = reader(&log, 10)
            .produce(OperationFilter::creates_only(), CancellationToken::new())
            .unwrap();
        assert_eq!(log.open_sessions(), 1);

        drop(feed);
        assert_eq!(log.open_sessions(), 0);
    }
}
