//! Background task that forwards newly created records to the broadcaster.

use super::reader::ChangeFeedReader;
use crate::cancel::CancellationToken;
use crate::config::FeedConfig;
use crate::error::{FeedError, Result};
use crate::log::{OperationFilter, StoreConnector};
use crate::subscriptions::Broadcaster;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Capacity of the failure channel handed to the hosting process.
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// How a supervisor run ended.
#[derive(Clone, Debug)]
pub enum FeedOutcome {
    /// Stopped by the cancellation signal. Not a failure.
    Cancelled,
    /// The feed could not continue; restart policy belongs to the host.
    Failed(Arc<FeedError>),
}

impl FeedOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FeedOutcome::Cancelled)
    }

    pub fn error(&self) -> Option<&FeedError> {
        match self {
            FeedOutcome::Cancelled => None,
            FeedOutcome::Failed(e) => Some(e),
        }
    }
}

/// Owns the lifetime of "listen for new records and forward them".
///
/// The supervisor runs one [`ChangeFeed`](super::ChangeFeed) on a dedicated
/// thread: it connects to the store, watches the configured collection for
/// create operations only, and publishes every record in log order. Publishing
/// never blocks on subscribers.
///
/// Fatal errors end the run, are logged, and are sent on [`errors`](Self::errors)
/// for the hosting process. Cancellation ends the run quietly.
///
/// The worker runs on a child of the signal passed to
/// [`with_cancellation`](Self::with_cancellation): the shared signal stops it,
/// but [`stop`](Self::stop) and dropping the supervisor only fire the child.
pub struct FeedSupervisor {
    config: FeedConfig,
    connector: Arc<dyn StoreConnector>,
    broadcaster: Broadcaster,
    cancel: CancellationToken,
    errors_tx: Sender<Arc<FeedError>>,
    errors_rx: Receiver<Arc<FeedError>>,
    forwarded: Arc<AtomicU64>,
    started: AtomicBool,
    worker: Mutex<Option<JoinHandle<FeedOutcome>>>,
}

impl FeedSupervisor {
    /// Create a supervisor with its own cancellation signal.
    pub fn new(
        config: FeedConfig,
        connector: Arc<dyn StoreConnector>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self::with_cancellation(config, connector, broadcaster, CancellationToken::new())
    }

    /// Create a supervisor stopped by an existing (e.g. process-wide) signal.
    pub fn with_cancellation(
        config: FeedConfig,
        connector: Arc<dyn StoreConnector>,
        broadcaster: Broadcaster,
        shutdown: CancellationToken,
    ) -> Self {
        let (errors_tx, errors_rx) = bounded(ERROR_CHANNEL_CAPACITY);
        Self {
            config,
            connector,
            broadcaster,
            cancel: shutdown.child(),
            errors_tx,
            errors_rx,
            forwarded: Arc::new(AtomicU64::new(0)),
            started: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker thread. A supervisor runs at most once.
    pub fn start(&self) -> Result<()> {
        self.config.validate()?;

        if self.started.swap(true, Ordering::AcqRel) {
            return Err(FeedError::InvalidOperation(
                "feed supervisor already started".into(),
            ));
        }

        let worker = Worker {
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            broadcaster: self.broadcaster.clone(),
            cancel: self.cancel.clone(),
            errors: self.errors_tx.clone(),
            forwarded: Arc::clone(&self.forwarded),
        };

        let handle = thread::Builder::new()
            .name("feed-supervisor".to_string())
            .spawn(move || worker.run())?;
        *self.worker.lock() = Some(handle);

        tracing::info!(
            collection = %self.config.collection,
            retry_delay_ms = self.config.retry_delay.as_millis() as u64,
            "Feed supervisor started"
        );
        Ok(())
    }

    /// Signal the worker to stop. Does not wait, and never fires the shared
    /// signal this supervisor was created with.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the worker to finish. `None` if it was never started or was
    /// already joined.
    pub fn join(&self) -> Option<FeedOutcome> {
        let handle = self.worker.lock().take()?;
        Some(
            handle
                .join()
                .unwrap_or_else(|_| FeedOutcome::Failed(Arc::new(FeedError::WorkerPanicked))),
        )
    }

    /// Stop and wait.
    pub fn shutdown(&self) -> Option<FeedOutcome> {
        self.stop();
        self.join()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Fatal failures, for the hosting process' restart/alerting policy.
    pub fn errors(&self) -> Receiver<Arc<FeedError>> {
        self.errors_rx.clone()
    }

    /// Records handed to the broadcaster so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// The worker's own signal, a child of the shared one.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }
}

impl Drop for FeedSupervisor {
    /// Dropping a supervisor stops its worker and waits for it.
    fn drop(&mut self) {
        if self.worker.lock().is_some() {
            self.shutdown();
        }
    }
}

/// State moved onto the worker thread.
struct Worker {
    config: FeedConfig,
    connector: Arc<dyn StoreConnector>,
    broadcaster: Broadcaster,
    cancel: CancellationToken,
    errors: Sender<Arc<FeedError>>,
    forwarded: Arc<AtomicU64>,
}

impl Worker {
    fn run(self) -> FeedOutcome {
        match self.consume() {
            Ok(()) => {
                tracing::info!(
                    collection = %self.config.collection,
                    forwarded = self.forwarded.load(Ordering::Relaxed),
                    "Feed supervisor stopped"
                );
                FeedOutcome::Cancelled
            }
            Err(e) => {
                let e = Arc::new(e);
                tracing::error!(
                    collection = %self.config.collection,
                    error = %e,
                    "Feed supervisor failed"
                );
                if let Err(TrySendError::Full(_)) = self.errors.try_send(Arc::clone(&e)) {
                    tracing::warn!("Feed error channel full, failure not reported");
                }
                FeedOutcome::Failed(e)
            }
        }
    }

    /// Returns `Ok` only when the feed ended through cancellation.
    fn consume(&self) -> Result<()> {
        let log = self
            .connector
            .connect(&self.config.connection, &self.config.collection)?;
        let reader = ChangeFeedReader::new(log, self.config.retry_delay);
        let feed = reader.produce(OperationFilter::creates_only(), self.cancel.clone())?;

        for record in feed {
            let record = record?;
            tracing::debug!(id = %record.id, "Forwarding record");
            self.broadcaster.publish(record);
            self.forwarded.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }
}
