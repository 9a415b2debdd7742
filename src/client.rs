//! Reference subscriber keeping an ordered local view of delivered records.
//!
//! Real clients live on the far side of a transport; this one consumes a
//! [`Subscription`] directly and is what the tests and embedders use to
//! observe the feed.

use crate::subscriptions::{Broadcaster, FeedMessage, Subscription};
use crate::types::Record;
use crossbeam_channel::RecvTimeoutError;
use std::time::Duration;

/// Records in delivery order, with a counter bumped on every change.
#[derive(Clone, Debug, Default)]
pub struct LocalView {
    records: Vec<Record>,
    generation: u64,
}

impl LocalView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the message's record. No deduplication.
    pub fn apply(&mut self, message: FeedMessage) {
        match message {
            FeedMessage::RecordCreated { record } => self.records.push(record),
        }
        self.generation += 1;
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn latest(&self) -> Option<&Record> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Changes applied so far; derived state is stale when this moves.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

type RefreshHook = Box<dyn FnMut(&LocalView) + Send>;

/// A connected client.
pub struct SubscriberClient {
    subscription: Subscription,
    view: LocalView,
    on_refresh: Option<RefreshHook>,
}

impl SubscriberClient {
    /// Subscribe; only records published from now on will arrive.
    pub fn connect(broadcaster: &Broadcaster) -> Self {
        Self {
            subscription: broadcaster.subscribe(),
            view: LocalView::new(),
            on_refresh: None,
        }
    }

    /// Called after each poll that changed the view.
    pub fn on_refresh<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&LocalView) + Send + 'static,
    {
        self.on_refresh = Some(Box::new(hook));
        self
    }

    /// Apply everything already delivered. Returns how many records arrived.
    pub fn poll(&mut self) -> usize {
        let applied = self.poll_quiet();
        self.refresh_if(applied)
    }

    /// Wait up to `timeout` for at least one record, then drain the rest.
    pub fn wait(&mut self, timeout: Duration) -> usize {
        match self.subscription.recv_timeout(timeout) {
            Ok(message) => {
                self.view.apply(message);
                let rest = self.poll_quiet();
                self.refresh_if(1 + rest)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    fn poll_quiet(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(message) = self.subscription.try_recv() {
            self.view.apply(message);
            applied += 1;
        }
        applied
    }

    fn refresh_if(&mut self, applied: usize) -> usize {
        if applied > 0 {
            if let Some(ref mut hook) = self.on_refresh {
                hook(&self.view);
            }
        }
        applied
    }

    pub fn view(&self) -> &LocalView {
        &self.view
    }

    /// Records lost because this client fell behind.
    pub fn dropped(&self) -> u64 {
        self.subscription.dropped()
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Unsubscribe, keeping the view.
    pub fn disconnect(self) -> LocalView {
        self.view
    }
}
