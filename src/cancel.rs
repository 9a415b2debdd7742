//! Process-wide cancellation signal.
//!
//! Cancelling drops the only sender of an internal channel, so every waiter
//! parked on the receiver wakes at once with `Disconnected`. Waiting is a
//! blocking park on the channel, never a spin.
//!
//! A [`child`](CancellationToken::child) token is cancelled with its parent
//! but can also be cancelled alone, leaving the parent untouched.

use crossbeam_channel::{bounded, Receiver, Select, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Inner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    waiter: Receiver<()>,
    parent: Option<CancellationToken>,
}

/// Cloneable handle; all clones observe the same cancellation.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<CancellationToken>) -> Self {
        let (trigger, waiter) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                waiter,
                parent,
            }),
        }
    }

    /// New token cancelled whenever this one is. Cancelling the child does
    /// not propagate upwards.
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.trigger.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
            || self.inner.parent.as_ref().map_or(false, |p| p.is_cancelled())
    }

    /// Park for up to `timeout`. Returns true if cancelled meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }

        let waiters = self.waiters();
        let mut select = Select::new();
        for waiter in &waiters {
            select.recv(waiter);
        }
        match select.select_timeout(timeout) {
            Ok(op) => {
                let index = op.index();
                // Only ever disconnected; the value is irrelevant.
                let _ = op.recv(waiters[index]);
                true
            }
            Err(_) => self.is_cancelled(),
        }
    }

    /// Receivers that become ready (disconnected) when this token is
    /// cancelled, own first then ancestors. Register all of them in a
    /// [`Select`] to wait for cancellation alongside other channels.
    pub fn waiters(&self) -> Vec<&Receiver<()>> {
        let mut waiters = vec![&self.inner.waiter];
        let mut current = self.inner.parent.as_ref();
        while let Some(token) = current {
            waiters.push(&token.inner.waiter);
            current = token.inner.parent.as_ref();
        }
        waiters
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("child", &self.inner.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_when_not_cancelled() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();

        let handle = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = waiter.wait_timeout(Duration::from_secs(10));
            (cancelled, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        let (cancelled, waited) = handle.join().unwrap();
        assert!(cancelled);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.wait_timeout(Duration::from_secs(10)));
    }

    #[test]
    fn test_parent_cancels_child() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();

        let handle = {
            let grandchild = grandchild.clone();
            thread::spawn(move || grandchild.wait_timeout(Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(20));
        parent.cancel();

        assert!(handle.join().unwrap());
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(child.wait_timeout(Duration::from_secs(10)));
        assert!(!parent.is_cancelled());
        assert!(!parent.wait_timeout(Duration::from_millis(10)));
        assert_eq!(child.waiters().len(), 2);
    }
}
