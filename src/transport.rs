//! Transport boundary for real-time clients.
//!
//! Clients hold a persistent connection on [`FEED_PATH`]. The server pushes
//! one JSON text frame per [`FeedMessage`]; nothing flows the other way.
//! Framework glue (WebSocket upgrade, SSE, ...) implements [`FeedConnection`]
//! and hands each accepted connection to [`pump`].

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::subscriptions::{FeedMessage, Subscription};
use crossbeam_channel::Select;
use std::io::{self, Write};

/// Fixed endpoint path of the feed.
pub const FEED_PATH: &str = "/feed";

/// Outbound half of a client connection.
pub trait FeedConnection {
    /// Send one text frame. An error means the client is gone.
    fn send_text(&mut self, frame: &str) -> io::Result<()>;
}

/// Newline-delimited JSON over any byte stream (e.g. a `TcpStream`).
pub struct LineConnection<W: Write> {
    writer: W,
}

impl<W: Write> LineConnection<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> FeedConnection for LineConnection<W> {
    fn send_text(&mut self, frame: &str) -> io::Result<()> {
        self.writer.write_all(frame.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Why a pump stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpExit {
    /// Shutdown signal fired.
    Cancelled,
    /// Sending failed; the client disconnected.
    Disconnected,
    /// The subscription was removed from its broadcaster.
    Unsubscribed,
}

/// Forward a subscription's messages to a connection until shutdown or
/// disconnect. The subscription is dropped (unsubscribed) on return.
///
/// Only encoding failures are errors; a vanished client is a normal exit.
pub fn pump<C: FeedConnection>(
    subscription: Subscription,
    connection: &mut C,
    cancel: &CancellationToken,
) -> Result<PumpExit> {
    let id = subscription.id();
    tracing::debug!(subscription = %id, path = FEED_PATH, "Client connected");

    let exit = loop {
        if cancel.is_cancelled() {
            break PumpExit::Cancelled;
        }

        let waiters = cancel.waiters();
        let mut select = Select::new();
        let inbox = select.recv(subscription.receiver());
        for waiter in &waiters {
            select.recv(waiter);
        }

        let op = select.select();
        let index = op.index();
        let message: FeedMessage = if index == inbox {
            match op.recv(subscription.receiver()) {
                Ok(message) => message,
                Err(_) => break PumpExit::Unsubscribed,
            }
        } else {
            let _ = op.recv(waiters[index - inbox - 1]);
            break PumpExit::Cancelled;
        };

        let frame = message.to_json()?;
        if let Err(e) = connection.send_text(&frame) {
            tracing::debug!(subscription = %id, error = %e, "Client send failed");
            break PumpExit::Disconnected;
        }
    };

    tracing::debug!(subscription = %id, exit = ?exit, "Client pump finished");
    Ok(exit)
}
