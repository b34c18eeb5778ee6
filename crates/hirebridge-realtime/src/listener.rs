//! Change listener: one subscription at a time, forwarding into the
//! invalidation queue.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ok──▶ Subscribed
//!      ▲                          │                  │
//!      └──────────── error ───────┴── error/close ───┘
//! ```
//!
//! The listener never retries on its own; the connection supervisor decides
//! when to call [`ChangeListener::connect`] again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use hirebridge_core::{FeedMessage, OverflowSignal};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ListenerError;
use crate::metrics;
use crate::source::{ChangeSource, ChangeStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Subscribed,
}

/// Outcome of handing one message to the invalidation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Sent,
    /// The queue stayed full past the enqueue timeout.
    Dropped,
    /// The consumer is gone.
    Closed,
}

/// How the forwarding loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardEnd {
    Cancelled,
    ConsumerGone,
}

pub struct ChangeListener {
    source: Arc<dyn ChangeSource>,
    tables: Vec<String>,
    queue: mpsc::Sender<FeedMessage>,
    overflow: OverflowSignal,
    enqueue_timeout: Duration,
    state: watch::Sender<ListenerState>,
    forwarded: AtomicU64,
}

impl ChangeListener {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        tables: Vec<String>,
        queue: mpsc::Sender<FeedMessage>,
        overflow: OverflowSignal,
        enqueue_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Self {
            source,
            tables,
            queue,
            overflow,
            enqueue_timeout,
            state,
            forwarded: AtomicU64::new(0),
        }
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Events handed to the queue so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Events dropped on a full queue so far.
    pub fn dropped(&self) -> u64 {
        self.overflow.dropped()
    }

    /// Opens a fresh subscription for all watched tables.
    pub async fn connect(&self) -> Result<ChangeStream, ListenerError> {
        self.state.send_replace(ListenerState::Connecting);
        match self.source.subscribe(&self.tables).await {
            Ok(stream) => {
                self.state.send_replace(ListenerState::Subscribed);
                metrics::set_connected(true);
                info!(source = self.source.name(), tables = ?self.tables, "Change feed subscribed");
                Ok(stream)
            }
            Err(e) => {
                self.mark_disconnected();
                Err(e)
            }
        }
    }

    pub fn mark_disconnected(&self) {
        self.state.send_replace(ListenerState::Disconnected);
        metrics::set_connected(false);
    }

    /// Forwards events until the stream fails or ends (an error), or until
    /// `cancel` fires or the consumer goes away.
    pub async fn forward(
        &self,
        mut stream: ChangeStream,
        cancel: &CancellationToken,
    ) -> Result<ForwardEnd, ListenerError> {
        let result = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(ForwardEnd::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    debug!(table = %event.table, kind = %event.kind, "Forwarding change event");
                    metrics::record_feed_event(&event.table);
                    if self.enqueue(FeedMessage::Change(event)).await == Enqueued::Closed {
                        break Ok(ForwardEnd::ConsumerGone);
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Err(ListenerError::Closed),
            }
        };
        self.mark_disconnected();
        result
    }

    /// Hands `message` to the queue, waiting at most `enqueue_timeout` when
    /// it is full. A message that still does not fit is dropped and the
    /// overflow flag raised, so the consumer compensates with a full clear.
    pub async fn enqueue(&self, message: FeedMessage) -> Enqueued {
        let message = match self.queue.try_send(message) {
            Ok(()) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                return Enqueued::Sent;
            }
            Err(TrySendError::Closed(_)) => return Enqueued::Closed,
            Err(TrySendError::Full(message)) => message,
        };

        match self.queue.send_timeout(message, self.enqueue_timeout).await {
            Ok(()) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                Enqueued::Sent
            }
            Err(SendTimeoutError::Closed(_)) => Enqueued::Closed,
            Err(SendTimeoutError::Timeout(_)) => {
                self.overflow.raise();
                metrics::record_dropped_event();
                warn!(
                    timeout_ms = self.enqueue_timeout.as_millis() as u64,
                    dropped_total = self.overflow.dropped(),
                    "Invalidation queue full, dropping change event"
                );
                Enqueued::Dropped
            }
        }
    }
}
