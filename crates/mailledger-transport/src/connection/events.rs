//! Event fan-out for connection activity.
//!
//! A connection publishes on three independent broadcast channels:
//!
//! - **data**: one `Bytes` buffer per read-readiness notification
//! - **status**: [`StatusEvent`]s describing the connection lifecycle
//! - **activity**: `true` while the read loop drains the socket, `false` after
//!
//! Events are delivered to the subscribers attached at the moment of
//! sending. A receiver created later never sees earlier events, and an
//! event sent while nobody listens is dropped.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::Error;

/// Lifecycle notification published on the status channel.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// The output channel finished opening; the connection is usable.
    OpenCompleted,
    /// The transport reported an error outside a direct write call.
    ///
    /// The connection is **not** torn down by this event. Call
    /// [`Connection::close`](crate::Connection::close) to release it.
    ErrorOccurred(Option<Arc<Error>>),
    /// The peer closed the stream. The connection has already been closed
    /// when this event is observed.
    EndEncountered,
}

impl StatusEvent {
    /// Returns true for [`StatusEvent::ErrorOccurred`].
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::ErrorOccurred(_))
    }

    /// Returns the error detail carried by an `ErrorOccurred` event.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::ErrorOccurred(detail) => detail.as_deref(),
            _ => None,
        }
    }
}

/// Sending side of the three event channels.
#[derive(Debug)]
pub(crate) struct EventHub {
    data: broadcast::Sender<Bytes>,
    status: broadcast::Sender<StatusEvent>,
    activity: broadcast::Sender<bool>,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        // broadcast::channel panics on zero capacity
        let capacity = capacity.max(1);
        let (data, _) = broadcast::channel(capacity);
        let (status, _) = broadcast::channel(capacity);
        let (activity, _) = broadcast::channel(capacity);
        Self {
            data,
            status,
            activity,
        }
    }

    pub(crate) fn subscribe_data(&self) -> broadcast::Receiver<Bytes> {
        self.data.subscribe()
    }

    pub(crate) fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub(crate) fn subscribe_activity(&self) -> broadcast::Receiver<bool> {
        self.activity.subscribe()
    }

    // A send error only means there is no subscriber right now.

    pub(crate) fn received(&self, data: Bytes) {
        let _ = self.data.send(data);
    }

    pub(crate) fn status(&self, event: StatusEvent) {
        let _ = self.status.send(event);
    }

    pub(crate) fn error(&self, detail: Error) {
        self.status(StatusEvent::ErrorOccurred(Some(Arc::new(detail))));
    }

    pub(crate) fn activity(&self, reading: bool) {
        let _ = self.activity.send(reading);
    }
}
