//! Connection lifecycle state.
//!
//! Everything the caller and the driver task both touch lives in one
//! [`Lifecycle`] behind one mutex. The guard is never held across an
//! `.await`.

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::driver::DriverHandle;
use super::events::EventHub;
use super::queue::WriteQueue;

/// Status reported by one channel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Created, not yet asked to open.
    NotOpen,
    /// TCP connect or TLS handshake in progress.
    Opening,
    /// Open and idle.
    Open,
    /// The read loop is draining this channel.
    Reading,
    /// A write is in flight on this channel.
    Writing,
    /// The peer closed its side.
    AtEnd,
    /// Closed locally.
    Closed,
    /// The transport failed.
    Error,
}

impl ChannelStatus {
    /// Returns true if the channel counts towards a live connection.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(
            self,
            Self::NotOpen | Self::Opening | Self::Closed | Self::Error
        )
    }
}

/// Coarse connection state derived from both channel handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable connection. Also reported after a transport error while
    /// the handles are still registered.
    Disconnected,
    /// A connect is in flight.
    Connecting,
    /// Both channels are live.
    Open,
}

/// Handles, flags and queue of the current session.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    input: Option<ChannelStatus>,
    output: Option<ChannelStatus>,
    connecting: bool,
    pub(crate) queue: WriteQueue,
    /// Bumped on every register and teardown; a driver whose session no
    /// longer matches is stale and must not touch state or publish.
    session: u64,
    driver: Option<DriverHandle>,
}

impl Lifecycle {
    pub(crate) fn connected(&self) -> bool {
        matches!(
            (self.input, self.output),
            (Some(input), Some(output)) if input.is_live() && output.is_live()
        )
    }

    pub(crate) fn connecting(&self) -> bool {
        self.connecting
            || self.input == Some(ChannelStatus::Opening)
            || self.output == Some(ChannelStatus::Opening)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        if self.connecting() {
            ConnectionState::Connecting
        } else if self.connected() {
            ConnectionState::Open
        } else {
            ConnectionState::Disconnected
        }
    }

    pub(crate) const fn has_handles(&self) -> bool {
        self.input.is_some() || self.output.is_some()
    }

    /// Creates both handles and starts opening them. Returns the new
    /// session id.
    pub(crate) fn register(&mut self) -> u64 {
        self.session += 1;
        self.input = Some(ChannelStatus::NotOpen);
        self.output = Some(ChannelStatus::NotOpen);
        self.connecting = true;
        self.set_input(ChannelStatus::Opening);
        self.set_output(ChannelStatus::Opening);
        self.session
    }

    pub(crate) fn attach_driver(&mut self, driver: DriverHandle) {
        self.driver = Some(driver);
    }

    pub(crate) const fn driver(&self) -> Option<&DriverHandle> {
        self.driver.as_ref()
    }

    #[cfg(test)]
    pub(crate) const fn take_driver(&mut self) -> Option<DriverHandle> {
        self.driver.take()
    }

    /// Releases both handles and pending writes. Returns the driver of the
    /// released session so the caller can decide whether to abort it.
    pub(crate) fn teardown(&mut self) -> Option<DriverHandle> {
        self.session += 1;
        self.set_input(ChannelStatus::Closed);
        self.set_output(ChannelStatus::Closed);
        self.input = None;
        self.output = None;
        self.connecting = false;
        let dropped = self.queue.discard();
        if dropped > 0 {
            tracing::debug!(dropped, "discarded queued writes on close");
        }
        self.driver.take()
    }

    pub(crate) const fn is_current(&self, session: u64) -> bool {
        self.session == session
    }

    /// Updates the input handle's status if the handle exists.
    pub(crate) fn set_input(&mut self, status: ChannelStatus) {
        if let Some(input) = self.input.as_mut() {
            *input = status;
        }
    }

    /// Updates the output handle's status if the handle exists.
    pub(crate) fn set_output(&mut self, status: ChannelStatus) {
        if let Some(output) = self.output.as_mut() {
            *output = status;
        }
    }

    pub(crate) const fn finish_connecting(&mut self) {
        self.connecting = false;
    }
}

/// State shared between a [`Connection`](crate::Connection) and its driver.
#[derive(Debug)]
pub(crate) struct Shared {
    lifecycle: Mutex<Lifecycle>,
    pub(crate) events: EventHub,
}

impl Shared {
    pub(crate) fn new(event_capacity: usize) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::default()),
            events: EventHub::new(event_capacity),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        // The lifecycle stays consistent between statements, so a poisoned
        // lock is still usable.
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
