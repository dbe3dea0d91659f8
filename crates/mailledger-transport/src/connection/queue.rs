//! Outbound write queue with readiness-latched flow control.
//!
//! Buffers submitted while the output channel cannot take them wait here in
//! submission order. Each write-readiness signal releases exactly one head
//! buffer. A readiness signal that finds the queue empty is remembered in the
//! latch so the next submission can skip the queue.

use std::collections::VecDeque;

use bytes::Bytes;

/// Where a submitted buffer went.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Submission {
    /// Latch consumed; the caller must hand the buffer to the transport now.
    Direct(Bytes),
    /// Appended to the tail of the queue.
    Queued,
}

/// FIFO of pending writes plus the readiness latch.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    pending: VecDeque<Bytes>,
    ready: bool,
}

impl WriteQueue {
    /// Submits a buffer. `open` says whether the output channel is open and
    /// present.
    pub(crate) fn submit(&mut self, data: Bytes, open: bool) -> Submission {
        if open && self.ready {
            self.ready = false;
            Submission::Direct(data)
        } else {
            self.pending.push_back(data);
            Submission::Queued
        }
    }

    /// Handles one write-readiness signal.
    ///
    /// Returns the head buffer to write, or `None` after setting the latch
    /// when nothing is pending.
    pub(crate) fn on_writable(&mut self) -> Option<Bytes> {
        let head = self.pending.pop_front();
        if head.is_none() {
            self.ready = true;
        }
        head
    }

    /// Re-arms the latch after a direct write could not be handed over.
    pub(crate) const fn restore_latch(&mut self) {
        self.ready = true;
    }

    /// Puts back a buffer the transport accepted zero bytes of.
    ///
    /// It goes to the tail, so ordering is kept only if nothing else was
    /// queued in the meantime.
    pub(crate) fn requeue(&mut self, data: Bytes) {
        self.pending.push_back(data);
    }

    /// Puts back the unwritten remainder of a partial write at the head.
    pub(crate) fn requeue_front(&mut self, remainder: Bytes) {
        self.pending.push_front(remainder);
    }

    /// Drops every pending buffer and the latch. Returns how many buffers
    /// were discarded.
    pub(crate) fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.ready = false;
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) const fn is_ready(&self) -> bool {
        self.ready
    }
}
