//! Per-stream flow control.
//!
//! Each stream carries two windows:
//!
//! - [`SendWindow`]: credit the peer has granted us. Writers reserve from it
//!   and park when it is empty; WindowUpdate frames add to it.
//! - [`RecvWindow`]: credit we have granted the peer. Inbound Data consumes
//!   it; as the reader drains the buffer the consumed credit is returned in
//!   one WindowUpdate once it reaches half the initial window.
//!
//! Window updates carry deltas, so applying them is commutative.
//!
//! The types here are plain bookkeeping with no locking or waking; the
//! stream owns them behind its mutex.

use crate::error::{Error, Result};

/// Credit this side may still send on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    available: u32,
}

impl SendWindow {
    /// Create a window with `initial` bytes of credit.
    pub fn new(initial: u32) -> Self {
        Self { available: initial }
    }

    /// Bytes that may be sent right now.
    #[inline]
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Check whether writers must wait for a WindowUpdate.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.available == 0
    }

    /// Take up to `wanted` bytes of credit and return how many were granted.
    ///
    /// Returns 0 when the window is exhausted; never goes below zero.
    pub fn reserve(&mut self, wanted: usize) -> u32 {
        let granted = wanted.min(self.available as usize) as u32;
        self.available -= granted;
        granted
    }

    /// Apply a WindowUpdate delta.
    ///
    /// A delta that would overflow the 32-bit window is rejected and leaves
    /// the window unchanged.
    pub fn grant(&mut self, delta: u32) -> Result<()> {
        self.available = self.available.checked_add(delta).ok_or_else(|| {
            Error::protocol(format!(
                "window update of {} overflows send window {}",
                delta, self.available
            ))
        })?;
        Ok(())
    }
}

/// Credit granted to the peer, and bytes received but not yet read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWindow {
    initial: u32,
    remaining: u32,
    buffered: u32,
}

impl RecvWindow {
    /// Create a window advertising `initial` bytes.
    pub fn new(initial: u32) -> Self {
        Self {
            initial,
            remaining: initial,
            buffered: 0,
        }
    }

    /// Credit the peer still holds.
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Bytes received and not yet consumed by the reader.
    #[inline]
    pub fn buffered(&self) -> u32 {
        self.buffered
    }

    /// Account for an inbound Data payload of `len` bytes.
    ///
    /// Fails if the peer sent more than it was allowed to.
    pub fn on_data(&mut self, len: u32) -> Result<()> {
        if len > self.remaining {
            return Err(Error::protocol(format!(
                "peer sent {} bytes with only {} bytes of window",
                len, self.remaining
            )));
        }
        self.remaining -= len;
        self.buffered += len;
        Ok(())
    }

    /// Account for `n` bytes handed to the reader.
    ///
    /// Returns the delta to send in a WindowUpdate when enough credit has
    /// been consumed; the window is restored to its initial size.
    pub fn on_consume(&mut self, n: u32) -> Option<u32> {
        debug_assert!(n <= self.buffered);
        self.buffered = self.buffered.saturating_sub(n);

        let returnable = self.initial - self.remaining - self.buffered;
        if returnable > 0 && returnable >= self.initial / 2 {
            self.remaining += returnable;
            Some(returnable)
        } else {
            None
        }
    }

    /// Forget buffered bytes (stream reset).
    pub fn discard(&mut self) {
        self.buffered = 0;
    }
}
