//! Per-flow state and window accounting

use super::{TunnelError, INITIAL_WINDOW};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Notify;

/// Lifecycle of one proxied flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Registered, waiting for the dial / ConnectionOpened handshake
    Opening,
    /// Pumping in both directions
    Open,
    /// We have finished sending; still accepting peer data
    HalfClosedLocal,
    /// Peer has finished sending; we may still send
    HalfClosedRemote,
    /// Both directions done
    Closed,
}

impl FlowState {
    /// Our data direction is done (local socket EOF observed)
    pub fn close_local(self) -> Self {
        match self {
            FlowState::Opening | FlowState::Open => FlowState::HalfClosedLocal,
            FlowState::HalfClosedRemote => FlowState::Closed,
            other => other,
        }
    }

    /// Peer's data direction is done (CloseConnection with reason ok)
    pub fn close_remote(self) -> Self {
        match self {
            FlowState::Opening | FlowState::Open => FlowState::HalfClosedRemote,
            FlowState::HalfClosedLocal => FlowState::Closed,
            other => other,
        }
    }

    pub fn is_closed(self) -> bool {
        self == FlowState::Closed
    }
}

/// Byte credit governing how much Data a flow's socket-reader may send
///
/// The invariant is that the window never goes negative: a reader claims
/// credit before reading from its socket and releases whatever it did not
/// use. Peers replenish the window with WindowUpdate credits.
#[derive(Debug)]
pub struct SendWindow {
    available: AtomicI64,
    notify: Notify,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            available: AtomicI64::new(i64::from(initial)),
            notify: Notify::new(),
        }
    }

    /// Claim up to `max` bytes of credit, waiting while the window is empty
    pub async fn claim(&self, max: usize) -> usize {
        loop {
            let avail = self.available.load(Ordering::Acquire);
            if avail > 0 {
                let take = avail.min(max as i64);
                if self
                    .available
                    .compare_exchange(avail, avail - take, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return take as usize;
                }
                continue;
            }
            self.notify.notified().await;
        }
    }

    /// Return unused credit from a previous claim
    pub fn release(&self, n: usize) {
        if n > 0 {
            self.available.fetch_add(n as i64, Ordering::AcqRel);
            self.notify.notify_one();
        }
    }

    /// Apply a WindowUpdate credit from the peer
    pub fn credit(&self, n: u32) {
        self.available.fetch_add(i64::from(n), Ordering::AcqRel);
        self.notify.notify_one();
    }

    pub fn available(&self) -> i64 {
        self.available.load(Ordering::Acquire)
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new(INITIAL_WINDOW)
    }
}

/// Receive-side credit bookkeeping
///
/// Tracks how much of the window we granted the peer is in flight (delivered
/// but not yet credited back). A peer that sends past its credit is a
/// flow-control violation. Refreshes are coalesced to half the window to
/// avoid WindowUpdate chatter.
#[derive(Debug)]
pub struct RecvCredit {
    window: u32,
    /// Bytes delivered towards the local socket, not yet credited back
    in_flight: u32,
    /// Bytes the socket has consumed, awaiting the next coalesced refresh
    pending: u32,
}

impl RecvCredit {
    pub fn new(window: u32) -> Self {
        Self {
            window,
            in_flight: 0,
            pending: 0,
        }
    }

    /// Record `n` bytes arriving from the peer
    pub fn delivered(&mut self, n: usize) -> Result<(), TunnelError> {
        let n = u32::try_from(n).map_err(|_| TunnelError::FlowControl)?;
        self.in_flight = self
            .in_flight
            .checked_add(n)
            .ok_or(TunnelError::FlowControl)?;
        if self.in_flight > self.window {
            return Err(TunnelError::FlowControl);
        }
        Ok(())
    }

    /// Record `n` bytes consumed by the local socket. Returns the credit to
    /// send to the peer once the coalescing threshold is reached.
    pub fn consumed(&mut self, n: usize) -> Result<Option<u32>, TunnelError> {
        let n = u32::try_from(n).map_err(|_| TunnelError::FlowControl)?;
        self.pending = self
            .pending
            .checked_add(n)
            .ok_or(TunnelError::FlowControl)?;
        if self.pending > self.window {
            return Err(TunnelError::FlowControl);
        }
        if self.pending >= self.window / 2 {
            let credit = self.pending;
            self.pending = 0;
            self.in_flight = self.in_flight.saturating_sub(credit);
            Ok(Some(credit))
        } else {
            Ok(None)
        }
    }
}
