//! LSN acknowledgement (C7): tracks `last_received`/`last_flushed`/
//! `last_applied` and the auto/manual acknowledgement policy.
//!
//! Encoded as the tagged variant design notes call for:
//! `{Auto, Manual{pending: Option<LSN>}}`. `acknowledge()` is a contract
//! violation (`NoPendingLsn`) in `Auto`; in `Manual` it promotes `pending` to
//! `last_applied`/`last_flushed` and clears it.

use std::sync::Mutex;

use crate::errors::{ReplicationError, ReplicationResult};

/// The acknowledgement policy selected at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckMode {
    Auto,
    Manual,
}

/// Process-wide per-session LSN state (L), guarded by a single short-held
/// mutex. Shared by exactly two roles: the receiver (C5, advances
/// `last_received`) and the acknowledger (C7, advances
/// `last_applied`/`last_flushed`).
#[derive(Debug)]
struct LsnInner {
    last_received: u64,
    last_flushed: u64,
    last_applied: u64,
    /// Set on delivery in manual mode; cleared by `acknowledge()`.
    pending: Option<u64>,
}

pub struct LsnState {
    mode: AckMode,
    inner: Mutex<LsnInner>,
}

impl LsnState {
    pub fn new(auto_acknowledge: bool) -> Self {
        Self {
            mode: if auto_acknowledge {
                AckMode::Auto
            } else {
                AckMode::Manual
            },
            inner: Mutex::new(LsnInner {
                last_received: 0,
                last_flushed: 0,
                last_applied: 0,
                pending: None,
            }),
        }
    }

    pub fn auto_acknowledge(&self) -> bool {
        self.mode == AckMode::Auto
    }

    /// C5 calls this as frames arrive; monotonic max, never regresses.
    pub fn note_received(&self, lsn: u64) {
        let mut inner = self.inner.lock().expect("lsn state mutex poisoned");
        inner.last_received = inner.last_received.max(lsn);
    }

    /// Called when an event is delivered to the consumer. In auto mode,
    /// `last_applied`/`last_flushed` advance immediately; in manual mode the
    /// LSN is only staged as `pending` until an explicit `acknowledge()`.
    pub fn note_delivered(&self, commit_lsn: u64) {
        let mut inner = self.inner.lock().expect("lsn state mutex poisoned");
        match self.mode {
            AckMode::Auto => {
                inner.last_applied = inner.last_applied.max(commit_lsn);
                inner.last_flushed = inner.last_flushed.max(commit_lsn);
            }
            AckMode::Manual => {
                inner.pending = Some(commit_lsn);
            }
        }
    }

    /// Promote `pending` to `last_applied`/`last_flushed`. Fails
    /// `NoPendingLsn` in auto mode, or in manual mode with nothing pending.
    pub fn acknowledge(&self) -> ReplicationResult<u64> {
        if self.mode == AckMode::Auto {
            return Err(ReplicationError::NoPendingLsn);
        }
        let mut inner = self.inner.lock().expect("lsn state mutex poisoned");
        match inner.pending.take() {
            Some(lsn) => {
                inner.last_applied = inner.last_applied.max(lsn);
                inner.last_flushed = inner.last_flushed.max(lsn);
                Ok(lsn)
            }
            None => Err(ReplicationError::NoPendingLsn),
        }
    }

    pub fn snapshot(&self) -> LsnSnapshot {
        let inner = self.inner.lock().expect("lsn state mutex poisoned");
        LsnSnapshot {
            last_received: inner.last_received,
            last_flushed: inner.last_flushed,
            last_applied: inner.last_applied,
            pending: inner.pending,
        }
    }

    /// Forces `last_applied` (and, implicitly, the next feedback frame) up to
    /// `last_received` — used by `stop()`'s final StandbyStatusUpdate.
    pub fn mark_applied_through_received(&self) {
        let mut inner = self.inner.lock().expect("lsn state mutex poisoned");
        inner.last_applied = inner.last_applied.max(inner.last_received);
        inner.last_flushed = inner.last_flushed.max(inner.last_received);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LsnSnapshot {
    pub last_received: u64,
    pub last_flushed: u64,
    pub last_applied: u64,
    pub pending: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_mode_advances_on_delivery_and_rejects_ack() {
        let state = LsnState::new(true);
        state.note_received(100);
        state.note_delivered(100);

        let snap = state.snapshot();
        assert_eq!(snap.last_applied, 100);
        assert_eq!(snap.last_flushed, 100);

        match state.acknowledge() {
            Err(ReplicationError::NoPendingLsn) => {}
            other => panic!("expected NoPendingLsn, got {other:?}"),
        }
    }

    #[test]
    fn manual_mode_stages_then_promotes_on_acknowledge() {
        let state = LsnState::new(false);
        state.note_received(200);
        state.note_delivered(200);

        let before_ack = state.snapshot();
        assert_eq!(before_ack.last_applied, 0);
        assert_eq!(before_ack.pending, Some(200));

        let acked = state.acknowledge().unwrap();
        assert_eq!(acked, 200);

        let after_ack = state.snapshot();
        assert_eq!(after_ack.last_applied, 200);
        assert_eq!(after_ack.last_flushed, 200);
        assert_eq!(after_ack.pending, None);
    }

    #[test]
    fn manual_mode_ack_without_delivery_fails() {
        let state = LsnState::new(false);
        match state.acknowledge() {
            Err(ReplicationError::NoPendingLsn) => {}
            other => panic!("expected NoPendingLsn, got {other:?}"),
        }
    }

    #[test]
    fn lsn_state_is_monotonic() {
        let state = LsnState::new(true);
        state.note_received(50);
        state.note_received(10); // out-of-order frame arrival, should not regress
        assert_eq!(state.snapshot().last_received, 50);
    }
}
