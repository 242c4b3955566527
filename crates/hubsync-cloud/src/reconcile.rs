//! Resync bookkeeping for the push stream.
//!
//! [`Reconciler`] decides when a full snapshot must be re-pulled and what
//! happens to store-mutating events around that fetch:
//!
//! - a resync request opens a debounce window; further requests inside it
//!   collapse into the same fetch
//! - events arriving while a resync is pending are buffered and discarded
//!   when the fetch starts, since the snapshot supersedes them
//! - events arriving while the fetch is in flight are buffered and replayed
//!   once the snapshot is applied
//!
//! It holds no I/O and takes the current instant as an argument.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use hubsync_devices::ResyncReason;

use crate::envelope::StreamEvent;

/// Result of checking a frame's sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// First id seen on this connection.
    First,
    InOrder,
    /// Ids were skipped.
    Gap { expected: u64, got: u64 },
    /// Id repeated or went backwards.
    Regressed { last: u64, got: u64 },
}

impl SeqCheck {
    pub fn is_discontinuity(&self) -> bool {
        matches!(self, SeqCheck::Gap { .. } | SeqCheck::Regressed { .. })
    }
}

/// Per-account stream position.
///
/// The protocol cannot resume from a sequence id, so the position is reset
/// on every connection.
#[derive(Debug, Clone, Default)]
pub struct SyncCursor {
    last_seq: Option<u64>,
    last_snapshot_at: Option<DateTime<Utc>>,
    snapshots: u64,
    connections: u64,
}

impl SyncCursor {
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn last_snapshot_at(&self) -> Option<DateTime<Utc>> {
        self.last_snapshot_at
    }

    /// Snapshots applied since start.
    pub fn snapshots(&self) -> u64 {
        self.snapshots
    }

    /// Connections authenticated since start.
    pub fn connections(&self) -> u64 {
        self.connections
    }

    pub fn reset_for_connection(&mut self) {
        self.last_seq = None;
        self.connections += 1;
    }

    pub fn observe(&mut self, seq: u64) -> SeqCheck {
        match self.last_seq {
            None => {
                self.last_seq = Some(seq);
                SeqCheck::First
            }
            Some(last) if seq == last.wrapping_add(1) => {
                self.last_seq = Some(seq);
                SeqCheck::InOrder
            }
            Some(last) if seq <= last => {
                // Re-anchor so a restarted numbering counts as one discontinuity.
                self.last_seq = Some(seq);
                SeqCheck::Regressed { last, got: seq }
            }
            Some(last) => {
                self.last_seq = Some(seq);
                SeqCheck::Gap {
                    expected: last + 1,
                    got: seq,
                }
            }
        }
    }

    pub fn snapshot_applied(&mut self) {
        self.snapshots += 1;
        self.last_snapshot_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    reason: ResyncReason,
    due: Instant,
}

/// Resync scheduler and event buffer.
#[derive(Debug)]
pub struct Reconciler {
    debounce: Duration,
    cursor: SyncCursor,
    pending: Option<Pending>,
    in_flight: Option<ResyncReason>,
    buffered: Vec<StreamEvent>,
    discarded: u64,
}

impl Reconciler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            cursor: SyncCursor::default(),
            pending: None,
            in_flight: None,
            buffered: Vec::new(),
            discarded: 0,
        }
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    pub fn observe_seq(&mut self, seq: u64) -> SeqCheck {
        self.cursor.observe(seq)
    }

    /// Events dropped because a snapshot superseded them.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn in_flight(&self) -> Option<ResyncReason> {
        self.in_flight
    }

    /// New connection: reset the cursor and schedule an immediate resync.
    pub fn on_connected(&mut self, now: Instant) {
        self.reset();
        self.cursor.reset_for_connection();
        self.pending = Some(Pending {
            reason: ResyncReason::Connected,
            due: now,
        });
    }

    /// Forget pending work; the connection is gone.
    pub fn reset(&mut self) {
        self.pending = None;
        self.in_flight = None;
        self.buffered.clear();
    }

    /// Ask for a resync. Returns `true` when this opened a new window.
    ///
    /// Full-sync requests during an in-flight fetch are dropped: that fetch
    /// was issued after the signal and already reflects it.
    pub fn request(&mut self, reason: ResyncReason, now: Instant) -> bool {
        if self.in_flight.is_some() && reason == ResyncReason::FullSync {
            debug!(category = "sync", "Full sync during fetch ignored");
            return false;
        }
        let due = match reason {
            ResyncReason::Connected | ResyncReason::Requested => now,
            _ => now + self.debounce,
        };
        match &mut self.pending {
            Some(pending) => {
                if due < pending.due {
                    pending.due = due;
                }
                false
            }
            None => {
                self.pending = Some(Pending { reason, due });
                true
            }
        }
    }

    /// When the pending resync becomes due, if one can start.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.in_flight.is_some() {
            return None;
        }
        self.pending.map(|p| p.due)
    }

    /// Start the pending resync if it is due. Buffered events are discarded.
    pub fn poll_due(&mut self, now: Instant) -> Option<ResyncReason> {
        if self.in_flight.is_some() {
            return None;
        }
        let pending = self.pending.filter(|p| p.due <= now)?;
        self.pending = None;
        self.in_flight = Some(pending.reason);
        self.discarded += self.buffered.len() as u64;
        if !self.buffered.is_empty() {
            debug!(category = "sync", discarded = self.buffered.len(), "Dropping events superseded by snapshot");
        }
        self.buffered.clear();
        Some(pending.reason)
    }

    /// Pass an event through, or hold it while a resync is pending or in
    /// flight. Events that do not touch the store always pass.
    pub fn admit(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        if event.mutates_store() && (self.pending.is_some() || self.in_flight.is_some()) {
            self.buffered.push(event);
            return None;
        }
        Some(event)
    }

    /// Snapshot applied. Returns the events received during the fetch, in
    /// arrival order, for replay.
    pub fn fetch_succeeded(&mut self) -> Vec<StreamEvent> {
        self.in_flight = None;
        self.cursor.snapshot_applied();
        std::mem::take(&mut self.buffered)
    }

    /// Fetch failed; retry after `retry_after`. Buffered events are returned
    /// so the current tree still sees them.
    pub fn fetch_failed(&mut self, now: Instant, retry_after: Duration) -> Vec<StreamEvent> {
        let reason = self.in_flight.take().unwrap_or(ResyncReason::Requested);
        let due = now + retry_after;
        match &mut self.pending {
            Some(pending) => pending.due = pending.due.min(due),
            None => self.pending = Some(Pending { reason, due }),
        }
        std::mem::take(&mut self.buffered)
    }
}
