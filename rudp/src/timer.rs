//! Retransmission and connection-level timers.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent if no
//! ACK arrives within a bounded time.  The [`RetransmitScheduler`] keeps one
//! deadline per armed timer and answers two questions for the dispatcher:
//! "when is the next deadline?" and "which timers have expired by `now`?".
//!
//! The scheduler never owns a connection.  Each entry is a back-reference,
//! a [`ConnId`] plus a [`Timer`], resolved through the connection table
//! when it fires.  Segment timers are packet-type agnostic: SYN, DATA and
//! FIN segments all use [`Timer::Retransmit`].

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use crate::table::ConnId;

/// What a deadline is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timer {
    /// Retransmit the in-flight segment with this sequence number.
    Retransmit(u32),
    /// A requested close has waited long enough for in-flight data.
    Drain,
    /// Our FIN is acknowledged but the peer, which still has a sequence
    /// space open towards us, has not sent its own FIN.
    FinWait,
    /// `FIN_RECEIVED` has re-acknowledged retransmitted FINs long enough.
    Linger,
}

/// Deadline bookkeeping for every connection of one endpoint.
#[derive(Debug, Default)]
pub struct RetransmitScheduler {
    /// Ordered by deadline so the earliest is always first.
    queue: BTreeSet<(Instant, ConnId, Timer)>,
    armed: HashMap<(ConnId, Timer), Instant>,
}

impl RetransmitScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the retransmission timer for segment `seq` of `conn`.
    pub fn arm(&mut self, conn: ConnId, seq: u32, deadline: Instant) {
        self.arm_timer(conn, Timer::Retransmit(seq), deadline);
    }

    /// Cancel the retransmission timer for segment `seq` (it was acked).
    pub fn disarm(&mut self, conn: ConnId, seq: u32) -> bool {
        self.disarm_timer(conn, Timer::Retransmit(seq))
    }

    /// Arm `timer`, replacing any deadline it already had.
    pub fn arm_timer(&mut self, conn: ConnId, timer: Timer, deadline: Instant) {
        if let Some(previous) = self.armed.insert((conn, timer), deadline) {
            self.queue.remove(&(previous, conn, timer));
        }
        self.queue.insert((deadline, conn, timer));
    }

    pub fn disarm_timer(&mut self, conn: ConnId, timer: Timer) -> bool {
        match self.armed.remove(&(conn, timer)) {
            Some(deadline) => {
                self.queue.remove(&(deadline, conn, timer));
                true
            }
            None => false,
        }
    }

    /// Cancel every timer belonging to `conn`.
    pub fn disarm_all(&mut self, conn: ConnId) {
        let timers: Vec<Timer> = self
            .armed
            .keys()
            .filter(|(c, _)| *c == conn)
            .map(|(_, t)| *t)
            .collect();
        for timer in timers {
            self.disarm_timer(conn, timer);
        }
    }

    pub fn deadline(&self, conn: ConnId, timer: Timer) -> Option<Instant> {
        self.armed.get(&(conn, timer)).copied()
    }

    /// Earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.first().map(|(deadline, _, _)| *deadline)
    }

    /// Remove and return every timer whose deadline is ≤ `now`, earliest
    /// first.
    pub fn next_expired(&mut self, now: Instant) -> Vec<(ConnId, Timer)> {
        let mut expired = Vec::new();
        while let Some(&(deadline, conn, timer)) = self.queue.first() {
            if deadline > now {
                break;
            }
            self.queue.pop_first();
            self.armed.remove(&(conn, timer));
            expired.push((conn, timer));
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
