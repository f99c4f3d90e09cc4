//! Receive-side sequencing for one direction of a peer connection.
//!
//! [`Receiver`] tracks the peer's sequence space:
//!
//! - The peer's SYN fixes its ISN; the first DATA expected is ISN + 1.
//! - Only the **next expected** segment is accepted.  Duplicates (below the
//!   expected number) and gaps (above it) are discarded; there is no
//!   reordering buffer.
//! - After every segment the caller emits a cumulative ACK carrying
//!   [`Receiver::ack_number`], the last contiguous sequence number received.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use crate::packet::seq_lt;

/// How an inbound SYN relates to what the receiver already knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynArrival {
    /// First SYN: the peer's sequence space is now known.
    Fresh,
    /// Retransmission of the SYN already accepted.
    Repeated,
    /// A SYN with a different ISN than the one already accepted.
    Conflicting { known_isn: u32 },
}

/// How an inbound DATA or FIN segment relates to the expected sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// `seq` was the next expected number; it has been consumed.
    InOrder,
    /// Already received; must not be delivered again.
    Duplicate,
    /// A gap precedes `seq`; discarded.
    Gap,
}

/// Receive-side state for one peer connection.
#[derive(Debug, Default)]
pub struct Receiver {
    peer_isn: Option<u32>,
    /// Next sequence number expected from the peer.
    pub expected: u32,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once the peer's SYN has been accepted.
    pub fn is_synchronized(&self) -> bool {
        self.peer_isn.is_some()
    }

    pub fn peer_isn(&self) -> Option<u32> {
        self.peer_isn
    }

    /// Process the peer's SYN.
    pub fn on_syn(&mut self, seq: u32) -> SynArrival {
        match self.peer_isn {
            None => {
                self.peer_isn = Some(seq);
                self.expected = seq.wrapping_add(1);
                SynArrival::Fresh
            }
            Some(isn) if isn == seq => SynArrival::Repeated,
            Some(known_isn) => SynArrival::Conflicting { known_isn },
        }
    }

    /// Process a DATA or FIN segment.  Only valid once synchronised.
    pub fn on_segment(&mut self, seq: u32) -> Arrival {
        debug_assert!(self.is_synchronized());
        if seq == self.expected {
            self.expected = self.expected.wrapping_add(1);
            Arrival::InOrder
        } else if seq_lt(seq, self.expected) {
            Arrival::Duplicate
        } else {
            Arrival::Gap
        }
    }

    /// Process the peer's FIN.
    ///
    /// A FIN is only sent once everything before it was acknowledged or
    /// abandoned by the sender, so it is accepted even past a gap; the
    /// skipped sequence numbers will never arrive.
    pub fn on_fin(&mut self, seq: u32) -> Arrival {
        debug_assert!(self.is_synchronized());
        if seq_lt(seq, self.expected) {
            return Arrival::Duplicate;
        }
        self.expected = seq.wrapping_add(1);
        Arrival::InOrder
    }

    /// Cumulative ACK value: the last contiguous sequence number received.
    pub fn ack_number(&self) -> u32 {
        self.expected.wrapping_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let r = Receiver::new();
        assert!(!r.is_synchronized());
    }

    #[test]
    fn syn_sets_expected() {
        let mut r = Receiver::new();
        assert_eq!(r.on_syn(41), SynArrival::Fresh);
        assert_eq!(r.expected, 42);
        assert_eq!(r.ack_number(), 41);
    }

    #[test]
    fn repeated_and_conflicting_syn() {
        let mut r = Receiver::new();
        r.on_syn(10);
        assert_eq!(r.on_syn(10), SynArrival::Repeated);
        assert_eq!(r.on_syn(99), SynArrival::Conflicting { known_isn: 10 });
        assert_eq!(r.expected, 11);
    }

    #[test]
    fn in_order_segment_advances() {
        let mut r = Receiver::new();
        r.on_syn(100);
        assert_eq!(r.on_segment(101), Arrival::InOrder);
        assert_eq!(r.on_segment(102), Arrival::InOrder);
        assert_eq!(r.ack_number(), 102);
    }

    #[test]
    fn duplicate_segment_is_not_consumed_twice() {
        let mut r = Receiver::new();
        r.on_syn(100);
        r.on_segment(101);
        assert_eq!(r.on_segment(101), Arrival::Duplicate);
        assert_eq!(r.on_segment(100), Arrival::Duplicate);
        assert_eq!(r.ack_number(), 101);
    }

    #[test]
    fn gap_is_discarded() {
        let mut r = Receiver::new();
        r.on_syn(100);
        assert_eq!(r.on_segment(103), Arrival::Gap);
        assert_eq!(r.ack_number(), 100, "ACK must stay at the last contiguous seq");
        assert_eq!(r.on_segment(101), Arrival::InOrder);
    }

    #[test]
    fn fin_closes_over_abandoned_gap() {
        let mut r = Receiver::new();
        r.on_syn(100);
        r.on_segment(101);
        assert_eq!(r.on_fin(104), Arrival::InOrder);
        assert_eq!(r.ack_number(), 104);
        assert_eq!(r.on_fin(104), Arrival::Duplicate);
        assert_eq!(r.on_segment(102), Arrival::Duplicate);
    }

    #[test]
    fn seq_wrap_around() {
        let mut r = Receiver::new();
        r.on_syn(u32::MAX - 1);
        assert_eq!(r.on_segment(u32::MAX), Arrival::InOrder);
        assert_eq!(r.on_segment(0), Arrival::InOrder);
        assert_eq!(r.on_segment(u32::MAX), Arrival::Duplicate);
        assert_eq!(r.ack_number(), 0);
    }
}
