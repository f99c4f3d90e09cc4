//! Send-side window for one direction of a peer connection.
//!
//! [`Sender`] owns our sequence space towards the peer: the SYN that opens
//! it, the DATA segments carrying application bytes, and the FIN that closes
//! it.  Segments wait in an admission queue until the window has room and
//! the handshake allows them out.
//!
//! # Protocol contract
//!
//! - Every segment consumes exactly one sequence number; the SYN carries the
//!   initial sequence number (ISN) and the first DATA segment carries ISN + 1.
//! - At most `window_size` segments are in flight at once.  The window is
//!   ordered by sequence number, appended at the back on admission and
//!   trimmed at the front on acknowledgement; never reordered in place.
//! - ACKs are **cumulative**: `ack = S` acknowledges every segment whose
//!   sequence number is ≤ `S`.
//! - DATA and FIN are only admitted once our SYN has been acknowledged.  A
//!   FIN is only admitted once the window is otherwise empty.
//!
//! This module only manages state; the caller transmits the packets it
//! returns and arms their timers.

use std::collections::VecDeque;
use std::time::Instant;

use crate::packet::{seq_le, seq_lt, Packet, PacketType};

// ---------------------------------------------------------------------------
// SendEntry
// ---------------------------------------------------------------------------

/// A single in-flight segment occupying one slot in the window.
#[derive(Debug, Clone)]
pub struct SendEntry {
    /// The segment exactly as first transmitted; retransmissions reuse it.
    pub packet: Packet,
    pub acked: bool,
    /// Time of the most recent transmission.
    pub last_sent: Instant,
    /// Number of retransmissions so far (0 after the first send).
    pub retries: u32,
}

/// Sequence number and kind of a segment released by an ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acked {
    pub seq: u32,
    pub kind: PacketType,
}

/// Why an ACK could not be applied to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRejection {
    /// Nothing has been transmitted in our sequence space yet.
    NotStarted,
    /// The ACK names a sequence number we have not transmitted.
    Unsent { ack: u32, highest_sent: u32 },
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Send-side state for one peer connection.
///
/// ```text
///   highest_acked   window (in flight)      queue (not admitted)   next_seq
///        │        ┌────┬────┬────┐        ┌────┬────┬────┐            │
///  ──────┼────────┤ s  │s+1 │s+2 ├────────┤s+3 │s+4 │FIN ├────────────┼──▶
///        │        └────┴────┴────┘        └────┴────┴────┘            │
/// ```
#[derive(Debug)]
pub struct Sender {
    isn: Option<u32>,
    /// Sequence number the next enqueued segment will carry.
    pub next_seq: u32,
    /// Highest sequence number the peer has acknowledged.
    pub highest_acked: Option<u32>,
    synchronized: bool,
    window_size: usize,
    window: VecDeque<SendEntry>,
    queue: VecDeque<Packet>,
}

impl Sender {
    /// Create an idle sender.  `window_size` is the maximum number of
    /// outstanding segments (≥ 1).
    pub fn new(window_size: usize) -> Self {
        assert!(window_size >= 1, "window_size must be at least 1");
        Self {
            isn: None,
            next_seq: 0,
            highest_acked: None,
            synchronized: false,
            window_size,
            window: VecDeque::with_capacity(window_size),
            queue: VecDeque::new(),
        }
    }

    /// `true` once a SYN has been issued in this sequence space.
    pub fn is_started(&self) -> bool {
        self.isn.is_some()
    }

    /// `true` once the peer has acknowledged our SYN.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn isn(&self) -> Option<u32> {
        self.isn
    }

    /// Open the sequence space at `isn`.
    ///
    /// The SYN goes straight into the (empty) window; the returned packet is
    /// ready to transmit.
    pub fn start(&mut self, isn: u32, now: Instant) -> Packet {
        debug_assert!(!self.is_started(), "sequence space already opened");
        debug_assert!(self.window.is_empty());
        let syn = Packet::syn(isn);
        self.isn = Some(isn);
        self.next_seq = isn.wrapping_add(1);
        self.push_window(syn.clone(), now);
        syn
    }

    /// Split `payload` into segments of at most `mss` bytes and queue them.
    ///
    /// Returns the number of segments queued.  An empty payload still queues
    /// one empty segment so the peer observes the send.
    pub fn enqueue_data(&mut self, payload: &[u8], mss: usize) -> usize {
        if payload.is_empty() {
            self.enqueue(PacketType::Data, Vec::new());
            return 1;
        }
        let mut count = 0;
        for chunk in payload.chunks(mss) {
            self.enqueue(PacketType::Data, chunk.to_vec());
            count += 1;
        }
        count
    }

    /// Queue the FIN that closes our sequence space.
    pub fn enqueue_fin(&mut self) -> u32 {
        self.enqueue(PacketType::Fin, Vec::new())
    }

    fn enqueue(&mut self, kind: PacketType, payload: Vec<u8>) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let packet = match kind {
            PacketType::Fin => Packet::fin(seq),
            _ => Packet::data(seq, payload),
        };
        self.queue.push_back(packet);
        seq
    }

    fn push_window(&mut self, packet: Packet, now: Instant) {
        debug_assert!(
            self.window.len() < self.window_size,
            "window overflow ({} / {})",
            self.window.len(),
            self.window_size
        );
        self.window.push_back(SendEntry {
            packet,
            acked: false,
            last_sent: now,
            retries: 0,
        });
    }

    /// Move queued segments into free window slots.
    ///
    /// Returns the admitted packets in sequence order; the caller transmits
    /// each one and arms its timer.
    pub fn admit(&mut self, now: Instant) -> Vec<Packet> {
        let mut admitted = Vec::new();
        if !self.synchronized {
            return admitted;
        }
        while self.window.len() < self.window_size {
            let Some(front) = self.queue.front() else {
                break;
            };
            if front.kind == PacketType::Fin && !self.window.is_empty() {
                break;
            }
            let Some(packet) = self.queue.pop_front() else {
                break;
            };
            self.push_window(packet.clone(), now);
            admitted.push(packet);
        }
        admitted
    }

    /// Apply a cumulative ACK.
    ///
    /// Evicts every window entry with sequence ≤ `ack` from the front and
    /// returns them.  A stale ACK (below the window) returns an empty list;
    /// an ACK for a sequence number never transmitted is rejected.
    pub fn on_ack(&mut self, ack: u32) -> Result<Vec<Acked>, AckRejection> {
        if !self.is_started() {
            return Err(AckRejection::NotStarted);
        }
        let Some(back) = self.window.back() else {
            return Ok(Vec::new());
        };
        let highest_sent = back.packet.seq;
        if seq_lt(highest_sent, ack) {
            return Err(AckRejection::Unsent { ack, highest_sent });
        }

        let mut acked = Vec::new();
        while let Some(front) = self.window.front_mut() {
            if !seq_le(front.packet.seq, ack) {
                break;
            }
            front.acked = true;
            let kind = front.packet.kind;
            let seq = front.packet.seq;
            self.window.pop_front();
            if kind == PacketType::Syn {
                self.synchronized = true;
            }
            acked.push(Acked { seq, kind });
        }
        if !acked.is_empty() {
            self.highest_acked = Some(ack);
        }
        Ok(acked)
    }

    /// Drop every DATA segment, in flight or queued.
    ///
    /// Returns the sequence numbers of every dropped segment, in-flight ones
    /// first, so their timers can be disarmed.  SYN and FIN segments are kept.
    pub fn discard_data(&mut self) -> Vec<u32> {
        let mut dropped = Vec::new();
        self.window.retain(|e| {
            let keep = e.packet.kind != PacketType::Data;
            if !keep {
                dropped.push(e.packet.seq);
            }
            keep
        });
        self.queue.retain(|p| {
            let keep = p.kind != PacketType::Data;
            if !keep {
                dropped.push(p.seq);
            }
            keep
        });
        dropped
    }

    pub fn entry_mut(&mut self, seq: u32) -> Option<&mut SendEntry> {
        self.window.iter_mut().find(|e| e.packet.seq == seq)
    }

    /// Iterate over all in-flight segments from oldest to newest.
    pub fn window_entries(&self) -> impl Iterator<Item = &SendEntry> {
        self.window.iter()
    }

    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// `true` when a FIN is in flight or waiting for admission.
    pub fn fin_pending(&self) -> bool {
        self.queue.iter().any(|p| p.kind == PacketType::Fin)
            || self.window.iter().any(|e| e.packet.kind == PacketType::Fin)
    }

    /// `true` when nothing is in flight or queued.
    pub fn is_drained(&self) -> bool {
        self.window.is_empty() && self.queue.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn started(window: usize, isn: u32) -> (Sender, Instant) {
        let now = Instant::now();
        let mut s = Sender::new(window);
        s.start(isn, now);
        (s, now)
    }

    #[test]
    fn start_places_syn_in_window() {
        let (s, _) = started(3, 100);
        assert_eq!(s.isn(), Some(100));
        assert_eq!(s.next_seq, 101);
        assert_eq!(s.in_flight(), 1);
        assert!(!s.is_synchronized());
    }

    #[test]
    fn data_waits_for_syn_ack() {
        let (mut s, now) = started(3, 100);
        s.enqueue_data(b"abc", 1000);
        assert!(s.admit(now).is_empty());
        assert_eq!(s.queued(), 1);

        let acked = s.on_ack(100).unwrap();
        assert_eq!(acked, vec![Acked { seq: 100, kind: PacketType::Syn }]);
        assert!(s.is_synchronized());

        let admitted = s.admit(now);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].seq, 101);
        assert_eq!(admitted[0].payload, b"abc");
    }

    #[test]
    fn payload_is_segmented_by_mss() {
        let (mut s, _) = started(3, 0);
        assert_eq!(s.enqueue_data(&[7u8; 25], 10), 3);
        assert_eq!(s.next_seq, 4);
    }

    #[test]
    fn window_limits_admission() {
        let (mut s, now) = started(2, 0);
        s.on_ack(0).unwrap();
        s.enqueue_data(&[0u8; 50], 10); // 5 segments
        let admitted = s.admit(now);
        assert_eq!(admitted.len(), 2);
        assert_eq!(s.in_flight(), 2);
        assert_eq!(s.queued(), 3);
    }

    #[test]
    fn cumulative_ack_evicts_front_and_frees_slots() {
        let (mut s, now) = started(3, 0);
        s.on_ack(0).unwrap();
        s.enqueue_data(&[0u8; 50], 10);
        s.admit(now); // seqs 1, 2, 3

        let acked = s.on_ack(2).unwrap();
        assert_eq!(acked.iter().map(|a| a.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(s.highest_acked, Some(2));

        let admitted = s.admit(now);
        assert_eq!(admitted.iter().map(|p| p.seq).collect::<Vec<_>>(), vec![4, 5]);
        let order: Vec<u32> = s.window_entries().map(|e| e.packet.seq).collect();
        assert_eq!(order, vec![3, 4, 5]);
    }

    #[test]
    fn duplicate_ack_releases_nothing() {
        let (mut s, now) = started(3, 0);
        s.on_ack(0).unwrap();
        s.enqueue_data(b"a", 10);
        s.admit(now);
        assert_eq!(s.on_ack(1).unwrap().len(), 1);
        assert!(s.on_ack(1).unwrap().is_empty());
        assert!(s.on_ack(0).unwrap().is_empty());
    }

    #[test]
    fn ack_beyond_transmitted_is_rejected() {
        let (mut s, _) = started(3, 10);
        assert_eq!(
            s.on_ack(50),
            Err(AckRejection::Unsent { ack: 50, highest_sent: 10 })
        );
        assert_eq!(s.in_flight(), 1);
    }

    #[test]
    fn ack_before_start_is_rejected() {
        let mut s = Sender::new(3);
        assert_eq!(s.on_ack(1), Err(AckRejection::NotStarted));
    }

    #[test]
    fn fin_waits_for_empty_window() {
        let (mut s, now) = started(3, 0);
        s.on_ack(0).unwrap();
        s.enqueue_data(b"x", 10);
        let fin_seq = s.enqueue_fin();
        assert_eq!(fin_seq, 2);

        let admitted = s.admit(now);
        assert_eq!(admitted.len(), 1);
        assert!(s.fin_pending());

        s.on_ack(1).unwrap();
        let admitted = s.admit(now);
        assert_eq!(admitted[0].kind, PacketType::Fin);
        assert_eq!(s.on_ack(2).unwrap()[0].kind, PacketType::Fin);
        assert!(s.is_drained());
    }

    #[test]
    fn discard_data_keeps_control_segments() {
        let (mut s, now) = started(3, 0);
        s.on_ack(0).unwrap();
        s.enqueue_data(&[0u8; 40], 10);
        s.admit(now);
        s.enqueue_fin();
        let dropped = s.discard_data();
        assert_eq!(dropped, vec![1, 2, 3, 4], "window and queue alike");
        assert_eq!(s.in_flight(), 0);
        assert_eq!(s.queued(), 1);
        assert_eq!(s.admit(now)[0].kind, PacketType::Fin);
    }

    #[test]
    fn seq_wrap_around() {
        let (mut s, now) = started(3, u32::MAX);
        s.on_ack(u32::MAX).unwrap();
        s.enqueue_data(&[0u8; 20], 10);
        let admitted = s.admit(now);
        assert_eq!(admitted[0].seq, 0);
        assert_eq!(admitted[1].seq, 1);
        assert_eq!(s.on_ack(1).unwrap().len(), 2);
    }
}
