//! Per-peer connection state machine.
//!
//! A [`PeerConnection`] owns the complete protocol state for one remote
//! address under one endpoint:
//! - Driving the finite-state machine (see [`crate::state`]).
//! - Coordinating [`crate::sender`] (our sequence space) and
//!   [`crate::receiver`] (the peer's sequence space).
//! - Reacting to inbound packets and to expired timers.
//!
//! It performs no I/O.  Datagrams to transmit, timers to arm, and payloads
//! or events for the application are all written into the [`Effects`] the
//! caller passes in.  Each triggering event produces each side effect
//! exactly once, so a duplicated inbound packet can at most trigger a
//! duplicate ACK, never a duplicate delivery.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng;
use thiserror::Error;

use crate::config::RudpConfig;
use crate::engine::{LifecycleEvent, Notification, SendRejected, Transmit};
use crate::packet::{Packet, PacketType};
use crate::receiver::{Arrival, Receiver, SynArrival};
use crate::sender::{AckRejection, Sender};
use crate::state::ConnectionState;
use crate::table::ConnId;
use crate::timer::{RetransmitScheduler, Timer};

/// Side-effect sinks shared by every connection of an endpoint.
#[derive(Debug)]
pub struct Effects<'a> {
    pub now: Instant,
    pub timers: &'a mut RetransmitScheduler,
    pub transmits: &'a mut VecDeque<Transmit>,
    pub notifications: &'a mut VecDeque<Notification>,
}

/// An inbound packet that does not fit the connection's current state.
///
/// The packet is dropped and the connection state is left unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("{kind} from {peer} with no connection")]
    NoConnection { kind: PacketType, peer: SocketAddr },
    #[error("{kind} before the peer's SYN")]
    NotSynchronized { kind: PacketType },
    #[error("SYN with ISN {got} conflicts with accepted ISN {known}")]
    ConflictingSyn { known: u32, got: u32 },
    #[error("ACK {ack} before anything was sent")]
    AckWithoutSend { ack: u32 },
    #[error("ACK {ack} beyond highest sent sequence {highest_sent}")]
    AckUnsent { ack: u32, highest_sent: u32 },
    #[error("{kind} in state {state}")]
    UnexpectedPacket {
        kind: PacketType,
        state: ConnectionState,
    },
}

/// Protocol state for one remote address.
#[derive(Debug)]
pub struct PeerConnection {
    id: ConnId,
    remote: SocketAddr,
    config: RudpConfig,
    state: ConnectionState,
    /// Our sequence space towards the peer.
    pub sender: Sender,
    /// The peer's sequence space towards us.
    pub receiver: Receiver,
    close_requested: bool,
    /// The peer's FIN has been accepted.
    peer_closed: bool,
}

impl PeerConnection {
    pub fn new(id: ConnId, remote: SocketAddr, config: RudpConfig) -> Self {
        Self {
            id,
            remote,
            config,
            state: ConnectionState::Idle,
            sender: Sender::new(config.window_size),
            receiver: Receiver::new(),
            close_requested: false,
            peer_closed: false,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// `true` while this connection carries application data from us.
    pub fn is_sending(&self) -> bool {
        self.sender.is_started() && !self.is_closed()
    }

    // -----------------------------------------------------------------------
    // Application requests
    // -----------------------------------------------------------------------

    /// Queue `payload` for reliable delivery to the peer.
    ///
    /// Opens our sequence space with a SYN on first use.  Segments are
    /// admitted into the window as soon as the SYN is acknowledged.
    pub fn send(&mut self, payload: &[u8], fx: &mut Effects<'_>) -> Result<(), SendRejected> {
        if self.state.is_tearing_down() || self.close_requested {
            return Err(SendRejected::ConnectionClosing { peer: self.remote });
        }
        if !self.sender.is_started() {
            self.open_sequence_space(fx);
        }
        let segments = self
            .sender
            .enqueue_data(payload, self.config.max_segment_size);
        log::debug!(
            "[rudp] {} queued {} byte(s) as {} segment(s)",
            self.remote,
            payload.len(),
            segments
        );
        self.pump(fx);
        Ok(())
    }

    /// Start an orderly teardown.
    ///
    /// The FIN follows every queued segment; if the window has not drained
    /// within `drain_timeout` the remaining DATA is abandoned and the FIN is
    /// sent anyway.
    pub fn close(&mut self, fx: &mut Effects<'_>) {
        if self.state == ConnectionState::Idle {
            self.set_state(ConnectionState::Closed);
            return;
        }
        if self.state.is_tearing_down() || self.close_requested {
            return;
        }
        self.queue_fin(fx);
    }

    /// Tear the session down because the peer has opened a new one.
    ///
    /// Anything of ours still unacknowledged is abandoned; the peer no
    /// longer knows our sequence space.
    pub fn reset(&mut self, fx: &mut Effects<'_>) {
        let dropped = self.sender.discard_data();
        if !dropped.is_empty() {
            log::warn!(
                "[rudp] {} reset with {} segment(s) undelivered",
                self.remote,
                dropped.len()
            );
            self.notify(LifecycleEvent::Abandoned, fx);
        }
        self.finish(LifecycleEvent::Closed, fx);
    }

    // -----------------------------------------------------------------------
    // Inbound packets
    // -----------------------------------------------------------------------

    /// Apply one decoded packet received from the peer.
    pub fn on_packet(
        &mut self,
        packet: &Packet,
        fx: &mut Effects<'_>,
    ) -> Result<(), ProtocolViolation> {
        log::debug!(
            "[rudp] {} ← {} seq={} len={} ({})",
            self.remote,
            packet.kind,
            packet.seq,
            packet.payload.len(),
            self.state
        );
        if self.is_closed() {
            return Err(ProtocolViolation::UnexpectedPacket {
                kind: packet.kind,
                state: self.state,
            });
        }
        match packet.kind {
            PacketType::Syn => self.on_syn(packet.seq, fx),
            PacketType::Ack => self.on_ack(packet.seq, fx),
            PacketType::Data => self.on_data(packet, fx),
            PacketType::Fin => self.on_fin(packet.seq, fx),
        }
    }

    fn on_syn(&mut self, seq: u32, fx: &mut Effects<'_>) -> Result<(), ProtocolViolation> {
        match self.receiver.on_syn(seq) {
            SynArrival::Fresh => {
                self.transmit(&Packet::ack(seq), fx);
                match self.state {
                    ConnectionState::Idle => {
                        self.set_state(ConnectionState::SynReceived);
                        self.establish(fx);
                    }
                    ConnectionState::SynSent => self.establish(fx),
                    _ => {}
                }
                Ok(())
            }
            SynArrival::Repeated => {
                self.transmit(&Packet::ack(self.receiver.ack_number()), fx);
                Ok(())
            }
            SynArrival::Conflicting { known_isn } => Err(ProtocolViolation::ConflictingSyn {
                known: known_isn,
                got: seq,
            }),
        }
    }

    fn on_ack(&mut self, ack: u32, fx: &mut Effects<'_>) -> Result<(), ProtocolViolation> {
        let acked = self.sender.on_ack(ack).map_err(|rejection| match rejection {
            AckRejection::NotStarted => ProtocolViolation::AckWithoutSend { ack },
            AckRejection::Unsent { ack, highest_sent } => {
                ProtocolViolation::AckUnsent { ack, highest_sent }
            }
        })?;
        if acked.is_empty() {
            log::debug!("[rudp] {} duplicate ACK {}", self.remote, ack);
            return Ok(());
        }

        let mut fin_acked = false;
        for segment in &acked {
            fx.timers.disarm(self.id, segment.seq);
            match segment.kind {
                PacketType::Syn if self.state == ConnectionState::SynSent => self.establish(fx),
                PacketType::Fin => fin_acked = true,
                _ => {}
            }
        }
        if fin_acked {
            if self.peer_closed {
                self.linger(fx);
            } else if self.receiver.is_synchronized() {
                // The peer's own stream is still open; it may have data for us.
                log::debug!("[rudp] {} FIN acknowledged; awaiting peer FIN", self.remote);
                fx.timers.arm_timer(
                    self.id,
                    Timer::FinWait,
                    fx.now + self.config.fin_wait_timeout(),
                );
            } else {
                self.finish(LifecycleEvent::Closed, fx);
            }
            return Ok(());
        }
        self.pump(fx);
        Ok(())
    }

    fn on_data(&mut self, packet: &Packet, fx: &mut Effects<'_>) -> Result<(), ProtocolViolation> {
        if !self.receiver.is_synchronized() {
            return Err(ProtocolViolation::NotSynchronized {
                kind: PacketType::Data,
            });
        }
        match self.receiver.on_segment(packet.seq) {
            Arrival::InOrder => fx.notifications.push_back(Notification::Data {
                from: self.remote,
                payload: packet.payload.clone(),
            }),
            Arrival::Duplicate => {
                log::debug!("[rudp] {} duplicate DATA seq={}", self.remote, packet.seq)
            }
            Arrival::Gap => log::debug!(
                "[rudp] {} DATA seq={} ahead of expected {}; dropped",
                self.remote,
                packet.seq,
                self.receiver.expected
            ),
        }
        self.transmit(&Packet::ack(self.receiver.ack_number()), fx);
        Ok(())
    }

    fn on_fin(&mut self, seq: u32, fx: &mut Effects<'_>) -> Result<(), ProtocolViolation> {
        if !self.receiver.is_synchronized() {
            return Err(ProtocolViolation::NotSynchronized {
                kind: PacketType::Fin,
            });
        }
        let expected = self.receiver.expected;
        let arrival = self.receiver.on_fin(seq);
        if arrival == Arrival::InOrder && expected != seq {
            log::warn!(
                "[rudp] {} FIN seq={} skips abandoned segments from {}",
                self.remote,
                seq,
                expected
            );
        }
        self.transmit(&Packet::ack(self.receiver.ack_number()), fx);
        if arrival != Arrival::InOrder {
            return Ok(());
        }
        self.peer_closed = true;
        if self.state == ConnectionState::FinSent {
            // A drained sender in FIN_SENT means our FIN was acknowledged.
            if self.sender.is_drained() {
                self.linger(fx);
            }
            return Ok(());
        }
        if !self.sender.is_started() {
            self.linger(fx);
            return Ok(());
        }

        // Our stream is still open: keep delivering what is pending, then
        // close it with our own FIN.
        log::debug!(
            "[rudp] {} peer closed; {} segment(s) of ours still pending",
            self.remote,
            self.sender.in_flight() + self.sender.queued()
        );
        self.set_state(ConnectionState::FinReceived);
        if self.close_requested {
            self.pump(fx);
        } else {
            self.queue_fin(fx);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// React to one of this connection's timers expiring.
    pub fn on_timer(&mut self, timer: Timer, fx: &mut Effects<'_>) {
        if self.is_closed() {
            return;
        }
        match timer {
            Timer::Retransmit(seq) => self.retransmit(seq, fx),
            Timer::Drain => self.drain_expired(fx),
            Timer::FinWait => {
                log::warn!("[rudp] {} peer never sent its FIN; closing", self.remote);
                self.finish(LifecycleEvent::Closed, fx);
            }
            Timer::Linger => self.finish(LifecycleEvent::Closed, fx),
        }
    }

    fn retransmit(&mut self, seq: u32, fx: &mut Effects<'_>) {
        let max_retries = self.config.max_retries;
        let Some(entry) = self.sender.entry_mut(seq) else {
            return;
        };
        entry.retries += 1;
        if entry.retries > max_retries {
            log::warn!(
                "[rudp] {} {} seq={} unacknowledged after {} retransmission(s); giving up",
                self.remote,
                entry.packet.kind,
                seq,
                max_retries
            );
            self.finish(LifecycleEvent::TimedOut, fx);
            return;
        }
        entry.last_sent = fx.now;
        let packet = entry.packet.clone();
        log::debug!(
            "[rudp] {} retransmit {} seq={} (retry {})",
            self.remote,
            packet.kind,
            seq,
            entry.retries
        );
        self.send_segment(&packet, fx);
    }

    fn drain_expired(&mut self, fx: &mut Effects<'_>) {
        let dropped = self.sender.discard_data();
        for seq in &dropped {
            fx.timers.disarm(self.id, *seq);
        }
        if !dropped.is_empty() {
            log::warn!(
                "[rudp] {} drain timeout; abandoning {} undelivered segment(s)",
                self.remote,
                dropped.len()
            );
            self.notify(LifecycleEvent::Abandoned, fx);
        }
        if !self.sender.is_synchronized() {
            log::warn!("[rudp] {} handshake incomplete at drain timeout", self.remote);
            self.finish(LifecycleEvent::Closed, fx);
            return;
        }
        self.pump(fx);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn open_sequence_space(&mut self, fx: &mut Effects<'_>) {
        let isn: u32 = rand::rng().random();
        let syn = self.sender.start(isn, fx.now);
        self.send_segment(&syn, fx);
        if self.state == ConnectionState::Idle {
            self.set_state(ConnectionState::SynSent);
        }
    }

    /// Queue our FIN behind everything pending and bound the wait for the
    /// window to drain.
    fn queue_fin(&mut self, fx: &mut Effects<'_>) {
        self.close_requested = true;
        if !self.sender.is_started() {
            self.open_sequence_space(fx);
        }
        let fin_seq = self.sender.enqueue_fin();
        log::debug!("[rudp] {} closing; FIN will be seq={}", self.remote, fin_seq);
        fx.timers
            .arm_timer(self.id, Timer::Drain, fx.now + self.config.drain_timeout);
        self.pump(fx);
    }

    /// Nothing of ours is pending: stay around to re-acknowledge
    /// retransmitted FINs.
    fn linger(&mut self, fx: &mut Effects<'_>) {
        fx.timers.disarm_all(self.id);
        self.set_state(ConnectionState::FinReceived);
        fx.timers
            .arm_timer(self.id, Timer::Linger, fx.now + self.config.linger_timeout);
    }

    /// Admit queued segments into free window slots and transmit them.
    fn pump(&mut self, fx: &mut Effects<'_>) {
        if self.is_closed() {
            return;
        }
        for packet in self.sender.admit(fx.now) {
            if packet.kind == PacketType::Fin {
                fx.timers.disarm_timer(self.id, Timer::Drain);
                self.set_state(ConnectionState::FinSent);
            }
            self.send_segment(&packet, fx);
        }
    }

    fn establish(&mut self, fx: &mut Effects<'_>) {
        self.set_state(ConnectionState::Established);
        self.notify(LifecycleEvent::Connected, fx);
        self.pump(fx);
    }

    fn notify(&self, event: LifecycleEvent, fx: &mut Effects<'_>) {
        fx.notifications.push_back(Notification::Event {
            peer: self.remote,
            event,
        });
    }

    /// Transition to `Closed`, cancelling every timer and raising `event`.
    fn finish(&mut self, event: LifecycleEvent, fx: &mut Effects<'_>) {
        if self.is_closed() {
            return;
        }
        fx.timers.disarm_all(self.id);
        self.set_state(ConnectionState::Closed);
        self.notify(event, fx);
    }

    /// Transmit a window segment and arm its retransmission timer.
    fn send_segment(&self, packet: &Packet, fx: &mut Effects<'_>) {
        self.transmit(packet, fx);
        fx.timers.arm(
            self.id,
            packet.seq,
            fx.now + self.config.retransmit_interval,
        );
    }

    fn transmit(&self, packet: &Packet, fx: &mut Effects<'_>) {
        log::debug!(
            "[rudp] {} → {} seq={} len={}",
            self.remote,
            packet.kind,
            packet.seq,
            packet.payload.len()
        );
        fx.transmits.push_back(Transmit {
            dest: self.remote,
            bytes: packet.encode(),
        });
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            log::info!("[rudp] {} {} → {}", self.remote, self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Harness {
        now: Instant,
        timers: RetransmitScheduler,
        transmits: VecDeque<Transmit>,
        notifications: VecDeque<Notification>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                now: Instant::now(),
                timers: RetransmitScheduler::new(),
                transmits: VecDeque::new(),
                notifications: VecDeque::new(),
            }
        }

        fn fx(&mut self) -> Effects<'_> {
            Effects {
                now: self.now,
                timers: &mut self.timers,
                transmits: &mut self.transmits,
                notifications: &mut self.notifications,
            }
        }

        fn sent(&mut self) -> Vec<Packet> {
            self.transmits
                .drain(..)
                .map(|t| Packet::decode(&t.bytes).unwrap())
                .collect()
        }

        fn events(&mut self) -> Vec<LifecycleEvent> {
            self.notifications
                .drain(..)
                .filter_map(|n| match n {
                    Notification::Event { event, .. } => Some(event),
                    Notification::Data { .. } => None,
                })
                .collect()
        }
    }

    fn config() -> RudpConfig {
        RudpConfig::default()
            .with_retransmit_interval(Duration::from_millis(100))
            .with_max_retries(2)
            .with_window_size(2)
            .with_max_segment_size(4)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:6000".parse().unwrap()
    }

    /// Initiator that has sent its SYN; returns the ISN.
    fn syn_sent(h: &mut Harness) -> (PeerConnection, u32) {
        let mut c = PeerConnection::new(ConnId(1), peer(), config());
        c.send(b"hello world", &mut h.fx()).unwrap();
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketType::Syn);
        (c, sent[0].seq)
    }

    #[test]
    fn send_from_idle_emits_syn_only() {
        let mut h = Harness::new();
        let (c, _) = syn_sent(&mut h);
        assert_eq!(c.state(), ConnectionState::SynSent);
        assert_eq!(c.sender.queued(), 3);
        assert_eq!(h.timers.len(), 1);
    }

    #[test]
    fn syn_ack_establishes_and_admits_window() {
        let mut h = Harness::new();
        let (mut c, isn) = syn_sent(&mut h);
        c.on_packet(&Packet::ack(isn), &mut h.fx()).unwrap();

        assert_eq!(c.state(), ConnectionState::Established);
        assert_eq!(h.events(), vec![LifecycleEvent::Connected]);
        let sent = h.sent();
        assert_eq!(sent.len(), 2, "window of two");
        assert_eq!(sent[0], Packet::data(isn.wrapping_add(1), b"hell".to_vec()));
        assert_eq!(sent[1], Packet::data(isn.wrapping_add(2), b"o wo".to_vec()));
    }

    #[test]
    fn duplicate_ack_advances_window_once() {
        let mut h = Harness::new();
        let (mut c, isn) = syn_sent(&mut h);
        c.on_packet(&Packet::ack(isn), &mut h.fx()).unwrap();
        h.sent();

        let ack = Packet::ack(isn.wrapping_add(1));
        c.on_packet(&ack, &mut h.fx()).unwrap();
        assert_eq!(h.sent().len(), 1, "one slot freed, one segment admitted");
        c.on_packet(&ack, &mut h.fx()).unwrap();
        assert!(h.sent().is_empty());
        assert_eq!(c.sender.in_flight(), 2);
    }

    #[test]
    fn responder_acks_syn_and_delivers_in_order() {
        let mut h = Harness::new();
        let mut c = PeerConnection::new(ConnId(2), peer(), config());
        c.on_packet(&Packet::syn(500), &mut h.fx()).unwrap();
        assert_eq!(c.state(), ConnectionState::Established);
        assert_eq!(h.sent(), vec![Packet::ack(500)]);
        assert_eq!(h.events(), vec![LifecycleEvent::Connected]);

        c.on_packet(&Packet::data(502, b"late".to_vec()), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::ack(500)], "gap acks last contiguous");
        assert!(h.notifications.is_empty());

        c.on_packet(&Packet::data(501, b"first".to_vec()), &mut h.fx()).unwrap();
        c.on_packet(&Packet::data(501, b"first".to_vec()), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::ack(501), Packet::ack(501)]);
        assert_eq!(h.notifications.len(), 1, "duplicate must not be re-delivered");
    }

    #[test]
    fn repeated_syn_is_reacked_without_new_event() {
        let mut h = Harness::new();
        let mut c = PeerConnection::new(ConnId(2), peer(), config());
        c.on_packet(&Packet::syn(7), &mut h.fx()).unwrap();
        h.sent();
        h.events();
        c.on_packet(&Packet::syn(7), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::ack(7)]);
        assert!(h.events().is_empty());
        assert_eq!(
            c.on_packet(&Packet::syn(8), &mut h.fx()),
            Err(ProtocolViolation::ConflictingSyn { known: 7, got: 8 })
        );
    }

    #[test]
    fn data_before_syn_is_a_violation() {
        let mut h = Harness::new();
        let (mut c, _) = syn_sent(&mut h);
        let err = c.on_packet(&Packet::data(1, vec![1]), &mut h.fx()).unwrap_err();
        assert_eq!(err, ProtocolViolation::NotSynchronized { kind: PacketType::Data });
        assert_eq!(c.state(), ConnectionState::SynSent);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn retransmission_is_verbatim() {
        let mut h = Harness::new();
        let (mut c, isn) = syn_sent(&mut h);
        h.now += Duration::from_millis(100);
        for (conn, timer) in h.timers.next_expired(h.now) {
            assert_eq!(conn, ConnId(1));
            c.on_timer(timer, &mut h.fx());
        }
        assert_eq!(h.sent(), vec![Packet::syn(isn)]);
        assert_eq!(c.sender.window_entries().next().unwrap().retries, 1);
    }

    #[test]
    fn exhausted_retries_time_out_once() {
        let mut h = Harness::new();
        let (mut c, _) = syn_sent(&mut h);
        for _ in 0..10 {
            h.now += Duration::from_millis(100);
            for (_, timer) in h.timers.next_expired(h.now) {
                c.on_timer(timer, &mut h.fx());
            }
        }
        assert!(c.is_closed());
        assert_eq!(h.events(), vec![LifecycleEvent::TimedOut]);
        assert_eq!(h.sent().len(), 2, "max_retries retransmissions");
        assert!(h.timers.is_empty());
    }

    #[test]
    fn close_sends_fin_after_window_drains() {
        let mut h = Harness::new();
        let mut c = PeerConnection::new(ConnId(1), peer(), config());
        c.send(b"hi", &mut h.fx()).unwrap();
        let isn = h.sent()[0].seq;
        c.on_packet(&Packet::ack(isn), &mut h.fx()).unwrap();
        h.sent();
        h.events();

        c.close(&mut h.fx());
        assert!(h.sent().is_empty(), "FIN waits for DATA ack");
        assert!(c.send(b"more", &mut h.fx()).is_err());

        c.on_packet(&Packet::ack(isn.wrapping_add(1)), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::fin(isn.wrapping_add(2))]);
        assert_eq!(c.state(), ConnectionState::FinSent);

        c.on_packet(&Packet::ack(isn.wrapping_add(2)), &mut h.fx()).unwrap();
        assert!(c.is_closed());
        assert_eq!(h.events(), vec![LifecycleEvent::Closed]);
        assert!(h.timers.is_empty());
    }

    #[test]
    fn drain_timeout_forces_fin() {
        let mut h = Harness::new();
        let mut c = PeerConnection::new(ConnId(1), peer(), config());
        c.send(b"hi", &mut h.fx()).unwrap();
        let isn = h.sent()[0].seq;
        c.on_packet(&Packet::ack(isn), &mut h.fx()).unwrap();
        h.sent();

        c.close(&mut h.fx());
        c.on_timer(Timer::Drain, &mut h.fx());
        assert_eq!(h.sent(), vec![Packet::fin(isn.wrapping_add(2))]);
        assert_eq!(c.state(), ConnectionState::FinSent);
        assert!(h
            .timers
            .deadline(ConnId(1), Timer::Retransmit(isn.wrapping_add(1)))
            .is_none());
        assert_eq!(
            h.events(),
            vec![LifecycleEvent::Connected, LifecycleEvent::Abandoned],
            "discarded data is reported"
        );
    }

    #[test]
    fn drain_timeout_before_handshake_abandons_queued_data() {
        let mut h = Harness::new();
        let (mut c, _) = syn_sent(&mut h);
        c.close(&mut h.fx());
        c.on_timer(Timer::Drain, &mut h.fx());
        assert!(c.is_closed());
        assert_eq!(
            h.events(),
            vec![LifecycleEvent::Abandoned, LifecycleEvent::Closed]
        );
        assert!(h.timers.is_empty());
    }

    #[test]
    fn peer_fin_lingers_then_closes() {
        let mut h = Harness::new();
        let mut c = PeerConnection::new(ConnId(2), peer(), config());
        c.on_packet(&Packet::syn(10), &mut h.fx()).unwrap();
        c.on_packet(&Packet::fin(11), &mut h.fx()).unwrap();
        assert_eq!(c.state(), ConnectionState::FinReceived);
        h.sent();
        h.events();

        c.on_packet(&Packet::fin(11), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::ack(11)], "retransmitted FIN re-acked");

        c.on_timer(Timer::Linger, &mut h.fx());
        assert!(c.is_closed());
        assert_eq!(h.events(), vec![LifecycleEvent::Closed]);
    }

    #[test]
    fn simultaneous_close_lingers_after_own_fin_is_acked() {
        let mut h = Harness::new();
        let mut c = PeerConnection::new(ConnId(1), peer(), config());
        c.send(b"x", &mut h.fx()).unwrap();
        let isn = h.sent()[0].seq;
        c.on_packet(&Packet::ack(isn), &mut h.fx()).unwrap();
        c.on_packet(&Packet::syn(50), &mut h.fx()).unwrap();
        c.on_packet(&Packet::ack(isn.wrapping_add(1)), &mut h.fx()).unwrap();
        c.close(&mut h.fx());
        assert_eq!(c.state(), ConnectionState::FinSent);
        h.sent();
        h.events();

        c.on_packet(&Packet::fin(51), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::ack(51)]);
        assert_eq!(c.state(), ConnectionState::FinSent);

        c.on_packet(&Packet::ack(isn.wrapping_add(2)), &mut h.fx()).unwrap();
        assert_eq!(c.state(), ConnectionState::FinReceived);
        c.on_packet(&Packet::fin(51), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::ack(51)]);

        c.on_timer(Timer::Linger, &mut h.fx());
        assert!(c.is_closed());
        assert_eq!(h.events(), vec![LifecycleEvent::Closed]);
    }

    #[test]
    fn fin_past_abandoned_data_is_accepted() {
        let mut h = Harness::new();
        let mut c = PeerConnection::new(ConnId(2), peer(), config());
        c.on_packet(&Packet::syn(10), &mut h.fx()).unwrap();
        h.sent();
        c.on_packet(&Packet::fin(13), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::ack(13)]);
        assert_eq!(c.state(), ConnectionState::FinReceived);
    }

    #[test]
    fn responder_close_opens_own_sequence_space_first() {
        let mut h = Harness::new();
        let mut c = PeerConnection::new(ConnId(2), peer(), config());
        c.on_packet(&Packet::syn(10), &mut h.fx()).unwrap();
        h.sent();

        c.close(&mut h.fx());
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketType::Syn);

        c.on_packet(&Packet::ack(sent[0].seq), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::fin(sent[0].seq.wrapping_add(1))]);
    }

    /// Responder that has opened its own sequence space and has "pong" in
    /// flight; returns our ISN.
    fn replying(h: &mut Harness) -> (PeerConnection, u32) {
        let mut c = PeerConnection::new(ConnId(2), peer(), config());
        c.on_packet(&Packet::syn(10), &mut h.fx()).unwrap();
        c.send(b"pong", &mut h.fx()).unwrap();
        let isn = h.sent()[1].seq;
        c.on_packet(&Packet::ack(isn), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::data(isn.wrapping_add(1), b"pong".to_vec())]);
        h.events();
        (c, isn)
    }

    #[test]
    fn peer_fin_does_not_drop_our_pending_data() {
        let mut h = Harness::new();
        let (mut c, isn) = replying(&mut h);

        c.on_packet(&Packet::fin(11), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::ack(11)], "our FIN waits behind the data");
        assert_eq!(c.state(), ConnectionState::FinReceived);
        assert!(c.send(b"more", &mut h.fx()).is_err());

        h.now += Duration::from_millis(100);
        for (_, timer) in h.timers.next_expired(h.now) {
            c.on_timer(timer, &mut h.fx());
        }
        assert_eq!(
            h.sent(),
            vec![Packet::data(isn.wrapping_add(1), b"pong".to_vec())],
            "still retransmitted after the peer's FIN"
        );

        c.on_packet(&Packet::ack(isn.wrapping_add(1)), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::fin(isn.wrapping_add(2))]);
        assert_eq!(c.state(), ConnectionState::FinSent);

        c.on_packet(&Packet::ack(isn.wrapping_add(2)), &mut h.fx()).unwrap();
        assert_eq!(c.state(), ConnectionState::FinReceived);
        c.on_timer(Timer::Linger, &mut h.fx());
        assert!(c.is_closed());
        assert_eq!(h.events(), vec![LifecycleEvent::Closed]);
    }

    #[test]
    fn peer_fin_with_unacked_data_times_out_rather_than_closing_quietly() {
        let mut h = Harness::new();
        let (mut c, _) = replying(&mut h);
        c.on_packet(&Packet::fin(11), &mut h.fx()).unwrap();
        for _ in 0..10 {
            h.now += Duration::from_millis(100);
            for (_, timer) in h.timers.next_expired(h.now) {
                c.on_timer(timer, &mut h.fx());
            }
        }
        assert!(c.is_closed());
        assert_eq!(h.events(), vec![LifecycleEvent::TimedOut]);
    }

    #[test]
    fn closer_waits_for_peer_fin_while_peer_stream_is_open() {
        let mut h = Harness::new();
        let mut c = PeerConnection::new(ConnId(1), peer(), config());
        c.send(b"ping", &mut h.fx()).unwrap();
        let isn = h.sent()[0].seq;
        c.on_packet(&Packet::ack(isn), &mut h.fx()).unwrap();
        c.on_packet(&Packet::ack(isn.wrapping_add(1)), &mut h.fx()).unwrap();
        c.on_packet(&Packet::syn(50), &mut h.fx()).unwrap();
        c.close(&mut h.fx());
        c.on_packet(&Packet::ack(isn.wrapping_add(2)), &mut h.fx()).unwrap();
        h.sent();
        h.events();

        assert_eq!(c.state(), ConnectionState::FinSent);
        assert!(h.timers.deadline(ConnId(1), Timer::FinWait).is_some());

        c.on_packet(&Packet::data(51, b"pong".to_vec()), &mut h.fx()).unwrap();
        assert_eq!(
            h.notifications.pop_front(),
            Some(Notification::Data {
                from: peer(),
                payload: b"pong".to_vec()
            })
        );

        c.on_packet(&Packet::fin(52), &mut h.fx()).unwrap();
        assert_eq!(h.sent(), vec![Packet::ack(51), Packet::ack(52)]);
        assert_eq!(c.state(), ConnectionState::FinReceived);
        assert!(h.timers.deadline(ConnId(1), Timer::FinWait).is_none());
        c.on_timer(Timer::Linger, &mut h.fx());
        assert_eq!(h.events(), vec![LifecycleEvent::Closed]);
    }

    #[test]
    fn fin_wait_expiry_closes() {
        let mut h = Harness::new();
        let mut c = PeerConnection::new(ConnId(1), peer(), config());
        c.send(b"x", &mut h.fx()).unwrap();
        let isn = h.sent()[0].seq;
        c.on_packet(&Packet::ack(isn), &mut h.fx()).unwrap();
        c.on_packet(&Packet::syn(50), &mut h.fx()).unwrap();
        c.on_packet(&Packet::ack(isn.wrapping_add(1)), &mut h.fx()).unwrap();
        c.close(&mut h.fx());
        c.on_packet(&Packet::ack(isn.wrapping_add(2)), &mut h.fx()).unwrap();
        h.events();

        c.on_timer(Timer::FinWait, &mut h.fx());
        assert!(c.is_closed());
        assert_eq!(h.events(), vec![LifecycleEvent::Closed]);
        assert!(h.timers.is_empty());
    }

    #[test]
    fn reset_reports_abandoned_data_then_closes() {
        let mut h = Harness::new();
        let (mut c, _) = replying(&mut h);
        c.reset(&mut h.fx());
        assert!(c.is_closed());
        assert_eq!(
            h.events(),
            vec![LifecycleEvent::Abandoned, LifecycleEvent::Closed]
        );
        assert!(h.timers.is_empty());
    }
}
