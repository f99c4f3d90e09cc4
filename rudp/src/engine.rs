//! Per-endpoint protocol engine.
//!
//! [`Engine`] is the sans-I/O core of one endpoint.  It owns the connection
//! table and the retransmission scheduler, and it is driven entirely by the
//! caller:
//!
//! - [`Engine::handle_datagram`] for every datagram read from the socket,
//! - [`Engine::handle_timeout`] once [`Engine::next_deadline`] has passed,
//! - [`Engine::send`] and [`Engine::close`] for application requests.
//!
//! Outputs are queued and drained with [`Engine::poll_transmit`] (datagrams
//! to put on the wire) and [`Engine::poll_notification`] (payloads and
//! lifecycle events for the application).  Time is always passed in, so the
//! whole protocol can be exercised without sockets or sleeps.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use thiserror::Error;

use crate::config::{ConfigError, RudpConfig};
use crate::connection::{Effects, PeerConnection};
use crate::packet::{Packet, PacketType};
use crate::state::ConnectionState;
use crate::table::ConnectionTable;
use crate::timer::RetransmitScheduler;

/// One datagram ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub dest: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Connection lifecycle changes reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Handshake completed.
    Connected,
    /// Orderly teardown finished.
    Closed,
    /// A segment exhausted its retries; the connection is gone.
    TimedOut,
    /// Teardown discarded data of ours that the peer never acknowledged.
    /// `Closed` follows once teardown completes.
    Abandoned,
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::TimedOut => "timed out",
            Self::Abandoned => "abandoned undelivered data",
        };
        f.write_str(name)
    }
}

/// Something the application must be told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// An in-order payload, delivered exactly once.
    Data { from: SocketAddr, payload: Vec<u8> },
    Event {
        peer: SocketAddr,
        event: LifecycleEvent,
    },
}

/// Why an application send was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendRejected {
    #[error("endpoint is not open")]
    UnknownEndpoint,
    #[error("endpoint already has an active session with {active}")]
    OtherDestination { active: SocketAddr },
    #[error("endpoint is closing")]
    EndpointClosing,
    #[error("connection to {peer} is closing")]
    ConnectionClosing { peer: SocketAddr },
}

/// Protocol state of one endpoint.
#[derive(Debug)]
pub struct Engine {
    config: RudpConfig,
    local_addr: SocketAddr,
    table: ConnectionTable,
    timers: RetransmitScheduler,
    transmits: VecDeque<Transmit>,
    notifications: VecDeque<Notification>,
    closing: bool,
}

impl Engine {
    /// Create the engine for the endpoint bound to `local_addr`.
    ///
    /// Fails if `config` does not pass [`RudpConfig::validate`].
    pub fn new(config: RudpConfig, local_addr: SocketAddr) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            local_addr,
            table: ConnectionTable::new(),
            timers: RetransmitScheduler::new(),
            transmits: VecDeque::new(),
            notifications: VecDeque::new(),
            closing: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &RudpConfig {
        &self.config
    }

    /// Queue `payload` for reliable, in-order delivery to `dest`.
    ///
    /// Only one destination may carry our data at a time; inbound sessions
    /// from other peers are unaffected.
    pub fn send(
        &mut self,
        payload: &[u8],
        dest: SocketAddr,
        now: Instant,
    ) -> Result<(), SendRejected> {
        if self.closing {
            return Err(SendRejected::EndpointClosing);
        }
        if let Some(active) = self.table.active_sender_other_than(dest) {
            return Err(SendRejected::OtherDestination { active });
        }
        let Self {
            config,
            table,
            timers,
            transmits,
            notifications,
            ..
        } = self;
        let conn = table.get_or_create(dest, *config);
        let mut fx = Effects {
            now,
            timers,
            transmits,
            notifications,
        };
        let result = conn.send(payload, &mut fx);
        self.reap(&dest);
        result
    }

    /// Process one datagram received from `from`.
    ///
    /// Malformed datagrams and protocol violations are logged and dropped;
    /// they never disturb connection state.
    pub fn handle_datagram(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!(
                    "[rudp] {} dropping {} byte datagram from {}: {}",
                    self.local_addr,
                    bytes.len(),
                    from,
                    e
                );
                return;
            }
        };
        if packet.kind == PacketType::Syn {
            self.restart_if_superseded(from, packet.seq, now);
        }
        if self.closing && packet.kind == PacketType::Syn && !self.table.contains(&from) {
            log::debug!("[rudp] {} closing; ignoring SYN from {}", self.local_addr, from);
            return;
        }

        let Self {
            config,
            table,
            timers,
            transmits,
            notifications,
            local_addr,
            ..
        } = self;
        let conn = match table.lookup_or_create(from, &packet, *config) {
            Ok(conn) => conn,
            Err(violation) => {
                log::warn!("[rudp] {} protocol violation: {}", local_addr, violation);
                return;
            }
        };
        let mut fx = Effects {
            now,
            timers,
            transmits,
            notifications,
        };
        if let Err(violation) = conn.on_packet(&packet, &mut fx) {
            log::warn!(
                "[rudp] {} protocol violation from {}: {}",
                local_addr,
                from,
                violation
            );
        }
        self.reap(&from);
    }

    /// A SYN carrying a new ISN means the peer has started over, typically
    /// after timing out on us.  The old session can never complete, so it is
    /// torn down here and the SYN goes on to open a fresh one.
    fn restart_if_superseded(&mut self, from: SocketAddr, isn: u32, now: Instant) {
        let Self {
            table,
            timers,
            transmits,
            notifications,
            local_addr,
            ..
        } = self;
        let Some(conn) = table.get_mut(&from) else {
            return;
        };
        let Some(known) = conn.receiver.peer_isn() else {
            return;
        };
        if known == isn {
            return;
        }
        log::warn!(
            "[rudp] {} {} restarted (ISN {} replaces {}); resetting connection {}",
            local_addr,
            from,
            isn,
            known,
            conn.id()
        );
        let mut fx = Effects {
            now,
            timers,
            transmits,
            notifications,
        };
        conn.reset(&mut fx);
        self.reap(&from);
    }

    /// Fire every timer whose deadline is ≤ `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        let expired = self.timers.next_expired(now);
        if expired.is_empty() {
            return;
        }
        let mut touched = Vec::new();
        for (id, timer) in expired {
            let Self {
                table,
                timers,
                transmits,
                notifications,
                ..
            } = self;
            let Some(conn) = table.by_id_mut(id) else {
                continue;
            };
            let mut fx = Effects {
                now,
                timers,
                transmits,
                notifications,
            };
            conn.on_timer(timer, &mut fx);
            touched.push(conn.remote());
        }
        for remote in touched {
            self.reap(&remote);
        }
    }

    /// Begin closing the endpoint: every connection is driven to teardown
    /// and no new connections are accepted.
    pub fn close(&mut self, now: Instant) {
        if self.closing {
            return;
        }
        log::info!(
            "[rudp] {} closing with {} connection(s)",
            self.local_addr,
            self.table.len()
        );
        self.closing = true;

        let mut touched = Vec::new();
        for id in self.table.ids() {
            let Self {
                table,
                timers,
                transmits,
                notifications,
                ..
            } = self;
            let Some(conn) = table.by_id_mut(id) else {
                continue;
            };
            let mut fx = Effects {
                now,
                timers,
                transmits,
                notifications,
            };
            conn.close(&mut fx);
            touched.push(conn.remote());
        }
        for remote in touched {
            self.reap(&remote);
        }
    }

    /// Remove `remote`'s connection once it has reached `Closed`.
    fn reap(&mut self, remote: &SocketAddr) {
        let closed = self.table.get(remote).is_some_and(PeerConnection::is_closed);
        if !closed {
            return;
        }
        if let Some(conn) = self.table.remove(remote) {
            self.timers.disarm_all(conn.id());
            log::debug!(
                "[rudp] {} released connection {} to {}",
                self.local_addr,
                conn.id(),
                remote
            );
        }
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    /// Earliest timer deadline across every connection of this endpoint.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// `true` once a requested close has torn down every connection.
    pub fn is_closed(&self) -> bool {
        self.closing && self.table.is_empty()
    }

    pub fn connection_state(&self, remote: &SocketAddr) -> Option<ConnectionState> {
        self.table.get(remote).map(PeerConnection::state)
    }

    pub fn connection_count(&self) -> usize {
        self.table.len()
    }
}
