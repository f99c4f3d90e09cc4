//! Per-endpoint connection table.
//!
//! Connections live in an arena keyed by [`ConnId`]; a second index maps the
//! remote address to its id.  Timers refer to connections by id only, so a
//! connection that has been removed simply stops resolving.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::config::RudpConfig;
use crate::connection::{PeerConnection, ProtocolViolation};
use crate::packet::{Packet, PacketType};

/// Stable identifier of a connection within one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// At most one [`PeerConnection`] per remote address.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    by_addr: HashMap<SocketAddr, ConnId>,
    conns: HashMap<ConnId, PeerConnection>,
    next_id: u64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the connection an inbound packet belongs to.
    ///
    /// Only a SYN may create a connection; anything else from an unknown
    /// address is a protocol violation.
    pub fn lookup_or_create(
        &mut self,
        remote: SocketAddr,
        packet: &Packet,
        config: RudpConfig,
    ) -> Result<&mut PeerConnection, ProtocolViolation> {
        let id = match self.by_addr.get(&remote).copied() {
            Some(id) => id,
            None if packet.kind == PacketType::Syn => self.insert(remote, config),
            None => {
                return Err(ProtocolViolation::NoConnection {
                    kind: packet.kind,
                    peer: remote,
                })
            }
        };
        self.conns
            .get_mut(&id)
            .ok_or(ProtocolViolation::NoConnection {
                kind: packet.kind,
                peer: remote,
            })
    }

    /// Connection used by an application send to `remote`, created on demand.
    pub fn get_or_create(
        &mut self,
        remote: SocketAddr,
        config: RudpConfig,
    ) -> &mut PeerConnection {
        let id = match self.by_addr.get(&remote).copied() {
            Some(id) => id,
            None => self.insert(remote, config),
        };
        self.conns
            .entry(id)
            .or_insert_with(|| PeerConnection::new(id, remote, config))
    }

    fn insert(&mut self, remote: SocketAddr, config: RudpConfig) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.by_addr.insert(remote, id);
        self.conns.insert(id, PeerConnection::new(id, remote, config));
        log::debug!("[rudp] new connection {} for {}", id, remote);
        id
    }

    pub fn get(&self, remote: &SocketAddr) -> Option<&PeerConnection> {
        self.by_addr.get(remote).and_then(|id| self.conns.get(id))
    }

    pub fn get_mut(&mut self, remote: &SocketAddr) -> Option<&mut PeerConnection> {
        let id = self.by_addr.get(remote)?;
        self.conns.get_mut(id)
    }

    pub fn by_id_mut(&mut self, id: ConnId) -> Option<&mut PeerConnection> {
        self.conns.get_mut(&id)
    }

    pub fn contains(&self, remote: &SocketAddr) -> bool {
        self.by_addr.contains_key(remote)
    }

    pub fn remove(&mut self, remote: &SocketAddr) -> Option<PeerConnection> {
        let id = self.by_addr.remove(remote)?;
        self.conns.remove(&id)
    }

    /// Ids of every connection, in creation order.
    pub fn ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.conns.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Remote address of a connection that carries our data to somewhere
    /// other than `dest`.
    pub fn active_sender_other_than(&self, dest: SocketAddr) -> Option<SocketAddr> {
        self.conns
            .values()
            .find(|c| c.remote() != dest && c.is_sending())
            .map(PeerConnection::remote)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
