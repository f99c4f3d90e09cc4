//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::PeerConnection`]
//! can occupy.  Transitions live in [`crate::connection`]; keeping the state
//! type on its own makes it easy to log and assert on without pulling in the
//! connection plumbing.

/// All possible states of the per-peer FSM.
///
/// ```text
///  IDLE ──send──▶ SYN_SENT ──ACK of SYN / peer SYN──▶ ESTABLISHED
///    │                                                   │   │
///    └──SYN──▶ SYN_RECEIVED ──ACK emitted──────────────▶─┘   │
///                                                            │
///            ┌──────────── close requested ──────────────────┤
///            ▼                                               ▼ FIN received
///        FIN_SENT ──ACK of FIN──▶ CLOSED ◀──linger── FIN_RECEIVED
/// ```
///
/// Any state moves to `Closed` when a segment exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No handshake attempted yet.
    #[default]
    Idle,
    /// Our SYN is in flight; waiting for its ACK.
    SynSent,
    /// Peer's SYN received; acknowledging it.
    SynReceived,
    /// Handshake complete; DATA and ACK may flow.
    Established,
    /// Our FIN is in flight; waiting for its ACK.
    FinSent,
    /// Peer's FIN acknowledged; lingering to re-acknowledge retransmissions.
    FinReceived,
    /// Terminal; the entry is removed from its connection table.
    Closed,
}

impl ConnectionState {
    /// `true` once the connection may no longer accept application sends.
    pub fn is_tearing_down(self) -> bool {
        matches!(self, Self::FinSent | Self::FinReceived | Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinSent => "FIN_SENT",
            Self::FinReceived => "FIN_RECEIVED",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
