//! `rudp` — reliable, connection-oriented datagram delivery over UDP.
//!
//! # Architecture
//!
//! ```text
//!   application handlers (data / lifecycle events)
//!            ▲                         │ send / close
//!            │                         ▼
//!  ┌──────────────────────────────────────────────┐
//!  │ Dispatcher  (one loop, many endpoints)       │
//!  │   select!: readable socket │ nearest timer   │
//!  └─────┬─────────────────────────────┬──────────┘
//!        │ datagrams                   │ deadlines
//!  ┌─────▼──────────────────────────────▼─────────┐
//!  │ Engine  (per endpoint, sans-I/O)             │
//!  │   ConnectionTable ─▶ PeerConnection ×N       │
//!  │                      ├─ Sender (window)      │
//!  │                      └─ Receiver (in-order)  │
//!  │   RetransmitScheduler                        │
//!  └─────┬────────────────────────────────────────┘
//!        │ raw UDP datagrams
//!  ┌─────▼─────┐   ┌───────────┐
//!  │  Socket   │◀──│ Simulator │  (optional fault injection)
//!  └───────────┘   └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]      — wire format (serialise / deserialise)
//! - [`state`]       — finite-state-machine types
//! - [`sender`]      — outbound sliding window with cumulative ACKs
//! - [`receiver`]    — inbound in-order acceptance
//! - [`connection`]  — per-peer state machine
//! - [`table`]       — per-endpoint connection table
//! - [`timer`]       — retransmission, drain and linger deadlines
//! - [`engine`]      — per-endpoint protocol engine
//! - [`dispatcher`]  — event loop, endpoints and handlers
//! - [`socket`]      — async UDP socket abstraction
//! - [`simulator`]   — seeded loss/duplication/reorder model for testing
//! - [`config`]      — tunable protocol parameters
//!
//! # Example
//!
//! ```no_run
//! use rudp::{Dispatcher, RudpConfig};
//!
//! # async fn demo() -> Result<(), rudp::RudpError> {
//! let mut dispatcher = Dispatcher::new(RudpConfig::default())?;
//! let receiver = dispatcher.open(6000).await?;
//! dispatcher.register_data_handler(receiver, |_, from, payload| {
//!     println!("{from}: {}", String::from_utf8_lossy(payload));
//! })?;
//! dispatcher.run().await
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod table;
pub mod timer;

pub use config::{ConfigError, RudpConfig};
pub use connection::ProtocolViolation;
pub use dispatcher::{Control, Dispatcher, Endpoint, RudpError};
pub use engine::{Engine, LifecycleEvent, Notification, SendRejected, Transmit};
pub use packet::{DecodeError, Packet, PacketType};
pub use simulator::{Simulator, SimulatorConfig};
pub use state::ConnectionState;
