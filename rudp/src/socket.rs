//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that moves
//! raw datagrams for one endpoint.  All protocol logic lives elsewhere; this
//! module owns only byte I/O and, when configured, the [`Simulator`] that
//! sits in front of the real socket.

use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use tokio::io::ReadBuf;
use tokio::net::UdpSocket;

use crate::engine::Transmit;
use crate::simulator::Simulator;

/// Largest UDP payload a socket will ever hand us.
pub const MAX_DATAGRAM: usize = 65_535;

/// An async, datagram-oriented UDP socket with optional fault injection.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
    simulator: Option<Simulator>,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner,
            simulator: None,
        })
    }

    /// Route every outbound datagram through `simulator`.
    pub fn with_simulator(mut self, simulator: Simulator) -> Self {
        self.simulator = Some(simulator);
        self
    }

    pub fn simulator(&self) -> Option<&Simulator> {
        self.simulator.as_ref()
    }

    /// Send one datagram, subject to the simulator's fault model if any.
    pub async fn send_to(&mut self, datagram: Transmit) -> io::Result<()> {
        let outgoing = match self.simulator.as_mut() {
            Some(sim) => sim.transmit(datagram),
            None => vec![datagram],
        };
        for d in outgoing {
            self.inner.send_to(&d.bytes, d.dest).await?;
        }
        Ok(())
    }

    /// Put a datagram still held back by the simulator on the wire.
    pub async fn flush_held(&mut self) -> io::Result<()> {
        if let Some(d) = self.simulator.as_mut().and_then(Simulator::flush) {
            self.inner.send_to(&d.bytes, d.dest).await?;
        }
        Ok(())
    }

    /// Poll for the next inbound datagram; see
    /// [`UdpSocket::poll_recv_from`].
    pub fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>> {
        self.inner.poll_recv_from(cx, buf)
    }

    /// Receive the next datagram into `buf`.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }
}
