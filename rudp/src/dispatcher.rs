//! Single-threaded event loop multiplexing every open endpoint.
//!
//! A [`Dispatcher`] owns, per [`Endpoint`], a bound [`Socket`], the
//! endpoint's [`Engine`], and the application's data and event handlers.
//! Each [`Dispatcher::turn`]:
//!
//! 1. waits for the first of: a readable socket, or the nearest timer
//!    deadline across all endpoints;
//! 2. feeds the datagram (if any) to its engine;
//! 3. fires expired timers, invokes handlers for queued notifications and
//!    flushes outbound datagrams;
//! 4. releases endpoints whose close has completed.
//!
//! Handlers run on the loop and receive a [`Control`] through which they may
//! send or close their endpoint.  Nothing here is `Send`; the dispatcher is
//! meant to be driven from one task.

use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::task::Poll;
use std::time::Instant;

use thiserror::Error;
use tokio::io::ReadBuf;

use crate::config::{ConfigError, RudpConfig};
use crate::engine::{Engine, LifecycleEvent, Notification, SendRejected};
use crate::simulator::{Simulator, SimulatorStats};
use crate::socket::{Socket, MAX_DATAGRAM};
use crate::state::ConnectionState;

// ---------------------------------------------------------------------------
// Handles and errors
// ---------------------------------------------------------------------------

/// Handle to an endpoint opened on a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(u32);

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "endpoint {}", self.0)
    }
}

/// Errors surfaced by [`Dispatcher`] operations.
#[derive(Error, Debug)]
pub enum RudpError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not open")]
    UnknownEndpoint(Endpoint),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

type DataHandler = Box<dyn FnMut(&mut Control<'_>, SocketAddr, &[u8])>;
type EventHandler = Box<dyn FnMut(&mut Control<'_>, SocketAddr, LifecycleEvent)>;

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// What a handler may do to its own endpoint while it runs.
pub struct Control<'a> {
    endpoint: Endpoint,
    engine: &'a mut Engine,
}

impl Control<'_> {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.engine.local_addr()
    }

    /// Queue `payload` for `dest`; see [`Dispatcher::send`].
    pub fn send(&mut self, payload: &[u8], dest: SocketAddr) -> Result<(), SendRejected> {
        self.engine.send(payload, dest, Instant::now())
    }

    /// Begin closing this endpoint; see [`Dispatcher::close`].
    pub fn close(&mut self) {
        self.engine.close(Instant::now());
    }

    pub fn connection_state(&self, peer: SocketAddr) -> Option<ConnectionState> {
        self.engine.connection_state(&peer)
    }
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

struct Slot {
    socket: Socket,
    engine: Engine,
    on_data: Option<DataHandler>,
    on_event: Option<EventHandler>,
}

impl Slot {
    /// Hand every queued notification to the registered handlers.
    fn deliver(&mut self, endpoint: Endpoint) {
        while let Some(notification) = self.engine.poll_notification() {
            let mut control = Control {
                endpoint,
                engine: &mut self.engine,
            };
            match notification {
                Notification::Data { from, payload } => match self.on_data.as_mut() {
                    Some(handler) => handler(&mut control, from, &payload),
                    None => log::debug!(
                        "[rudp] {} no data handler; {} byte(s) from {} discarded",
                        endpoint,
                        payload.len(),
                        from
                    ),
                },
                Notification::Event { peer, event } => {
                    log::info!("[rudp] {} {} {}", endpoint, peer, event);
                    if let Some(handler) = self.on_event.as_mut() {
                        handler(&mut control, peer, event);
                    }
                }
            }
        }
    }

    /// Put every queued datagram on the wire.
    ///
    /// Send failures are logged and otherwise ignored; retransmission covers
    /// them.
    async fn flush(&mut self) {
        while let Some(datagram) = self.engine.poll_transmit() {
            let dest = datagram.dest;
            if let Err(e) = self.socket.send_to(datagram).await {
                log::warn!("[rudp] {} send to {} failed: {}", self.socket.local_addr, dest, e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Owner of every open endpoint and the loop that drives them.
pub struct Dispatcher {
    config: RudpConfig,
    slots: BTreeMap<Endpoint, Slot>,
    next_endpoint: u32,
    /// Where the next receive poll starts, so no socket is always polled first.
    poll_start: usize,
    recv_buf: Vec<u8>,
}

impl Dispatcher {
    /// Create a dispatcher whose endpoints all use `config`.
    pub fn new(config: RudpConfig) -> Result<Self, RudpError> {
        config.validate()?;
        Ok(Self {
            config,
            slots: BTreeMap::new(),
            next_endpoint: 0,
            poll_start: 0,
            recv_buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn config(&self) -> &RudpConfig {
        &self.config
    }

    /// Bind an endpoint on `port` on every IPv4 interface.  Port 0 picks an
    /// ephemeral port; read it back with [`Dispatcher::local_addr`].
    pub async fn open(&mut self, port: u16) -> Result<Endpoint, RudpError> {
        self.open_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .await
    }

    /// Bind an endpoint on exactly `addr`.
    pub async fn open_addr(&mut self, addr: SocketAddr) -> Result<Endpoint, RudpError> {
        let socket = Socket::bind(addr)
            .await
            .map_err(|source| RudpError::Bind { addr, source })?;
        self.insert(socket)
    }

    /// Bind an endpoint whose outbound datagrams pass through `simulator`.
    pub async fn open_simulated(
        &mut self,
        addr: SocketAddr,
        simulator: Simulator,
    ) -> Result<Endpoint, RudpError> {
        let socket = Socket::bind(addr)
            .await
            .map_err(|source| RudpError::Bind { addr, source })?
            .with_simulator(simulator);
        self.insert(socket)
    }

    fn insert(&mut self, socket: Socket) -> Result<Endpoint, RudpError> {
        let engine = Engine::new(self.config, socket.local_addr)?;
        let endpoint = Endpoint(self.next_endpoint);
        self.next_endpoint += 1;
        log::info!("[rudp] {} bound to {}", endpoint, socket.local_addr);
        self.slots.insert(
            endpoint,
            Slot {
                socket,
                engine,
                on_data: None,
                on_event: None,
            },
        );
        Ok(endpoint)
    }

    fn slot_mut(&mut self, endpoint: Endpoint) -> Result<&mut Slot, RudpError> {
        self.slots
            .get_mut(&endpoint)
            .ok_or(RudpError::UnknownEndpoint(endpoint))
    }

    /// Handler for every in-order payload received on `endpoint`.
    ///
    /// Replaces any previously registered data handler.
    pub fn register_data_handler<F>(
        &mut self,
        endpoint: Endpoint,
        handler: F,
    ) -> Result<(), RudpError>
    where
        F: FnMut(&mut Control<'_>, SocketAddr, &[u8]) + 'static,
    {
        self.slot_mut(endpoint)?.on_data = Some(Box::new(handler));
        Ok(())
    }

    /// Handler for connection lifecycle events on `endpoint`.
    pub fn register_event_handler<F>(
        &mut self,
        endpoint: Endpoint,
        handler: F,
    ) -> Result<(), RudpError>
    where
        F: FnMut(&mut Control<'_>, SocketAddr, LifecycleEvent) + 'static,
    {
        self.slot_mut(endpoint)?.on_event = Some(Box::new(handler));
        Ok(())
    }

    /// Queue `payload` for reliable, in-order delivery to `dest`.
    ///
    /// Returns as soon as the payload is queued; datagrams go out on the
    /// next [`Dispatcher::turn`].
    pub fn send(
        &mut self,
        endpoint: Endpoint,
        payload: &[u8],
        dest: SocketAddr,
    ) -> Result<(), SendRejected> {
        let slot = self
            .slots
            .get_mut(&endpoint)
            .ok_or(SendRejected::UnknownEndpoint)?;
        slot.engine.send(payload, dest, Instant::now())
    }

    /// Close `endpoint`: every connection is torn down with a FIN and the
    /// socket is released once the last one has closed.
    pub fn close(&mut self, endpoint: Endpoint) -> Result<(), RudpError> {
        self.slot_mut(endpoint)?.engine.close(Instant::now());
        Ok(())
    }

    pub fn local_addr(&self, endpoint: Endpoint) -> Option<SocketAddr> {
        self.slots.get(&endpoint).map(|s| s.socket.local_addr)
    }

    pub fn is_open(&self, endpoint: Endpoint) -> bool {
        self.slots.contains_key(&endpoint)
    }

    pub fn endpoint_count(&self) -> usize {
        self.slots.len()
    }

    pub fn connection_state(
        &self,
        endpoint: Endpoint,
        peer: SocketAddr,
    ) -> Option<ConnectionState> {
        self.slots.get(&endpoint)?.engine.connection_state(&peer)
    }

    pub fn simulator_stats(&self, endpoint: Endpoint) -> Option<SimulatorStats> {
        self.slots
            .get(&endpoint)?
            .socket
            .simulator()
            .map(Simulator::stats)
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Run one iteration of the loop.
    ///
    /// Returns `false` once no endpoint remains open.  With endpoints open
    /// but no timers armed, waits until a datagram arrives.
    pub async fn turn(&mut self) -> Result<bool, RudpError> {
        self.service().await;
        if self.slots.is_empty() {
            return Ok(false);
        }

        let deadline = self
            .slots
            .values()
            .filter_map(|s| s.engine.next_deadline())
            .min();
        if let Some((endpoint, received)) = self.wait(deadline).await {
            match received {
                Ok((from, len)) => {
                    if let Some(slot) = self.slots.get_mut(&endpoint) {
                        slot.engine
                            .handle_datagram(from, &self.recv_buf[..len], Instant::now());
                    }
                }
                Err(e) => log::warn!("[rudp] {} receive failed: {}", endpoint, e),
            }
        }

        self.service().await;
        Ok(!self.slots.is_empty())
    }

    /// Drive the loop until every endpoint has closed.
    pub async fn run(&mut self) -> Result<(), RudpError> {
        while self.turn().await? {}
        Ok(())
    }

    /// Drive the loop until `done` holds or every endpoint has closed.
    pub async fn run_until<F>(&mut self, mut done: F) -> Result<(), RudpError>
    where
        F: FnMut(&Dispatcher) -> bool,
    {
        loop {
            self.service().await;
            if done(self) || !self.turn().await? {
                return Ok(());
            }
        }
    }

    /// Fire timers, deliver notifications, flush output, then release
    /// endpoints that have finished closing.
    async fn service(&mut self) {
        let now = Instant::now();
        let mut finished = Vec::new();
        for (endpoint, slot) in self.slots.iter_mut() {
            slot.engine.handle_timeout(now);
            slot.deliver(*endpoint);
            slot.flush().await;
            if slot.engine.is_closed() {
                finished.push(*endpoint);
            }
        }
        for endpoint in finished {
            if let Some(mut slot) = self.slots.remove(&endpoint) {
                if let Err(e) = slot.socket.flush_held().await {
                    log::debug!("[rudp] {} dropping held datagram: {}", endpoint, e);
                }
                log::info!("[rudp] {} closed; released {}", endpoint, slot.socket.local_addr);
            }
        }
    }

    /// Wait for a datagram on any endpoint or until `deadline`.
    ///
    /// Returns `None` when the deadline passed first.
    async fn wait(
        &mut self,
        deadline: Option<Instant>,
    ) -> Option<(Endpoint, io::Result<(SocketAddr, usize)>)> {
        let order = self.poll_order();
        let slots = &self.slots;
        let buf = &mut self.recv_buf;
        let recv = std::future::poll_fn(|cx| {
            for endpoint in &order {
                let Some(slot) = slots.get(endpoint) else {
                    continue;
                };
                let mut read = ReadBuf::new(buf.as_mut_slice());
                match slot.socket.poll_recv_from(cx, &mut read) {
                    Poll::Ready(Ok(from)) => {
                        return Poll::Ready((*endpoint, Ok((from, read.filled().len()))))
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready((*endpoint, Err(e))),
                    Poll::Pending => {}
                }
            }
            Poll::Pending
        });

        match deadline {
            Some(at) => tokio::select! {
                received = recv => Some(received),
                _ = tokio::time::sleep_until(at.into()) => None,
            },
            None => Some(recv.await),
        }
    }

    /// Endpoints in the order the next wait polls them.  The starting point
    /// advances by one on every call.
    fn poll_order(&mut self) -> Vec<Endpoint> {
        let endpoints: Vec<Endpoint> = self.slots.keys().copied().collect();
        if endpoints.is_empty() {
            return endpoints;
        }
        let start = self.poll_start % endpoints.len();
        self.poll_start = self.poll_start.wrapping_add(1);
        endpoints[start..]
            .iter()
            .chain(&endpoints[..start])
            .copied()
            .collect()
    }
}
