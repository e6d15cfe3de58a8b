//! Downstream side of an established session.
//!
//! A [`BackendBridge`] is opened once a client completes the handshake. It
//! wraps a [`BackendSession`] produced by the configured [`BackendConnector`]
//! and carries game payloads in both directions.

use crate::address::AddressKey;
use crate::error::BackendError;
use bytes::Bytes;
use log::debug;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Largest datagram read from a relay backend.
const RELAY_BUFFER_SIZE: usize = 65535;

/// A downstream game-protocol session for one client.
pub trait BackendSession: Send {
    /// Hands a client payload to the backend.
    fn send(&mut self, payload: Bytes) -> Result<(), BackendError>;

    /// Drains payloads the backend wants delivered to the client.
    fn poll(&mut self) -> Result<Vec<Bytes>, BackendError>;

    /// Drives backend timers.
    fn tick(&mut self, _now: Instant) {}
}

/// Opens backend sessions for newly established clients.
pub trait BackendConnector: Send + Sync {
    fn connect(&self, client: &AddressKey) -> Result<Box<dyn BackendSession>, BackendError>;
}

/// Adapter owned by a connected client session.
pub struct BackendBridge {
    client: AddressKey,
    session: Box<dyn BackendSession>,
}

impl BackendBridge {
    pub fn open(connector: &dyn BackendConnector, client: AddressKey) -> Result<Self, BackendError> {
        let session = connector.connect(&client)?;
        debug!("Opened backend session for {}", client);
        Ok(Self { client, session })
    }

    pub fn client(&self) -> AddressKey {
        self.client
    }

    pub fn forward(&mut self, payload: Bytes) -> Result<(), BackendError> {
        self.session.send(payload)
    }

    pub fn poll_outbound(&mut self) -> Result<Vec<Bytes>, BackendError> {
        self.session.poll()
    }

    pub fn tick(&mut self, now: Instant) {
        self.session.tick(now);
    }
}

impl std::fmt::Debug for BackendBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendBridge")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

/// Relays each client's payloads over its own UDP socket to a downstream
/// server, one datagram per payload. Sockets are registered with the tokio
/// reactor, so sessions must be opened from inside a runtime.
#[derive(Debug, Clone)]
pub struct UdpRelayConnector {
    downstream: SocketAddr,
}

impl UdpRelayConnector {
    pub fn new(downstream: SocketAddr) -> Self {
        Self { downstream }
    }
}

impl BackendConnector for UdpRelayConnector {
    fn connect(&self, _client: &AddressKey) -> Result<Box<dyn BackendSession>, BackendError> {
        let unreachable = |source| BackendError::Unreachable {
            addr: self.downstream,
            source,
        };
        let local: SocketAddr = if self.downstream.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        tokio::runtime::Handle::try_current()
            .map_err(|e| unreachable(io::Error::new(ErrorKind::Other, e)))?;
        let socket = std::net::UdpSocket::bind(local).map_err(unreachable)?;
        socket.connect(self.downstream).map_err(unreachable)?;
        socket.set_nonblocking(true).map_err(unreachable)?;
        let socket = UdpSocket::from_std(socket).map_err(unreachable)?;

        Ok(Box::new(UdpRelaySession {
            socket,
            downstream: self.downstream,
            buffer: vec![0u8; RELAY_BUFFER_SIZE],
        }))
    }
}

struct UdpRelaySession {
    socket: UdpSocket,
    downstream: SocketAddr,
    buffer: Vec<u8>,
}

impl BackendSession for UdpRelaySession {
    fn send(&mut self, payload: Bytes) -> Result<(), BackendError> {
        match self.socket.try_send(&payload) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("Backend {} send buffer full, dropping payload", self.downstream);
                Ok(())
            }
            Err(source) => Err(BackendError::Unreachable {
                addr: self.downstream,
                source,
            }),
        }
    }

    fn poll(&mut self) -> Result<Vec<Bytes>, BackendError> {
        let mut received = Vec::new();
        loop {
            match self.socket.try_recv(&mut self.buffer) {
                Ok(len) => received.push(Bytes::copy_from_slice(&self.buffer[..len])),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(received),
                Err(source) => {
                    return Err(BackendError::Unreachable {
                        addr: self.downstream,
                        source,
                    })
                }
            }
        }
    }
}

/// One established client handed to an embedding application.
#[derive(Debug)]
pub struct BackendLink {
    pub client: AddressKey,
    /// Payloads sent by the client.
    pub from_client: mpsc::UnboundedReceiver<Bytes>,
    /// Payloads to deliver to the client.
    pub to_client: mpsc::UnboundedSender<Bytes>,
}

/// Hands each established session to the application as a [`BackendLink`].
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    links: mpsc::UnboundedSender<BackendLink>,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BackendLink>) {
        let (links, receiver) = mpsc::unbounded_channel();
        (Self { links }, receiver)
    }
}

impl BackendConnector for ChannelConnector {
    fn connect(&self, client: &AddressKey) -> Result<Box<dyn BackendSession>, BackendError> {
        let (to_app, from_client) = mpsc::unbounded_channel();
        let (to_client, from_app) = mpsc::unbounded_channel();

        self.links
            .send(BackendLink {
                client: *client,
                from_client,
                to_client,
            })
            .map_err(|_| BackendError::Closed)?;

        Ok(Box::new(ChannelSession { to_app, from_app }))
    }
}

struct ChannelSession {
    to_app: mpsc::UnboundedSender<Bytes>,
    from_app: mpsc::UnboundedReceiver<Bytes>,
}

impl BackendSession for ChannelSession {
    fn send(&mut self, payload: Bytes) -> Result<(), BackendError> {
        self.to_app.send(payload).map_err(|_| BackendError::Closed)
    }

    fn poll(&mut self) -> Result<Vec<Bytes>, BackendError> {
        let mut received = Vec::new();
        loop {
            match self.from_app.try_recv() {
                Ok(payload) => received.push(payload),
                Err(mpsc::error::TryRecvError::Empty) => return Ok(received),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if received.is_empty() {
                        return Err(BackendError::Closed);
                    }
                    return Ok(received);
                }
            }
        }
    }
}
