//! Per-client handshake state machine.
//!
//! A [`ClientSession`] is created by the registry when a new address sends
//! `OpenConnectionRequest1`. It answers the offline handshake directly,
//! unwraps frame sets through its [`ReliabilityLayer`], and once the client
//! reports `NewIncomingConnection` it opens a [`BackendBridge`] that carries
//! game payloads in both directions.
//!
//! Handlers are lenient about ordering: UDP may reorder or repeat handshake
//! steps, so each handler answers whatever it receives and the stage only
//! ever moves forward.

use crate::address::AddressKey;
use crate::backend::{BackendBridge, BackendConnector};
use crate::error::BackendError;
use crate::reliability::ReliabilityLayer;
use bytes::Bytes;
use log::{debug, info, warn};
use protocol::{frame, ids, packet_id, Packet, Reliability, MIN_MTU_SIZE, UDP_HEADER_OVERHEAD};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a session is in the connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeStage {
    New,
    MtuAgreed,
    AddressConfirmed,
    Connected,
    Disconnected,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStage::New => "new",
            HandshakeStage::MtuAgreed => "mtu-agreed",
            HandshakeStage::AddressConfirmed => "address-confirmed",
            HandshakeStage::Connected => "connected",
            HandshakeStage::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Process-wide values every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub server_id: u64,
    /// Zero point of the millisecond timestamps sent to clients.
    pub epoch: Instant,
    pub keepalive_interval: Duration,
    pub connector: Arc<dyn BackendConnector>,
}

pub struct ClientSession {
    address: AddressKey,
    context: SessionContext,
    stage: HandshakeStage,
    mtu_size: u16,
    reliability: ReliabilityLayer,
    bridge: Option<BackendBridge>,
    /// Set while the backend is failing, so the failure is logged once.
    backend_failed: bool,
    last_activity: Instant,
    last_keepalive: Instant,
    last_timestamp: u64,
    latency_ms: Option<u64>,
    raw_outgoing: Vec<Bytes>,
}

impl ClientSession {
    pub fn new(address: AddressKey, context: SessionContext, now: Instant) -> Self {
        Self {
            address,
            context,
            stage: HandshakeStage::New,
            mtu_size: MIN_MTU_SIZE,
            reliability: ReliabilityLayer::new(MIN_MTU_SIZE),
            bridge: None,
            backend_failed: false,
            last_activity: now,
            last_keepalive: now,
            last_timestamp: 0,
            latency_ms: None,
            raw_outgoing: Vec::new(),
        }
    }

    pub fn address(&self) -> AddressKey {
        self.address
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    pub fn mtu_size(&self) -> u16 {
        self.mtu_size
    }

    pub fn is_connected(&self) -> bool {
        self.stage == HandshakeStage::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.stage == HandshakeStage::Disconnected
    }

    pub fn has_bridge(&self) -> bool {
        self.bridge.is_some()
    }

    /// Round-trip time measured by the last keepalive, in milliseconds.
    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    /// Processes one datagram from this session's peer.
    pub fn handle(&mut self, raw: &[u8], now: Instant) {
        if self.is_disconnected() {
            return;
        }
        self.last_activity = now;

        if self.handle_datagram(raw, now) {
            return;
        }

        let Some(id) = packet_id(raw) else {
            return;
        };
        if frame::is_frame_set(id) {
            match self.reliability.handle_frame_set(raw, now) {
                Ok(payloads) => {
                    for payload in payloads {
                        self.handle_encapsulated_payload(payload, now);
                        if self.is_disconnected() {
                            break;
                        }
                    }
                }
                Err(e) => debug!("Malformed frame set from {}: {}", self.address, e),
            }
        } else if frame::is_ack(id) {
            if let Err(e) = self.reliability.handle_ack(raw) {
                debug!("Malformed ACK from {}: {}", self.address, e);
            }
        } else if frame::is_nack(id) {
            if let Err(e) = self.reliability.handle_nack(raw) {
                debug!("Malformed NACK from {}: {}", self.address, e);
            }
        } else {
            debug!("Unhandled datagram 0x{:02x} from {}", id, self.address);
        }

        self.reliability.flush(now);
    }

    /// Handles the offline handshake requests. Returns whether the datagram
    /// was one of them.
    pub fn handle_datagram(&mut self, raw: &[u8], now: Instant) -> bool {
        let id = packet_id(raw);
        if id != Some(ids::OPEN_CONNECTION_REQUEST_1) && id != Some(ids::OPEN_CONNECTION_REQUEST_2) {
            return false;
        }

        match Packet::decode(raw) {
            Ok(Packet::OpenConnectionRequest1 { mtu_size, .. }) => {
                self.send_packet_raw(&Packet::OpenConnectionReply1 {
                    server_id: self.context.server_id,
                    mtu_size: mtu_size.saturating_add(UDP_HEADER_OVERHEAD),
                });
                self.advance(HandshakeStage::MtuAgreed);
            }
            Ok(Packet::OpenConnectionRequest2 { mtu_size, .. }) => {
                if self.stage < HandshakeStage::Connected {
                    self.reliability.set_mtu(mtu_size);
                    self.mtu_size = self.reliability.mtu();
                }
                // The reply carries the MTU frame sets will actually use.
                self.send_packet_raw(&Packet::OpenConnectionReply2 {
                    server_id: self.context.server_id,
                    client_address: self.address.socket_addr(),
                    mtu_size: self.mtu_size,
                });
                self.advance(HandshakeStage::AddressConfirmed);
            }
            Ok(other) => debug!("Unexpected offline packet {:?} from {}", other, self.address),
            Err(e) => debug!("Malformed handshake request from {}: {}", self.address, e),
        }

        self.last_activity = now;
        true
    }

    /// Dispatches one message delivered by the reliability layer.
    pub fn handle_encapsulated_payload(&mut self, payload: Bytes, now: Instant) {
        if packet_id(&payload) == Some(ids::GAME_PACKET) {
            self.forward_to_backend(payload);
            return;
        }

        let packet = match Packet::decode(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Unhandled payload from {}: {}", self.address, e);
                return;
            }
        };

        match packet {
            Packet::ConnectedPing { send_ping_time } => {
                let send_pong_time = self.timestamp(now);
                self.send_packet(
                    &Packet::ConnectedPong {
                        send_ping_time,
                        send_pong_time,
                    },
                    Reliability::Unreliable,
                );
            }
            Packet::ConnectedPong { send_ping_time, .. } => {
                let rtt = self.timestamp(now).saturating_sub(send_ping_time);
                self.latency_ms = Some(rtt);
            }
            Packet::ConnectionRequest { send_ping_time, .. } => {
                let send_pong_time = self.timestamp(now);
                self.send_packet(
                    &Packet::ConnectionRequestAccepted {
                        client_address: self.address.socket_addr(),
                        send_ping_time,
                        send_pong_time,
                    },
                    Reliability::ReliableOrdered,
                );
            }
            Packet::NewIncomingConnection { .. } => {
                if self.is_connected() {
                    debug!("Repeated NewIncomingConnection from {}", self.address);
                    return;
                }
                if self.stage < HandshakeStage::AddressConfirmed {
                    debug!(
                        "{} completed the handshake from stage {}",
                        self.address, self.stage
                    );
                }
                self.advance(HandshakeStage::Connected);
                info!("Connection with {} successfully established!", self.address);
                self.last_keepalive = now;
                self.ensure_bridge();
            }
            Packet::DisconnectionNotification => {
                info!("{} sent a disconnection notification", self.address);
                self.close();
            }
            other => debug!(
                "Unhandled packet 0x{:02x} from {}",
                other.id(),
                self.address
            ),
        }
    }

    /// Drives keepalive, backend relay and frame-set resends.
    pub fn tick(&mut self, now: Instant) {
        if self.is_connected() {
            self.ensure_bridge();
            self.pump_backend(now);

            if now.saturating_duration_since(self.last_keepalive) >= self.context.keepalive_interval
            {
                self.last_keepalive = now;
                let send_ping_time = self.timestamp(now);
                self.send_packet(&Packet::ConnectedPing { send_ping_time }, Reliability::Unreliable);
            }
        }

        self.reliability.tick(now);
    }

    /// Tells the client the proxy is closing the session.
    pub fn disconnect(&mut self, now: Instant) {
        if self.is_disconnected() {
            return;
        }
        if self.stage >= HandshakeStage::AddressConfirmed {
            self.send_packet(&Packet::DisconnectionNotification, Reliability::ReliableOrdered);
            self.reliability.flush(now);
        }
        self.close();
    }

    /// Sends an unencapsulated datagram.
    pub fn send_raw(&mut self, datagram: Bytes) {
        self.raw_outgoing.push(datagram);
    }

    /// Sends a payload reliably and in order.
    pub fn send_reliable(&mut self, payload: Bytes) {
        self.reliability.send(payload, Reliability::ReliableOrdered);
    }

    /// Takes every datagram queued for the peer.
    pub fn drain_outgoing(&mut self) -> Vec<Bytes> {
        let mut datagrams = std::mem::take(&mut self.raw_outgoing);
        datagrams.extend(self.reliability.drain_outgoing());
        datagrams
    }

    fn close(&mut self) {
        self.stage = HandshakeStage::Disconnected;
        self.bridge = None;
    }

    fn advance(&mut self, stage: HandshakeStage) {
        if stage > self.stage {
            debug!("{} moved from {} to {}", self.address, self.stage, stage);
            self.stage = stage;
        }
    }

    /// Milliseconds since the proxy started, never decreasing per session.
    fn timestamp(&mut self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.context.epoch).as_millis() as u64;
        self.last_timestamp = self.last_timestamp.max(elapsed);
        self.last_timestamp
    }

    fn send_packet_raw(&mut self, packet: &Packet) {
        match packet.encode() {
            Ok(datagram) => self.send_raw(datagram),
            Err(e) => warn!("Failed to encode {:?} for {}: {}", packet, self.address, e),
        }
    }

    fn send_packet(&mut self, packet: &Packet, reliability: Reliability) {
        match packet.encode() {
            Ok(payload) => self.reliability.send(payload, reliability),
            Err(e) => warn!("Failed to encode {:?} for {}: {}", packet, self.address, e),
        }
    }

    fn ensure_bridge(&mut self) {
        if self.bridge.is_some() {
            return;
        }
        match BackendBridge::open(self.context.connector.as_ref(), self.address) {
            Ok(bridge) => {
                if self.backend_failed {
                    info!("Backend for {} is reachable again", self.address);
                }
                self.backend_failed = false;
                self.bridge = Some(bridge);
            }
            Err(e) => self.backend_failure(e),
        }
    }

    fn backend_failure(&mut self, error: BackendError) {
        self.bridge = None;
        if self.backend_failed {
            debug!("Backend for {} still failing: {}", self.address, error);
        } else {
            warn!("Backend for {} failed: {}", self.address, error);
            self.backend_failed = true;
        }
    }

    fn forward_to_backend(&mut self, payload: Bytes) {
        if !self.is_connected() {
            debug!("Dropping game packet from {} before connection", self.address);
            return;
        }
        let Some(bridge) = self.bridge.as_mut() else {
            debug!("No backend for {}, dropping game packet", self.address);
            return;
        };
        if let Err(e) = bridge.forward(payload) {
            self.backend_failure(e);
        }
    }

    fn pump_backend(&mut self, now: Instant) {
        let Some(bridge) = self.bridge.as_mut() else {
            return;
        };
        bridge.tick(now);
        match bridge.poll_outbound() {
            Ok(payloads) => {
                for payload in payloads {
                    self.relay_to_client(payload);
                }
            }
            Err(e) => self.backend_failure(e),
        }
    }

    /// Offline messages go out as-is; everything else is encapsulated.
    fn relay_to_client(&mut self, payload: Bytes) {
        match packet_id(&payload) {
            None => {}
            Some(id) if is_offline_message(id) => self.send_raw(payload),
            Some(_) => self.send_reliable(payload),
        }
    }
}

fn is_offline_message(id: u8) -> bool {
    matches!(
        id,
        ids::UNCONNECTED_PING
            | ids::UNCONNECTED_PING_OPEN_CONNECTIONS
            | ids::UNCONNECTED_PONG
            | ids::OPEN_CONNECTION_REQUEST_1
            | ids::OPEN_CONNECTION_REPLY_1
            | ids::OPEN_CONNECTION_REQUEST_2
            | ids::OPEN_CONNECTION_REPLY_2
            | ids::NO_FREE_INCOMING_CONNECTIONS
    )
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("address", &self.address)
            .field("stage", &self.stage)
            .field("mtu_size", &self.mtu_size)
            .field("bridge", &self.bridge.is_some())
            .finish()
    }
}
