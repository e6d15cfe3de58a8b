//! Session registry: the proxy's table of live clients.
//!
//! The registry routes each inbound datagram by sender address. Discovery
//! pings are answered directly without touching the table, a new session is
//! created only by `OpenConnectionRequest1`, and everything else from an
//! unknown address is dropped. Replies are queued per peer and collected by
//! the network layer through [`SessionRegistry::drain_outgoing`].

use crate::address::AddressKey;
use crate::backend::BackendConnector;
use crate::config::ProxyConfig;
use crate::session::{ClientSession, SessionContext};
use bytes::Bytes;
use log::{debug, info, warn};
use protocol::{ids, packet_id, Packet};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// A live session and the transport address replies go to.
#[derive(Debug)]
struct Entry {
    session: ClientSession,
    peer: SocketAddr,
}

pub struct SessionRegistry {
    config: ProxyConfig,
    context: SessionContext,
    sessions: HashMap<AddressKey, Entry>,
    outgoing: Vec<(SocketAddr, Bytes)>,
}

impl SessionRegistry {
    /// Creates an empty registry with a random server id.
    pub fn new(config: ProxyConfig, connector: Arc<dyn BackendConnector>) -> Self {
        Self::with_server_id(config, connector, rand::random())
    }

    pub fn with_server_id(
        config: ProxyConfig,
        connector: Arc<dyn BackendConnector>,
        server_id: u64,
    ) -> Self {
        let context = SessionContext {
            server_id,
            epoch: Instant::now(),
            keepalive_interval: config.keepalive_interval(),
            connector,
        };
        Self {
            config,
            context,
            sessions: HashMap::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn server_id(&self) -> u64 {
        self.context.server_id
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, key: &AddressKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn get(&self, key: &AddressKey) -> Option<&ClientSession> {
        self.sessions.get(key).map(|entry| &entry.session)
    }

    /// Routes one inbound datagram.
    ///
    /// Discovery pings are answered statelessly. A datagram from an unknown
    /// address creates a session only when it is `OpenConnectionRequest1`
    /// and the proxy is below its session cap; at the cap the client is told
    /// `NoFreeIncomingConnections` instead.
    pub fn dispatch(&mut self, raw: &[u8], sender: SocketAddr, now: Instant) {
        if raw.is_empty() {
            debug!("Dropping empty datagram from {}", sender);
            return;
        }
        if self.discovery(raw, sender) {
            return;
        }

        let key = AddressKey::from(sender);
        if !self.sessions.contains_key(&key) {
            if packet_id(raw) != Some(ids::OPEN_CONNECTION_REQUEST_1) {
                debug!(
                    "Dropping 0x{:02x} from unknown address {}",
                    raw[0], sender
                );
                return;
            }
            if self.sessions.len() >= self.config.max_sessions {
                warn!(
                    "Session limit {} reached, refusing {}",
                    self.config.max_sessions, sender
                );
                self.queue(
                    sender,
                    &Packet::NoFreeIncomingConnections {
                        server_id: self.context.server_id,
                    },
                );
                return;
            }

            info!("New session from {}", key);
            let session = ClientSession::new(key, self.context.clone(), now);
            self.sessions.insert(
                key,
                Entry {
                    session,
                    peer: sender,
                },
            );
        }

        let Some(entry) = self.sessions.get_mut(&key) else {
            return;
        };
        entry.peer = sender;
        entry.session.handle(raw, now);
        self.collect(&key);
    }

    /// Answers unconnected pings. Returns whether the datagram was one.
    pub fn discovery(&mut self, raw: &[u8], sender: SocketAddr) -> bool {
        let id = packet_id(raw);
        if id != Some(ids::UNCONNECTED_PING) && id != Some(ids::UNCONNECTED_PING_OPEN_CONNECTIONS)
        {
            return false;
        }

        match Packet::decode(raw) {
            Ok(Packet::UnconnectedPing {
                send_ping_time,
                open_connections_only,
                ..
            }) => {
                let count = self.sessions.len();
                if open_connections_only && count >= self.config.max_sessions {
                    debug!("No open slots, ignoring ping from {}", sender);
                    return true;
                }
                let server_name =
                    self.config
                        .motd
                        .status_line(count, self.config.max_sessions, self.context.server_id);
                self.queue(
                    sender,
                    &Packet::UnconnectedPong {
                        send_ping_time,
                        server_id: self.context.server_id,
                        server_name,
                    },
                );
            }
            Ok(_) => {}
            Err(e) => debug!("Malformed ping from {}: {}", sender, e),
        }
        true
    }

    /// Expires idle sessions and drives every live one.
    pub fn tick(&mut self, now: Instant) {
        let timeout = self.config.session_timeout();
        let keys: Vec<AddressKey> = self.sessions.keys().copied().collect();

        for key in keys {
            let Some(entry) = self.sessions.get_mut(&key) else {
                continue;
            };
            if entry.session.is_idle(now, timeout) {
                info!("{} timed out", key);
                entry.session.disconnect(now);
            } else {
                entry.session.tick(now);
            }
            self.collect(&key);
        }
    }

    /// Forgets a session. Removing an unknown address is a no-op.
    pub fn remove_session(&mut self, key: &AddressKey) -> bool {
        match self.sessions.remove(key) {
            Some(_) => {
                info!("Player with address {} disconnected!", key);
                true
            }
            None => false,
        }
    }

    /// Notifies every client and empties the table.
    pub fn shutdown(&mut self, now: Instant) {
        if !self.sessions.is_empty() {
            info!("Closing {} sessions", self.sessions.len());
        }
        let keys: Vec<AddressKey> = self.sessions.keys().copied().collect();
        for key in keys {
            if let Some(entry) = self.sessions.get_mut(&key) {
                entry.session.disconnect(now);
            }
            self.collect(&key);
        }
    }

    /// Takes every datagram queued for the socket, paired with its target.
    pub fn drain_outgoing(&mut self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut self.outgoing)
    }

    /// Moves a session's queued datagrams to the socket queue and drops
    /// the session once it has disconnected.
    fn collect(&mut self, key: &AddressKey) {
        let Some(entry) = self.sessions.get_mut(key) else {
            return;
        };
        let peer = entry.peer;
        let disconnected = entry.session.is_disconnected();
        self.outgoing.extend(
            entry
                .session
                .drain_outgoing()
                .into_iter()
                .map(|datagram| (peer, datagram)),
        );
        if disconnected {
            self.remove_session(key);
        }
    }

    fn queue(&mut self, target: SocketAddr, packet: &Packet) {
        match packet.encode() {
            Ok(datagram) => self.outgoing.push((target, datagram)),
            Err(e) => warn!("Failed to encode reply for {}: {}", target, e),
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("server_id", &self.context.server_id)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
