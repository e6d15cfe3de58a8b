//! Offline handshake messages and the connected control messages carried
//! inside frame sets.
//!
//! Every message the proxy understands is a variant of [`Packet`]; decoding
//! picks the variant from the leading id byte and anything else is reported as
//! [`CodecError::UnknownPacketId`].

use crate::error::{CodecError, Result};
use crate::wire::{ReadExt, WriteExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Message identifiers.
pub mod ids {
    pub const CONNECTED_PING: u8 = 0x00;
    pub const UNCONNECTED_PING: u8 = 0x01;
    pub const UNCONNECTED_PING_OPEN_CONNECTIONS: u8 = 0x02;
    pub const CONNECTED_PONG: u8 = 0x03;
    pub const OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
    pub const OPEN_CONNECTION_REPLY_1: u8 = 0x06;
    pub const OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
    pub const OPEN_CONNECTION_REPLY_2: u8 = 0x08;
    pub const CONNECTION_REQUEST: u8 = 0x09;
    pub const CONNECTION_REQUEST_ACCEPTED: u8 = 0x10;
    pub const NEW_INCOMING_CONNECTION: u8 = 0x13;
    pub const NO_FREE_INCOMING_CONNECTIONS: u8 = 0x14;
    pub const DISCONNECTION_NOTIFICATION: u8 = 0x15;
    pub const UNCONNECTED_PONG: u8 = 0x1c;
    /// Header byte of a game-protocol payload.
    pub const GAME_PACKET: u8 = 0xfe;
}

/// Number of system addresses carried by the connection handshake messages.
pub const SYSTEM_ADDRESS_COUNT: usize = 20;

/// A decoded RakNet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectedPing {
        send_ping_time: u64,
    },
    UnconnectedPing {
        send_ping_time: u64,
        client_guid: u64,
        /// Set for `UnconnectedPingOpenConnections`, which only wants an
        /// answer while the server has free slots.
        open_connections_only: bool,
    },
    ConnectedPong {
        send_ping_time: u64,
        send_pong_time: u64,
    },
    OpenConnectionRequest1 {
        protocol_version: u8,
        /// Total datagram length, padding included.
        mtu_size: u16,
    },
    OpenConnectionReply1 {
        server_id: u64,
        mtu_size: u16,
    },
    OpenConnectionRequest2 {
        server_address: SocketAddr,
        mtu_size: u16,
        client_guid: u64,
    },
    OpenConnectionReply2 {
        server_id: u64,
        client_address: SocketAddr,
        mtu_size: u16,
    },
    ConnectionRequest {
        client_guid: u64,
        send_ping_time: u64,
        use_security: bool,
    },
    ConnectionRequestAccepted {
        client_address: SocketAddr,
        send_ping_time: u64,
        send_pong_time: u64,
    },
    NewIncomingConnection {
        server_address: SocketAddr,
        send_ping_time: u64,
        send_pong_time: u64,
    },
    NoFreeIncomingConnections {
        server_id: u64,
    },
    DisconnectionNotification,
    UnconnectedPong {
        send_ping_time: u64,
        server_id: u64,
        server_name: String,
    },
    /// Opaque game-protocol payload, header byte included.
    Game(Bytes),
}

impl Packet {
    /// Returns the wire id of this packet.
    pub fn id(&self) -> u8 {
        match self {
            Packet::ConnectedPing { .. } => ids::CONNECTED_PING,
            Packet::UnconnectedPing {
                open_connections_only: true,
                ..
            } => ids::UNCONNECTED_PING_OPEN_CONNECTIONS,
            Packet::UnconnectedPing { .. } => ids::UNCONNECTED_PING,
            Packet::ConnectedPong { .. } => ids::CONNECTED_PONG,
            Packet::OpenConnectionRequest1 { .. } => ids::OPEN_CONNECTION_REQUEST_1,
            Packet::OpenConnectionReply1 { .. } => ids::OPEN_CONNECTION_REPLY_1,
            Packet::OpenConnectionRequest2 { .. } => ids::OPEN_CONNECTION_REQUEST_2,
            Packet::OpenConnectionReply2 { .. } => ids::OPEN_CONNECTION_REPLY_2,
            Packet::ConnectionRequest { .. } => ids::CONNECTION_REQUEST,
            Packet::ConnectionRequestAccepted { .. } => ids::CONNECTION_REQUEST_ACCEPTED,
            Packet::NewIncomingConnection { .. } => ids::NEW_INCOMING_CONNECTION,
            Packet::NoFreeIncomingConnections { .. } => ids::NO_FREE_INCOMING_CONNECTIONS,
            Packet::DisconnectionNotification => ids::DISCONNECTION_NOTIFICATION,
            Packet::UnconnectedPong { .. } => ids::UNCONNECTED_PONG,
            Packet::Game(_) => ids::GAME_PACKET,
        }
    }

    /// Decodes a complete message, id byte included.
    pub fn decode(data: &[u8]) -> Result<Packet> {
        let (&id, mut buf) = data.split_first().ok_or(CodecError::Empty)?;

        let packet = match id {
            ids::CONNECTED_PING => Packet::ConnectedPing {
                send_ping_time: buf.read_u64()?,
            },
            ids::UNCONNECTED_PING | ids::UNCONNECTED_PING_OPEN_CONNECTIONS => {
                let send_ping_time = buf.read_u64()?;
                buf.read_magic()?;
                // Some clients omit the guid.
                let client_guid = if buf.len() >= 8 { buf.read_u64()? } else { 0 };
                Packet::UnconnectedPing {
                    send_ping_time,
                    client_guid,
                    open_connections_only: id == ids::UNCONNECTED_PING_OPEN_CONNECTIONS,
                }
            }
            ids::CONNECTED_PONG => Packet::ConnectedPong {
                send_ping_time: buf.read_u64()?,
                send_pong_time: buf.read_u64()?,
            },
            ids::OPEN_CONNECTION_REQUEST_1 => {
                buf.read_magic()?;
                let protocol_version = buf.read_u8()?;
                Packet::OpenConnectionRequest1 {
                    protocol_version,
                    mtu_size: u16::try_from(data.len()).unwrap_or(u16::MAX),
                }
            }
            ids::OPEN_CONNECTION_REPLY_1 => {
                buf.read_magic()?;
                let server_id = buf.read_u64()?;
                let _security = buf.read_bool()?;
                Packet::OpenConnectionReply1 {
                    server_id,
                    mtu_size: buf.read_u16()?,
                }
            }
            ids::OPEN_CONNECTION_REQUEST_2 => {
                buf.read_magic()?;
                Packet::OpenConnectionRequest2 {
                    server_address: buf.read_address()?,
                    mtu_size: buf.read_u16()?,
                    client_guid: buf.read_u64()?,
                }
            }
            ids::OPEN_CONNECTION_REPLY_2 => {
                buf.read_magic()?;
                let server_id = buf.read_u64()?;
                let client_address = buf.read_address()?;
                let mtu_size = buf.read_u16()?;
                let _encryption = buf.read_bool()?;
                Packet::OpenConnectionReply2 {
                    server_id,
                    client_address,
                    mtu_size,
                }
            }
            ids::CONNECTION_REQUEST => {
                let client_guid = buf.read_u64()?;
                let send_ping_time = buf.read_u64()?;
                let use_security = if buf.is_empty() { false } else { buf.read_bool()? };
                Packet::ConnectionRequest {
                    client_guid,
                    send_ping_time,
                    use_security,
                }
            }
            ids::CONNECTION_REQUEST_ACCEPTED => {
                let client_address = buf.read_address()?;
                let _system_index = buf.read_u16()?;
                skip_system_addresses(&mut buf)?;
                Packet::ConnectionRequestAccepted {
                    client_address,
                    send_ping_time: buf.read_u64()?,
                    send_pong_time: buf.read_u64()?,
                }
            }
            ids::NEW_INCOMING_CONNECTION => {
                let server_address = buf.read_address()?;
                skip_system_addresses(&mut buf)?;
                Packet::NewIncomingConnection {
                    server_address,
                    send_ping_time: buf.read_u64()?,
                    send_pong_time: buf.read_u64()?,
                }
            }
            ids::NO_FREE_INCOMING_CONNECTIONS => {
                buf.read_magic()?;
                Packet::NoFreeIncomingConnections {
                    server_id: buf.read_u64()?,
                }
            }
            ids::DISCONNECTION_NOTIFICATION => Packet::DisconnectionNotification,
            ids::UNCONNECTED_PONG => {
                let send_ping_time = buf.read_u64()?;
                let server_id = buf.read_u64()?;
                buf.read_magic()?;
                Packet::UnconnectedPong {
                    send_ping_time,
                    server_id,
                    server_name: buf.read_string()?,
                }
            }
            ids::GAME_PACKET => Packet::Game(Bytes::copy_from_slice(data)),
            other => return Err(CodecError::UnknownPacketId(other)),
        };

        Ok(packet)
    }

    /// Encodes this packet, id byte included.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.id());

        match self {
            Packet::ConnectedPing { send_ping_time } => buf.put_u64(*send_ping_time),
            Packet::UnconnectedPing {
                send_ping_time,
                client_guid,
                ..
            } => {
                buf.put_u64(*send_ping_time);
                buf.put_magic();
                buf.put_u64(*client_guid);
            }
            Packet::ConnectedPong {
                send_ping_time,
                send_pong_time,
            } => {
                buf.put_u64(*send_ping_time);
                buf.put_u64(*send_pong_time);
            }
            Packet::OpenConnectionRequest1 {
                protocol_version,
                mtu_size,
            } => {
                buf.put_magic();
                buf.put_u8(*protocol_version);
                let padding = (*mtu_size as usize).saturating_sub(buf.len());
                buf.put_bytes(0, padding);
            }
            Packet::OpenConnectionReply1 {
                server_id,
                mtu_size,
            } => {
                buf.put_magic();
                buf.put_u64(*server_id);
                buf.put_bool(false);
                buf.put_u16(*mtu_size);
            }
            Packet::OpenConnectionRequest2 {
                server_address,
                mtu_size,
                client_guid,
            } => {
                buf.put_magic();
                buf.put_address(server_address);
                buf.put_u16(*mtu_size);
                buf.put_u64(*client_guid);
            }
            Packet::OpenConnectionReply2 {
                server_id,
                client_address,
                mtu_size,
            } => {
                buf.put_magic();
                buf.put_u64(*server_id);
                buf.put_address(client_address);
                buf.put_u16(*mtu_size);
                buf.put_bool(false);
            }
            Packet::ConnectionRequest {
                client_guid,
                send_ping_time,
                use_security,
            } => {
                buf.put_u64(*client_guid);
                buf.put_u64(*send_ping_time);
                buf.put_bool(*use_security);
            }
            Packet::ConnectionRequestAccepted {
                client_address,
                send_ping_time,
                send_pong_time,
            } => {
                buf.put_address(client_address);
                buf.put_u16(0);
                put_system_addresses(&mut buf);
                buf.put_u64(*send_ping_time);
                buf.put_u64(*send_pong_time);
            }
            Packet::NewIncomingConnection {
                server_address,
                send_ping_time,
                send_pong_time,
            } => {
                buf.put_address(server_address);
                put_system_addresses(&mut buf);
                buf.put_u64(*send_ping_time);
                buf.put_u64(*send_pong_time);
            }
            Packet::NoFreeIncomingConnections { server_id } => {
                buf.put_magic();
                buf.put_u64(*server_id);
            }
            Packet::DisconnectionNotification => {}
            Packet::UnconnectedPong {
                send_ping_time,
                server_id,
                server_name,
            } => {
                buf.put_u64(*send_ping_time);
                buf.put_u64(*server_id);
                buf.put_magic();
                buf.put_string(server_name)?;
            }
            Packet::Game(payload) => return Ok(payload.clone()),
        }

        Ok(buf.freeze())
    }
}

fn put_system_addresses(buf: &mut BytesMut) {
    let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    buf.put_address(&loopback);
    for _ in 1..SYSTEM_ADDRESS_COUNT {
        buf.put_address(&unspecified);
    }
}

/// Skips system addresses until only the two trailing timestamps remain.
fn skip_system_addresses(buf: &mut &[u8]) -> Result<()> {
    while buf.len() > 16 {
        buf.read_address()?;
    }
    buf.need(16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_addr() -> SocketAddr {
        "192.168.1.20:51234".parse().unwrap()
    }

    #[test]
    fn test_open_connection_request_1_mtu_is_datagram_length() {
        let packet = Packet::OpenConnectionRequest1 {
            protocol_version: 11,
            mtu_size: 1400,
        };
        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), 1400);

        match Packet::decode(&encoded).unwrap() {
            Packet::OpenConnectionRequest1 {
                protocol_version,
                mtu_size,
            } => {
                assert_eq!(protocol_version, 11);
                assert_eq!(mtu_size, 1400);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_reply_1_layout() {
        let encoded = Packet::OpenConnectionReply1 {
            server_id: 0x0102030405060708,
            mtu_size: 1428,
        }
        .encode()
        .unwrap();

        assert_eq!(encoded[0], ids::OPEN_CONNECTION_REPLY_1);
        assert_eq!(&encoded[1..17], &crate::OFFLINE_MAGIC);
        assert_eq!(&encoded[17..25], &0x0102030405060708u64.to_be_bytes());
        assert_eq!(encoded[25], 0);
        assert_eq!(&encoded[26..28], &1428u16.to_be_bytes());
    }

    #[test]
    fn test_connection_request_accepted_carries_system_addresses() {
        let packet = Packet::ConnectionRequestAccepted {
            client_address: client_addr(),
            send_ping_time: 1234,
            send_pong_time: 5678,
        };
        let encoded = packet.encode().unwrap();
        // id + address + system index + 20 addresses + two timestamps
        assert_eq!(encoded.len(), 1 + 7 + 2 + SYSTEM_ADDRESS_COUNT * 7 + 16);
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_new_incoming_connection_with_fewer_system_addresses() {
        // Clients are free to send fewer than 20 internal addresses.
        let mut buf = BytesMut::new();
        buf.put_u8(ids::NEW_INCOMING_CONNECTION);
        buf.put_address(&"10.0.0.1:19132".parse().unwrap());
        buf.put_address(&"127.0.0.1:0".parse().unwrap());
        buf.put_u64(77);
        buf.put_u64(88);

        match Packet::decode(&buf).unwrap() {
            Packet::NewIncomingConnection {
                send_ping_time,
                send_pong_time,
                ..
            } => {
                assert_eq!(send_ping_time, 77);
                assert_eq!(send_pong_time, 88);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_unconnected_ping_without_guid() {
        let mut buf = BytesMut::new();
        buf.put_u8(ids::UNCONNECTED_PING);
        buf.put_u64(42);
        buf.put_magic();

        assert_eq!(
            Packet::decode(&buf).unwrap(),
            Packet::UnconnectedPing {
                send_ping_time: 42,
                client_guid: 0,
                open_connections_only: false
            }
        );
    }

    #[test]
    fn test_unconnected_pong_string() {
        let packet = Packet::UnconnectedPong {
            send_ping_time: 1,
            server_id: 2,
            server_name: "MCPE;Proxy;".to_string(),
        };
        let encoded = packet.encode().unwrap();
        assert_eq!(encoded[0], ids::UNCONNECTED_PONG);
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_game_payload_is_opaque() {
        let raw = [ids::GAME_PACKET, 0x01, 0x02, 0x03];
        let packet = Packet::decode(&raw).unwrap();
        assert_eq!(packet, Packet::Game(Bytes::copy_from_slice(&raw)));
        assert_eq!(&packet.encode().unwrap()[..], &raw);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Packet::decode(&[]), Err(CodecError::Empty));
        assert_eq!(
            Packet::decode(&[0x42, 0x00]),
            Err(CodecError::UnknownPacketId(0x42))
        );
        assert!(matches!(
            Packet::decode(&[ids::CONNECTED_PING, 0x00]),
            Err(CodecError::Truncated { .. })
        ));
        assert_eq!(
            Packet::decode(&[ids::OPEN_CONNECTION_REQUEST_1; 20]),
            Err(CodecError::BadMagic)
        );
    }

    #[test]
    fn test_disconnection_notification_is_single_byte() {
        let encoded = Packet::DisconnectionNotification.encode().unwrap();
        assert_eq!(&encoded[..], &[ids::DISCONNECTION_NOTIFICATION]);
    }
}
