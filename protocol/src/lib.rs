//! # Protocol
//!
//! Wire vocabulary shared by the proxy and its scripted test client: the
//! offline handshake messages, the connected control messages, opaque game
//! payloads, and the frame-set framing that carries everything after the
//! offline handshake.
//!
//! All multi-byte integers are big-endian except the 24-bit frame counters,
//! which are little-endian.

pub mod error;
pub mod frame;
pub mod packet;
pub mod wire;

pub use error::CodecError;
pub use frame::{AckRecords, Frame, FrameSet, Reliability, SplitInfo};
pub use packet::{ids, Packet};

/// Marker embedded in every offline message.
pub const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

/// RakNet protocol version spoken by current Bedrock clients.
pub const RAKNET_PROTOCOL_VERSION: u8 = 11;

/// IPv4 + UDP header bytes counted in a negotiated MTU.
pub const UDP_HEADER_OVERHEAD: u16 = 28;

/// Smallest MTU a frame-set sender will assume.
pub const MIN_MTU_SIZE: u16 = 576;

/// Largest MTU a frame-set sender will use.
pub const MAX_MTU_SIZE: u16 = 1500;

/// Returns the id byte of a raw datagram, if there is one.
pub fn packet_id(data: &[u8]) -> Option<u8> {
    data.first().copied()
}
