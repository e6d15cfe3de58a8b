//! Errors raised while decoding or encoding RakNet wire data.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("empty datagram")]
    Empty,

    #[error("offline message magic mismatch")]
    BadMagic,

    #[error("unknown packet id 0x{0:02x}")]
    UnknownPacketId(u8),

    #[error("unsupported address version {0}")]
    BadAddressVersion(u8),

    #[error("string of {0} bytes does not fit a u16 length prefix")]
    StringTooLong(usize),

    #[error("invalid reliability type {0}")]
    BadReliability(u8),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

pub type Result<T> = std::result::Result<T, CodecError>;
