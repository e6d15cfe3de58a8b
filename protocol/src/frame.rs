//! Frame-set framing used once the offline handshake is over.
//!
//! A frame set is a datagram with a header byte in `0x80..=0x8f`, a 24-bit
//! sequence number and one or more frames. Each frame carries one
//! encapsulated message (or one part of a split message) plus the indices
//! the receiver needs for duplicate detection and ordering. Received frame
//! sets are acknowledged with ACK/NACK datagrams holding sequence ranges.

use crate::error::{CodecError, Result};
use crate::wire::{ReadExt, WriteExt};
use bytes::{BufMut, Bytes, BytesMut};

pub const FRAME_SET_FLAG: u8 = 0x80;
pub const NACK: u8 = 0xa0;
pub const ACK: u8 = 0xc0;

/// Header byte written on outgoing frame sets.
pub const FRAME_SET_HEADER: u8 = 0x84;

/// Bytes taken by the frame-set header (flags + u24 sequence).
pub const FRAME_SET_HEADER_LEN: usize = 4;

/// Largest frame header: flags, bit length, three u24 indices, channel and
/// the split triple.
pub const MAX_FRAME_HEADER_LEN: usize = 1 + 2 + 3 + 3 + 3 + 1 + 10;

/// Upper bound on the sequence numbers a single ACK/NACK range may cover.
const MAX_ACK_RANGE: u32 = 4096;

pub fn is_frame_set(id: u8) -> bool {
    id & 0xf0 == FRAME_SET_FLAG
}

pub fn is_ack(id: u8) -> bool {
    id == ACK
}

pub fn is_nack(id: u8) -> bool {
    id == NACK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableWithAckReceipt = 5,
    ReliableWithAckReceipt = 6,
    ReliableOrderedWithAckReceipt = 7,
}

impl Reliability {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Reliability::Unreliable,
            1 => Reliability::UnreliableSequenced,
            2 => Reliability::Reliable,
            3 => Reliability::ReliableOrdered,
            4 => Reliability::ReliableSequenced,
            5 => Reliability::UnreliableWithAckReceipt,
            6 => Reliability::ReliableWithAckReceipt,
            7 => Reliability::ReliableOrderedWithAckReceipt,
            other => return Err(CodecError::BadReliability(other)),
        })
    }

    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Reliability::Reliable
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
                | Reliability::ReliableWithAckReceipt
                | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced | Reliability::ReliableSequenced
        )
    }

    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            Reliability::ReliableOrdered | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    /// Sequenced frames carry ordering fields too.
    pub fn has_order_fields(self) -> bool {
        self.is_sequenced() || self.is_ordered()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInfo {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}

/// One encapsulated message inside a frame set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub reliability: Reliability,
    pub reliable_index: u32,
    pub sequence_index: u32,
    pub order_index: u32,
    pub order_channel: u8,
    pub split: Option<SplitInfo>,
    pub body: Bytes,
}

impl Frame {
    /// A frame with no indices assigned yet.
    pub fn new(reliability: Reliability, body: Bytes) -> Self {
        Self {
            reliability,
            reliable_index: 0,
            sequence_index: 0,
            order_index: 0,
            order_channel: 0,
            split: None,
            body,
        }
    }

    pub fn header_len(&self) -> usize {
        let mut len = 3;
        if self.reliability.is_reliable() {
            len += 3;
        }
        if self.reliability.is_sequenced() {
            len += 3;
        }
        if self.reliability.has_order_fields() {
            len += 4;
        }
        if self.split.is_some() {
            len += 10;
        }
        len
    }

    pub fn encoded_len(&self) -> usize {
        self.header_len() + self.body.len()
    }

    fn decode(buf: &mut &[u8]) -> Result<Frame> {
        let flags = buf.read_u8()?;
        let reliability = Reliability::from_u8(flags >> 5)?;
        let bit_len = buf.read_u16()? as usize;
        let byte_len = (bit_len + 7) / 8;
        if byte_len == 0 {
            return Err(CodecError::Malformed("zero-length frame"));
        }

        let mut frame = Frame::new(reliability, Bytes::new());
        if reliability.is_reliable() {
            frame.reliable_index = buf.read_u24_le()?;
        }
        if reliability.is_sequenced() {
            frame.sequence_index = buf.read_u24_le()?;
        }
        if reliability.has_order_fields() {
            frame.order_index = buf.read_u24_le()?;
            frame.order_channel = buf.read_u8()?;
        }
        if flags & 0x10 != 0 {
            let split = SplitInfo {
                count: buf.read_u32()?,
                id: buf.read_u16()?,
                index: buf.read_u32()?,
            };
            if split.count == 0 || split.index >= split.count {
                return Err(CodecError::Malformed("split index out of range"));
            }
            frame.split = Some(split);
        }

        buf.need(byte_len)?;
        let data: &[u8] = *buf;
        let (body, rest) = data.split_at(byte_len);
        frame.body = Bytes::copy_from_slice(body);
        *buf = rest;
        Ok(frame)
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut flags = (self.reliability as u8) << 5;
        if self.split.is_some() {
            flags |= 0x10;
        }
        buf.put_u8(flags);
        buf.put_u16((self.body.len() * 8) as u16);
        if self.reliability.is_reliable() {
            buf.put_u24_le(self.reliable_index);
        }
        if self.reliability.is_sequenced() {
            buf.put_u24_le(self.sequence_index);
        }
        if self.reliability.has_order_fields() {
            buf.put_u24_le(self.order_index);
            buf.put_u8(self.order_channel);
        }
        if let Some(split) = &self.split {
            buf.put_u32(split.count);
            buf.put_u16(split.id);
            buf.put_u32(split.index);
        }
        buf.put_slice(&self.body);
    }
}

/// A datagram carrying frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSet {
    pub sequence: u32,
    pub frames: Vec<Frame>,
}

impl FrameSet {
    pub fn decode(data: &[u8]) -> Result<FrameSet> {
        let (&header, mut buf) = data.split_first().ok_or(CodecError::Empty)?;
        if !is_frame_set(header) {
            return Err(CodecError::UnknownPacketId(header));
        }
        let sequence = buf.read_u24_le()?;

        let mut frames = Vec::new();
        while !buf.is_empty() {
            frames.push(Frame::decode(&mut buf)?);
        }
        Ok(FrameSet { sequence, frames })
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_SET_HEADER_LEN + self.frames.iter().map(Frame::encoded_len).sum::<usize>()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(FRAME_SET_HEADER);
        buf.put_u24_le(self.sequence);
        for frame in &self.frames {
            frame.encode(&mut buf);
        }
        buf.freeze()
    }
}

/// Sequence-number ranges carried by ACK and NACK datagrams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckRecords {
    /// Inclusive `(start, end)` ranges.
    pub ranges: Vec<(u32, u32)>,
}

impl AckRecords {
    /// Collapses arbitrary sequence numbers into sorted, merged ranges.
    pub fn from_sequences(mut sequences: Vec<u32>) -> Self {
        sequences.sort_unstable();
        sequences.dedup();

        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for seq in sequences {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == seq => *end = seq,
                _ => ranges.push((seq, seq)),
            }
        }
        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn sequences(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(start, end)| start..=end)
    }

    /// Decodes an ACK or NACK datagram, id byte included.
    pub fn decode(data: &[u8]) -> Result<AckRecords> {
        let (_, mut buf) = data.split_first().ok_or(CodecError::Empty)?;
        let count = buf.read_u16()?;

        let mut ranges = Vec::with_capacity(count.min(512) as usize);
        for _ in 0..count {
            let single = buf.read_bool()?;
            let start = buf.read_u24_le()?;
            let end = if single { start } else { buf.read_u24_le()? };
            if end < start || end - start >= MAX_ACK_RANGE {
                return Err(CodecError::Malformed("acknowledgement range"));
            }
            ranges.push((start, end));
        }
        Ok(AckRecords { ranges })
    }

    pub fn encode(&self, id: u8) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.ranges.len() * 7);
        buf.put_u8(id);
        buf.put_u16(self.ranges.len() as u16);
        for &(start, end) in &self.ranges {
            if start == end {
                buf.put_bool(true);
                buf.put_u24_le(start);
            } else {
                buf.put_bool(false);
                buf.put_u24_le(start);
                buf.put_u24_le(end);
            }
        }
        buf.freeze()
    }
}
