//! Per-session frame-set reliability.
//!
//! Turns inbound frame sets into in-order message payloads and outbound
//! payloads into frame sets sized for the negotiated MTU. Inbound frame sets
//! are acknowledged on the next flush and gaps in the sequence are NACKed.
//! Outbound reliable frames stay in a recovery queue until acknowledged and
//! are resent on NACK or after [`RESEND_TIMEOUT`].

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use protocol::frame::{self, FRAME_SET_HEADER_LEN, MAX_FRAME_HEADER_LEN};
use protocol::{
    AckRecords, CodecError, Frame, FrameSet, Reliability, SplitInfo, MAX_MTU_SIZE, MIN_MTU_SIZE,
    UDP_HEADER_OVERHEAD,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Unacknowledged reliable frame sets are resent after this long.
pub const RESEND_TIMEOUT: Duration = Duration::from_secs(1);

const MAX_RECOVERY_ENTRIES: usize = 1024;
const MAX_NACK_GAP: u32 = 512;
const RELIABLE_WINDOW: u32 = 4096;
const MAX_ORDERED_BACKLOG: usize = 512;
const MAX_SPLIT_PARTS: u32 = 8192;
const MAX_CONCURRENT_SPLITS: usize = 64;
/// Bytes of incomplete split packets buffered per session.
const MAX_SPLIT_BYTES: usize = 4 * 1024 * 1024;
/// Incomplete split packets are dropped after this long.
pub const SPLIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sequence numbers and frame indices are 24-bit counters.
const INDEX_MASK: u32 = 0x00ff_ffff;
/// Indices less than half the ring ahead count as newer.
const HALF_INDEX_RANGE: u32 = 1 << 23;

/// Forward distance from `from` to `to` on the 24-bit ring.
fn index_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from) & INDEX_MASK
}

fn next_index(index: u32) -> u32 {
    index.wrapping_add(1) & INDEX_MASK
}

/// Reliable frames sent in one frame set, awaiting acknowledgement.
#[derive(Debug)]
struct SentFrameSet {
    frames: Vec<Frame>,
    sent_at: Instant,
}

#[derive(Debug)]
struct SplitAssembly {
    parts: Vec<Option<Bytes>>,
    received: u32,
    bytes: usize,
    first_seen: Instant,
    /// Template carrying the reliability and ordering fields of the message.
    template: Frame,
}

#[derive(Debug, Default)]
struct OrderChannel {
    expected: u32,
    backlog: BTreeMap<u32, Bytes>,
}

#[derive(Debug)]
pub struct ReliabilityLayer {
    mtu: u16,

    next_sequence: u32,
    next_reliable_index: u32,
    next_order_index: u32,
    next_split_id: u16,
    pending: VecDeque<Frame>,
    recovery: BTreeMap<u32, SentFrameSet>,
    outgoing: Vec<Bytes>,

    ack_queue: Vec<u32>,
    nack_queue: Vec<u32>,
    highest_sequence: Option<u32>,
    reliable_window_start: u32,
    received_reliable: HashSet<u32>,
    splits: HashMap<u16, SplitAssembly>,
    split_bytes: usize,
    order_channels: HashMap<u8, OrderChannel>,
    sequenced_next: HashMap<u8, u32>,
}

impl ReliabilityLayer {
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu: mtu.clamp(MIN_MTU_SIZE, MAX_MTU_SIZE),
            next_sequence: 0,
            next_reliable_index: 0,
            next_order_index: 0,
            next_split_id: 0,
            pending: VecDeque::new(),
            recovery: BTreeMap::new(),
            outgoing: Vec::new(),
            ack_queue: Vec::new(),
            nack_queue: Vec::new(),
            highest_sequence: None,
            reliable_window_start: 0,
            received_reliable: HashSet::new(),
            splits: HashMap::new(),
            split_bytes: 0,
            order_channels: HashMap::new(),
            sequenced_next: HashMap::new(),
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Applies the MTU agreed during the offline handshake.
    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu.clamp(MIN_MTU_SIZE, MAX_MTU_SIZE);
    }

    /// Largest frame set the peer is expected to accept.
    fn max_frame_set_len(&self) -> usize {
        (self.mtu - UDP_HEADER_OVERHEAD) as usize
    }

    /// Largest body that fits one frame without splitting.
    pub fn max_frame_body(&self) -> usize {
        self.max_frame_set_len() - FRAME_SET_HEADER_LEN - MAX_FRAME_HEADER_LEN
    }

    /// Number of reliable frame sets awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.recovery.len()
    }

    /// Decodes a frame set and returns the payloads now deliverable, in
    /// delivery order.
    pub fn handle_frame_set(
        &mut self,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<Bytes>, CodecError> {
        let set = FrameSet::decode(data)?;
        self.record_sequence(set.sequence);

        let mut delivered = Vec::new();
        for frame in set.frames {
            if frame.reliability.is_reliable() && !self.accept_reliable(frame.reliable_index) {
                trace!("Dropping duplicate reliable frame {}", frame.reliable_index);
                continue;
            }

            let frame = match frame.split {
                Some(split) => match self.reassemble(split, frame, now) {
                    Some(whole) => whole,
                    None => continue,
                },
                None => frame,
            };

            self.deliver(frame, &mut delivered);
        }
        Ok(delivered)
    }

    /// Drops acknowledged frame sets from the recovery queue.
    pub fn handle_ack(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let records = AckRecords::decode(data)?;
        for seq in records.sequences() {
            self.recovery.remove(&seq);
        }
        Ok(())
    }

    /// Requeues NACKed frame sets for immediate resend.
    pub fn handle_nack(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let records = AckRecords::decode(data)?;
        for seq in records.sequences() {
            if let Some(sent) = self.recovery.remove(&seq) {
                trace!("Peer NACKed frame set {}, resending", seq);
                for frame in sent.frames.into_iter().rev() {
                    self.pending.push_front(frame);
                }
            }
        }
        Ok(())
    }

    /// Queues a payload for the next flush.
    pub fn send(&mut self, payload: Bytes, reliability: Reliability) {
        let order_index = if reliability.has_order_fields() {
            let index = self.next_order_index;
            self.next_order_index = next_index(self.next_order_index);
            index
        } else {
            0
        };

        let max_body = self.max_frame_body();
        if payload.len() <= max_body {
            let mut frame = Frame::new(reliability, payload);
            frame.order_index = order_index;
            self.queue_frame(frame);
            return;
        }

        // Split parts are always sent reliably so the message can be rebuilt.
        let reliability = match reliability {
            Reliability::Unreliable | Reliability::UnreliableWithAckReceipt => {
                Reliability::Reliable
            }
            Reliability::UnreliableSequenced => Reliability::ReliableSequenced,
            other => other,
        };
        let split_id = self.next_split_id;
        self.next_split_id = self.next_split_id.wrapping_add(1);
        let count = payload.len().div_ceil(max_body) as u32;

        for (index, chunk) in payload.chunks(max_body).enumerate() {
            let mut frame = Frame::new(reliability, payload.slice_ref(chunk));
            frame.order_index = order_index;
            frame.split = Some(SplitInfo {
                count,
                id: split_id,
                index: index as u32,
            });
            self.queue_frame(frame);
        }
    }

    fn queue_frame(&mut self, mut frame: Frame) {
        if frame.reliability.is_reliable() {
            frame.reliable_index = self.next_reliable_index;
            self.next_reliable_index = next_index(self.next_reliable_index);
        }
        self.pending.push_back(frame);
    }

    /// Emits pending acknowledgements and packs queued frames into frame sets.
    pub fn flush(&mut self, now: Instant) {
        if !self.ack_queue.is_empty() {
            let records = AckRecords::from_sequences(std::mem::take(&mut self.ack_queue));
            self.outgoing.push(records.encode(frame::ACK));
        }
        if !self.nack_queue.is_empty() {
            let records = AckRecords::from_sequences(std::mem::take(&mut self.nack_queue));
            self.outgoing.push(records.encode(frame::NACK));
        }

        let limit = self.max_frame_set_len();
        while !self.pending.is_empty() {
            let mut frames = Vec::new();
            let mut size = FRAME_SET_HEADER_LEN;
            while let Some(frame) = self.pending.front() {
                if !frames.is_empty() && size + frame.encoded_len() > limit {
                    break;
                }
                size += frame.encoded_len();
                frames.extend(self.pending.pop_front());
            }
            self.emit_frame_set(frames, now);
        }
    }

    /// Resends frame sets that were not acknowledged in time, drops stale
    /// split packets, then flushes.
    pub fn tick(&mut self, now: Instant) {
        let stale: Vec<u16> = self
            .splits
            .iter()
            .filter(|(_, assembly)| {
                now.saturating_duration_since(assembly.first_seen) >= SPLIT_TIMEOUT
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            debug!("Split packet {} timed out", id);
            self.drop_split(id);
        }

        let expired: Vec<u32> = self
            .recovery
            .iter()
            .filter(|(_, sent)| now.saturating_duration_since(sent.sent_at) >= RESEND_TIMEOUT)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in expired {
            if let Some(sent) = self.recovery.remove(&seq) {
                debug!("Frame set {} unacknowledged, resending", seq);
                self.pending.extend(sent.frames);
            }
        }

        self.flush(now);
    }

    /// Takes the datagrams ready to be written to the socket.
    pub fn drain_outgoing(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outgoing)
    }

    fn emit_frame_set(&mut self, frames: Vec<Frame>, now: Instant) {
        let sequence = self.next_sequence;
        self.next_sequence = next_index(self.next_sequence);

        let set = FrameSet { sequence, frames };
        self.outgoing.push(set.encode());

        let reliable: Vec<Frame> = set
            .frames
            .into_iter()
            .filter(|frame| frame.reliability.is_reliable())
            .collect();
        if reliable.is_empty() {
            return;
        }

        if self.recovery.len() >= MAX_RECOVERY_ENTRIES {
            if let Some((oldest, _)) = self.recovery.pop_first() {
                debug!("Recovery queue full, giving up on frame set {}", oldest);
            }
        }
        self.recovery.insert(
            sequence,
            SentFrameSet {
                frames: reliable,
                sent_at: now,
            },
        );
    }

    fn record_sequence(&mut self, sequence: u32) {
        self.ack_queue.push(sequence);
        self.nack_queue.retain(|&missing| missing != sequence);

        match self.highest_sequence {
            None => self.highest_sequence = Some(sequence),
            Some(highest) => {
                let ahead = index_distance(highest, sequence);
                if ahead == 0 || ahead >= HALF_INDEX_RANGE {
                    return;
                }
                let missing = (ahead - 1).min(MAX_NACK_GAP);
                self.nack_queue.extend(
                    (1..=missing)
                        .rev()
                        .map(|back| sequence.wrapping_sub(back) & INDEX_MASK),
                );
                self.highest_sequence = Some(sequence);
            }
        }
    }

    /// Returns false for reliable indices already seen or too far ahead.
    fn accept_reliable(&mut self, index: u32) -> bool {
        if index_distance(self.reliable_window_start, index) >= RELIABLE_WINDOW {
            return false;
        }
        if !self.received_reliable.insert(index) {
            return false;
        }
        while self.received_reliable.remove(&self.reliable_window_start) {
            self.reliable_window_start = next_index(self.reliable_window_start);
        }
        true
    }

    fn reassemble(&mut self, split: SplitInfo, frame: Frame, now: Instant) -> Option<Frame> {
        if split.count > MAX_SPLIT_PARTS {
            debug!("Dropping split packet with {} parts", split.count);
            return None;
        }
        if !self.splits.contains_key(&split.id) && self.splits.len() >= MAX_CONCURRENT_SPLITS {
            self.evict_oldest_split(split.id);
        }
        while self.split_bytes + frame.body.len() > MAX_SPLIT_BYTES {
            if !self.evict_oldest_split(split.id) {
                debug!("Split {} exceeds the reassembly budget, dropping it", split.id);
                self.drop_split(split.id);
                return None;
            }
        }

        let assembly = self.splits.entry(split.id).or_insert_with(|| SplitAssembly {
            parts: vec![None; split.count as usize],
            received: 0,
            bytes: 0,
            first_seen: now,
            template: Frame {
                split: None,
                body: Bytes::new(),
                ..frame.clone()
            },
        });
        if assembly.parts.len() != split.count as usize {
            debug!("Split {} changed its part count", split.id);
            return None;
        }

        let slot = &mut assembly.parts[split.index as usize];
        if slot.is_none() {
            assembly.bytes += frame.body.len();
            self.split_bytes += frame.body.len();
            *slot = Some(frame.body);
            assembly.received += 1;
        }
        if assembly.received < split.count {
            return None;
        }

        let assembly = self.drop_split(split.id)?;
        let mut body = BytesMut::new();
        for part in assembly.parts.into_iter().flatten() {
            body.extend_from_slice(&part);
        }
        Some(Frame {
            body: body.freeze(),
            ..assembly.template
        })
    }

    /// Drops the assembly that started first, other than `keep`. Returns
    /// whether one was dropped.
    fn evict_oldest_split(&mut self, keep: u16) -> bool {
        let oldest = self
            .splits
            .iter()
            .filter(|(id, _)| **id != keep)
            .min_by_key(|(_, assembly)| assembly.first_seen)
            .map(|(id, _)| *id);
        match oldest {
            Some(id) => {
                debug!("Evicting incomplete split packet {}", id);
                self.drop_split(id);
                true
            }
            None => false,
        }
    }

    fn drop_split(&mut self, id: u16) -> Option<SplitAssembly> {
        let assembly = self.splits.remove(&id)?;
        self.split_bytes -= assembly.bytes;
        Some(assembly)
    }

    fn deliver(&mut self, frame: Frame, delivered: &mut Vec<Bytes>) {
        let reliability = frame.reliability;

        if reliability.is_sequenced() {
            let next = self.sequenced_next.entry(frame.order_channel).or_insert(0);
            if index_distance(*next, frame.sequence_index) >= HALF_INDEX_RANGE {
                return;
            }
            *next = next_index(frame.sequence_index);
            delivered.push(frame.body);
            return;
        }

        if !reliability.is_ordered() {
            delivered.push(frame.body);
            return;
        }

        let channel = self.order_channels.entry(frame.order_channel).or_default();
        let ahead = index_distance(channel.expected, frame.order_index);
        if ahead >= HALF_INDEX_RANGE {
            return;
        }
        if ahead > 0 {
            if channel.backlog.len() < MAX_ORDERED_BACKLOG {
                channel.backlog.insert(frame.order_index, frame.body);
            }
            return;
        }

        delivered.push(frame.body);
        channel.expected = next_index(channel.expected);
        while let Some(body) = channel.backlog.remove(&channel.expected) {
            delivered.push(body);
            channel.expected = next_index(channel.expected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::frame::{ACK, NACK};

    fn frame_set(sequence: u32, frames: Vec<Frame>) -> Bytes {
        FrameSet { sequence, frames }.encode()
    }

    fn ordered(reliable_index: u32, order_index: u32, body: &'static [u8]) -> Frame {
        let mut frame = Frame::new(Reliability::ReliableOrdered, Bytes::from_static(body));
        frame.reliable_index = reliable_index;
        frame.order_index = order_index;
        frame
    }

    #[test]
    fn test_inbound_frames_are_acked_on_flush() {
        let mut layer = ReliabilityLayer::new(1400);
        let delivered = layer
            .handle_frame_set(&frame_set(0, vec![ordered(0, 0, b"\x09a")]), Instant::now())
            .unwrap();
        assert_eq!(delivered, vec![Bytes::from_static(b"\x09a")]);

        layer.flush(Instant::now());
        let out = layer.drain_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][0], ACK);
        assert_eq!(AckRecords::decode(&out[0]).unwrap().ranges, vec![(0, 0)]);
    }

    #[test]
    fn test_sequence_gap_is_nacked() {
        let mut layer = ReliabilityLayer::new(1400);
        layer.handle_frame_set(&frame_set(0, vec![]), Instant::now()).unwrap();
        layer.handle_frame_set(&frame_set(3, vec![]), Instant::now()).unwrap();
        layer.flush(Instant::now());

        let out = layer.drain_outgoing();
        let nack = out.iter().find(|d| d[0] == NACK).expect("nack");
        assert_eq!(AckRecords::decode(nack).unwrap().ranges, vec![(1, 2)]);
    }

    #[test]
    fn test_late_frame_set_clears_its_nack() {
        let mut layer = ReliabilityLayer::new(1400);
        layer.handle_frame_set(&frame_set(0, vec![]), Instant::now()).unwrap();
        layer.handle_frame_set(&frame_set(2, vec![]), Instant::now()).unwrap();
        layer.handle_frame_set(&frame_set(1, vec![]), Instant::now()).unwrap();
        layer.flush(Instant::now());

        let out = layer.drain_outgoing();
        assert!(out.iter().all(|d| d[0] != NACK));
    }

    #[test]
    fn test_duplicate_reliable_frame_is_dropped() {
        let mut layer = ReliabilityLayer::new(1400);
        let first = layer
            .handle_frame_set(&frame_set(0, vec![ordered(0, 0, b"x")]), Instant::now())
            .unwrap();
        let again = layer
            .handle_frame_set(&frame_set(1, vec![ordered(0, 0, b"x")]), Instant::now())
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(again.is_empty());
    }

    #[test]
    fn test_ordered_frames_wait_for_gap() {
        let mut layer = ReliabilityLayer::new(1400);
        let early = layer
            .handle_frame_set(&frame_set(0, vec![ordered(1, 1, b"second")]), Instant::now())
            .unwrap();
        assert!(early.is_empty());

        let both = layer
            .handle_frame_set(&frame_set(1, vec![ordered(0, 0, b"first")]), Instant::now())
            .unwrap();
        assert_eq!(
            both,
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
    }

    #[test]
    fn test_split_packet_reassembly() {
        let mut layer = ReliabilityLayer::new(1400);
        let part = |index: u32, body: &'static [u8]| {
            let mut frame = ordered(index, 0, body);
            frame.split = Some(SplitInfo {
                count: 2,
                id: 9,
                index,
            });
            frame
        };

        assert!(layer
            .handle_frame_set(&frame_set(0, vec![part(1, b"world")]), Instant::now())
            .unwrap()
            .is_empty());
        let whole = layer
            .handle_frame_set(&frame_set(1, vec![part(0, b"hello ")]), Instant::now())
            .unwrap();
        assert_eq!(whole, vec![Bytes::from_static(b"hello world")]);
    }

    #[test]
    fn test_large_payload_is_split_within_mtu() {
        let mut layer = ReliabilityLayer::new(576);
        let payload = Bytes::from(vec![0xfe; 2000]);
        layer.send(payload.clone(), Reliability::ReliableOrdered);
        layer.flush(Instant::now());

        let out = layer.drain_outgoing();
        assert!(out.len() > 1);
        assert!(out.iter().all(|d| d.len() <= 576 - 28));

        // Feeding our own output back reassembles the original payload.
        let mut peer = ReliabilityLayer::new(576);
        let mut received = Vec::new();
        for datagram in &out {
            received.extend(peer.handle_frame_set(datagram, Instant::now()).unwrap());
        }
        assert_eq!(received, vec![payload]);
    }

    #[test]
    fn test_small_frames_share_a_frame_set() {
        let mut layer = ReliabilityLayer::new(1400);
        layer.send(Bytes::from_static(b"\x03one"), Reliability::Unreliable);
        layer.send(Bytes::from_static(b"\xfetwo"), Reliability::ReliableOrdered);
        layer.flush(Instant::now());

        let out = layer.drain_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(FrameSet::decode(&out[0]).unwrap().frames.len(), 2);
        // Only the reliable frame is tracked for recovery.
        assert_eq!(layer.in_flight(), 1);
    }

    #[test]
    fn test_ack_clears_recovery() {
        let mut layer = ReliabilityLayer::new(1400);
        layer.send(Bytes::from_static(b"\xfe"), Reliability::ReliableOrdered);
        layer.flush(Instant::now());
        assert_eq!(layer.in_flight(), 1);

        let ack = AckRecords::from_sequences(vec![0]).encode(ACK);
        layer.handle_ack(&ack).unwrap();
        assert_eq!(layer.in_flight(), 0);
    }

    #[test]
    fn test_nack_resends_with_new_sequence() {
        let mut layer = ReliabilityLayer::new(1400);
        layer.send(Bytes::from_static(b"\xfe"), Reliability::ReliableOrdered);
        let now = Instant::now();
        layer.flush(now);
        layer.drain_outgoing();

        let nack = AckRecords::from_sequences(vec![0]).encode(NACK);
        layer.handle_nack(&nack).unwrap();
        layer.flush(now);

        let out = layer.drain_outgoing();
        assert_eq!(out.len(), 1);
        let resent = FrameSet::decode(&out[0]).unwrap();
        assert_eq!(resent.sequence, 1);
        assert_eq!(resent.frames[0].reliable_index, 0);
    }

    #[test]
    fn test_timeout_resend() {
        let mut layer = ReliabilityLayer::new(1400);
        layer.send(Bytes::from_static(b"\xfe"), Reliability::ReliableOrdered);
        let start = Instant::now();
        layer.flush(start);
        layer.drain_outgoing();

        layer.tick(start + Duration::from_millis(100));
        assert!(layer.drain_outgoing().is_empty());

        layer.tick(start + RESEND_TIMEOUT);
        assert_eq!(layer.drain_outgoing().len(), 1);
        assert_eq!(layer.in_flight(), 1);
    }

    fn split_part(reliable_index: u32, id: u16, count: u32, index: u32, body: Bytes) -> Frame {
        let mut frame = Frame::new(Reliability::Reliable, body);
        frame.reliable_index = reliable_index;
        frame.split = Some(SplitInfo { count, id, index });
        frame
    }

    #[test]
    fn test_ordered_delivery_crosses_index_wrap() {
        let now = Instant::now();
        let mut sender = ReliabilityLayer::new(1400);
        let mut receiver = ReliabilityLayer::new(1400);
        sender.next_reliable_index = 0x00ff_fffe;
        sender.next_order_index = 0x00ff_fffe;
        receiver.reliable_window_start = 0x00ff_fffe;
        receiver.order_channels.entry(0).or_default().expected = 0x00ff_fffe;

        let mut datagrams = Vec::new();
        for body in [&b"\x09a"[..], b"\x09b", b"\x09c"] {
            sender.send(Bytes::copy_from_slice(body), Reliability::ReliableOrdered);
            sender.flush(now);
            datagrams.extend(sender.drain_outgoing());
        }

        let mut delivered = Vec::new();
        for datagram in &datagrams {
            delivered.extend(receiver.handle_frame_set(datagram, now).unwrap());
        }
        assert_eq!(
            delivered,
            vec![
                Bytes::from_static(b"\x09a"),
                Bytes::from_static(b"\x09b"),
                Bytes::from_static(b"\x09c"),
            ]
        );
        assert_eq!(receiver.reliable_window_start, 1);

        // A replay from before the wrap is still a duplicate.
        assert!(receiver.handle_frame_set(&datagrams[0], now).unwrap().is_empty());
    }

    #[test]
    fn test_ordered_backlog_across_index_wrap() {
        let now = Instant::now();
        let mut layer = ReliabilityLayer::new(1400);
        layer.reliable_window_start = 0x00ff_ffff;
        layer.order_channels.entry(0).or_default().expected = 0x00ff_ffff;

        let early = layer
            .handle_frame_set(&frame_set(0, vec![ordered(0, 0, b"after")]), now)
            .unwrap();
        assert!(early.is_empty());

        let both = layer
            .handle_frame_set(&frame_set(1, vec![ordered(0x00ff_ffff, 0x00ff_ffff, b"before")]), now)
            .unwrap();
        assert_eq!(
            both,
            vec![Bytes::from_static(b"before"), Bytes::from_static(b"after")]
        );
    }

    #[test]
    fn test_sequence_gaps_are_nacked_across_wrap() {
        let now = Instant::now();
        let mut layer = ReliabilityLayer::new(1400);
        layer.handle_frame_set(&frame_set(0x00ff_fffe, vec![]), now).unwrap();
        layer.handle_frame_set(&frame_set(1, vec![]), now).unwrap();
        layer.flush(now);

        let out = layer.drain_outgoing();
        let nack = out.iter().find(|d| d[0] == NACK).expect("nack");
        assert_eq!(
            AckRecords::decode(nack).unwrap().ranges,
            vec![(0, 0), (0x00ff_ffff, 0x00ff_ffff)]
        );

        // Gaps after the wrap are still detected.
        layer.handle_frame_set(&frame_set(4, vec![]), now).unwrap();
        layer.flush(now);
        let out = layer.drain_outgoing();
        let nack = out.iter().find(|d| d[0] == NACK).expect("nack");
        assert_eq!(AckRecords::decode(nack).unwrap().ranges, vec![(2, 3)]);
    }

    #[test]
    fn test_abandoned_splits_are_evicted_at_cap() {
        let now = Instant::now();
        let mut layer = ReliabilityLayer::new(1400);
        for id in 0..MAX_CONCURRENT_SPLITS as u16 {
            let part = split_part(id as u32, id, 2, 0, Bytes::from_static(b"lost"));
            assert!(layer
                .handle_frame_set(&frame_set(id as u32, vec![part]), now)
                .unwrap()
                .is_empty());
        }
        assert_eq!(layer.splits.len(), MAX_CONCURRENT_SPLITS);

        let base = MAX_CONCURRENT_SPLITS as u32;
        let whole = layer
            .handle_frame_set(
                &frame_set(
                    base,
                    vec![
                        split_part(base, 100, 2, 0, Bytes::from_static(b"\xfehello ")),
                        split_part(base + 1, 100, 2, 1, Bytes::from_static(b"world")),
                    ],
                ),
                now,
            )
            .unwrap();

        assert_eq!(whole, vec![Bytes::from_static(b"\xfehello world")]);
        assert!(layer.splits.len() <= MAX_CONCURRENT_SPLITS);
    }

    #[test]
    fn test_stale_splits_expire_on_tick() {
        let start = Instant::now();
        let mut layer = ReliabilityLayer::new(1400);
        let part = split_part(0, 7, 2, 0, Bytes::from_static(b"half"));
        layer.handle_frame_set(&frame_set(0, vec![part]), start).unwrap();
        assert_eq!(layer.split_bytes, 4);

        layer.tick(start + Duration::from_secs(1));
        assert_eq!(layer.splits.len(), 1);

        layer.tick(start + SPLIT_TIMEOUT);
        assert!(layer.splits.is_empty());
        assert_eq!(layer.split_bytes, 0);
    }

    #[test]
    fn test_split_buffer_is_bounded() {
        let now = Instant::now();
        let mut layer = ReliabilityLayer::new(1400);
        let chunk = Bytes::from(vec![0u8; 8000]);
        let parts = (MAX_SPLIT_BYTES / chunk.len()) as u32 + 8;

        let early = split_part(0, 1, 2, 0, chunk.clone());
        layer.handle_frame_set(&frame_set(0, vec![early]), now).unwrap();
        for index in 0..parts {
            let part = split_part(index + 1, 2, parts + 1, index, chunk.clone());
            layer
                .handle_frame_set(&frame_set(index + 1, vec![part]), now)
                .unwrap();
            assert!(layer.split_bytes <= MAX_SPLIT_BYTES);
        }

        // The older split was evicted first, then the oversized one itself.
        assert!(!layer.splits.contains_key(&1));
        assert!(layer.split_bytes <= MAX_SPLIT_BYTES);
    }

    #[test]
    fn test_mtu_is_clamped() {
        let mut layer = ReliabilityLayer::new(100);
        assert_eq!(layer.mtu(), MIN_MTU_SIZE);
        layer.set_mtu(9000);
        assert_eq!(layer.mtu(), MAX_MTU_SIZE);
    }
}
