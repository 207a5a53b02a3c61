//! Lower transport (C9): segmentation, block acknowledgement, retransmission, and reassembly of
//! access/control messages that don't fit in a single network PDU. This is the hardest subsystem
//! in the stack and earns the largest line-count share (§2, §4.9).
//!
//! All PDU bytes handled here are already network-encrypted; this layer only ever sees/produces
//! the `TransportPDU` slice referenced by [`crate::network`].

use crate::address::Address;
use crate::bytes::{ByteReader, ByteWriter};
use crate::error::Error;
use crate::time::{Duration, Instant};

/// Maximum payload of a single unsegmented access transport PDU.
pub const MAX_UNSEG_ACCESS_PAYLOAD: usize = 15;
/// Maximum payload of a single unsegmented control transport PDU.
pub const MAX_UNSEG_CONTROL_PAYLOAD: usize = 11;
/// Maximum payload of one access segment.
pub const MAX_SEG_ACCESS_PAYLOAD: usize = 12;
/// Maximum payload of one control segment.
pub const MAX_SEG_CONTROL_PAYLOAD: usize = 8;
/// `SegN` is 5 bits, so at most 32 segments make up one segmented message.
pub const MAX_SEGMENTS: usize = 32;
/// Largest reassembled upper transport PDU this layer will build or accept: `MAX_SEGMENTS *
/// MAX_SEG_ACCESS_PAYLOAD` (the access segment size is the larger of the two), comfortably
/// covering the access layer's 380-octet segmented ceiling (§4.11) plus its TransMIC.
pub const MAX_REASSEMBLED_PDU: usize = MAX_SEGMENTS * MAX_SEG_ACCESS_PAYLOAD;

/// The control opcode used by a Segment Acknowledgment PDU (§4.9).
pub const SEGACK_OPCODE: u8 = 0x00;

/// The 13-bit low-order window of a segmented message's authoritative sequence number, as carried
/// on the wire.
pub fn seq_zero_of(seq_auth: u32) -> u16 {
    (seq_auth & 0x1FFF) as u16
}

/// Reconstructs the full `SeqAuth` of a segment from its wire-carried `SeqZero` and the network
/// `SEQ` it arrived on (§4.9).
pub fn reconstruct_seq_auth(seq_zero: u16, seq: u32) -> u32 {
    let low13 = seq & 0x1FFF;
    let high = seq & !0x1FFF;
    let seq_zero = u32::from(seq_zero);
    if seq_zero > low13 {
        high.wrapping_sub(0x2000).wrapping_add(seq_zero)
    } else {
        high.wrapping_add(seq_zero)
    }
}

/// Whether `seq` is a valid member of the segmented message authoritative sequence `seq_auth`:
/// `0 ≤ (SEQ − SeqAuth) < 0x2000` (§4.9).
pub fn seq_auth_valid(seq: u32, seq_auth: u32) -> bool {
    seq.wrapping_sub(seq_auth) < 0x2000
}

/// A parsed lower-transport PDU. Payload slices borrow from the buffer passed to [`parse`].
#[derive(Debug, Copy, Clone)]
pub enum LowerPdu<'a> {
    UnsegmentedAccess {
        akf: bool,
        aid: u8,
        payload: &'a [u8],
    },
    SegmentedAccess {
        akf: bool,
        aid: u8,
        szmic: bool,
        seq_zero: u16,
        seg_o: u8,
        seg_n: u8,
        payload: &'a [u8],
    },
    UnsegmentedControl {
        opcode: u8,
        payload: &'a [u8],
    },
    SegmentedControl {
        opcode: u8,
        seq_zero: u16,
        seg_o: u8,
        seg_n: u8,
        payload: &'a [u8],
    },
    SegmentAck {
        obo: bool,
        seq_zero: u16,
        block_ack: u32,
    },
}

/// Parses a `TransportPDU` known (from the carrying network PDU's `CTL` bit) to be an access
/// message.
pub fn parse_access(pdu: &[u8]) -> Result<LowerPdu<'_>, Error> {
    let mut r = ByteReader::new(pdu);
    let b0 = r.read_u8()?;
    let seg = b0 & 0x80 != 0;
    let akf = b0 & 0x40 != 0;
    let aid = b0 & 0x3F;

    if !seg {
        let payload = r.read_rest();
        if payload.len() > MAX_UNSEG_ACCESS_PAYLOAD {
            return Err(Error::Length);
        }
        return Ok(LowerPdu::UnsegmentedAccess { akf, aid, payload });
    }

    let b1 = r.read_u8()?;
    let b2 = r.read_u8()?;
    let b3 = r.read_u8()?;
    let szmic = b1 & 0x80 != 0;
    let seq_zero = (((b1 as u16) & 0x7F) << 6) | ((b2 as u16) >> 2);
    let seg_o = ((b2 & 0x03) << 3) | (b3 >> 5);
    let seg_n = b3 & 0x1F;
    let payload = r.read_rest();
    if payload.len() > MAX_SEG_ACCESS_PAYLOAD {
        return Err(Error::Length);
    }

    Ok(LowerPdu::SegmentedAccess {
        akf,
        aid,
        szmic,
        seq_zero,
        seg_o,
        seg_n,
        payload,
    })
}

/// Parses a `TransportPDU` known to be a control message (including Segment Ack, opcode 0).
pub fn parse_control(pdu: &[u8]) -> Result<LowerPdu<'_>, Error> {
    let mut r = ByteReader::new(pdu);
    let b0 = r.read_u8()?;
    let seg = b0 & 0x80 != 0;
    let opcode = b0 & 0x7F;

    if !seg {
        if opcode == SEGACK_OPCODE {
            // OBO(1) | SeqZero(13) | RFU(2) | BlockAck(32), packed after the opcode byte already
            // consumed above: 48 bits total across 6 bytes.
            let b = r.read_array::<[u8; 6]>()?;
            let obo = b[0] & 0x80 != 0;
            let seq_zero = (((b[0] as u16) & 0x7F) << 6) | ((b[1] as u16) >> 2);
            let raw48 = ((b[0] as u64) << 40)
                | ((b[1] as u64) << 32)
                | ((b[2] as u64) << 24)
                | ((b[3] as u64) << 16)
                | ((b[4] as u64) << 8)
                | (b[5] as u64);
            let block_ack = (raw48 & 0xFFFF_FFFF) as u32;
            return Ok(LowerPdu::SegmentAck {
                obo,
                seq_zero,
                block_ack,
            });
        }
        let payload = r.read_rest();
        if payload.len() > MAX_UNSEG_CONTROL_PAYLOAD {
            return Err(Error::Length);
        }
        return Ok(LowerPdu::UnsegmentedControl { opcode, payload });
    }

    let b1 = r.read_u8()?;
    let b2 = r.read_u8()?;
    let b3 = r.read_u8()?;
    let seq_zero = (((b1 as u16) & 0x7F) << 6) | ((b2 as u16) >> 2);
    let seg_o = ((b2 & 0x03) << 3) | (b3 >> 5);
    let seg_n = b3 & 0x1F;
    let payload = r.read_rest();
    if payload.len() > MAX_SEG_CONTROL_PAYLOAD {
        return Err(Error::Length);
    }

    Ok(LowerPdu::SegmentedControl {
        opcode,
        seq_zero,
        seg_o,
        seg_n,
        payload,
    })
}

/// Serializes a [`LowerPdu`] to `out`, returning the number of bytes written.
pub fn write(pdu: &LowerPdu<'_>, out: &mut [u8]) -> Result<usize, Error> {
    let mut w = ByteWriter::new(out);
    match *pdu {
        LowerPdu::UnsegmentedAccess { akf, aid, payload } => {
            w.write_u8((akf as u8) << 6 | (aid & 0x3F))?;
            w.write_slice(payload)?;
        }
        LowerPdu::SegmentedAccess {
            akf,
            aid,
            szmic,
            seq_zero,
            seg_o,
            seg_n,
            payload,
        } => {
            w.write_u8(0x80 | (akf as u8) << 6 | (aid & 0x3F))?;
            let b1 = ((szmic as u8) << 7) | ((seq_zero >> 6) as u8 & 0x7F);
            let b2 = (((seq_zero & 0x3F) as u8) << 2) | (seg_o >> 3);
            let b3 = ((seg_o & 0x07) << 5) | (seg_n & 0x1F);
            w.write_slice(&[b1, b2, b3])?;
            w.write_slice(payload)?;
        }
        LowerPdu::UnsegmentedControl { opcode, payload } => {
            w.write_u8(opcode & 0x7F)?;
            w.write_slice(payload)?;
        }
        LowerPdu::SegmentedControl {
            opcode,
            seq_zero,
            seg_o,
            seg_n,
            payload,
        } => {
            w.write_u8(0x80 | (opcode & 0x7F))?;
            let b1 = (seq_zero >> 6) as u8 & 0x7F;
            let b2 = (((seq_zero & 0x3F) as u8) << 2) | (seg_o >> 3);
            let b3 = ((seg_o & 0x07) << 5) | (seg_n & 0x1F);
            w.write_slice(&[b1, b2, b3])?;
            w.write_slice(payload)?;
        }
        LowerPdu::SegmentAck {
            obo,
            seq_zero,
            block_ack,
        } => {
            w.write_u8(SEGACK_OPCODE)?;
            let raw48: u64 = ((obo as u64) << 47)
                | ((u64::from(seq_zero) & 0x1FFF) << 34)
                | (u64::from(block_ack));
            let bytes = raw48.to_be_bytes();
            w.write_slice(&bytes[2..8])?;
        }
    }
    Ok(out.len() - w.space_left())
}

/// Retry timer for a unicast destination: `200 + 50 * ttl` ms (§4.9).
pub fn unicast_retry_timeout(ttl: u8) -> Duration {
    Duration::from_millis(200 + 50 * u32::from(ttl))
}

/// Ack timer: `150 + 50 * ttl` ms (§4.9).
pub fn ack_timeout(ttl: u8) -> Duration {
    Duration::from_millis(150 + 50 * u32::from(ttl))
}

/// The RX incomplete timer: 10 s of silence abandons the task (§4.9).
pub fn incomplete_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Bitmask covering segments `0..=seg_n`.
pub fn full_mask(seg_n: u8) -> u32 {
    if seg_n >= 31 {
        u32::MAX
    } else {
        (1u32 << (seg_n + 1)) - 1
    }
}

/// What a destination address means for retry/completion policy (§4.9, §8 scenario 5).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DestKind {
    Unicast,
    GroupOrVirtual,
}

impl DestKind {
    pub fn of(addr: Address) -> Self {
        if addr.is_unicast() {
            DestKind::Unicast
        } else {
            DestKind::GroupOrVirtual
        }
    }
}

/// Outcome of submitting a new message to a [`TxTask`]/examining a segment ack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// More segments remain unacknowledged; kept active.
    Active,
    /// Every segment was acknowledged (unicast) or the retry budget was spent (group/virtual).
    Done,
    /// Peer cancelled the transfer (`BlockAck == 0`) or the unicast retry budget was exhausted.
    Failed,
}

/// A single outstanding segmented transmission to one destination.
///
/// Spec invariant: at most one active `TxTask` per destination exists at a time; others queue
/// (§3, §4.9). That queueing is the caller's responsibility (a FIFO per destination); this type
/// only models the state machine of the currently-active task.
pub struct TxTask {
    pub dst: Address,
    pub dst_kind: DestKind,
    pub ttl: u8,
    pub seq_zero: u16,
    pub seg_n: u8,
    pub is_control: bool,
    pub opcode: u8,
    pub akf: bool,
    pub aid: u8,
    pub szmic: bool,
    pdu: [u8; MAX_REASSEMBLED_PDU],
    pdu_len: usize,
    seg_payload_len: usize,
    acked: u32,
    retry_armed_at: Instant,
    retries_left: u8,
}

impl TxTask {
    /// Begins transmitting `pdu` (already network-layer-ready: the upper transport PDU including
    /// its TransMIC) to `dst`, split into `seg_n + 1` segments of `seg_payload_len` bytes each.
    pub fn submit(
        dst: Address,
        ttl: u8,
        seq_auth: u32,
        pdu: &[u8],
        is_control: bool,
        opcode: u8,
        akf: bool,
        aid: u8,
        szmic: bool,
        retries: u8,
        now: Instant,
    ) -> Result<Self, Error> {
        if pdu.len() > MAX_REASSEMBLED_PDU {
            return Err(Error::Length);
        }
        let seg_payload_len = if is_control {
            MAX_SEG_CONTROL_PAYLOAD
        } else {
            MAX_SEG_ACCESS_PAYLOAD
        };
        let seg_count = (pdu.len() + seg_payload_len - 1) / seg_payload_len;
        if seg_count == 0 || seg_count > MAX_SEGMENTS {
            return Err(Error::Length);
        }
        let seg_n = (seg_count - 1) as u8;

        let mut buf = [0u8; MAX_REASSEMBLED_PDU];
        buf[..pdu.len()].copy_from_slice(pdu);

        let dst_kind = DestKind::of(dst);

        Ok(TxTask {
            dst,
            dst_kind,
            ttl,
            seq_zero: seq_zero_of(seq_auth),
            seg_n,
            is_control,
            opcode,
            akf,
            aid,
            szmic,
            pdu: buf,
            pdu_len: pdu.len(),
            seg_payload_len,
            acked: 0,
            retry_armed_at: now,
            retries_left: retries,
        })
    }

    fn retry_timeout(&self) -> Duration {
        if self.dst_kind == DestKind::Unicast {
            unicast_retry_timeout(self.ttl)
        } else {
            Duration::from_millis(20)
        }
    }

    pub fn seg_count(&self) -> u8 {
        self.seg_n + 1
    }

    fn segment_bytes(&self, seg_o: u8) -> &[u8] {
        let start = usize::from(seg_o) * self.seg_payload_len;
        let end = core::cmp::min(start + self.seg_payload_len, self.pdu_len);
        &self.pdu[start..end]
    }

    /// Builds the wire representation of segment `seg_o`, which a caller must pair with a freshly
    /// allocated sequence number and pass through [`crate::network::encrypt`] (§4.9: "allocates a
    /// new sequence number for each outgoing segment, including retransmits").
    pub fn build_segment(&self, seg_o: u8, out: &mut [u8]) -> Result<usize, Error> {
        if seg_o > self.seg_n {
            return Err(Error::Inval);
        }
        let payload = self.segment_bytes(seg_o);
        let pdu = if self.is_control {
            LowerPdu::SegmentedControl {
                opcode: self.opcode,
                seq_zero: self.seq_zero,
                seg_o,
                seg_n: self.seg_n,
                payload,
            }
        } else {
            LowerPdu::SegmentedAccess {
                akf: self.akf,
                aid: self.aid,
                szmic: self.szmic,
                seq_zero: self.seq_zero,
                seg_o,
                seg_n: self.seg_n,
                payload,
            }
        };
        write(&pdu, out)
    }

    /// Segments not yet acknowledged by the peer.
    pub fn missing_mask(&self) -> u32 {
        full_mask(self.seg_n) & !self.acked
    }

    /// Applies a received Segment Ack. `None` if the ack's `SeqZero` doesn't match this task (the
    /// caller should ignore it).
    pub fn on_ack(&mut self, seq_zero: u16, block_ack: u32, now: Instant) -> Option<TxOutcome> {
        if seq_zero != self.seq_zero {
            return None;
        }
        if block_ack == 0 {
            return Some(TxOutcome::Failed);
        }
        self.acked |= block_ack;
        if self.acked & full_mask(self.seg_n) == full_mask(self.seg_n) {
            return Some(TxOutcome::Done);
        }
        self.retry_armed_at = now;
        Some(TxOutcome::Active)
    }

    /// Whether the retry timer has fired.
    pub fn retry_due(&self, now: Instant) -> bool {
        now.has_elapsed_since(self.retry_armed_at, self.retry_timeout())
    }

    /// The retry timer fired: consumes one retry attempt. Returns the outcome — `Active` if more
    /// retries remain (the caller should resend every unacked segment), `Done` for a group/virtual
    /// destination whose retries are exhausted ("succeeds regardless of any ack", §4.9/§8 scenario
    /// 5), or `Failed` for a unicast destination whose retries are exhausted (§4.9, §7: reported as
    /// `Timeout` to the upper layer).
    pub fn on_retry_timeout(&mut self, now: Instant) -> TxOutcome {
        if self.retries_left == 0 {
            return match self.dst_kind {
                DestKind::Unicast => TxOutcome::Failed,
                DestKind::GroupOrVirtual => TxOutcome::Done,
            };
        }
        self.retries_left -= 1;
        self.retry_armed_at = now;
        TxOutcome::Active
    }
}

/// Outcome of feeding a segment to an [`RxTask`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RxOutcome {
    /// Segment accepted; more are still missing.
    Accepted,
    /// Already had every bit set for this segment; re-ack without re-dispatching (idempotence).
    DuplicateComplete,
    /// Segment belonged to an already-superseded `SeqAuth`; dropped, no ack.
    Stale,
    /// Every segment is now present; `len` is the reassembled PDU's length.
    Complete { len: usize },
}

/// A single outstanding segmented reassembly from one source.
///
/// Spec invariant: at most one active `RxTask` per source exists at a time (§3, §4.9). On receipt
/// of a segment whose `SeqAuth` exceeds the stored task's, the caller replaces the task outright
/// (see [`RxTask::new`]); on receipt of a lower `SeqAuth`, the segment is dropped without ack.
pub struct RxTask {
    pub src: Address,
    pub seq_auth: u32,
    pub ttl: u8,
    pub is_control: bool,
    pub opcode: u8,
    pub akf: bool,
    pub aid: u8,
    pub szmic: bool,
    pub seg_n: u8,
    buffer: [u8; MAX_REASSEMBLED_PDU],
    seg_payload_len: usize,
    received: u32,
    last_seg_len: Option<usize>,
    last_activity: Instant,
    ack_armed_at: Instant,
    store_armed_at: Option<Instant>,
}

impl RxTask {
    fn new_common(
        src: Address,
        seq_auth: u32,
        ttl: u8,
        is_control: bool,
        opcode: u8,
        akf: bool,
        aid: u8,
        szmic: bool,
        seg_n: u8,
        now: Instant,
    ) -> Self {
        let seg_payload_len = if is_control {
            MAX_SEG_CONTROL_PAYLOAD
        } else {
            MAX_SEG_ACCESS_PAYLOAD
        };
        RxTask {
            src,
            seq_auth,
            ttl,
            is_control,
            opcode,
            akf,
            aid,
            szmic,
            seg_n,
            buffer: [0u8; MAX_REASSEMBLED_PDU],
            seg_payload_len,
            received: 0,
            last_seg_len: None,
            last_activity: now,
            ack_armed_at: now,
            store_armed_at: None,
        }
    }

    /// Starts a fresh access reassembly task.
    pub fn new_access(
        src: Address,
        seq_auth: u32,
        ttl: u8,
        akf: bool,
        aid: u8,
        szmic: bool,
        seg_n: u8,
        now: Instant,
    ) -> Self {
        Self::new_common(src, seq_auth, ttl, false, 0, akf, aid, szmic, seg_n, now)
    }

    /// Starts a fresh control reassembly task.
    pub fn new_control(
        src: Address,
        seq_auth: u32,
        ttl: u8,
        opcode: u8,
        seg_n: u8,
        now: Instant,
    ) -> Self {
        Self::new_common(src, seq_auth, ttl, true, opcode, false, 0, false, seg_n, now)
    }

    fn full_mask(&self) -> u32 {
        full_mask(self.seg_n)
    }

    pub fn is_complete(&self) -> bool {
        self.received & self.full_mask() == self.full_mask()
    }

    /// Current acknowledgment bitmap, for emitting a Segment Ack (interim partial, or the final
    /// full one).
    pub fn ack_bitmap(&self) -> u32 {
        self.received
    }

    /// Feeds one freshly-arrived segment with payload `data` at offset `seg_o`.
    pub fn on_segment(&mut self, seg_o: u8, data: &[u8], now: Instant) -> Result<RxOutcome, Error> {
        if seg_o > self.seg_n {
            return Err(Error::Inval);
        }
        let bit = 1u32 << seg_o;
        if self.received & bit != 0 {
            return Ok(if self.is_complete() {
                RxOutcome::DuplicateComplete
            } else {
                RxOutcome::Accepted
            });
        }

        let start = usize::from(seg_o) * self.seg_payload_len;
        if start + data.len() > self.buffer.len() {
            return Err(Error::Length);
        }
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.received |= bit;
        self.last_activity = now;
        self.ack_armed_at = now;
        if seg_o == self.seg_n {
            self.last_seg_len = Some(data.len());
        }

        if self.is_complete() {
            // The final segment's length determines the reassembled length; it may have arrived
            // at any point during reassembly, not necessarily last (§8 Property 2: "independent
            // of arrival order").
            let last_len = self.last_seg_len.ok_or(Error::Length)?;
            let len = usize::from(self.seg_n) * self.seg_payload_len + last_len;
            self.store_armed_at = Some(now);
            Ok(RxOutcome::Complete { len })
        } else {
            Ok(RxOutcome::Accepted)
        }
    }

    /// The reassembled PDU bytes, valid once [`RxTask::is_complete`] is true.
    pub fn reassembled(&self, len: usize) -> &[u8] {
        &self.buffer[..len]
    }

    pub fn ack_due(&self, now: Instant) -> bool {
        !self.is_complete() && now.has_elapsed_since(self.ack_armed_at, ack_timeout(self.ttl))
    }

    pub fn incomplete(&self, now: Instant) -> bool {
        !self.is_complete()
            && now.has_elapsed_since(self.last_activity, incomplete_timeout())
    }

    /// Whether the post-completion store timer (absorbing late retransmits) has expired.
    pub fn store_expired(&self, now: Instant) -> bool {
        self.store_armed_at
            .map(|armed| now.has_elapsed_since(armed, Duration::from_secs(10)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_auth_round_trip() {
        let seq: u32 = 0x0100_0007;
        let seq_zero = seq_zero_of(seq);
        assert_eq!(reconstruct_seq_auth(seq_zero, seq), seq);
        assert!(seq_auth_valid(seq, seq));
    }

    #[test]
    fn seq_auth_wrap_before_zero() {
        // SeqZero from a previous 0x2000-block, SEQ already advanced into the next block.
        let seq_auth = 0x0000_1FF0u32;
        let seq_zero = seq_zero_of(seq_auth);
        let seq = 0x0000_2005u32; // one block further, low13 (5) < seq_zero (0x1FF0 & 0x1FFF)
        assert_eq!(reconstruct_seq_auth(seq_zero, seq), seq_auth);
    }

    #[test]
    fn unsegmented_access_round_trip() {
        let pdu = LowerPdu::UnsegmentedAccess {
            akf: true,
            aid: 0x12,
            payload: &[0xAA, 0xBB, 0xCC],
        };
        let mut buf = [0u8; 16];
        let n = write(&pdu, &mut buf).unwrap();
        let parsed = parse_access(&buf[..n]).unwrap();
        match parsed {
            LowerPdu::UnsegmentedAccess { akf, aid, payload } => {
                assert!(akf);
                assert_eq!(aid, 0x12);
                assert_eq!(payload, &[0xAA, 0xBB, 0xCC]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn segmented_access_round_trip() {
        let pdu = LowerPdu::SegmentedAccess {
            akf: false,
            aid: 0x01,
            szmic: true,
            seq_zero: 0x0007,
            seg_o: 2,
            seg_n: 5,
            payload: &[1, 2, 3, 4],
        };
        let mut buf = [0u8; 16];
        let n = write(&pdu, &mut buf).unwrap();
        let parsed = parse_access(&buf[..n]).unwrap();
        match parsed {
            LowerPdu::SegmentedAccess {
                szmic,
                seq_zero,
                seg_o,
                seg_n,
                payload,
                ..
            } => {
                assert!(szmic);
                assert_eq!(seq_zero, 0x0007);
                assert_eq!(seg_o, 2);
                assert_eq!(seg_n, 5);
                assert_eq!(payload, &[1, 2, 3, 4]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn segment_ack_round_trip() {
        let pdu = LowerPdu::SegmentAck {
            obo: true,
            seq_zero: 0x1234 & 0x1FFF,
            block_ack: 0x0000_0007,
        };
        let mut buf = [0u8; 16];
        let n = write(&pdu, &mut buf).unwrap();
        let parsed = parse_control(&buf[..n]).unwrap();
        match parsed {
            LowerPdu::SegmentAck {
                obo,
                seq_zero,
                block_ack,
            } => {
                assert!(obo);
                assert_eq!(seq_zero, 0x1234 & 0x1FFF);
                assert_eq!(block_ack, 0x0000_0007);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn reassembly_three_segments_in_order() {
        let now = Instant::from_raw_micros(0);
        let mut task = RxTask::new_access(Address::from_raw(0x0010), 7, 4, true, 0x01, false, 2, now);
        assert_eq!(
            task.on_segment(0, &[0u8; 12], now).unwrap(),
            RxOutcome::Accepted
        );
        assert_eq!(
            task.on_segment(1, &[0u8; 12], now).unwrap(),
            RxOutcome::Accepted
        );
        match task.on_segment(2, &[0u8; 1], now).unwrap() {
            RxOutcome::Complete { len } => assert_eq!(len, 25),
            other => panic!("expected complete, got {:?}", other),
        }
        assert_eq!(task.ack_bitmap(), 0b111);
    }

    #[test]
    fn reassembly_out_of_order_uses_final_segment_length() {
        let now = Instant::from_raw_micros(0);
        let mut task = RxTask::new_access(Address::from_raw(0x0010), 7, 4, true, 0x01, false, 2, now);
        // Full-size middle segment arrives last; length must still come from segment 2 (the
        // SegN-indexed one), not from whichever segment happens to complete the reassembly.
        assert_eq!(
            task.on_segment(2, &[0u8; 1], now).unwrap(),
            RxOutcome::Accepted
        );
        assert_eq!(
            task.on_segment(0, &[0u8; 12], now).unwrap(),
            RxOutcome::Accepted
        );
        match task.on_segment(1, &[0u8; 12], now).unwrap() {
            RxOutcome::Complete { len } => assert_eq!(len, 25),
            other => panic!("expected complete, got {:?}", other),
        }
        assert_eq!(task.ack_bitmap(), 0b111);
    }

    #[test]
    fn duplicate_segment_after_complete_reacks() {
        let now = Instant::from_raw_micros(0);
        let mut task = RxTask::new_access(Address::from_raw(0x0010), 7, 4, true, 0x01, false, 0, now);
        assert!(matches!(
            task.on_segment(0, &[1, 2, 3], now).unwrap(),
            RxOutcome::Complete { .. }
        ));
        assert_eq!(
            task.on_segment(0, &[1, 2, 3], now).unwrap(),
            RxOutcome::DuplicateComplete
        );
    }

    #[test]
    fn tx_task_full_ack_completes() {
        let now = Instant::from_raw_micros(0);
        let pdu = [0xAAu8; 25];
        let mut task = TxTask::submit(
            Address::from_raw(0x0003),
            4,
            7,
            &pdu,
            false,
            0,
            true,
            0x01,
            false,
            4,
            now,
        )
        .unwrap();
        assert_eq!(task.seg_count(), 3);
        assert_eq!(
            task.on_ack(task.seq_zero, full_mask(task.seg_n), now),
            Some(TxOutcome::Done)
        );
    }

    #[test]
    fn tx_task_partial_ack_then_retransmit_missing() {
        let now = Instant::from_raw_micros(0);
        let pdu = [0xAAu8; 25];
        let mut task = TxTask::submit(
            Address::from_raw(0x0003),
            4,
            7,
            &pdu,
            false,
            0,
            true,
            0x01,
            false,
            4,
            now,
        )
        .unwrap();
        // Segment 1 missing, per §8 scenario 4.
        assert_eq!(
            task.on_ack(task.seq_zero, 0b101, now),
            Some(TxOutcome::Active)
        );
        assert_eq!(task.missing_mask(), 0b010);
    }

    #[test]
    fn tx_task_zero_ack_is_cancellation() {
        let now = Instant::from_raw_micros(0);
        let pdu = [0xAAu8; 10];
        let mut task = TxTask::submit(
            Address::from_raw(0x0003),
            4,
            7,
            &pdu,
            false,
            0,
            true,
            0x01,
            false,
            4,
            now,
        )
        .unwrap();
        assert_eq!(task.on_ack(task.seq_zero, 0, now), Some(TxOutcome::Failed));
    }

    #[test]
    fn group_destination_completes_after_retries_regardless_of_ack() {
        let now = Instant::from_raw_micros(0);
        let pdu = [0xAAu8; 10];
        let mut task = TxTask::submit(
            Address::from_raw(0xFFFF),
            4,
            7,
            &pdu,
            false,
            0,
            true,
            0x01,
            false,
            2,
            now,
        )
        .unwrap();
        assert_eq!(task.dst_kind, DestKind::GroupOrVirtual);
        assert_eq!(task.on_retry_timeout(now), TxOutcome::Active);
        assert_eq!(task.on_retry_timeout(now), TxOutcome::Active);
        assert_eq!(task.on_retry_timeout(now), TxOutcome::Done);
    }

    #[test]
    fn unicast_retries_exhausted_fails() {
        let now = Instant::from_raw_micros(0);
        let pdu = [0xAAu8; 10];
        let mut task = TxTask::submit(
            Address::from_raw(0x0003),
            4,
            7,
            &pdu,
            false,
            0,
            true,
            0x01,
            false,
            1,
            now,
        )
        .unwrap();
        assert_eq!(task.on_retry_timeout(now), TxOutcome::Active);
        assert_eq!(task.on_retry_timeout(now), TxOutcome::Failed);
    }
}
