//! PB-ADV transport (C13): Generic Provisioning PDU framing, link establishment, and the
//! transaction-level segmentation/reassembly/retry/ack protocol provisioning rides on top of
//! (§4.13).
//!
//! This is a second, independent segmentation scheme from [`crate::lower_transport`]'s: PB-ADV
//! predates the mesh network layer and carries only provisioning PDUs, one link at a time, with no
//! network-layer addressing at all — the link ID plays that role instead.

use crate::bytes::{ByteReader, ByteWriter};
use crate::error::Error;
use crate::time::{Duration, Instant};
use crate::uuid::DeviceUuid;

/// Maximum payload of a Transaction Start segment.
pub const MAX_START_PAYLOAD: usize = 20;
/// Maximum payload of a Transaction Continue segment.
pub const MAX_CONTINUE_PAYLOAD: usize = 23;
/// Largest reassembled provisioning PDU this layer will accept.
pub const MAX_PROV_PDU: usize = 256;

/// 3GPP-style CRC-8 (polynomial `0x07`, initial value `0x00`) used as the Transaction Start FCS.
pub fn fcs(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Generic Provisioning Control Format: the low 2 bits of the first payload byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Gpcf {
    TransactionStart = 0b00,
    TransactionAck = 0b01,
    TransactionContinue = 0b10,
    BearerControl = 0b11,
}

impl Gpcf {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Gpcf::TransactionStart,
            0b01 => Gpcf::TransactionAck,
            0b10 => Gpcf::TransactionContinue,
            _ => Gpcf::BearerControl,
        }
    }
}

/// Bearer Control opcodes (§4.13).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BearerControlOpcode {
    LinkOpen,
    LinkAck,
    LinkClose,
}

impl BearerControlOpcode {
    fn from_bits(bits: u8) -> Result<Self, Error> {
        match bits {
            0 => Ok(BearerControlOpcode::LinkOpen),
            1 => Ok(BearerControlOpcode::LinkAck),
            2 => Ok(BearerControlOpcode::LinkClose),
            _ => Err(Error::Inval),
        }
    }

    fn bits(&self) -> u8 {
        match self {
            BearerControlOpcode::LinkOpen => 0,
            BearerControlOpcode::LinkAck => 1,
            BearerControlOpcode::LinkClose => 2,
        }
    }
}

/// A parsed Generic Provisioning PDU (everything after `LinkID` and `TransNum`).
#[derive(Debug, Copy, Clone)]
pub enum GenericProvisioningPdu<'a> {
    TransactionStart {
        last_seg_n: u8,
        total_len: u16,
        fcs: u8,
        payload: &'a [u8],
    },
    TransactionAck,
    TransactionContinue {
        seg_index: u8,
        payload: &'a [u8],
    },
    LinkOpen {
        uuid: DeviceUuid,
    },
    LinkAck,
    LinkClose {
        reason: u8,
    },
}

/// A full PB-ADV PDU's `LinkID ‖ TransNum` framing plus its decoded body.
#[derive(Debug, Copy, Clone)]
pub struct Frame<'a> {
    pub link_id: u32,
    pub trans_num: u8,
    pub pdu: GenericProvisioningPdu<'a>,
}

/// Parses a full PB-ADV bearer PDU (link ID through payload, FCS checked only for Transaction
/// Start where it lives inline).
pub fn parse(data: &[u8]) -> Result<Frame<'_>, Error> {
    let mut r = ByteReader::new(data);
    let link_id = r.read_u32_be()?;
    let trans_num = r.read_u8()?;
    let b0 = r.read_u8()?;
    let gpcf = Gpcf::from_bits(b0);
    let field = b0 >> 2;

    let pdu = match gpcf {
        Gpcf::TransactionStart => {
            let total_len = r.read_u16_be()?;
            let fcs = r.read_u8()?;
            let payload = r.read_rest();
            if payload.len() > MAX_START_PAYLOAD {
                return Err(Error::Length);
            }
            GenericProvisioningPdu::TransactionStart {
                last_seg_n: field,
                total_len,
                fcs,
                payload,
            }
        }
        Gpcf::TransactionAck => GenericProvisioningPdu::TransactionAck,
        Gpcf::TransactionContinue => {
            let payload = r.read_rest();
            if payload.len() > MAX_CONTINUE_PAYLOAD {
                return Err(Error::Length);
            }
            GenericProvisioningPdu::TransactionContinue {
                seg_index: field,
                payload,
            }
        }
        Gpcf::BearerControl => match BearerControlOpcode::from_bits(field)? {
            BearerControlOpcode::LinkOpen => {
                let uuid_bytes: [u8; 16] = r.read_array()?;
                GenericProvisioningPdu::LinkOpen {
                    uuid: DeviceUuid::from_bytes(uuid_bytes),
                }
            }
            BearerControlOpcode::LinkAck => GenericProvisioningPdu::LinkAck,
            BearerControlOpcode::LinkClose => {
                let reason = r.read_u8()?;
                GenericProvisioningPdu::LinkClose { reason }
            }
        },
    };

    Ok(Frame {
        link_id,
        trans_num,
        pdu,
    })
}

/// Serializes a PB-ADV frame to `out`, returning the number of bytes written.
pub fn write(frame: &Frame<'_>, out: &mut [u8]) -> Result<usize, Error> {
    let mut w = ByteWriter::new(out);
    w.write_u32_be(frame.link_id)?;
    w.write_u8(frame.trans_num)?;

    match frame.pdu {
        GenericProvisioningPdu::TransactionStart {
            last_seg_n,
            total_len,
            fcs,
            payload,
        } => {
            w.write_u8((last_seg_n << 2) | Gpcf::TransactionStart as u8)?;
            w.write_u16_be(total_len)?;
            w.write_u8(fcs)?;
            w.write_slice(payload)?;
        }
        GenericProvisioningPdu::TransactionAck => {
            w.write_u8(Gpcf::TransactionAck as u8)?;
        }
        GenericProvisioningPdu::TransactionContinue { seg_index, payload } => {
            w.write_u8((seg_index << 2) | Gpcf::TransactionContinue as u8)?;
            w.write_slice(payload)?;
        }
        GenericProvisioningPdu::LinkOpen { uuid } => {
            w.write_u8((BearerControlOpcode::LinkOpen.bits() << 2) | Gpcf::BearerControl as u8)?;
            w.write_slice(uuid.as_bytes())?;
        }
        GenericProvisioningPdu::LinkAck => {
            w.write_u8((BearerControlOpcode::LinkAck.bits() << 2) | Gpcf::BearerControl as u8)?;
        }
        GenericProvisioningPdu::LinkClose { reason } => {
            w.write_u8((BearerControlOpcode::LinkClose.bits() << 2) | Gpcf::BearerControl as u8)?;
            w.write_u8(reason)?;
        }
    }

    Ok(out.len() - w.space_left())
}

/// Link retry timer: 200 ms, giving up after 60 s (§4.13).
pub fn link_retry_interval() -> Duration {
    Duration::from_millis(200)
}
pub fn link_open_timeout() -> Duration {
    Duration::from_secs(60)
}
/// Transaction retry timer: 500 ms, giving up after 30 s (declares link loss) (§4.13).
pub fn transaction_retry_interval() -> Duration {
    Duration::from_millis(500)
}
pub fn transaction_timeout() -> Duration {
    Duration::from_secs(30)
}
/// Link idle timeout: 60 s without any valid PDU for the link (§4.13).
pub fn link_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Which end of a link this side plays, which governs the transaction-number range it allocates
/// from when transmitting (§4.13: "provisioner `0x00..0x7F` wrapping; device `0x80..0xFF`
/// wrapping").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Provisioner,
    Device,
}

impl Role {
    fn first_trans_num(&self) -> u8 {
        match self {
            Role::Provisioner => 0x00,
            Role::Device => 0x80,
        }
    }

    fn wraps_at(&self, n: u8) -> bool {
        match self {
            Role::Provisioner => n > 0x7F,
            Role::Device => n < 0x80,
        }
    }
}

/// Link lifecycle state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Opening,
    Open,
    Closing,
}

/// Outcome of feeding a PDU or timer tick to a [`Link`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Nothing of note; keep waiting.
    Idle,
    /// The link finished opening (Link Ack received).
    Opened,
    /// A transaction completed reassembly; `len` is the PDU's length in the link's buffer.
    TransactionComplete { len: usize },
    /// A duplicate of an already-acked transaction arrived; it was re-acked but not redelivered
    /// (§4.13, Property 7).
    DuplicateTransaction,
    /// The link was closed, locally or by the peer.
    Closed,
    /// The link's retry budget (link-open or transaction) was exhausted; the link is lost.
    Lost,
}

/// One PB-ADV link: link establishment, and the transaction reassembly/retry/ack state machine
/// layered on top (§4.13).
///
/// Exactly one transaction may be in flight for reassembly at a time; a fresh Transaction Start
/// with a higher transaction number than the one being reassembled restarts reassembly, while one
/// with an equal or lower number is ignored unless it matches the last acked transaction (in which
/// case it is idempotently re-acked, Property 7).
pub struct Link {
    pub link_id: u32,
    pub role: Role,
    pub state: LinkState,
    next_tx_trans_num: u8,
    rx_trans_num: Option<u8>,
    acked_trans_num: Option<u8>,
    reassembly: Option<Reassembly>,
    last_activity: Instant,
    retry_armed_at: Instant,
    opened_or_transaction_started_at: Instant,
}

struct Reassembly {
    trans_num: u8,
    total_len: u16,
    expected_fcs: u8,
    last_seg_n: u8,
    buffer: [u8; MAX_PROV_PDU],
    received_mask: u64,
}

impl Link {
    /// Opens a new link as the provisioner, picking `link_id` (should be random per §4.13).
    pub fn open_as_provisioner(link_id: u32, now: Instant) -> Self {
        Link {
            link_id,
            role: Role::Provisioner,
            state: LinkState::Opening,
            next_tx_trans_num: Role::Provisioner.first_trans_num(),
            rx_trans_num: None,
            acked_trans_num: None,
            reassembly: None,
            last_activity: now,
            retry_armed_at: now,
            opened_or_transaction_started_at: now,
        }
    }

    /// Accepts an inbound Link Open as the device side, becoming `Open` immediately (the device
    /// replies with a Link Ack, which the caller sends from the returned `true`).
    pub fn accept_as_device(link_id: u32, now: Instant) -> Self {
        Link {
            link_id,
            role: Role::Device,
            state: LinkState::Open,
            next_tx_trans_num: Role::Device.first_trans_num(),
            rx_trans_num: None,
            acked_trans_num: None,
            reassembly: None,
            last_activity: now,
            retry_armed_at: now,
            opened_or_transaction_started_at: now,
        }
    }

    /// Allocates the next outgoing transaction number, wrapping within this role's range.
    pub fn next_transaction_number(&mut self) -> u8 {
        let n = self.next_tx_trans_num;
        let candidate = n.wrapping_add(1);
        self.next_tx_trans_num = if self.role.wraps_at(candidate) {
            self.role.first_trans_num()
        } else {
            candidate
        };
        n
    }

    /// The Link Ack received while `Opening`: transitions to `Open` and stops the link-retry
    /// timer.
    pub fn on_link_ack(&mut self) -> Result<(), Error> {
        if self.state != LinkState::Opening {
            return Err(Error::State);
        }
        self.state = LinkState::Open;
        Ok(())
    }

    /// Whether the link-open retry timer has fired.
    pub fn link_retry_due(&self, now: Instant) -> bool {
        self.state == LinkState::Opening
            && now.has_elapsed_since(self.retry_armed_at, link_retry_interval())
    }

    /// The link-open retry timer fired: rearms it, or reports loss once the overall open timeout
    /// has elapsed.
    pub fn on_link_retry_timeout(&mut self, now: Instant) -> LinkEvent {
        if now.has_elapsed_since(self.opened_or_transaction_started_at, link_open_timeout()) {
            self.state = LinkState::Idle;
            return LinkEvent::Lost;
        }
        self.retry_armed_at = now;
        LinkEvent::Idle
    }

    /// Whether the link idle timeout (60 s without any valid PDU) has fired.
    pub fn idle_timed_out(&self, now: Instant) -> bool {
        self.state != LinkState::Idle
            && now.has_elapsed_since(self.last_activity, link_idle_timeout())
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Feeds an inbound Transaction Start, beginning or restarting reassembly as appropriate.
    pub fn on_transaction_start(
        &mut self,
        trans_num: u8,
        last_seg_n: u8,
        total_len: u16,
        expected_fcs: u8,
        payload: &[u8],
        now: Instant,
    ) -> Result<LinkEvent, Error> {
        self.touch(now);

        if Some(trans_num) == self.acked_trans_num {
            return Ok(LinkEvent::DuplicateTransaction);
        }
        if let Some(current) = self.reassembly.as_ref().map(|r| r.trans_num) {
            if trans_num <= current && Some(trans_num) != Some(current) {
                return Ok(LinkEvent::Idle);
            }
        }
        if usize::from(total_len) > MAX_PROV_PDU {
            return Err(Error::Length);
        }

        self.opened_or_transaction_started_at = now;
        let mut buffer = [0u8; MAX_PROV_PDU];
        buffer[..payload.len()].copy_from_slice(payload);
        self.reassembly = Some(Reassembly {
            trans_num,
            total_len,
            expected_fcs,
            last_seg_n,
            buffer,
            received_mask: 1,
        });

        self.finish_if_single_segment(now)
    }

    /// Feeds an inbound Transaction Continue.
    pub fn on_transaction_continue(
        &mut self,
        trans_num: u8,
        seg_index: u8,
        payload: &[u8],
        now: Instant,
    ) -> Result<LinkEvent, Error> {
        self.touch(now);

        if Some(trans_num) == self.acked_trans_num {
            return Ok(LinkEvent::DuplicateTransaction);
        }
        let reassembly = match &mut self.reassembly {
            Some(r) if r.trans_num == trans_num => r,
            _ => return Ok(LinkEvent::Idle),
        };
        if seg_index == 0 || seg_index > reassembly.last_seg_n {
            return Err(Error::Inval);
        }
        let offset = MAX_START_PAYLOAD + (usize::from(seg_index) - 1) * MAX_CONTINUE_PAYLOAD;
        if offset + payload.len() > reassembly.buffer.len() {
            return Err(Error::Length);
        }
        reassembly.buffer[offset..offset + payload.len()].copy_from_slice(payload);
        reassembly.received_mask |= 1u64 << seg_index;

        self.finish_if_single_segment(now)
    }

    fn finish_if_single_segment(&mut self, now: Instant) -> Result<LinkEvent, Error> {
        let reassembly = self.reassembly.as_ref().unwrap();
        let full_mask = if reassembly.last_seg_n >= 63 {
            u64::MAX
        } else {
            (1u64 << (reassembly.last_seg_n + 1)) - 1
        };
        if reassembly.received_mask & full_mask != full_mask {
            return Ok(LinkEvent::Idle);
        }

        let len = usize::from(reassembly.total_len);
        if len > reassembly.buffer.len() {
            return Err(Error::Length);
        }
        let got_fcs = fcs(&reassembly.buffer[..len]);
        let trans_num = reassembly.trans_num;
        if got_fcs != reassembly.expected_fcs {
            self.reassembly = None;
            return Err(Error::Diff);
        }

        self.acked_trans_num = Some(trans_num);
        self.rx_trans_num = Some(trans_num);
        let _ = now;
        Ok(LinkEvent::TransactionComplete { len })
    }

    /// The reassembled provisioning PDU bytes for the just-completed transaction.
    pub fn reassembled(&self, len: usize) -> &[u8] {
        &self.reassembly.as_ref().unwrap().buffer[..len]
    }

    /// Closes the link locally, e.g. after provisioning completes or fails.
    pub fn close(&mut self) {
        self.state = LinkState::Closing;
    }

    /// An inbound Link Close: the link is torn down immediately.
    pub fn on_link_close(&mut self, _reason: u8) -> LinkEvent {
        self.state = LinkState::Idle;
        LinkEvent::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fcs_is_deterministic_and_sensitive_to_tampering() {
        let data = b"provisioning payload";
        let a = fcs(data);
        let mut tampered = *data;
        tampered[0] ^= 0xFF;
        assert_ne!(a, fcs(&tampered));
        assert_eq!(a, fcs(data));
    }

    #[test]
    fn link_open_frame_round_trips() {
        let frame = Frame {
            link_id: 0x1234_5678,
            trans_num: 0x00,
            pdu: GenericProvisioningPdu::LinkOpen {
                uuid: DeviceUuid::from_bytes([0x01; 16]),
            },
        };
        let mut buf = [0u8; 32];
        let n = write(&frame, &mut buf).unwrap();
        let parsed = parse(&buf[..n]).unwrap();
        assert_eq!(parsed.link_id, 0x1234_5678);
        assert!(matches!(parsed.pdu, GenericProvisioningPdu::LinkOpen { .. }));
    }

    #[test]
    fn transaction_number_wraps_within_provisioner_range() {
        let mut link = Link::open_as_provisioner(1, Instant::from_raw_micros(0));
        let mut last = link.next_transaction_number();
        for _ in 0..200 {
            let n = link.next_transaction_number();
            assert!(n <= 0x7F);
            last = n;
        }
        let _ = last;
    }

    #[test]
    fn transaction_number_wraps_within_device_range() {
        let link = Link::accept_as_device(1, Instant::from_raw_micros(0));
        assert_eq!(link.next_tx_trans_num, 0x80);
    }

    #[test]
    fn single_segment_transaction_completes_immediately() {
        let mut link = Link::accept_as_device(1, Instant::from_raw_micros(0));
        let payload = b"hello";
        let expected_fcs = fcs(payload);
        let event = link
            .on_transaction_start(0x00, 0, payload.len() as u16, expected_fcs, payload, Instant::from_raw_micros(0))
            .unwrap();
        match event {
            LinkEvent::TransactionComplete { len } => {
                assert_eq!(link.reassembled(len), payload);
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn multi_segment_transaction_reassembles() {
        let mut link = Link::accept_as_device(1, Instant::from_raw_micros(0));
        let mut full = [0u8; 25];
        for (i, b) in full.iter_mut().enumerate() {
            *b = i as u8;
        }
        let expected_fcs = fcs(&full);
        let now = Instant::from_raw_micros(0);

        let event = link
            .on_transaction_start(0x00, 1, full.len() as u16, expected_fcs, &full[..20], now)
            .unwrap();
        assert_eq!(event, LinkEvent::Idle);

        let event = link
            .on_transaction_continue(0x00, 1, &full[20..25], now)
            .unwrap();
        match event {
            LinkEvent::TransactionComplete { len } => {
                assert_eq!(link.reassembled(len), &full[..]);
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_transaction_is_reacked_not_redelivered() {
        let mut link = Link::accept_as_device(1, Instant::from_raw_micros(0));
        let payload = b"hi";
        let expected_fcs = fcs(payload);
        let now = Instant::from_raw_micros(0);
        link.on_transaction_start(0x00, 0, payload.len() as u16, expected_fcs, payload, now)
            .unwrap();

        let event = link
            .on_transaction_start(0x00, 0, payload.len() as u16, expected_fcs, payload, now)
            .unwrap();
        assert_eq!(event, LinkEvent::DuplicateTransaction);
    }

    #[test]
    fn bad_fcs_is_rejected() {
        let mut link = Link::accept_as_device(1, Instant::from_raw_micros(0));
        let payload = b"hello";
        let now = Instant::from_raw_micros(0);
        let err = link
            .on_transaction_start(0x00, 0, payload.len() as u16, 0xFF, payload, now)
            .unwrap_err();
        assert_eq!(err, Error::Diff);
    }

    #[test]
    fn link_ack_transitions_opening_to_open() {
        let mut link = Link::open_as_provisioner(1, Instant::from_raw_micros(0));
        assert_eq!(link.state, LinkState::Opening);
        link.on_link_ack().unwrap();
        assert_eq!(link.state, LinkState::Open);
    }
}
