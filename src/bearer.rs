//! Bearer layer (C6): the advertising bearer and the loopback bearer, and the packet-type tagging
//! that lets a single advertising channel carry PB-ADV, mesh network, and beacon traffic (§4.6).

use heapless::consts::U4;
use heapless::Vec;

use crate::error::Error;
use crate::gap::{AdvertiseAction, AdvertiseDuration};
use crate::time::Duration;

/// Default number of bearers a single node can have open at once.
pub type DefaultBearerCapacity = U4;

/// Opaque handle identifying a bearer, returned by [`BearerTable::create`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BearerHandle(u8);

impl BearerHandle {
    /// The sentinel handle used for the loopback interface, which isn't bound to a real bearer.
    pub fn loopback_placeholder() -> Self {
        BearerHandle(u8::MAX)
    }
}

/// Which of the three payload kinds a bearer PDU carries, and the AD type it maps to on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketType {
    /// PB-ADV generic provisioning PDU, AD type `0x29`.
    PbAdv,
    /// Mesh network PDU, AD type `0x2A`.
    MeshMessage,
    /// Mesh beacon, AD type `0x2B`.
    Beacon,
}

impl PacketType {
    /// The AD type byte used on the wire for this packet kind.
    pub fn ad_type(&self) -> u8 {
        match self {
            PacketType::PbAdv => 0x29,
            PacketType::MeshMessage => 0x2A,
            PacketType::Beacon => 0x2B,
        }
    }

    /// Classifies an AD type byte back into a `PacketType`, if recognized.
    pub fn from_ad_type(ad_type: u8) -> Option<Self> {
        match ad_type {
            0x29 => Some(PacketType::PbAdv),
            0x2A => Some(PacketType::MeshMessage),
            0x2B => Some(PacketType::Beacon),
            _ => None,
        }
    }
}

/// Creation parameters for a bearer.
#[derive(Debug, Copy, Clone)]
pub struct BearerParams {
    /// Whether this is the loopback bearer (addressed-to-self traffic never touches the air).
    pub loopback: bool,
    /// Per-packet advertise duration used when this bearer sends over the air.
    pub advertise_duration: AdvertiseDuration,
}

struct BearerEntry {
    handle: BearerHandle,
    params: BearerParams,
}

/// Owns the set of open bearers and wraps/unwraps their wire framing.
///
/// The advertising bearer wraps a PDU as `[len, ad_type, pdu...]` and hands it to the GAP
/// scheduler as an advertise action; the loopback bearer never touches the radio at all, routing
/// straight back into [`crate::iface`].
pub struct BearerTable<N: heapless::ArrayLength<BearerEntry> = DefaultBearerCapacity> {
    bearers: Vec<BearerEntry, N>,
    next_handle: u8,
}

impl<N: heapless::ArrayLength<BearerEntry>> BearerTable<N> {
    pub fn new() -> Self {
        BearerTable {
            bearers: Vec::new(),
            next_handle: 0,
        }
    }

    /// Creates a new bearer, returning its handle.
    pub fn create(&mut self, params: BearerParams) -> Result<BearerHandle, Error> {
        let handle = BearerHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.bearers
            .push(BearerEntry { handle, params })
            .map_err(|_| Error::Resource)?;
        Ok(handle)
    }

    /// Closes a previously created bearer.
    pub fn delete(&mut self, handle: BearerHandle) -> Result<(), Error> {
        let pos = self
            .bearers
            .iter()
            .position(|b| b.handle == handle)
            .ok_or(Error::InvalBearer)?;
        self.bearers.swap_remove(pos);
        Ok(())
    }

    fn find(&self, handle: BearerHandle) -> Result<&BearerEntry, Error> {
        self.bearers
            .iter()
            .find(|b| b.handle == handle)
            .ok_or(Error::InvalBearer)
    }

    /// Frames `pdu` for `pkt_type` and, for a non-loopback bearer, produces the GAP advertise
    /// action that should be queued to send it. Returns `None` when the bearer is the loopback
    /// bearer (the caller should instead feed the PDU directly back into the network interface
    /// table, C7).
    pub fn send(
        &self,
        handle: BearerHandle,
        pkt_type: PacketType,
        pdu: &[u8],
    ) -> Result<Option<AdvertiseAction>, Error> {
        let entry = self.find(handle)?;
        if entry.params.loopback {
            return Ok(None);
        }

        if pdu.len() > 29 {
            return Err(Error::Length);
        }

        let mut buf = [0u8; 31];
        let len = (pdu.len() + 1) as u8; // AD length field covers [ad_type, pdu...]
        buf[0] = len;
        buf[1] = pkt_type.ad_type();
        buf[2..2 + pdu.len()].copy_from_slice(pdu);

        Ok(Some(AdvertiseAction {
            pdu: buf,
            len: len + 1,
            duration: entry.params.advertise_duration,
        }))
    }

    /// Demultiplexes an inbound advertisement (pushed from the GAP scheduler via
    /// `on_adv_received`) by AD type, returning the packet kind and the unwrapped PDU bytes.
    pub fn on_adv_received<'a>(&self, adv_data: &'a [u8]) -> Option<(PacketType, &'a [u8])> {
        if adv_data.len() < 2 {
            return None;
        }
        let len = adv_data[0] as usize;
        if len == 0 || len + 1 > adv_data.len() {
            return None;
        }
        let ad_type = adv_data[1];
        let pdu = &adv_data[2..1 + len];
        PacketType::from_ad_type(ad_type).map(|kind| (kind, pdu))
    }

    /// The default per-bearer advertise duration used for single-shot transmissions (fire and
    /// wait for the GAP scheduler's T_IFS-scale turnaround).
    pub fn default_duration() -> Duration {
        Duration::from_millis(20)
    }
}

impl<N: heapless::ArrayLength<BearerEntry>> Default for BearerTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ad_type_round_trips() {
        for kind in [PacketType::PbAdv, PacketType::MeshMessage, PacketType::Beacon] {
            assert_eq!(PacketType::from_ad_type(kind.ad_type()), Some(kind));
        }
    }

    #[test]
    fn send_frames_len_and_ad_type() {
        let mut table: BearerTable = BearerTable::new();
        let handle = table
            .create(BearerParams {
                loopback: false,
                advertise_duration: None,
            })
            .unwrap();
        let action = table
            .send(handle, PacketType::MeshMessage, &[0xAA, 0xBB])
            .unwrap()
            .unwrap();
        assert_eq!(action.pdu[0], 3);
        assert_eq!(action.pdu[1], 0x2A);
        assert_eq!(&action.pdu[2..4], &[0xAA, 0xBB]);
    }

    #[test]
    fn loopback_bearer_sends_nothing_over_the_air() {
        let mut table: BearerTable = BearerTable::new();
        let handle = table
            .create(BearerParams {
                loopback: true,
                advertise_duration: None,
            })
            .unwrap();
        assert!(table
            .send(handle, PacketType::MeshMessage, &[0x01])
            .unwrap()
            .is_none());
    }
}
