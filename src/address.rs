//! The 16-bit mesh addressing scheme (§3).
//!
//! This is distinct from the 6-byte link-layer device address used to open a PB-ADV bearer link;
//! see [`crate::pb_adv`] for that.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::error::Error;

/// A 16-bit mesh address, partitioned by value into one of several kinds.
///
/// | Range | Kind |
/// |---|---|
/// | `0x0000` | unassigned |
/// | `0x0001..=0x7FFF` | unicast |
/// | `0x8000..=0xBFFF` | virtual |
/// | `0xC000..=0xFEFF` | group |
/// | `0xFF00..=0xFFFB` | reserved |
/// | `0xFFFC..=0xFFFF` | fixed group (proxies/friends/relays/all-nodes) |
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Address(u16);

/// A fixed-group address with special all-node-class meaning.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FixedGroup {
    AllProxies,
    AllFriends,
    AllRelays,
    AllNodes,
}

/// The kind of a mesh [`Address`], as determined by its numeric value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    Unassigned,
    Unicast,
    Virtual,
    Group,
    Reserved,
    FixedGroup(FixedGroup),
}

impl Address {
    pub const UNASSIGNED: Self = Address(0x0000);
    pub const ALL_PROXIES: Self = Address(0xFFFC);
    pub const ALL_FRIENDS: Self = Address(0xFFFD);
    pub const ALL_RELAYS: Self = Address(0xFFFE);
    pub const ALL_NODES: Self = Address(0xFFFF);

    /// Wraps a raw 16-bit value as an `Address`.
    pub fn from_raw(raw: u16) -> Self {
        Address(raw)
    }

    /// Returns the raw 16-bit value.
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Classifies this address by value.
    pub fn kind(&self) -> Kind {
        match self.0 {
            0x0000 => Kind::Unassigned,
            0x0001..=0x7FFF => Kind::Unicast,
            0x8000..=0xBFFF => Kind::Virtual,
            0xC000..=0xFEFF => Kind::Group,
            0xFFFC => Kind::FixedGroup(FixedGroup::AllProxies),
            0xFFFD => Kind::FixedGroup(FixedGroup::AllFriends),
            0xFFFE => Kind::FixedGroup(FixedGroup::AllRelays),
            0xFFFF => Kind::FixedGroup(FixedGroup::AllNodes),
            _ => Kind::Reserved,
        }
    }

    pub fn is_unassigned(&self) -> bool {
        self.kind() == Kind::Unassigned
    }

    pub fn is_unicast(&self) -> bool {
        self.kind() == Kind::Unicast
    }

    pub fn is_virtual(&self) -> bool {
        self.kind() == Kind::Virtual
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind(), Kind::Group | Kind::FixedGroup(_))
    }

    pub fn is_reserved(&self) -> bool {
        self.kind() == Kind::Reserved
    }

    /// Validates this address as a legal network-PDU source address: must be unicast (§3
    /// invariant: "source must be unicast").
    pub fn check_source(&self) -> Result<(), Error> {
        if self.is_unicast() {
            Ok(())
        } else {
            Err(Error::Inval)
        }
    }

    /// Validates this address as a legal network-PDU destination address: must not be reserved
    /// (§3 invariant: "destination must not be reserved").
    pub fn check_destination(&self) -> Result<(), Error> {
        if self.is_reserved() {
            Err(Error::Inval)
        } else {
            Ok(())
        }
    }
}

impl core::fmt::Debug for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Address({:#06x})", self.0)
    }
}

impl<'a> FromBytes<'a> for Address {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(Address(bytes.read_u16_be()?))
    }
}

impl ToBytes for Address {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_be(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ranges() {
        assert_eq!(Address::from_raw(0x0000).kind(), Kind::Unassigned);
        assert_eq!(Address::from_raw(0x1234).kind(), Kind::Unicast);
        assert_eq!(Address::from_raw(0x8001).kind(), Kind::Virtual);
        assert_eq!(Address::from_raw(0xC000).kind(), Kind::Group);
        assert_eq!(Address::from_raw(0xFF00).kind(), Kind::Reserved);
        assert_eq!(
            Address::from_raw(0xFFFF).kind(),
            Kind::FixedGroup(FixedGroup::AllNodes)
        );
    }

    #[test]
    fn source_must_be_unicast() {
        assert!(Address::from_raw(0x1234).check_source().is_ok());
        assert!(Address::from_raw(0xC000).check_source().is_err());
        assert!(Address::from_raw(0x0000).check_source().is_err());
    }

    #[test]
    fn destination_rejects_reserved_only() {
        assert!(Address::from_raw(0xFF00).check_destination().is_err());
        assert!(Address::from_raw(0xC000).check_destination().is_ok());
        assert!(Address::from_raw(0x0000).check_destination().is_ok());
    }
}
