//! Device UUIDs used by unprovisioned-device beacons and the provisioning FSM.
//!
//! Unlike Bluetooth's 16/32/128-bit service UUID aliasing scheme, a mesh device UUID is always a
//! flat 16-byte value with no base-UUID expansion; this type only needs to carry and compare those
//! bytes.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::error::Error;
use crate::utils::HexSlice;
use core::fmt;

/// A 16-byte device UUID, as carried in the Unprovisioned Device Beacon and the provisioning
/// Invite exchange (§4.13, §8 scenario 1).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceUuid([u8; 16]);

impl DeviceUuid {
    /// Wraps 16 raw bytes as a `DeviceUuid`.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        DeviceUuid(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceUuid({:?})", HexSlice(&self.0[..]))
    }
}

impl<'a> FromBytes<'a> for DeviceUuid {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(DeviceUuid(bytes.read_array()?))
    }
}

impl ToBytes for DeviceUuid {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let uuid = DeviceUuid::from_bytes([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
            0x0E, 0x0F,
        ]);
        let mut buf = [0u8; 16];
        uuid.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        let decoded = DeviceUuid::from_bytes(buf);
        assert_eq!(uuid, decoded);
    }
}
