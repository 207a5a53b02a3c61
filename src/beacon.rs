//! Beacon engine (C12): constructs the Unprovisioned Device Beacon and Secure Network Beacon
//! advertising payloads (§4.12).
//!
//! Both beacon types ride the mesh beacon AD type inside a bearer PDU; this module only builds
//! and parses their payload bytes, leaving AD-type framing to [`crate::bearer`].

use crate::bytes::{ByteReader, ByteWriter};
use crate::crypto::CryptoProvider;
use crate::error::Error;
use crate::keys::NetKeyMaterial;
use crate::uuid::DeviceUuid;

/// Beacon type byte for an Unprovisioned Device Beacon.
pub const TYPE_UNPROVISIONED: u8 = 0x00;
/// Beacon type byte for a Secure Network Beacon.
pub const TYPE_SECURE_NETWORK: u8 = 0x01;

/// Key-refresh and IV-update flag bits carried in a Secure Network Beacon's `flags` byte.
pub mod flags {
    pub const KEY_REFRESH_IN_PROGRESS: u8 = 0x01;
    pub const IV_UPDATE_IN_PROGRESS: u8 = 0x02;
}

/// An Unprovisioned Device Beacon: `type ‖ device_uuid(16) ‖ oob_info(2) ‖ [uri_hash(4)]` (§4.12).
#[derive(Debug, Copy, Clone)]
pub struct UnprovisionedDeviceBeacon {
    pub uuid: DeviceUuid,
    pub oob_info: u16,
    pub uri_hash: Option<u32>,
}

impl UnprovisionedDeviceBeacon {
    /// Serializes this beacon's payload to `out`, returning the byte count written.
    pub fn write(&self, out: &mut [u8]) -> Result<usize, Error> {
        let mut writer = ByteWriter::new(out);
        writer.write_u8(TYPE_UNPROVISIONED)?;
        writer.write_slice(self.uuid.as_bytes())?;
        writer.write_u16_be(self.oob_info)?;
        if let Some(hash) = self.uri_hash {
            writer.write_u32_be(hash)?;
        }
        Ok(out.len() - writer.space_left())
    }

    /// Parses an Unprovisioned Device Beacon payload (type byte included).
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(payload);
        if reader.read_u8()? != TYPE_UNPROVISIONED {
            return Err(Error::InvalidValue);
        }
        let uuid_bytes: [u8; 16] = reader.read_array()?;
        let oob_info = reader.read_u16_be()?;
        let uri_hash = if reader.is_empty() {
            None
        } else {
            Some(reader.read_u32_be()?)
        };
        Ok(UnprovisionedDeviceBeacon {
            uuid: DeviceUuid::from_bytes(uuid_bytes),
            oob_info,
            uri_hash,
        })
    }
}

/// A Secure Network Beacon: `type ‖ flags(1) ‖ network_id(8) ‖ iv_index(4) ‖ auth(8)` (§4.12),
/// where `auth = first8(AES_CMAC(beacon_key, flags ‖ network_id ‖ iv_index))`.
#[derive(Debug, Copy, Clone)]
pub struct SecureNetworkBeacon {
    pub key_refresh_in_progress: bool,
    pub iv_update_in_progress: bool,
    pub network_id: [u8; 8],
    pub iv_index: u32,
    pub auth: [u8; 8],
}

fn beacon_flags(key_refresh: bool, iv_update: bool) -> u8 {
    let mut f = 0u8;
    if key_refresh {
        f |= flags::KEY_REFRESH_IN_PROGRESS;
    }
    if iv_update {
        f |= flags::IV_UPDATE_IN_PROGRESS;
    }
    f
}

fn compute_auth(
    crypto: &impl CryptoProvider,
    beacon_key: &[u8; 16],
    flags_byte: u8,
    network_id: &[u8; 8],
    iv_index: u32,
) -> [u8; 8] {
    let mut msg = [0u8; 13];
    msg[0] = flags_byte;
    msg[1..9].copy_from_slice(network_id);
    msg[9..13].copy_from_slice(&iv_index.to_be_bytes());
    let full = crypto.aes_cmac(beacon_key, &msg);
    let mut out = [0u8; 8];
    out.copy_from_slice(&full[..8]);
    out
}

impl SecureNetworkBeacon {
    /// Builds and authenticates a Secure Network Beacon for `key` at the node's current
    /// `iv_index` and refresh/update state.
    pub fn build(
        crypto: &impl CryptoProvider,
        key: &NetKeyMaterial,
        iv_index: u32,
        key_refresh_in_progress: bool,
        iv_update_in_progress: bool,
    ) -> Self {
        let flags_byte = beacon_flags(key_refresh_in_progress, iv_update_in_progress);
        let auth = compute_auth(
            crypto,
            &key.beacon_key,
            flags_byte,
            &key.network_id,
            iv_index,
        );
        SecureNetworkBeacon {
            key_refresh_in_progress,
            iv_update_in_progress,
            network_id: key.network_id,
            iv_index,
            auth,
        }
    }

    /// Serializes this beacon's payload to `out`, returning the byte count written.
    pub fn write(&self, out: &mut [u8]) -> Result<usize, Error> {
        let mut writer = ByteWriter::new(out);
        writer.write_u8(TYPE_SECURE_NETWORK)?;
        writer.write_u8(beacon_flags(
            self.key_refresh_in_progress,
            self.iv_update_in_progress,
        ))?;
        writer.write_slice(&self.network_id)?;
        writer.write_u32_be(self.iv_index)?;
        writer.write_slice(&self.auth)?;
        Ok(out.len() - writer.space_left())
    }

    /// Parses a Secure Network Beacon payload (type byte included), without verifying `auth`.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(payload);
        if reader.read_u8()? != TYPE_SECURE_NETWORK {
            return Err(Error::InvalidValue);
        }
        let flags_byte = reader.read_u8()?;
        let network_id = reader.read_array()?;
        let iv_index = reader.read_u32_be()?;
        let auth = reader.read_array()?;
        Ok(SecureNetworkBeacon {
            key_refresh_in_progress: flags_byte & flags::KEY_REFRESH_IN_PROGRESS != 0,
            iv_update_in_progress: flags_byte & flags::IV_UPDATE_IN_PROGRESS != 0,
            network_id,
            iv_index,
            auth,
        })
    }

    /// Recomputes `auth` against `beacon_key` and compares against the stored value.
    pub fn verify(&self, crypto: &impl CryptoProvider, beacon_key: &[u8; 16]) -> bool {
        let flags_byte = beacon_flags(self.key_refresh_in_progress, self.iv_update_in_progress);
        compute_auth(crypto, beacon_key, flags_byte, &self.network_id, self.iv_index) == self.auth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;

    #[test]
    fn unprovisioned_beacon_round_trips_without_uri_hash() {
        let beacon = UnprovisionedDeviceBeacon {
            uuid: DeviceUuid::from_bytes([0x01; 16]),
            oob_info: 0x0000,
            uri_hash: None,
        };
        let mut buf = [0u8; 32];
        let n = beacon.write(&mut buf).unwrap();
        assert_eq!(n, 19);
        let parsed = UnprovisionedDeviceBeacon::parse(&buf[..n]).unwrap();
        assert_eq!(parsed.oob_info, 0x0000);
        assert!(parsed.uri_hash.is_none());
    }

    #[test]
    fn unprovisioned_beacon_round_trips_with_uri_hash() {
        let beacon = UnprovisionedDeviceBeacon {
            uuid: DeviceUuid::from_bytes([0x02; 16]),
            oob_info: 0x0004,
            uri_hash: Some(0xDEADBEEF),
        };
        let mut buf = [0u8; 32];
        let n = beacon.write(&mut buf).unwrap();
        assert_eq!(n, 23);
        let parsed = UnprovisionedDeviceBeacon::parse(&buf[..n]).unwrap();
        assert_eq!(parsed.uri_hash, Some(0xDEADBEEF));
    }

    #[test]
    fn secure_network_beacon_round_trips_and_authenticates() {
        let crypto = RustCryptoProvider;
        let key = NetKeyMaterial::derive(&crypto, [0x7du8, 0xdd, 0x0e, 0x93, 0x75, 0x39, 0x54, 0x53, 0x2d, 0x5e, 0x1a, 0x5e, 0xa9, 0x38, 0xfe, 0x3b]);
        let beacon = SecureNetworkBeacon::build(&crypto, &key, 0x12345678, false, true);

        let mut buf = [0u8; 32];
        let n = beacon.write(&mut buf).unwrap();
        assert_eq!(n, 22);

        let parsed = SecureNetworkBeacon::parse(&buf[..n]).unwrap();
        assert!(!parsed.key_refresh_in_progress);
        assert!(parsed.iv_update_in_progress);
        assert_eq!(parsed.iv_index, 0x12345678);
        assert!(parsed.verify(&crypto, &key.beacon_key));
    }

    #[test]
    fn tampered_secure_network_beacon_fails_verification() {
        let crypto = RustCryptoProvider;
        let key = NetKeyMaterial::derive(&crypto, [0x11u8; 16]);
        let mut beacon = SecureNetworkBeacon::build(&crypto, &key, 1, false, false);
        beacon.iv_index = 2;
        assert!(!beacon.verify(&crypto, &key.beacon_key));
    }
}
