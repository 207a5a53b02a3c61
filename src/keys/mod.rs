//! Key store (C2): owns net keys, app keys, and device keys, and performs the derivations that
//! turn a root key into the material the rest of the stack uses on the wire.

use heapless::consts::{U4, U8};
use heapless::Vec;

use crate::crypto::derive::{k1, k2, k3, k4, s1};
use crate::crypto::CryptoProvider;
use crate::error::Error;

/// A key's position in its key-refresh cycle (§3).
///
/// In `Phase1`/`Phase2`, both the old and new key variants coexist and decrypt attempts must try
/// both (`meshx_net_key_traverse`, §4.2).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefreshPhase {
    Normal,
    Phase1,
    Phase2,
}

/// Material derived from a network root key.
#[derive(Clone, Copy)]
pub struct NetKeyMaterial {
    pub root: [u8; 16],
    pub nid: u8,
    pub encryption_key: [u8; 16],
    pub privacy_key: [u8; 16],
    pub identity_key: [u8; 16],
    pub beacon_key: [u8; 16],
    pub network_id: [u8; 8],
}

impl NetKeyMaterial {
    /// Runs the full §4.2 derivation chain over a root key.
    pub fn derive(crypto: &impl CryptoProvider, root: [u8; 16]) -> Self {
        let nkik = s1(crypto, b"nkik");
        let nkbk = s1(crypto, b"nkbk");
        let identity_key = k1(crypto, &root, &nkik, b"id128\x01");
        let beacon_key = k1(crypto, &root, &nkbk, b"id128\x01");
        let k2_out = k2(crypto, &root, &[0x00]);
        let network_id = k3(crypto, &root);

        NetKeyMaterial {
            root,
            nid: k2_out.nid,
            encryption_key: k2_out.encryption_key,
            privacy_key: k2_out.privacy_key,
            identity_key,
            beacon_key,
            network_id,
        }
    }
}

/// A network key table entry: a 12-bit index, its refresh phase, and one or two generations of
/// derived material.
pub struct NetKeyEntry {
    pub index: u16,
    pub phase: RefreshPhase,
    pub current: NetKeyMaterial,
    pub updating: Option<NetKeyMaterial>,
}

/// An application key table entry, bound to exactly one network key index.
pub struct AppKeyEntry {
    pub index: u16,
    pub bound_net_key_index: u16,
    pub root: [u8; 16],
    pub aid: u8,
    pub updating: Option<([u8; 16], u8)>,
}

/// A device key table entry, bound to a contiguous unicast address range.
pub struct DeviceKeyEntry {
    pub primary_addr: u16,
    pub element_count: u8,
    pub key: [u8; 16],
}

/// Default net-key table capacity.
pub type DefaultNetKeyCapacity = U4;
/// Default app-key table capacity.
pub type DefaultAppKeyCapacity = U8;
/// Default device-key table capacity.
pub type DefaultDeviceKeyCapacity = U4;

/// Owns the net/app/device key tables and performs additions, updates, deletions, and derivation.
///
/// Capacity is bounded by configuration (the `N*` type parameters); exceeding it returns
/// `Error::Resource`, and an index collision returns `Error::Already` (§4.2).
pub struct KeyStore<C, NetN = DefaultNetKeyCapacity, AppN = DefaultAppKeyCapacity, DevN = DefaultDeviceKeyCapacity>
where
    C: CryptoProvider,
    NetN: heapless::ArrayLength<NetKeyEntry>,
    AppN: heapless::ArrayLength<AppKeyEntry>,
    DevN: heapless::ArrayLength<DeviceKeyEntry>,
{
    crypto: C,
    net_keys: Vec<NetKeyEntry, NetN>,
    app_keys: Vec<AppKeyEntry, AppN>,
    device_keys: Vec<DeviceKeyEntry, DevN>,
}

impl<C, NetN, AppN, DevN> KeyStore<C, NetN, AppN, DevN>
where
    C: CryptoProvider,
    NetN: heapless::ArrayLength<NetKeyEntry>,
    AppN: heapless::ArrayLength<AppKeyEntry>,
    DevN: heapless::ArrayLength<DeviceKeyEntry>,
{
    /// Creates an empty key store using the given crypto provider.
    pub fn new(crypto: C) -> Self {
        Self {
            crypto,
            net_keys: Vec::new(),
            app_keys: Vec::new(),
            device_keys: Vec::new(),
        }
    }

    /// Adds a network key at `index`, deriving its material. Fails with `Error::Already` on index
    /// collision and `Error::Resource` when the table is full.
    pub fn add_net_key(&mut self, index: u16, root: [u8; 16]) -> Result<(), Error> {
        if self.net_keys.iter().any(|e| e.index == index) {
            return Err(Error::Already);
        }
        let material = NetKeyMaterial::derive(&self.crypto, root);
        self.net_keys
            .push(NetKeyEntry {
                index,
                phase: RefreshPhase::Normal,
                current: material,
                updating: None,
            })
            .map_err(|_| Error::Resource)
    }

    /// Begins a key-refresh cycle for `index` by deriving and storing the new candidate material
    /// alongside the current one (refresh phase 1).
    pub fn begin_net_key_update(&mut self, index: u16, new_root: [u8; 16]) -> Result<(), Error> {
        let entry = self
            .net_keys
            .iter_mut()
            .find(|e| e.index == index)
            .ok_or(Error::NotFound)?;
        if entry.phase != RefreshPhase::Normal {
            return Err(Error::State);
        }
        entry.updating = Some(NetKeyMaterial::derive(&self.crypto, new_root));
        entry.phase = RefreshPhase::Phase1;
        Ok(())
    }

    /// Advances a network key's refresh phase from phase 1 to phase 2 (new material starts being
    /// used for transmission; both are still accepted on receive).
    pub fn advance_net_key_phase(&mut self, index: u16) -> Result<(), Error> {
        let entry = self
            .net_keys
            .iter_mut()
            .find(|e| e.index == index)
            .ok_or(Error::NotFound)?;
        match entry.phase {
            RefreshPhase::Phase1 => {
                entry.phase = RefreshPhase::Phase2;
                Ok(())
            }
            _ => Err(Error::State),
        }
    }

    /// Completes a key-refresh cycle: the updating material becomes current, the old material is
    /// discarded.
    pub fn complete_net_key_update(&mut self, index: u16) -> Result<(), Error> {
        let entry = self
            .net_keys
            .iter_mut()
            .find(|e| e.index == index)
            .ok_or(Error::NotFound)?;
        if entry.phase != RefreshPhase::Phase2 {
            return Err(Error::State);
        }
        if let Some(updating) = entry.updating.take() {
            entry.current = updating;
        }
        entry.phase = RefreshPhase::Normal;
        Ok(())
    }

    /// Removes a network key by index.
    pub fn delete_net_key(&mut self, index: u16) -> Result<(), Error> {
        let pos = self
            .net_keys
            .iter()
            .position(|e| e.index == index)
            .ok_or(Error::NotFound)?;
        self.net_keys.swap_remove(pos);
        Ok(())
    }

    /// Returns every net-key candidate material (current, and updating if present) whose NID
    /// matches `nid` — `meshx_net_key_traverse` (§4.2), used by the network layer to try every
    /// key whose NID matches the inbound PDU's NID.
    pub fn net_keys_by_nid(&self, nid: u8) -> impl Iterator<Item = &NetKeyMaterial> {
        self.net_keys.iter().flat_map(move |e| {
            let current = if e.current.nid == nid {
                Some(&e.current)
            } else {
                None
            };
            let updating = e
                .updating
                .as_ref()
                .filter(|m| m.nid == nid);
            current.into_iter().chain(updating.into_iter())
        })
    }

    /// Returns every known net key's material, in index order, for beacon emission (§4.12).
    pub fn net_keys(&self) -> impl Iterator<Item = &NetKeyMaterial> {
        self.net_keys.iter().map(|e| &e.current)
    }

    pub fn net_key(&self, index: u16) -> Option<&NetKeyEntry> {
        self.net_keys.iter().find(|e| e.index == index)
    }

    /// Adds an application key bound to `net_key_index`.
    pub fn add_app_key(
        &mut self,
        index: u16,
        net_key_index: u16,
        root: [u8; 16],
    ) -> Result<(), Error> {
        if self.net_key(net_key_index).is_none() {
            return Err(Error::NotFound);
        }
        if self.app_keys.iter().any(|e| e.index == index) {
            return Err(Error::Already);
        }
        let aid = k4(&self.crypto, &root);
        self.app_keys
            .push(AppKeyEntry {
                index,
                bound_net_key_index: net_key_index,
                root,
                aid,
                updating: None,
            })
            .map_err(|_| Error::Resource)
    }

    pub fn delete_app_key(&mut self, index: u16) -> Result<(), Error> {
        let pos = self
            .app_keys
            .iter()
            .position(|e| e.index == index)
            .ok_or(Error::NotFound)?;
        self.app_keys.swap_remove(pos);
        Ok(())
    }

    /// Returns every application key candidate (current, and updating if present) bound to
    /// `net_key_index` whose AID matches `aid`.
    pub fn app_keys_by_aid(
        &self,
        net_key_index: u16,
        aid: u8,
    ) -> impl Iterator<Item = &[u8; 16]> {
        self.app_keys.iter().filter_map(move |e| {
            if e.bound_net_key_index != net_key_index {
                return None;
            }
            if e.aid == aid {
                Some(&e.root)
            } else {
                e.updating
                    .as_ref()
                    .filter(|(_, a)| *a == aid)
                    .map(|(k, _)| k)
            }
        })
    }

    /// Looks up an application key table entry by its 12-bit index.
    pub fn app_key(&self, index: u16) -> Option<&AppKeyEntry> {
        self.app_keys.iter().find(|e| e.index == index)
    }

    /// Adds a device key bound to the unicast range `[primary_addr, primary_addr + element_count)`.
    pub fn add_device_key(
        &mut self,
        primary_addr: u16,
        element_count: u8,
        key: [u8; 16],
    ) -> Result<(), Error> {
        if self
            .device_keys
            .iter()
            .any(|e| e.primary_addr == primary_addr)
        {
            return Err(Error::Already);
        }
        self.device_keys
            .push(DeviceKeyEntry {
                primary_addr,
                element_count,
                key,
            })
            .map_err(|_| Error::Resource)
    }

    /// Looks up the device key covering a given unicast address.
    pub fn device_key_for(&self, addr: u16) -> Option<&[u8; 16]> {
        self.device_keys
            .iter()
            .find(|e| {
                addr >= e.primary_addr && addr < e.primary_addr + u16::from(e.element_count)
            })
            .map(|e| &e.key)
    }

    pub fn delete_device_key(&mut self, primary_addr: u16) -> Result<(), Error> {
        let pos = self
            .device_keys
            .iter()
            .position(|e| e.primary_addr == primary_addr)
            .ok_or(Error::NotFound)?;
        self.device_keys.swap_remove(pos);
        Ok(())
    }

    /// Drops every key (net/app/device). Used by `Node::reset()`.
    pub fn clear(&mut self) {
        self.net_keys.clear();
        self.app_keys.clear();
        self.device_keys.clear();
    }

    pub fn crypto(&self) -> &C {
        &self.crypto
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;

    fn store() -> KeyStore<RustCryptoProvider> {
        KeyStore::new(RustCryptoProvider)
    }

    #[test]
    fn add_and_find_by_nid() {
        let mut ks = store();
        ks.add_net_key(0, [0x11; 16]).unwrap();
        let nid = ks.net_key(0).unwrap().current.nid;
        assert_eq!(ks.net_keys_by_nid(nid).count(), 1);
    }

    #[test]
    fn duplicate_index_rejected() {
        let mut ks = store();
        ks.add_net_key(0, [0x11; 16]).unwrap();
        assert_eq!(ks.add_net_key(0, [0x22; 16]), Err(Error::Already));
    }

    #[test]
    fn app_key_must_bind_existing_net_key() {
        let mut ks = store();
        assert_eq!(ks.add_app_key(0, 0, [0x33; 16]), Err(Error::NotFound));
        ks.add_net_key(0, [0x11; 16]).unwrap();
        assert!(ks.add_app_key(0, 0, [0x33; 16]).is_ok());
    }

    #[test]
    fn refresh_cycle_swaps_material() {
        let mut ks = store();
        ks.add_net_key(0, [0x11; 16]).unwrap();
        let old_nid = ks.net_key(0).unwrap().current.nid;
        ks.begin_net_key_update(0, [0x22; 16]).unwrap();
        assert_eq!(ks.net_key(0).unwrap().phase, RefreshPhase::Phase1);
        ks.advance_net_key_phase(0).unwrap();
        ks.complete_net_key_update(0).unwrap();
        assert_eq!(ks.net_key(0).unwrap().phase, RefreshPhase::Normal);
        let _ = old_nid;
    }

    #[test]
    fn device_key_range_lookup() {
        let mut ks = store();
        ks.add_device_key(0x0010, 3, [0x44; 16]).unwrap();
        assert!(ks.device_key_for(0x0010).is_some());
        assert!(ks.device_key_for(0x0012).is_some());
        assert!(ks.device_key_for(0x0013).is_none());
    }
}
