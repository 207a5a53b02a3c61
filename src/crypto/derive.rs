//! The Bluetooth Mesh key-derivation functions: `s1`, `k1`, `k2`, `k3`, `k4` (§4.2).
//!
//! All of these bottom out in AES-CMAC via a [`CryptoProvider`]; none of them touch AES-CCM or
//! ECDH. They're free functions rather than methods on the provider since they're pure compositions
//! of `aes_cmac` and don't need anything else out of the provider.

use super::CryptoProvider;

/// `s1(M) = AES-CMAC(key = 0^16, msg = M)`.
pub fn s1(crypto: &impl CryptoProvider, m: &[u8]) -> [u8; 16] {
    crypto.aes_cmac(&[0u8; 16], m)
}

/// `k1(N, salt, P) = AES-CMAC(AES-CMAC(salt, N), P)`.
pub fn k1(crypto: &impl CryptoProvider, n: &[u8], salt: &[u8; 16], p: &[u8]) -> [u8; 16] {
    let t = crypto.aes_cmac(salt, n);
    crypto.aes_cmac(&t, p)
}

/// Output of [`k2`]: the NID (low 7 bits), encryption key, and privacy key derived from a network
/// root key for a given key-refresh phase identifier `P`.
pub struct K2Output {
    pub nid: u8,
    pub encryption_key: [u8; 16],
    pub privacy_key: [u8; 16],
}

/// `k2(N, P)`, as specified for deriving per-phase network credentials.
///
/// `T = AES-CMAC(s1("smk2"), N)`; `T1 = AES-CMAC(T, T0 || P || 0x01)`,
/// `T2 = AES-CMAC(T, T1 || P || 0x02)`, `T3 = AES-CMAC(T, T2 || P || 0x03)` (`T0` is empty).
/// NID is the low 7 bits of `T1`'s last octet; `T2` is the encryption key; `T3` is the privacy key.
pub fn k2(crypto: &impl CryptoProvider, n: &[u8; 16], p: &[u8]) -> K2Output {
    let salt = s1(crypto, b"smk2");
    let t = crypto.aes_cmac(&salt, n);

    let mut buf = [0u8; 32];
    let p_len = p.len();
    buf[..p_len].copy_from_slice(p);
    buf[p_len] = 0x01;
    let t1 = crypto.aes_cmac(&t, &buf[..p_len + 1]);

    buf[..16].copy_from_slice(&t1);
    buf[16..16 + p_len].copy_from_slice(p);
    buf[16 + p_len] = 0x02;
    let t2 = crypto.aes_cmac(&t, &buf[..16 + p_len + 1]);

    buf[..16].copy_from_slice(&t2);
    buf[16..16 + p_len].copy_from_slice(p);
    buf[16 + p_len] = 0x03;
    let t3 = crypto.aes_cmac(&t, &buf[..16 + p_len + 1]);

    K2Output {
        nid: t1[15] & 0x7F,
        encryption_key: t2,
        privacy_key: t3,
    }
}

/// `k3(N)`: folds a CMAC chain down to the 64-bit Network ID.
///
/// `T = AES-CMAC(s1("smk3"), N)`; output is the low 64 bits of `AES-CMAC(T, "id64" || 0x01)`.
pub fn k3(crypto: &impl CryptoProvider, n: &[u8; 16]) -> [u8; 8] {
    let salt = s1(crypto, b"smk3");
    let t = crypto.aes_cmac(&salt, n);
    let full = crypto.aes_cmac(&t, b"id64\x01");
    let mut out = [0u8; 8];
    out.copy_from_slice(&full[8..16]);
    out
}

/// `k4(N)`: folds a CMAC chain down to the 6-bit AID.
///
/// `T = AES-CMAC(s1("smk4"), N)`; output is the low 6 bits of `AES-CMAC(T, "id6" || 0x01)`.
pub fn k4(crypto: &impl CryptoProvider, n: &[u8; 16]) -> u8 {
    let salt = s1(crypto, b"smk4");
    let t = crypto.aes_cmac(&salt, n);
    let full = crypto.aes_cmac(&t, b"id6\x01");
    full[15] & 0x3F
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;

    #[test]
    fn k2_nid_is_seven_bits() {
        let crypto = RustCryptoProvider;
        let n = [0x42u8; 16];
        let out = k2(&crypto, &n, &[0x00]);
        assert_eq!(out.nid & 0x80, 0);
    }

    #[test]
    fn k4_aid_is_six_bits() {
        let crypto = RustCryptoProvider;
        let n = [0x07u8; 16];
        let aid = k4(&crypto, &n);
        assert_eq!(aid & 0xC0, 0);
    }

    #[test]
    fn derivations_are_deterministic() {
        let crypto = RustCryptoProvider;
        let n = [0x99u8; 16];
        assert_eq!(k3(&crypto, &n), k3(&crypto, &n));
        assert_eq!(k4(&crypto, &n), k4(&crypto, &n));
    }
}
