//! Network layer (C8): encrypts/obfuscates outbound network PDUs, decrypts/deobfuscates and
//! authenticates inbound ones against candidate network keys, and applies the relay policy
//! (§4.8).
//!
//! The wire layout is big-endian throughout, unlike the link-layer PDUs the bearer wraps it in:
//!
//! ```text
//! | IVI (1) | NID (7) | CTL (1) | TTL (7) | SEQ (24) | SRC (16) | DST (16) | TransportPDU | NetMIC |
//! ```

use crate::address::Address;
use crate::crypto::{CryptoProvider, NET_MIC_ACCESS, NET_MIC_CONTROL};
use crate::error::Error;
use crate::keys::NetKeyMaterial;

/// Maximum size of a network PDU's encrypted payload (`DST ‖ TransportPDU ‖ NetMIC`), bounding
/// the scratch buffers used by encrypt/decrypt.
pub const MAX_NET_PAYLOAD: usize = 2 + 16 + 8;

fn build_network_nonce(ctl: bool, ttl: u8, seq: u32, src: Address, iv_index: u32) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[0] = 0x00;
    nonce[1] = ((ctl as u8) << 7) | (ttl & 0x7F);
    nonce[2] = (seq >> 16) as u8;
    nonce[3] = (seq >> 8) as u8;
    nonce[4] = seq as u8;
    nonce[5] = (src.raw() >> 8) as u8;
    nonce[6] = src.raw() as u8;
    nonce[7] = 0x00;
    nonce[8] = 0x00;
    nonce[9] = (iv_index >> 24) as u8;
    nonce[10] = (iv_index >> 16) as u8;
    nonce[11] = (iv_index >> 8) as u8;
    nonce[12] = iv_index as u8;
    nonce
}

fn privacy_ecb(
    crypto: &impl CryptoProvider,
    privacy_key: &[u8; 16],
    iv_index: u32,
    ciphertext: &[u8],
) -> [u8; 16] {
    let mut block = [0u8; 16];
    // 5 zero bytes, then IV index, then the first 7 bytes of the ciphertext (§4.8).
    block[5] = (iv_index >> 24) as u8;
    block[6] = (iv_index >> 16) as u8;
    block[7] = (iv_index >> 8) as u8;
    block[8] = iv_index as u8;
    let n = core::cmp::min(7, ciphertext.len());
    block[9..9 + n].copy_from_slice(&ciphertext[..n]);
    crypto.aes128_encrypt(privacy_key, &block)
}

/// Parameters describing the cleartext header of an outbound network PDU.
#[derive(Debug, Copy, Clone)]
pub struct NetworkHeader {
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: Address,
    pub dst: Address,
}

/// Encrypts, authenticates and obfuscates a network PDU, writing the full wire representation
/// (header ‖ ciphertext ‖ NetMIC) into `out`. Returns the number of bytes written.
pub fn encrypt(
    crypto: &impl CryptoProvider,
    key: &NetKeyMaterial,
    iv_index: u32,
    header: &NetworkHeader,
    transport_pdu: &[u8],
    out: &mut [u8],
) -> Result<usize, Error> {
    let mic_len = if header.ctl {
        NET_MIC_CONTROL
    } else {
        NET_MIC_ACCESS
    };

    let mut plaintext = [0u8; MAX_NET_PAYLOAD];
    if transport_pdu.len() + 2 > plaintext.len() {
        return Err(Error::Length);
    }
    plaintext[0] = (header.dst.raw() >> 8) as u8;
    plaintext[1] = header.dst.raw() as u8;
    plaintext[2..2 + transport_pdu.len()].copy_from_slice(transport_pdu);
    let plaintext_len = 2 + transport_pdu.len();

    if out.len() < 9 + plaintext_len + mic_len {
        return Err(Error::Length);
    }

    let nonce = build_network_nonce(header.ctl, header.ttl, header.seq, header.src, iv_index);
    let cipher_len = crypto.aes_ccm_encrypt(
        &key.encryption_key,
        &nonce,
        &[],
        &plaintext[..plaintext_len],
        mic_len,
        &mut out[9..9 + plaintext_len + mic_len],
    )?;

    let ivi = (iv_index & 1) as u8;
    out[0] = (ivi << 7) | (key.nid & 0x7F);
    out[1] = ((header.ctl as u8) << 7) | (header.ttl & 0x7F);
    out[2] = (header.seq >> 16) as u8;
    out[3] = (header.seq >> 8) as u8;
    out[4] = header.seq as u8;
    out[5] = (header.src.raw() >> 8) as u8;
    out[6] = header.src.raw() as u8;

    let pecb = privacy_ecb(crypto, &key.privacy_key, iv_index, &out[9..9 + cipher_len]);
    for i in 0..6 {
        out[1 + i] ^= pecb[i];
    }

    Ok(9 + cipher_len)
}

/// A successfully decrypted network PDU.
#[derive(Debug, Copy, Clone)]
pub struct DecryptedPdu {
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: Address,
    pub dst: Address,
    pub transport_len: usize,
    pub iv_index_used: u32,
}

/// Attempts to deobfuscate and decrypt `pdu` against every key in `candidates` whose `nid`
/// matches the inbound NID, trying `iv_index` first and `iv_index - 1` if the embedded IVI bit
/// doesn't match (§4.8: "IVI selection"). Stops at the first candidate that authenticates.
///
/// `transport_out` receives the decrypted `TransportPDU` (the leading `DST` field is consumed and
/// returned via [`DecryptedPdu::dst`]).
pub fn decrypt<'k>(
    crypto: &impl CryptoProvider,
    candidates: impl Iterator<Item = &'k NetKeyMaterial>,
    iv_index: u32,
    pdu: &[u8],
    transport_out: &mut [u8],
) -> Result<DecryptedPdu, Error> {
    if pdu.len() < 9 {
        return Err(Error::Length);
    }
    let ivi = pdu[0] >> 7;
    let nid = pdu[0] & 0x7F;

    // Try the in-use IV index first, then IV_INDEX - 1, per the IVI-bit mismatch rule; whichever
    // candidate's bit doesn't match the inbound IVI is skipped for the MIC check below.
    let candidate_ivs: [u32; 2] = [iv_index, iv_index.wrapping_sub(1)];

    let mut tried_any_nid_match = false;
    for key in candidates {
        if key.nid != nid {
            continue;
        }
        tried_any_nid_match = true;

        for &iv_candidate in &candidate_ivs {
            if (iv_candidate & 1) as u8 != ivi {
                continue;
            }

            let pecb = privacy_ecb(crypto, &key.privacy_key, iv_candidate, &pdu[9..]);
            let mut header = [0u8; 6];
            header.copy_from_slice(&pdu[1..7]);
            for i in 0..6 {
                header[i] ^= pecb[i];
            }

            let ctl = header[0] & 0x80 != 0;
            let ttl = header[0] & 0x7F;
            let seq = ((header[1] as u32) << 16) | ((header[2] as u32) << 8) | header[3] as u32;
            let src = Address::from_raw(((header[4] as u16) << 8) | header[5] as u16);

            let mic_len = if ctl { NET_MIC_CONTROL } else { NET_MIC_ACCESS };
            if pdu.len() < 9 + mic_len {
                continue;
            }

            let nonce = build_network_nonce(ctl, ttl, seq, src, iv_candidate);
            let mut plaintext = [0u8; MAX_NET_PAYLOAD];
            let cipher = &pdu[9..];
            if cipher.len() > plaintext.len() {
                continue;
            }
            match crypto.aes_ccm_decrypt(
                &key.encryption_key,
                &nonce,
                &[],
                cipher,
                mic_len,
                &mut plaintext,
            ) {
                Ok(plain_len) => {
                    if plain_len < 2 {
                        continue;
                    }
                    let dst = Address::from_raw(
                        ((plaintext[0] as u16) << 8) | plaintext[1] as u16,
                    );
                    let transport_len = plain_len - 2;
                    if transport_out.len() < transport_len {
                        return Err(Error::Length);
                    }
                    transport_out[..transport_len]
                        .copy_from_slice(&plaintext[2..plain_len]);
                    return Ok(DecryptedPdu {
                        ctl,
                        ttl,
                        seq,
                        src,
                        dst,
                        transport_len,
                        iv_index_used: iv_candidate,
                    });
                }
                Err(_) => continue,
            }
        }
    }

    if tried_any_nid_match {
        Err(Error::Key)
    } else {
        Err(Error::NotFound)
    }
}

/// Whether a decrypted, non-local PDU should be relayed: relay must be enabled, TTL must leave
/// at least one hop after decrementing, and the NMC must not already have seen `(src, seq)`
/// (§4.8).
pub fn should_relay(relay_enabled: bool, ttl: u8, nmc_has_seen: bool) -> bool {
    relay_enabled && ttl > 1 && !nmc_has_seen
}

/// Decrements TTL for a relayed PDU. The header bytes remain obfuscated/encrypted exactly as
/// received; only the TTL nibble embedded in the (still-obfuscated) wire representation needs to
/// be rewritten in place by the caller using the same XOR-with-PECB trick used for decrypt, since
/// TTL lives inside the obfuscated region.
pub fn relay_ttl(ttl: u8) -> u8 {
    ttl - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;
    use crate::keys::NetKeyMaterial;

    fn sample_key() -> NetKeyMaterial {
        let crypto = RustCryptoProvider;
        NetKeyMaterial::derive(&crypto, [0x7du8, 0xdd, 0x0e, 0x93, 0x75, 0x39, 0x54, 0x53, 0x2d, 0x5e, 0x1a, 0x5e, 0xa9, 0x38, 0xfe, 0x3b])
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let crypto = RustCryptoProvider;
        let key = sample_key();
        let header = NetworkHeader {
            ctl: false,
            ttl: 4,
            seq: 6,
            src: Address::from_raw(0x1201),
            dst: Address::from_raw(0x0003),
        };
        let transport_pdu = [0x00u8, 0xAF, 0xF4];
        let mut wire = [0u8; 32];
        let n = encrypt(&crypto, &key, 0x12345678, &header, &transport_pdu, &mut wire).unwrap();

        let mut decoded_transport = [0u8; 16];
        let decoded = decrypt(
            &crypto,
            core::iter::once(&key),
            0x12345678,
            &wire[..n],
            &mut decoded_transport,
        )
        .unwrap();

        assert_eq!(decoded.src, header.src);
        assert_eq!(decoded.dst, header.dst);
        assert_eq!(decoded.seq, header.seq);
        assert_eq!(decoded.ttl, header.ttl);
        assert_eq!(&decoded_transport[..decoded.transport_len], &transport_pdu);
    }

    #[test]
    fn wrong_key_reports_not_found() {
        let crypto = RustCryptoProvider;
        let key = sample_key();
        let wrong = NetKeyMaterial::derive(&crypto, [0xAAu8; 16]);
        let header = NetworkHeader {
            ctl: false,
            ttl: 2,
            seq: 1,
            src: Address::from_raw(0x0010),
            dst: Address::from_raw(0x0020),
        };
        let mut wire = [0u8; 32];
        let n = encrypt(&crypto, &key, 1, &header, &[0x01], &mut wire).unwrap();

        let mut out = [0u8; 16];
        let err = decrypt(&crypto, core::iter::once(&wrong), 1, &wire[..n], &mut out).unwrap_err();
        assert_eq!(err, Error::NotFound);
    }

    #[test]
    fn relay_policy_requires_ttl_and_enabled_and_unseen() {
        assert!(should_relay(true, 4, false));
        assert!(!should_relay(false, 4, false));
        assert!(!should_relay(true, 1, false));
        assert!(!should_relay(true, 4, true));
    }
}
