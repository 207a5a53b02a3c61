//! Upper transport (C10): encrypts/authenticates and decrypts/verifies access payloads with an
//! application or device key, and passes control messages through untouched (§4.10).
//!
//! The upper transport never sees segmentation; it always operates on a single reassembled PDU
//! (already produced or about to be consumed by [`crate::lower_transport`]).

use crate::address::Address;
use crate::crypto::{CryptoProvider, TRANS_MIC_LARGE, TRANS_MIC_SMALL};
use crate::error::Error;

/// Nonce type byte for an application-key-encrypted access payload.
const NONCE_TYPE_APP: u8 = 0x01;
/// Nonce type byte for a device-key-encrypted access payload.
const NONCE_TYPE_DEVICE: u8 = 0x02;

/// Maximum size of an upper transport access payload this layer will handle: the access layer's
/// 380-octet segmented ceiling (§4.11) plus an 8-byte TransMIC.
pub const MAX_UPPER_ACCESS_PDU: usize = 380 + TRANS_MIC_LARGE;

fn build_nonce(
    nonce_type: u8,
    aszmic: bool,
    seq_auth: u32,
    src: Address,
    dst: Address,
    iv_index: u32,
) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[0] = nonce_type;
    nonce[1] = (aszmic as u8) << 7;
    nonce[2] = (seq_auth >> 16) as u8;
    nonce[3] = (seq_auth >> 8) as u8;
    nonce[4] = seq_auth as u8;
    nonce[5] = (src.raw() >> 8) as u8;
    nonce[6] = src.raw() as u8;
    nonce[7] = (dst.raw() >> 8) as u8;
    nonce[8] = dst.raw() as u8;
    nonce[9] = (iv_index >> 24) as u8;
    nonce[10] = (iv_index >> 16) as u8;
    nonce[11] = (iv_index >> 8) as u8;
    nonce[12] = iv_index as u8;
    nonce
}

/// The application or device key material an access message is encrypted or decrypted under.
#[derive(Debug, Copy, Clone)]
pub enum AccessKey<'a> {
    App(&'a [u8; 16]),
    Device(&'a [u8; 16]),
}

impl<'a> AccessKey<'a> {
    fn nonce_type(&self) -> u8 {
        match self {
            AccessKey::App(_) => NONCE_TYPE_APP,
            AccessKey::Device(_) => NONCE_TYPE_DEVICE,
        }
    }

    fn key(&self) -> &'a [u8; 16] {
        match self {
            AccessKey::App(k) | AccessKey::Device(k) => k,
        }
    }
}

/// Resolves the TransMIC length for an access message: 64 bits if segmented and `szmic`, 32 bits
/// otherwise (§4.10). Unsegmented messages always use the small MIC, since `SZMIC` does not exist
/// on an unsegmented PDU.
pub fn trans_mic_len(segmented: bool, szmic: bool) -> usize {
    if segmented && szmic {
        TRANS_MIC_LARGE
    } else {
        TRANS_MIC_SMALL
    }
}

/// Encrypts and authenticates an access message payload, writing `ciphertext ‖ TransMIC` to `out`.
/// Returns the number of bytes written.
///
/// `label_uuid` must be `Some` exactly when `dst` is a virtual address (§4.10: "virtual-address
/// destinations include the label UUID as AAD"); passing one when `dst` isn't virtual, or omitting
/// it when it is, will not authenticate the same way on the receiving end as plaintext AAD is
/// required to match bit-for-bit.
#[allow(clippy::too_many_arguments)]
pub fn encrypt(
    crypto: &impl CryptoProvider,
    key: AccessKey<'_>,
    szmic: bool,
    seq_auth: u32,
    src: Address,
    dst: Address,
    iv_index: u32,
    label_uuid: Option<&[u8; 16]>,
    plaintext: &[u8],
    out: &mut [u8],
) -> Result<usize, Error> {
    let mic_len = if szmic {
        TRANS_MIC_LARGE
    } else {
        TRANS_MIC_SMALL
    };
    let nonce = build_nonce(key.nonce_type(), szmic, seq_auth, src, dst, iv_index);
    let aad: &[u8] = label_uuid.map(|l| &l[..]).unwrap_or(&[]);
    crypto.aes_ccm_encrypt(key.key(), &nonce, aad, plaintext, mic_len, out)
}

/// Decrypts and authenticates an access message; `ciphertext` includes the trailing TransMIC.
pub fn decrypt(
    crypto: &impl CryptoProvider,
    key: AccessKey<'_>,
    szmic: bool,
    seq_auth: u32,
    src: Address,
    dst: Address,
    iv_index: u32,
    label_uuid: Option<&[u8; 16]>,
    mic_len: usize,
    ciphertext: &[u8],
    out: &mut [u8],
) -> Result<usize, Error> {
    let nonce = build_nonce(key.nonce_type(), szmic, seq_auth, src, dst, iv_index);
    let aad: &[u8] = label_uuid.map(|l| &l[..]).unwrap_or(&[]);
    crypto.aes_ccm_decrypt(key.key(), &nonce, aad, ciphertext, mic_len, out)
}

/// Upper transport for control messages is the identity transform (§4.10): no encryption, no MIC.
/// This function exists purely to document the no-op so call sites don't special-case it inline.
pub fn pass_through_control(pdu: &[u8]) -> &[u8] {
    pdu
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;

    #[test]
    fn app_key_round_trip_unicast() {
        let crypto = RustCryptoProvider;
        let key = [0x11u8; 16];
        let plaintext = b"hello mesh access payload";
        let mut cipher = [0u8; 64];
        let n = encrypt(
            &crypto,
            AccessKey::App(&key),
            false,
            7,
            Address::from_raw(0x1201),
            Address::from_raw(0x0003),
            0x12345678,
            None,
            plaintext,
            &mut cipher,
        )
        .unwrap();

        let mut plain_out = [0u8; 64];
        let m = decrypt(
            &crypto,
            AccessKey::App(&key),
            false,
            7,
            Address::from_raw(0x1201),
            Address::from_raw(0x0003),
            0x12345678,
            None,
            trans_mic_len(false, false),
            &cipher[..n],
            &mut plain_out,
        )
        .unwrap();
        assert_eq!(&plain_out[..m], plaintext);
    }

    #[test]
    fn device_key_wrong_seq_auth_fails_authentication() {
        let crypto = RustCryptoProvider;
        let key = [0x22u8; 16];
        let plaintext = b"config message";
        let mut cipher = [0u8; 64];
        let n = encrypt(
            &crypto,
            AccessKey::Device(&key),
            false,
            7,
            Address::from_raw(0x1201),
            Address::from_raw(0x0003),
            1,
            None,
            plaintext,
            &mut cipher,
        )
        .unwrap();

        let mut plain_out = [0u8; 64];
        let err = decrypt(
            &crypto,
            AccessKey::Device(&key),
            false,
            8, // wrong SeqAuth
            Address::from_raw(0x1201),
            Address::from_raw(0x0003),
            1,
            None,
            trans_mic_len(false, false),
            &cipher[..n],
            &mut plain_out,
        )
        .unwrap_err();
        assert_eq!(err, Error::Key);
    }

    #[test]
    fn virtual_address_requires_matching_label_uuid() {
        let crypto = RustCryptoProvider;
        let key = [0x33u8; 16];
        let label = [0xAAu8; 16];
        let plaintext = b"to a virtual address";
        let mut cipher = [0u8; 64];
        let n = encrypt(
            &crypto,
            AccessKey::App(&key),
            false,
            7,
            Address::from_raw(0x1201),
            Address::from_raw(0x8001),
            1,
            Some(&label),
            plaintext,
            &mut cipher,
        )
        .unwrap();

        let mut plain_out = [0u8; 64];
        // Decrypting without the label UUID AAD must fail.
        let err = decrypt(
            &crypto,
            AccessKey::App(&key),
            false,
            7,
            Address::from_raw(0x1201),
            Address::from_raw(0x8001),
            1,
            None,
            trans_mic_len(false, false),
            &cipher[..n],
            &mut plain_out,
        )
        .unwrap_err();
        assert_eq!(err, Error::Key);

        let m = decrypt(
            &crypto,
            AccessKey::App(&key),
            false,
            7,
            Address::from_raw(0x1201),
            Address::from_raw(0x8001),
            1,
            Some(&label),
            trans_mic_len(false, false),
            &cipher[..n],
            &mut plain_out,
        )
        .unwrap();
        assert_eq!(&plain_out[..m], plaintext);
    }

    #[test]
    fn control_messages_pass_through_unchanged() {
        let pdu = [0x01u8, 0x02, 0x03];
        assert_eq!(pass_through_control(&pdu), &pdu);
    }

    #[test]
    fn segmented_szmic_selects_large_mic() {
        assert_eq!(trans_mic_len(true, true), TRANS_MIC_LARGE);
        assert_eq!(trans_mic_len(true, false), TRANS_MIC_SMALL);
        assert_eq!(trans_mic_len(false, true), TRANS_MIC_SMALL);
    }
}
