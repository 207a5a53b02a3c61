//! Default [`CryptoProvider`] backed by the RustCrypto family of crates.

use super::CryptoProvider;
use crate::error::Error;

use aes::Aes128;
use ccm::aead::generic_array::{typenum::Unsigned, GenericArray};
use ccm::aead::{Aead, NewAead};
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;
use cmac::{Cmac, Mac, NewMac};

type Ccm32 = Ccm<Aes128, U4, U13>;
type Ccm64 = Ccm<Aes128, U8, U13>;

/// A [`CryptoProvider`] built from the `aes`, `cmac`, and `ccm` RustCrypto crates.
///
/// This is the concrete implementation a platform integration can reach for when it doesn't have
/// its own hardware crypto accelerator to wrap instead.
#[derive(Debug, Default, Copy, Clone)]
pub struct RustCryptoProvider;

impl CryptoProvider for RustCryptoProvider {
    fn aes128_encrypt(&self, key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
        use aes::cipher::generic_array::GenericArray as BlockArray;
        use aes::cipher::{BlockCipher, BlockEncrypt, NewBlockCipher};

        let cipher = Aes128::new(BlockArray::from_slice(key));
        let mut block = *BlockArray::from_slice(block);
        cipher.encrypt_block(&mut block);
        let mut out = [0u8; 16];
        out.copy_from_slice(block.as_slice());
        out
    }

    fn aes_cmac(&self, key: &[u8; 16], msg: &[u8]) -> [u8; 16] {
        let mut mac = Cmac::<Aes128>::new_varkey(key).expect("aes-cmac accepts any 16-byte key");
        mac.update(msg);
        let result = mac.finalize().into_bytes();
        let mut out = [0u8; 16];
        out.copy_from_slice(&result);
        out
    }

    fn aes_ccm_encrypt(
        &self,
        key: &[u8; 16],
        nonce: &[u8; 13],
        aad: &[u8],
        plaintext: &[u8],
        mic_len: usize,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        let needed = plaintext.len() + mic_len;
        if out.len() < needed {
            return Err(Error::Length);
        }

        let payload = ccm::aead::Payload {
            msg: plaintext,
            aad,
        };
        let ciphertext = match mic_len {
            4 => {
                let cipher = Ccm32::new(GenericArray::from_slice(key));
                cipher
                    .encrypt(GenericArray::from_slice(nonce), payload)
                    .map_err(|_| Error::Key)?
            }
            8 => {
                let cipher = Ccm64::new(GenericArray::from_slice(key));
                cipher
                    .encrypt(GenericArray::from_slice(nonce), payload)
                    .map_err(|_| Error::Key)?
            }
            _ => return Err(Error::Inval),
        };

        out[..ciphertext.len()].copy_from_slice(&ciphertext);
        Ok(ciphertext.len())
    }

    fn aes_ccm_decrypt(
        &self,
        key: &[u8; 16],
        nonce: &[u8; 13],
        aad: &[u8],
        ciphertext: &[u8],
        mic_len: usize,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        if ciphertext.len() < mic_len {
            return Err(Error::Length);
        }
        let needed = ciphertext.len() - mic_len;
        if out.len() < needed {
            return Err(Error::Length);
        }

        let payload = ccm::aead::Payload {
            msg: ciphertext,
            aad,
        };
        let plaintext = match mic_len {
            4 => {
                let cipher = Ccm32::new(GenericArray::from_slice(key));
                cipher
                    .decrypt(GenericArray::from_slice(nonce), payload)
                    .map_err(|_| Error::Key)?
            }
            8 => {
                let cipher = Ccm64::new(GenericArray::from_slice(key));
                cipher
                    .decrypt(GenericArray::from_slice(nonce), payload)
                    .map_err(|_| Error::Key)?
            }
            _ => return Err(Error::Inval),
        };

        out[..plaintext.len()].copy_from_slice(&plaintext);
        Ok(plaintext.len())
    }
}

// Tag-size constants for the payload-length asserts used by the derivation tests; not part of the
// public API.
#[allow(dead_code)]
const _TAG_4: usize = U4::USIZE;
#[allow(dead_code)]
const _TAG_8: usize = U8::USIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmac_zero_key_is_s1_building_block() {
        let provider = RustCryptoProvider;
        let key = [0u8; 16];
        let mac1 = provider.aes_cmac(&key, b"test");
        let mac2 = provider.aes_cmac(&key, b"test");
        assert_eq!(mac1, mac2);
        let mac3 = provider.aes_cmac(&key, b"tset");
        assert_ne!(mac1, mac3);
    }

    #[test]
    fn ccm_round_trip() {
        let provider = RustCryptoProvider;
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 13];
        let plaintext = b"mesh network pdu";
        let mut ciphertext = [0u8; 64];
        let n = provider
            .aes_ccm_encrypt(&key, &nonce, &[], plaintext, 4, &mut ciphertext)
            .unwrap();

        let mut decrypted = [0u8; 64];
        let m = provider
            .aes_ccm_decrypt(&key, &nonce, &[], &ciphertext[..n], 4, &mut decrypted)
            .unwrap();
        assert_eq!(&decrypted[..m], plaintext);
    }

    #[test]
    fn ccm_tamper_is_rejected() {
        let provider = RustCryptoProvider;
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 13];
        let plaintext = b"mesh network pdu";
        let mut ciphertext = [0u8; 64];
        let n = provider
            .aes_ccm_encrypt(&key, &nonce, &[], plaintext, 4, &mut ciphertext)
            .unwrap();
        ciphertext[0] ^= 0xFF;

        let mut decrypted = [0u8; 64];
        assert_eq!(
            provider.aes_ccm_decrypt(&key, &nonce, &[], &ciphertext[..n], 4, &mut decrypted),
            Err(Error::Key)
        );
    }
}
