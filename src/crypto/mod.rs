//! Crypto primitives adapter (C1).
//!
//! Wraps AES-128-ECB, AES-CMAC, and AES-CCM behind a single [`CryptoProvider`] trait, mirroring the
//! way [`crate::ecdh`] lets the ECDH half of the same contract be swapped out. All primitives are
//! side-effect-free. MIC/authentication failure is reported as a distinct error from a malformed
//! argument, and no partial plaintext is ever returned on an authentication failure.

mod provider;

pub use provider::RustCryptoProvider;

use crate::error::Error;

/// CCM tag length used for an unsegmented (or `SZMIC=0`) upper transport PDU: 32 bits.
pub const TRANS_MIC_SMALL: usize = 4;
/// CCM tag length used for a segmented upper transport PDU with `SZMIC=1`: 64 bits.
pub const TRANS_MIC_LARGE: usize = 8;
/// CCM tag length used by the network layer: 32 bits for access, 64 bits for control (§4.8).
pub const NET_MIC_ACCESS: usize = 4;
pub const NET_MIC_CONTROL: usize = 8;

/// Trait for the four cryptographic primitives the stack needs beyond ECDH (which has its own
/// provider trait, [`crate::ecdh::EcdhProvider`]).
///
/// Implementations are expected to be thin wrappers around a RustCrypto-family crate; the default
/// [`RustCryptoProvider`] does exactly that.
pub trait CryptoProvider {
    /// Encrypts a single 16-byte block with AES-128 in ECB mode (used to compute `PECB` for
    /// network-header obfuscation, §4.8).
    fn aes128_encrypt(&self, key: &[u8; 16], block: &[u8; 16]) -> [u8; 16];

    /// Computes AES-CMAC(`key`, `msg`), returning the full 128-bit MAC.
    fn aes_cmac(&self, key: &[u8; 16], msg: &[u8]) -> [u8; 16];

    /// Encrypts `plaintext` in place using AES-CCM, appending a `mic_len`-byte MIC. `mic_len` must
    /// be 4 or 8. Returns the number of bytes written to `out` (`plaintext.len() + mic_len`).
    ///
    /// `out` must have room for `plaintext.len() + mic_len` bytes.
    fn aes_ccm_encrypt(
        &self,
        key: &[u8; 16],
        nonce: &[u8; 13],
        aad: &[u8],
        plaintext: &[u8],
        mic_len: usize,
        out: &mut [u8],
    ) -> Result<usize, Error>;

    /// Decrypts and authenticates `ciphertext` (which includes the trailing `mic_len`-byte MIC)
    /// using AES-CCM. Returns the number of plaintext bytes written to `out`
    /// (`ciphertext.len() - mic_len`).
    ///
    /// On authentication failure, returns `Error::Key` (the stack treats MIC failure the same way
    /// as "no candidate key matched") and `out` is left unspecified — no partial plaintext is
    /// exposed.
    fn aes_ccm_decrypt(
        &self,
        key: &[u8; 16],
        nonce: &[u8; 13],
        aad: &[u8],
        ciphertext: &[u8],
        mic_len: usize,
        out: &mut [u8],
    ) -> Result<usize, Error>;
}

pub mod derive;
