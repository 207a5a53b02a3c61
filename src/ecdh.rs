//! Elliptic Curve Diffie-Hellman (ECDH) on P-256 (§4.1, §4.14).
//!
//! Provisioning's public key exchange step uses ECDH on P-256 to agree on a shared secret between
//! provisioner and device. This module defines [`EcdhProvider`], the interface the provisioning
//! FSM (C14) uses to generate key pairs and perform key agreement, independently of whatever
//! concrete curve implementation backs it — mirroring how [`crate::crypto`] abstracts over AES.
//!
//! [`P256Provider`] is the default, using the pure-Rust `p256` crate's low-level arithmetic types
//! (hence the `arithmetic` feature on that dependency) to implement scalar multiplication and
//! point encoding/decoding directly, since this stack needs raw 64-byte public keys rather than
//! the SEC1-tagged encodings a higher-level ECDH helper would hand back.

use core::fmt;
use rand_core::{CryptoRng, RngCore};

use p256::arithmetic::{AffinePoint, ProjectivePoint, Scalar};
use p256::elliptic_curve::group::Curve;

/// A P-256 public key (point on the curve) in uncompressed format, without the leading `0x04` SEC1
/// tag: the first 32 bytes are the big-endian X coordinate, the remaining 32 the Y coordinate.
///
/// This type does not guarantee the point is valid; [`SecretKey::agree`] validates it during key
/// agreement.
pub struct PublicKey(pub [u8; 64]);

/// A shared secret resulting from ECDH key agreement: the X coordinate of the agreed-upon point.
pub struct SharedSecret(pub [u8; 32]);

/// Error returned by [`SecretKey::agree`] when the peer's public key does not decode to a valid
/// point on the curve.
#[derive(Debug)]
pub struct InvalidPublicKey;

impl fmt::Display for InvalidPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid public key")
    }
}

/// Trait for ECDH providers.
pub trait EcdhProvider {
    /// Provider-defined secret key type.
    type SecretKey: SecretKey;

    /// Generates a P-256 key pair using cryptographically strong randomness (§4.14:
    /// `ecdh_p256_make_key`).
    fn generate_keypair<R>(&mut self, rng: &mut R) -> (Self::SecretKey, PublicKey)
    where
        R: RngCore + CryptoRng;
}

/// Secret key operations required by the stack.
///
/// Imposes no requirements on the representation or location of secret keys, so it can be
/// implemented even for keys held in secure storage.
pub trait SecretKey: Sized {
    /// Performs ECDH key agreement using the ephemeral secret key `self` and the public key of the
    /// other party (§4.14: `ecdh_p256_shared_secret`).
    ///
    /// Returns an error if `foreign_key` is invalid (§4.14: `ecdh_p256_validate_public`).
    fn agree(self, foreign_key: &PublicKey) -> Result<SharedSecret, InvalidPublicKey>;
}

/// The default [`EcdhProvider`], backed by the pure-Rust `p256` crate.
#[derive(Debug, Default, Copy, Clone)]
pub struct P256Provider;

/// The [`SecretKey`] produced by [`P256Provider`].
pub struct P256SecretKey(Scalar);

impl EcdhProvider for P256Provider {
    type SecretKey = P256SecretKey;

    fn generate_keypair<R>(&mut self, rng: &mut R) -> (Self::SecretKey, PublicKey)
    where
        R: RngCore + CryptoRng,
    {
        let secret = loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            if let Some(scalar) = Scalar::from_bytes(bytes).into() {
                break scalar;
            }
        };

        let point = (ProjectivePoint::generator() * secret).to_affine();
        let public = encode_point(&point);

        (P256SecretKey(secret), PublicKey(public))
    }
}

impl SecretKey for P256SecretKey {
    fn agree(self, foreign_key: &PublicKey) -> Result<SharedSecret, InvalidPublicKey> {
        let point = decode_point(&foreign_key.0).ok_or(InvalidPublicKey)?;
        let shared = (ProjectivePoint::from(point) * self.0).to_affine();

        if bool::from(shared.is_identity()) {
            return Err(InvalidPublicKey);
        }

        let encoded = encode_point(&shared);
        let mut x = [0u8; 32];
        x.copy_from_slice(&encoded[..32]);
        Ok(SharedSecret(x))
    }
}

fn encode_point(point: &AffinePoint) -> [u8; 64] {
    let encoded = point.to_encoded_point(false);
    let mut out = [0u8; 64];
    // `to_encoded_point` with `compress = false` produces `0x04 || X || Y`; strip the tag byte.
    out.copy_from_slice(&encoded.as_bytes()[1..65]);
    out
}

fn decode_point(raw: &[u8; 64]) -> Option<AffinePoint> {
    let mut tagged = [0u8; 65];
    tagged[0] = 0x04;
    tagged[1..].copy_from_slice(raw);
    let encoded = p256::EncodedPoint::from_bytes(&tagged[..]).ok()?;
    AffinePoint::from_encoded_point(&encoded)
}

/// Runs a conformance smoke-test suite against `provider`: that distinct key pairs are generated,
/// that agreement is symmetric, and that agreement with invalid public keys fails. Mirrors the
/// pattern used by [`crate::crypto`]'s own tests, for downstream implementors of `EcdhProvider` to
/// call from their own `#[test]` functions.
pub fn run_tests(mut provider: impl EcdhProvider) {
    static RNG: &[u8] = &[
        0x1e, 0x66, 0x81, 0xb6, 0xa3, 0x4e, 0x06, 0x97, 0x75, 0xbe, 0xd4, 0x5c, 0xf9, 0x52, 0x3f,
        0xf1, 0x5b, 0x6a, 0x72, 0xe2, 0xb8, 0x35, 0xb3, 0x29, 0x5e, 0xe0, 0xbb, 0x92, 0x35, 0xa5,
        0xb9, 0x60, 0xc9, 0xaf, 0xe2, 0x72, 0x12, 0xf1, 0xc4, 0xfc, 0x10, 0x2d, 0x63, 0x2f, 0x05,
        0xd6, 0xe5, 0x0a, 0xbf, 0x2c, 0xb9, 0x02, 0x3a, 0x67, 0x23, 0x63, 0x36, 0x7a, 0x62, 0xe6,
        0x63, 0xce, 0x28, 0x98,
    ];

    struct Rng(&'static [u8]);

    impl RngCore for Rng {
        fn next_u32(&mut self) -> u32 {
            rand_core::impls::next_u32_via_fill(self)
        }
        fn next_u64(&mut self) -> u64 {
            rand_core::impls::next_u64_via_fill(self)
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            if self.0.len() < dest.len() {
                panic!("ecdh::run_tests: ran out of pregenerated entropy");
            }
            for chunk in dest.chunks_mut(self.0.len()) {
                chunk.copy_from_slice(&self.0[..chunk.len()]);
                self.0 = &self.0[chunk.len()..];
            }
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for Rng {}

    let mut rng = Rng(RNG);
    let (secret1, public1) = provider.generate_keypair(&mut rng);
    let (secret2, public2) = provider.generate_keypair(&mut rng);
    assert_ne!(&public1.0[..], &public2.0[..]);

    let shared1 = secret1.agree(&public2).unwrap();
    let shared2 = secret2.agree(&public1).unwrap();
    assert_eq!(shared1.0, shared2.0);

    let infty = PublicKey([0; 64]);
    let (secret, _) = provider.generate_keypair(&mut Rng(RNG));
    assert!(secret.agree(&infty).is_err());
}

#[cfg(test)]
mod tests {
    #[test]
    fn p256_provider_passes_conformance_suite() {
        super::run_tests(super::P256Provider);
    }
}
