//! BLS12-381 keys and single-key signatures
//!
//! Public keys live in G2 and signatures in G1, so the signature that
//! travels in every rumor is a 48-byte compressed point. Two signing
//! contexts are used: one for the co-signed proposal and one for the
//! root's proof over the final co-signature.

use crate::{Error, Result};
use ark_bls12_381::{g1, Bls12_381, Fr, G1Affine, G1Projective, G2Affine, G2Projective};
use ark_ec::{
    hashing::{curve_maps::wb::WBMap, map_to_curve_hasher::MapToCurveBasedHasher, HashToCurve},
    pairing::Pairing,
    AffineRepr, CurveGroup,
};
use ark_ff::field_hashers::DefaultFieldHasher;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::UniformRand;
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Domain separation tag for co-signed proposals
pub const MESSAGE_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_COSIG:v1";

/// Domain separation tag for the root's shutdown proof
pub const SHUTDOWN_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_COSIG_SHUTDOWN:v1";

/// Length of a compressed G1 point (signature)
pub const SIGNATURE_LEN: usize = 48;

/// Length of a compressed G2 point (public key)
pub const PUBLIC_KEY_LEN: usize = 96;

type G1Hasher =
    MapToCurveBasedHasher<G1Projective, DefaultFieldHasher<Sha256, 128>, WBMap<g1::Config>>;

/// Hash a message onto G1 under the given domain separation tag
pub fn hash_to_g1(dst: &[u8], message: &[u8]) -> Result<G1Affine> {
    let hasher = G1Hasher::new(dst)
        .map_err(|e| Error::Crypto(format!("hash to curve setup failed: {:?}", e)))?;
    hasher
        .hash(message)
        .map_err(|e| Error::Crypto(format!("hash to curve failed: {:?}", e)))
}

/// Encode a G1 point in compressed form
pub fn g1_to_bytes(point: &G1Affine) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(SIGNATURE_LEN);
    point.serialize_compressed(&mut bytes)?;
    Ok(bytes)
}

/// Decode a compressed G1 point, checking curve and subgroup membership
pub fn g1_from_bytes(bytes: &[u8]) -> Result<G1Affine> {
    if bytes.len() != SIGNATURE_LEN {
        return Err(Error::MalformedSignature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LEN,
            bytes.len()
        )));
    }
    G1Affine::deserialize_compressed(bytes)
        .map_err(|e| Error::MalformedSignature(format!("invalid G1 point: {}", e)))
}

/// Check `e(sig, g2) == e(H(m), pk)`
pub(crate) fn pairing_check(signature: G1Affine, hashed: G1Affine, public: G2Affine) -> bool {
    Bls12_381::pairing(signature, G2Affine::generator()) == Bls12_381::pairing(hashed, public)
}

/// BLS secret scalar
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Fr);

/// BLS public key (G2 point)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(pub(crate) G2Affine);

impl PublicKey {
    /// Decode from compressed bytes (96 bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(Error::Crypto(format!(
                "Invalid BLS public key length: expected {}, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            )));
        }
        let point = G2Affine::deserialize_compressed(bytes)
            .map_err(|e| Error::Crypto(format!("Invalid BLS public key: {}", e)))?;
        Ok(Self(point))
    }

    /// Export to compressed bytes (96 bytes)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(PUBLIC_KEY_LEN);
        self.0.serialize_compressed(&mut bytes)?;
        Ok(bytes)
    }

    /// Export to hex string
    pub fn to_hex(&self) -> Result<String> {
        Ok(hex::encode(self.to_bytes()?))
    }

    /// Whether this is the point at infinity, which can never sign
    pub fn is_identity(&self) -> bool {
        self.0.is_zero()
    }

    /// Verify a single-key signature under `dst`
    pub fn verify(&self, dst: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
        if message.is_empty() {
            return Err(Error::VerificationFailed("no message provided".into()));
        }
        if signature.is_empty() {
            return Err(Error::VerificationFailed("no signature provided".into()));
        }
        let point = g1_from_bytes(signature)?;
        let hashed = hash_to_g1(dst, message)?;
        if pairing_check(point, hashed, self.0) {
            Ok(())
        } else {
            Err(Error::VerificationFailed(
                "didn't get a valid signature".into(),
            ))
        }
    }
}

/// Key pair held by one participant for the whole round
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = Fr::rand(rng);
        let public = (G2Projective::from(G2Affine::generator()) * secret).into_affine();
        Self {
            secret: SecretKey(secret),
            public: PublicKey(public),
        }
    }

    /// Get the corresponding public key
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Sign a message under `dst`, returning the G1 point
    pub fn sign_point(&self, dst: &[u8], message: &[u8]) -> Result<G1Affine> {
        let hashed = hash_to_g1(dst, message)?;
        Ok((hashed * self.secret.0).into_affine())
    }

    /// Sign a message under `dst`, returning the compressed signature
    pub fn sign(&self, dst: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        g1_to_bytes(&self.sign_point(dst, message)?)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_sign_verify() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let keypair = KeyPair::generate(&mut rng);

        let sig = keypair.sign(MESSAGE_DST, b"hello").unwrap();
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(keypair.public().verify(MESSAGE_DST, b"hello", &sig).is_ok());
        assert!(keypair.public().verify(MESSAGE_DST, b"other", &sig).is_err());
    }

    #[test]
    fn test_signing_contexts_are_distinct() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let keypair = KeyPair::generate(&mut rng);

        let sig = keypair.sign(MESSAGE_DST, b"hello").unwrap();
        assert!(keypair.public().verify(SHUTDOWN_DST, b"hello", &sig).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let alice = KeyPair::generate(&mut rng);
        let bob = KeyPair::generate(&mut rng);

        let sig = alice.sign(MESSAGE_DST, b"hello").unwrap();
        assert!(bob.public().verify(MESSAGE_DST, b"hello", &sig).is_err());
    }

    #[test]
    fn test_public_key_bytes() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let keypair = KeyPair::generate(&mut rng);

        let bytes = keypair.public().to_bytes().unwrap();
        assert_eq!(bytes.len(), PUBLIC_KEY_LEN);
        assert_eq!(PublicKey::from_bytes(&bytes).unwrap(), keypair.public());
        assert!(PublicKey::from_bytes(&bytes[1..]).is_err());
    }

    #[test]
    fn test_malformed_signature() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let keypair = KeyPair::generate(&mut rng);

        let err = keypair
            .public()
            .verify(MESSAGE_DST, b"hello", &[7u8; 12])
            .unwrap_err();
        assert!(matches!(err, Error::MalformedSignature(_)));
    }
}
