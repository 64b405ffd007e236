//! Ordered roster of public keys and their BDN coefficients
//!
//! Every signer `i` gets a coefficient `c_i` derived from the hash of the
//! whole roster. Shares are multiplied by `c_i` before they are combined and
//! the aggregate key of a mask is `Σ c_i·pk_i`, which blocks rogue-key
//! attacks against plain BLS aggregation.

use super::bls::PublicKey;
use super::mask::Mask;
use crate::{Error, NodeIndex, Result};
use ark_bls12_381::{Fr, G1Affine, G1Projective, G2Affine, G2Projective};
use ark_ec::CurveGroup;
use ark_ff::{PrimeField, Zero};
use sha2::{Digest, Sha256};

const COEFFICIENT_TAG: &[u8] = b"cosig-bdn-coefficients:v1";

/// Size in bytes of a coefficient before reduction (128-bit exponents)
const COEFFICIENT_BYTES: usize = 16;

/// The fixed participant list of one protocol run
#[derive(Debug, Clone)]
pub struct Roster {
    publics: Vec<PublicKey>,
    coefficients: Vec<Fr>,
}

impl Roster {
    /// Build a roster, deriving one coefficient per public key
    pub fn new(publics: Vec<PublicKey>) -> Result<Self> {
        if publics.is_empty() {
            return Err(Error::InvalidConfig("roster cannot be empty".into()));
        }
        if let Some(idx) = publics.iter().position(|pk| pk.is_identity()) {
            return Err(Error::InvalidConfig(format!(
                "public key at index {} is the identity",
                idx
            )));
        }

        let mut hasher = Sha256::new();
        hasher.update(COEFFICIENT_TAG);
        for public in &publics {
            hasher.update(public.to_bytes()?);
        }
        let seed = hasher.finalize();

        let coefficients = (0..publics.len())
            .map(|idx| {
                let digest = Sha256::new()
                    .chain_update(seed)
                    .chain_update((idx as u64).to_le_bytes())
                    .finalize();
                Fr::from_le_bytes_mod_order(&digest[..COEFFICIENT_BYTES])
            })
            .collect();

        Ok(Self {
            publics,
            coefficients,
        })
    }

    /// Number of participants
    pub fn len(&self) -> usize {
        self.publics.len()
    }

    /// A roster is never empty; provided for clippy's sake
    pub fn is_empty(&self) -> bool {
        self.publics.is_empty()
    }

    /// Public keys in roster order
    pub fn publics(&self) -> &[PublicKey] {
        &self.publics
    }

    /// Public key of the participant at `idx`
    pub fn public(&self, idx: NodeIndex) -> Result<&PublicKey> {
        self.publics
            .get(idx)
            .ok_or_else(|| Error::InvalidConfig(format!("no participant at index {}", idx)))
    }

    /// Roster position of `public`, if present
    pub fn index_of(&self, public: &PublicKey) -> Option<NodeIndex> {
        self.publics.iter().position(|pk| pk == public)
    }

    /// Fresh mask with no participant enabled
    pub fn empty_mask(&self) -> Mask {
        Mask::new(self.len())
    }

    /// Multiply one signer's raw share by its coefficient
    pub fn weigh_share(&self, idx: NodeIndex, share: &G1Affine) -> Result<G1Projective> {
        let coefficient = self
            .coefficients
            .get(idx)
            .ok_or_else(|| Error::InvalidResponse(format!("signer {} not in roster", idx)))?;
        Ok(*share * *coefficient)
    }

    /// Combine `(signer, raw share)` pairs into one rogue-key-safe aggregate
    pub fn aggregate_shares<'a, I>(&self, shares: I) -> Result<G1Projective>
    where
        I: IntoIterator<Item = (NodeIndex, &'a G1Affine)>,
    {
        let mut aggregate = G1Projective::zero();
        for (idx, share) in shares {
            aggregate += self.weigh_share(idx, share)?;
        }
        Ok(aggregate)
    }

    /// Aggregate public key of the participants enabled in `mask`
    pub fn aggregate_public_key(&self, mask: &Mask) -> Result<G2Affine> {
        if mask.len() != self.len() {
            return Err(Error::InvalidMask(format!(
                "mask covers {} participants, roster has {}",
                mask.len(),
                self.len()
            )));
        }
        let mut aggregate = G2Projective::zero();
        for idx in mask.enabled_indices() {
            aggregate += self.publics[idx].0 * self.coefficients[idx];
        }
        Ok(aggregate.into_affine())
    }
}
