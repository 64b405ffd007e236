//! Collective signature codec and verification
//!
//! A collective signature is `[compressed G1 point][mask bytes]`. The split
//! is implied by the point length; there is no length field.

use super::bls::{g1_from_bytes, hash_to_g1, pairing_check, MESSAGE_DST, SIGNATURE_LEN};
use super::mask::{Mask, Policy, ThresholdPolicy};
use super::roster::Roster;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Aggregate signature followed by the mask of its signers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlsSignature(pub Vec<u8>);

impl BlsSignature {
    /// Pack an encoded aggregate point and its mask
    pub fn new(point: &[u8], mask: &Mask) -> Self {
        let mut bytes = Vec::with_capacity(point.len() + mask.as_bytes().len());
        bytes.extend_from_slice(point);
        bytes.extend_from_slice(mask.as_bytes());
        Self(bytes)
    }

    /// Full encoding
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The point prefix only
    pub fn raw_signature(&self) -> Result<&[u8]> {
        self.check_len()?;
        Ok(&self.0[..SIGNATURE_LEN])
    }

    /// The trailing mask, read over the roster's ordering
    pub fn mask(&self, roster: &Roster) -> Result<Mask> {
        self.check_len()?;
        Mask::from_bytes(&self.0[SIGNATURE_LEN..], roster.len())
    }

    /// Verify against the default threshold policy of the roster
    pub fn verify_aggregate(&self, message: &[u8], roster: &Roster) -> Result<()> {
        self.verify_aggregate_with_policy(message, roster, &ThresholdPolicy::default_for(roster.len()))
    }

    /// Verify the pairing equation, then apply `policy` to the signers
    ///
    /// A valid aggregate that fails the policy is reported as
    /// [`Error::PolicyNotSatisfied`].
    pub fn verify_aggregate_with_policy(
        &self,
        message: &[u8],
        roster: &Roster,
        policy: &dyn Policy,
    ) -> Result<()> {
        let mask = self.mask(roster)?;
        let point = g1_from_bytes(self.raw_signature()?)?;
        let aggregate_key = roster.aggregate_public_key(&mask)?;
        let hashed = hash_to_g1(MESSAGE_DST, message)?;

        if !pairing_check(point, hashed, aggregate_key) {
            return Err(Error::VerificationFailed(
                "aggregate signature does not match the mask".into(),
            ));
        }

        if !policy.check(&mask) {
            debug!(enabled = mask.count_enabled(), "Signature rejected by policy");
            return Err(Error::PolicyNotSatisfied {
                enabled: mask.count_enabled(),
            });
        }

        Ok(())
    }

    fn check_len(&self) -> Result<()> {
        if self.0.len() < SIGNATURE_LEN {
            return Err(Error::MalformedSignature(format!(
                "signature has {} bytes, shorter than one point ({})",
                self.0.len(),
                SIGNATURE_LEN
            )));
        }
        Ok(())
    }
}
