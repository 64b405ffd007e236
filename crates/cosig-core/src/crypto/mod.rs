//! Pairing-based primitives used by the co-signing round
//!
//! - BLS key pairs and single-key signatures ([`bls`])
//! - Roster with BDN coefficients ([`roster`])
//! - Signer masks and policies ([`mask`])
//! - Collective signature codec ([`signature`])

pub mod bls;
pub mod mask;
pub mod roster;
pub mod signature;

pub use bls::{KeyPair, PublicKey, MESSAGE_DST, SHUTDOWN_DST, SIGNATURE_LEN};
pub use mask::{CompletePolicy, Mask, Policy, ThresholdPolicy};
pub use roster::Roster;
pub use signature::BlsSignature;
