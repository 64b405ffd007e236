//! Response aggregation strategies
//!
//! Both strategies merge per-signer contributions into one aggregate and
//! must give an aggregate that verifies against the same mask, whatever
//! the arrival order of the contributions:
//! - [`SimpleResponses`]: flat map of raw shares, weighed once at the end
//! - [`TreeResponses`]: binary aggregation tree, weighed on arrival

mod simple;
mod tree;

pub use simple::SimpleResponses;
pub use tree::TreeResponses;

use crate::crypto::{Mask, Roster};
use crate::gossip::messages::{Response, ResponseMap};
use crate::{NodeIndex, Result};
use ark_bls12_381::G1Affine;
use std::sync::Arc;

/// Container of the responses collected during a round
///
/// Implementations are internally synchronized since rumors are handled
/// from concurrent tasks.
pub trait ResponseAggregator: Send + Sync {
    /// Add the response of signer `idx`; no-op if already represented
    fn add(&self, idx: NodeIndex, response: &Response) -> Result<()>;

    /// Merge a snapshot received from a peer
    fn update(&self, responses: &ResponseMap) -> Result<()>;

    /// Number of distinct signers folded in
    fn count(&self) -> usize;

    /// Current best aggregate and the mask of its signers
    fn aggregate(&self) -> Result<(G1Affine, Mask)>;

    /// Serializable snapshot for outbound rumors
    fn map(&self) -> ResponseMap;
}

/// Create the aggregator selected by `tree_mode`
pub fn new_aggregator(
    tree_mode: bool,
    roster: Arc<Roster>,
) -> Result<Arc<dyn ResponseAggregator>> {
    Ok(if tree_mode {
        Arc::new(TreeResponses::new(roster)?)
    } else {
        Arc::new(SimpleResponses::new(roster))
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crypto::bls::{g1_to_bytes, KeyPair, PublicKey, MESSAGE_DST};
    use crate::crypto::BlsSignature;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    pub const MSG: &[u8] = b"hello";

    pub fn setup(n: usize) -> (Vec<KeyPair>, Arc<Roster>) {
        let mut rng = ChaCha20Rng::seed_from_u64(n as u64);
        let keypairs: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate(&mut rng)).collect();
        let publics: Vec<PublicKey> = keypairs.iter().map(|k| k.public()).collect();
        (keypairs, Arc::new(Roster::new(publics).unwrap()))
    }

    pub fn response(keypairs: &[KeyPair], idx: usize) -> Response {
        Response {
            signature: keypairs[idx].sign(MESSAGE_DST, MSG).unwrap(),
            mask: Mask::single(keypairs.len(), idx).unwrap().as_bytes().to_vec(),
        }
    }

    pub fn finalize(aggregator: &dyn ResponseAggregator) -> BlsSignature {
        let (point, mask) = aggregator.aggregate().unwrap();
        BlsSignature::new(&g1_to_bytes(&point).unwrap(), &mask)
    }
}
