//! Flat response map

use super::ResponseAggregator;
use crate::crypto::bls::g1_from_bytes;
use crate::crypto::{Mask, Roster};
use crate::gossip::messages::{Response, ResponseMap};
use crate::{Error, NodeIndex, Result};
use ark_bls12_381::G1Affine;
use ark_ec::CurveGroup;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Raw per-signer shares, keyed by signer index
///
/// Coefficients are applied once, in a single batch, when aggregating.
pub struct SimpleResponses {
    roster: Arc<Roster>,
    state: Mutex<SimpleState>,
}

struct SimpleState {
    responses: ResponseMap,
    mask: Mask,
}

impl SimpleResponses {
    /// Create an empty map over `roster`
    pub fn new(roster: Arc<Roster>) -> Self {
        let mask = roster.empty_mask();
        Self {
            roster,
            state: Mutex::new(SimpleState {
                responses: ResponseMap::new(),
                mask,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimpleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A flat response must carry exactly its own signer's bit
    fn validate(&self, idx: NodeIndex, response: &Response) -> Result<()> {
        let mask = Mask::from_bytes(&response.mask, self.roster.len())?;
        if mask != Mask::single(self.roster.len(), idx)? {
            return Err(Error::InvalidResponse(format!(
                "response for signer {} carries a foreign mask",
                idx
            )));
        }
        g1_from_bytes(&response.signature).map(drop)
    }

    fn insert(&self, state: &mut SimpleState, idx: NodeIndex, response: &Response) -> Result<()> {
        if state.responses.contains_key(&(idx as u32)) {
            return Ok(());
        }
        self.validate(idx, response)?;
        state.responses.insert(idx as u32, response.clone());
        state.mask.set(idx, true)
    }
}

impl ResponseAggregator for SimpleResponses {
    fn add(&self, idx: NodeIndex, response: &Response) -> Result<()> {
        let mut state = self.lock();
        self.insert(&mut state, idx, response)
    }

    fn update(&self, responses: &ResponseMap) -> Result<()> {
        let mut state = self.lock();
        let mut first_error = None;
        for (idx, response) in responses {
            if let Err(e) = self.insert(&mut state, *idx as NodeIndex, response) {
                debug!(signer = idx, error = %e, "Rejected response");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn count(&self) -> usize {
        self.lock().mask.count_enabled()
    }

    fn aggregate(&self) -> Result<(G1Affine, Mask)> {
        let state = self.lock();
        if state.responses.is_empty() {
            return Err(Error::Internal("no responses to aggregate".into()));
        }

        let mut mask = self.roster.empty_mask();
        let mut shares = Vec::with_capacity(state.responses.len());
        // BTreeMap iteration is ascending by signer
        for (idx, response) in &state.responses {
            mask.merge(&response.mask)?;
            shares.push((*idx as NodeIndex, g1_from_bytes(&response.signature)?));
        }
        debug!(signers = mask.count_enabled(), "Aggregating flat responses");

        let aggregate = self
            .roster
            .aggregate_shares(shares.iter().map(|(idx, share)| (*idx, share)))?;
        Ok((aggregate.into_affine(), mask))
    }

    fn map(&self) -> ResponseMap {
        self.lock().responses.clone()
    }
}
