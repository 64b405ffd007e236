//! Binary aggregation tree
//!
//! Leaves `0..n` are the signers. Internal nodes are numbered level by
//! level starting at the first power of two `>= n`, so a roster of 5 gives:
//!
//! ```text
//!              14
//!         12        13
//!       8    9      10
//!      0 1  2 3     4
//! ```
//!
//! Every stored fragment already carries its BDN coefficient: a share is
//! weighed once in [`add`](ResponseAggregator::add), and two complete
//! siblings are later merged with a plain point addition. Only the current
//! frontier is kept, so the map shrinks towards one entry as the round
//! converges.

use super::ResponseAggregator;
use crate::crypto::bls::{g1_from_bytes, g1_to_bytes};
use crate::crypto::{Mask, Roster};
use crate::gossip::messages::{Response, ResponseMap};
use crate::{Error, NodeIndex, Result};
use ark_bls12_381::{G1Affine, G1Projective};
use ark_ec::CurveGroup;
use ark_ff::Zero;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Shape of the aggregation tree, fixed by the roster size
#[derive(Debug)]
struct TreeLayout {
    children: BTreeMap<u32, Vec<u32>>,
    parents: HashMap<u32, u32>,
    /// Leaves below each node
    covers: HashMap<u32, Mask>,
}

impl TreeLayout {
    fn new(total: usize) -> Result<Self> {
        let total = u32::try_from(total)
            .map_err(|_| Error::InvalidConfig("roster too large for the aggregation tree".into()))?;

        let mut children = BTreeMap::new();
        let mut parents = HashMap::new();
        let mut covers = HashMap::new();
        for leaf in 0..total {
            covers.insert(leaf, Mask::single(total as usize, leaf as usize)?);
        }

        let mut start = 1u32;
        while start < total {
            start *= 2;
        }
        let mut start_below = 0u32;
        let mut end_below = total;

        // size is the maximum capacity of a level
        let mut size = start / 2;
        while size > 0 {
            let mut node = start;
            let mut left = start_below;
            while left < end_below {
                let right = left + 1;
                let mut cover = covers[&left].clone();
                if right < end_below {
                    cover.merge(covers[&right].as_bytes())?;
                    children.insert(node, vec![left, right]);
                    parents.insert(right, node);
                } else {
                    children.insert(node, vec![left]);
                }
                parents.insert(left, node);
                covers.insert(node, cover);
                node += 1;
                left += 2;
            }

            start_below = start;
            end_below = node;
            start += size;
            size /= 2;
        }

        trace!(?children, "Aggregation tree");

        Ok(Self {
            children,
            parents,
            covers,
        })
    }
}

/// A weighed partial aggregate over one complete subtree
struct Fragment {
    point: G1Affine,
    mask: Mask,
    encoded: Response,
}

struct TreeState {
    fragments: BTreeMap<u32, Fragment>,
    mask: Mask,
}

/// Tree-based response container
pub struct TreeResponses {
    roster: Arc<Roster>,
    layout: TreeLayout,
    state: Mutex<TreeState>,
}

impl TreeResponses {
    /// Create an empty tree over `roster`
    pub fn new(roster: Arc<Roster>) -> Result<Self> {
        let layout = TreeLayout::new(roster.len())?;
        let mask = roster.empty_mask();
        Ok(Self {
            roster,
            layout,
            state: Mutex::new(TreeState {
                fragments: BTreeMap::new(),
                mask,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a weighed fragment at `node`, merging upwards while siblings
    /// are complete
    fn add_aggregated(
        &self,
        state: &mut TreeState,
        mut node: u32,
        mut point: G1Projective,
        mut mask: Mask,
    ) -> Result<()> {
        let mut current = Some(node);
        while let Some(id) = current {
            if state.fragments.contains_key(&id) {
                return Ok(());
            }
            current = self.layout.parents.get(&id).copied();
        }

        loop {
            let parent = self.layout.parents.get(&node).copied();
            let siblings = parent.and_then(|p| self.layout.children.get(&p));

            match (parent, siblings) {
                (Some(parent), Some(siblings))
                    if siblings
                        .iter()
                        .all(|c| *c == node || state.fragments.contains_key(c)) =>
                {
                    for sibling in siblings.iter().filter(|c| **c != node) {
                        let fragment = &state.fragments[sibling];
                        point += fragment.point;
                        mask.merge(fragment.mask.as_bytes())?;
                    }
                    trace!(from = node, to = parent, "Merging siblings");
                    node = parent;
                }
                _ => break,
            }
        }

        let point = point.into_affine();
        let encoded = Response {
            signature: g1_to_bytes(&point)?,
            mask: mask.as_bytes().to_vec(),
        };
        state.mask.merge(mask.as_bytes())?;
        state.fragments.insert(
            node,
            Fragment {
                point,
                mask,
                encoded,
            },
        );

        // the new fragment covers everything below it
        let mut below: Vec<u32> = self.layout.children.get(&node).cloned().unwrap_or_default();
        while let Some(desc) = below.pop() {
            state.fragments.remove(&desc);
            if let Some(grand) = self.layout.children.get(&desc) {
                below.extend_from_slice(grand);
            }
        }

        Ok(())
    }

    /// Decode a fragment from a peer, which must cover exactly its subtree
    fn decode(&self, node: u32, response: &Response) -> Result<(G1Affine, Mask)> {
        let expected = self.layout.covers.get(&node).ok_or_else(|| {
            Error::InvalidResponse(format!("node {} not in tree", node))
        })?;
        let mask = Mask::from_bytes(&response.mask, self.roster.len())?;
        if &mask != expected {
            return Err(Error::InvalidResponse(format!(
                "fragment at node {} does not cover its subtree",
                node
            )));
        }
        let point = g1_from_bytes(&response.signature)?;
        Ok((point, mask))
    }
}

impl ResponseAggregator for TreeResponses {
    fn add(&self, idx: NodeIndex, response: &Response) -> Result<()> {
        let leaf = u32::try_from(idx)
            .ok()
            .filter(|leaf| (*leaf as usize) < self.roster.len())
            .ok_or_else(|| Error::InvalidResponse(format!("signer {} not in roster", idx)))?;
        let mut state = self.lock();
        if state.mask.is_enabled(idx) {
            return Ok(());
        }

        let (share, mask) = self.decode(leaf, response)?;
        let weighed = self.roster.weigh_share(idx, &share)?;
        self.add_aggregated(&mut state, leaf, weighed, mask)
    }

    fn update(&self, responses: &ResponseMap) -> Result<()> {
        let mut state = self.lock();
        let mut first_error = None;
        for (node, response) in responses {
            let merged = self
                .decode(*node, response)
                .and_then(|(point, mask)| {
                    self.add_aggregated(&mut state, *node, point.into(), mask)
                });
            if let Err(e) = merged {
                debug!(node, error = %e, "Rejected fragment");
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
        if state.fragments.is_empty() {
            return Err(Error::Internal("no responses to aggregate".into()));
        }

        // fragments are already weighed, plain addition is enough
        let mut aggregate = G1Projective::zero();
        for fragment in state.fragments.values() {
            aggregate += fragment.point;
        }
        debug!(
            fragments = state.fragments.len(),
            signers = state.mask.count_enabled(),
            "Aggregating tree responses"
        );
        Ok((aggregate.into_affine(), state.mask.clone()))
    }

    fn map(&self) -> ResponseMap {
        self.lock()
            .fragments
            .iter()
            .map(|(node, fragment)| (*node, fragment.encoded.clone()))
            .collect()
    }
}
