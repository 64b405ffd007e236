//! Core types shared by every protocol instance

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Position of a participant in the roster
pub type NodeIndex = usize;

/// Hard deadline of a protocol round
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the root waits for its start signal
pub const START_TIMEOUT: Duration = Duration::from_secs(1);

/// Smallest timeout accepted by the integrity check
pub const MIN_TIMEOUT: Duration = Duration::from_micros(500);

/// Default interval between two rounds of rumors sent by the root
pub const DEFAULT_GOSSIP_TICK: Duration = Duration::from_millis(100);

/// Minimal threshold tolerating `f = (n - 1) / 3` byzantine nodes (3f+1)
pub fn default_threshold(n: usize) -> usize {
    let f = n.saturating_sub(1) / 3;
    n - f
}

/// Round parameters chosen by the root and adopted by every node
/// through the first rumor it receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    /// Interval between rumor rounds on the root
    pub gossip_tick: Duration,
    /// Number of peers a rumor is sent to
    pub rumor_peers: usize,
    /// Number of peers a shutdown is sent to. Carried on the wire; the
    /// shutdown itself follows the tree topology.
    pub shutdown_peers: usize,
    /// Use [`TreeResponses`](crate::aggregate::TreeResponses) instead of
    /// the flat map
    pub tree_mode: bool,
    /// Number of signers needed to finalize
    pub threshold: usize,
}

impl Parameters {
    /// Defaults for a roster of `n` participants
    ///
    /// A single-node roster gossips with itself, so the fan-out never
    /// drops below one peer.
    pub fn default_for(n: usize) -> Self {
        let peers = n.saturating_sub(1).max(1);
        Self {
            gossip_tick: DEFAULT_GOSSIP_TICK,
            rumor_peers: peers,
            shutdown_peers: peers,
            tree_mode: true,
            threshold: default_threshold(n),
        }
    }
}
