//! Transport seam between the gossip round and the network
//!
//! The protocol only needs to send a message to one node and to fan a
//! message out to several nodes at once; delivery of inbound messages goes
//! through [`MessageHandler`].

use crate::gossip::messages::ProtocolMessage;
use crate::{Error, NodeIndex, Result};
use futures_util::future::join_all;

pub use ::async_trait::async_trait;

/// Outbound side of the network
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a specific node
    async fn send_to(&self, from: NodeIndex, to: NodeIndex, message: &ProtocolMessage)
        -> Result<()>;

    /// Send the same message to every target in parallel, collecting the
    /// failures instead of stopping at the first one
    async fn send_to_many(
        &self,
        from: NodeIndex,
        targets: &[NodeIndex],
        message: &ProtocolMessage,
    ) -> Vec<(NodeIndex, Error)> {
        let sends = targets.iter().map(|to| async move {
            self.send_to(from, *to, message).await.map_err(|e| (*to, e))
        });
        join_all(sends)
            .await
            .into_iter()
            .filter_map(|result| result.err())
            .collect()
    }
}

/// Inbound side of the network, implemented by protocol instances
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a message delivered by the transport
    async fn handle_message(&self, from: NodeIndex, message: ProtocolMessage) -> Result<()>;
}

mod topology;

/// In-memory network for testing and local simulation
pub mod memory;

pub use memory::MemoryNetwork;
pub use topology::Tree;
