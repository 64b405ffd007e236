//! In-memory network implementation for testing

use super::{async_trait, MessageHandler, Transport};
use crate::gossip::messages::{MessageKind, ProtocolMessage};
use crate::{Error, NodeIndex, Result};
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, warn};

/// One message accepted by the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeIndex,
    pub to: NodeIndex,
    pub kind: MessageKind,
}

/// In-process message network
///
/// Every message is serialized, then delivered on its own task, so handlers
/// run concurrently like they would behind a real transport.
pub struct MemoryNetwork {
    /// Registered handlers, held weakly so instances can be dropped
    handlers: DashMap<NodeIndex, Weak<dyn MessageHandler>>,
    /// Nodes that currently refuse every message
    offline: DashSet<NodeIndex>,
    /// Every accepted message, in send order
    log: Mutex<Vec<Envelope>>,
}

impl MemoryNetwork {
    /// Create a new in-memory network
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            offline: DashSet::new(),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Route messages addressed to `node` to `handler`
    pub fn register<H: MessageHandler + 'static>(&self, node: NodeIndex, handler: &Arc<H>) {
        let handler: Arc<dyn MessageHandler> = handler.clone();
        self.handlers.insert(node, Arc::downgrade(&handler));
    }

    /// Make every send to `node` fail
    pub fn disconnect(&self, node: NodeIndex) {
        self.offline.insert(node);
    }

    /// Undo [`disconnect`](Self::disconnect)
    pub fn reconnect(&self, node: NodeIndex) {
        self.offline.remove(&node);
    }

    /// Messages accepted so far
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of accepted messages of `kind` sent by `from`
    pub fn sent_by(&self, from: NodeIndex, kind: MessageKind) -> usize {
        self.envelopes()
            .iter()
            .filter(|e| e.from == from && e.kind == kind)
            .count()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn serialize(message: &ProtocolMessage) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| Error::Serialization(e.to_string()))
}

fn deserialize(bytes: &[u8]) -> Result<ProtocolMessage> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn send_to(
        &self,
        from: NodeIndex,
        to: NodeIndex,
        message: &ProtocolMessage,
    ) -> Result<()> {
        if self.offline.contains(&to) {
            return Err(Error::Transport(format!("node {} is unreachable", to)));
        }
        let handler = self
            .handlers
            .get(&to)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| Error::Transport(format!("no handler registered for node {}", to)))?;

        let bytes = serialize(message)?;
        let kind = message.kind();
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Envelope { from, to, kind });

        tokio::spawn(async move {
            let message = match deserialize(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    warn!(from, to, error = %e, "Dropping undecodable message");
                    return;
                }
            };
            if let Err(e) = handler.handle_message(from, message).await {
                debug!(from, to, ?kind, error = %e, "Handler rejected message");
            }
        });

        Ok(())
    }
}
