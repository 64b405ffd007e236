//! Wire messages of the gossip round

use crate::crypto::BlsSignature;
use crate::types::Parameters;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One or more combined signer shares with the mask of who is included
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Compressed G1 point
    pub signature: Vec<u8>,
    /// Signers folded into `signature`
    pub mask: Vec<u8>,
}

/// Snapshot of an aggregator, keyed by signer (flat) or tree node (tree)
pub type ResponseMap = BTreeMap<u32, Response>;

/// Gossip payload: the sender's whole aggregation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rumor {
    pub params: Parameters,
    pub response_map: ResponseMap,
    pub msg: Vec<u8>,
    pub data: Vec<u8>,
}

/// Terminal message forwarded down the tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shutdown {
    /// Final collective signature over the proposal
    pub final_co_signature: BlsSignature,
    /// Root's signature over `final_co_signature`, shutdown context
    pub root_sig: Vec<u8>,
}

/// Declared refusal; never emitted, refusing nodes stay silent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refusal {
    pub signature: Vec<u8>,
}

/// Declared stop request; never emitted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stop {}

/// Every payload that crosses the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolMessage {
    Rumor(Rumor),
    Shutdown(Shutdown),
    Refusal(Refusal),
    Stop(Stop),
}

/// Message discriminant, used in logs and envelope records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Rumor,
    Shutdown,
    Refusal,
    Stop,
}

impl ProtocolMessage {
    /// Get the kind of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            ProtocolMessage::Rumor(_) => MessageKind::Rumor,
            ProtocolMessage::Shutdown(_) => MessageKind::Shutdown,
            ProtocolMessage::Refusal(_) => MessageKind::Refusal,
            ProtocolMessage::Stop(_) => MessageKind::Stop,
        }
    }
}
