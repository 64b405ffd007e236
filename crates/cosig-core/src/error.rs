//! Error types for collective signing operations

use std::time::Duration;
use thiserror::Error;

/// Result type alias for collective signing operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a protocol instance refuses to start
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("no proposal msg specified")]
    MissingMessage,

    #[error("verification function cannot be nil")]
    MissingVerificationFn,

    #[error("unrealistic timeout: {0:?}")]
    UnrealisticTimeout(Duration),

    #[error("threshold ({threshold}) bigger than number of nodes ({nodes})")]
    ThresholdTooLarge { threshold: usize, nodes: usize },

    #[error("threshold of {0} smaller than one node")]
    ThresholdTooSmall(usize),
}

/// Errors that can occur during a co-signing round
#[derive(Debug, Error)]
pub enum Error {
    /// The instance was configured with unusable parameters
    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    /// Root never received its start signal
    #[error("start timeout")]
    StartTimeout,

    /// Instance was torn down before it started
    #[error("not started")]
    NotStarted,

    /// Root did not collect enough responses before the deadline
    #[error("gossip protocol timeout")]
    GossipTimeout,

    /// Non-root node never received a valid shutdown
    #[error("timeout")]
    Timeout,

    /// Shutdown proof was rejected
    #[error("couldn't verify the shutdown message: {0}")]
    ShutdownVerification(#[source] Box<Error>),

    /// Not enough peers to pick gossip targets from
    #[error("not enough nodes in the roster: requested {requested}, available {available}")]
    NotEnoughPeers { requested: usize, available: usize },

    /// Signature blob cannot be split into point and mask
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    /// Signature is valid but signed by too few participants
    #[error("policy not satisfied: {enabled} signers enabled")]
    PolicyNotSatisfied { enabled: usize },

    /// Pairing check failed
    #[error("Signature verification failed: {0}")]
    VerificationFailed(String),

    /// Mask does not match the roster
    #[error("Invalid mask: {0}")]
    InvalidMask(String),

    /// Response cannot be merged into an aggregator
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Network/transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid node or registry configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation is reserved to the root node
    #[error("only the root node can start the protocol")]
    NotRoot,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<ark_serialize::SerializationError> for Error {
    fn from(e: ark_serialize::SerializationError) -> Self {
        Error::Crypto(e.to_string())
    }
}
