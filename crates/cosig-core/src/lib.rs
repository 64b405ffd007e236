//! # Cosig Core
//!
//! Gossip-based BLS threshold collective signing.
//!
//! A roster of participants, each holding a BLS key pair, produces one
//! aggregate signature over a common message once at least `threshold` of
//! them agree to sign. Contributions spread by rumor mongering instead of a
//! fixed schedule, and a signed shutdown proof ends the round on every node.
//!
//! This crate provides:
//! - BLS12-381 keys, rogue-key safe aggregation and the signature/mask codec
//! - Two interchangeable response aggregators (flat map and binary tree)
//! - The per-node gossip state machine
//! - The transport seam and an in-memory network
//!
//! ## Example
//!
//! ```rust,ignore
//! use cosig_core::{CosigProtocol, NodeContext};
//!
//! let mut root = CosigProtocol::new(ctx, Some(verify))?;
//! root.set_message(b"hello".to_vec());
//! let root = Arc::new(root);
//! network.register(0, &root);
//!
//! let final_signature = root.final_signature().unwrap();
//! tokio::spawn({ let root = root.clone(); async move { root.dispatch().await } });
//! root.start()?;
//! let signature = final_signature.await?;
//! signature.verify_aggregate(b"hello", &roster)?;
//! ```

pub mod aggregate;
pub mod crypto;
pub mod error;
pub mod gossip;
pub mod net;
pub mod types;

pub use aggregate::{ResponseAggregator, SimpleResponses, TreeResponses};
pub use crypto::{BlsSignature, KeyPair, Mask, Policy, PublicKey, Roster, ThresholdPolicy};
pub use error::{Error, IntegrityError, Result};
pub use gossip::{CosigProtocol, NodeContext, ProtocolRegistry, State, VerificationFn};
pub use net::{MemoryNetwork, Transport, Tree};
pub use types::{default_threshold, NodeIndex, Parameters};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
