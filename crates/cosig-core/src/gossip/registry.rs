//! Named protocol constructors
//!
//! The registry is built once at startup and handed to whatever spawns
//! protocol instances, instead of living in process-wide state.

use super::{CosigProtocol, NodeContext, VerificationFn};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Name under which [`ProtocolRegistry::with_defaults`] registers the
/// gossip collective signing protocol
pub const DEFAULT_PROTOCOL_NAME: &str = "gossip_cosi";

/// Builds a protocol instance for one node
pub type ProtocolConstructor =
    Arc<dyn Fn(NodeContext) -> Result<CosigProtocol> + Send + Sync>;

/// Table of protocol constructors keyed by name
#[derive(Default, Clone)]
pub struct ProtocolRegistry {
    constructors: HashMap<String, ProtocolConstructor>,
}

impl ProtocolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding [`DEFAULT_PROTOCOL_NAME`], signing everything it is given
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let constructor: ProtocolConstructor = Arc::new(|ctx: NodeContext| {
            let verification_fn: VerificationFn = Arc::new(|_: &[u8], _: &[u8]| true);
            CosigProtocol::new(ctx, Some(verification_fn))
        });
        registry
            .constructors
            .insert(DEFAULT_PROTOCOL_NAME.to_string(), constructor);
        registry
    }

    /// Register a constructor; names are unique
    pub fn register(&mut self, name: impl Into<String>, constructor: ProtocolConstructor) -> Result<()> {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(Error::InvalidConfig(format!(
                "protocol {} is already registered",
                name
            )));
        }
        debug!(protocol = %name, "Registered protocol");
        self.constructors.insert(name, constructor);
        Ok(())
    }

    /// Build an instance of protocol `name` for the node described by `ctx`
    pub fn instantiate(&self, name: &str, ctx: NodeContext) -> Result<CosigProtocol> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown protocol {}", name)))?;
        constructor(ctx)
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }
}
