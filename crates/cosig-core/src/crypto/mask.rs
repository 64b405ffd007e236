//! Participation bitmask and acceptance policies

use crate::types::default_threshold;
use crate::{Error, NodeIndex, Result};

/// Bitmask over the roster; bit `i` is `bytes[i / 8] & (1 << (i % 8))`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    bits: Vec<u8>,
    len: usize,
}

impl Mask {
    /// Empty mask over `len` participants
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; Self::byte_len(len)],
            len,
        }
    }

    /// Mask with exactly one participant enabled
    pub fn single(len: usize, idx: NodeIndex) -> Result<Self> {
        let mut mask = Self::new(len);
        mask.set(idx, true)?;
        Ok(mask)
    }

    /// Parse a mask received over the wire
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        if bytes.len() != Self::byte_len(len) {
            return Err(Error::InvalidMask(format!(
                "expected {} bytes for {} participants, got {}",
                Self::byte_len(len),
                len,
                bytes.len()
            )));
        }
        let mask = Self {
            bits: bytes.to_vec(),
            len,
        };
        if let Some(last) = mask.bits.last() {
            let used = len % 8;
            if used != 0 && last >> used != 0 {
                return Err(Error::InvalidMask(
                    "bits set beyond the last participant".into(),
                ));
            }
        }
        Ok(mask)
    }

    /// Number of bytes in the encoding of a mask over `len` participants
    pub fn byte_len(len: usize) -> usize {
        (len + 7) / 8
    }

    /// Number of participants covered
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mask covers no participant at all
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw encoding
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Enable or disable participant `idx`
    pub fn set(&mut self, idx: NodeIndex, enabled: bool) -> Result<()> {
        if idx >= self.len {
            return Err(Error::InvalidMask(format!(
                "index {} out of range for {} participants",
                idx, self.len
            )));
        }
        let bit = 1u8 << (idx % 8);
        if enabled {
            self.bits[idx / 8] |= bit;
        } else {
            self.bits[idx / 8] &= !bit;
        }
        Ok(())
    }

    /// Whether participant `idx` is enabled
    pub fn is_enabled(&self, idx: NodeIndex) -> bool {
        idx < self.len && self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    /// Number of enabled participants
    pub fn count_enabled(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Indices of enabled participants, ascending
    pub fn enabled_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        (0..self.len).filter(move |idx| self.is_enabled(*idx))
    }

    /// Union with another encoded mask of the same length
    pub fn merge(&mut self, other: &[u8]) -> Result<()> {
        if other.len() != self.bits.len() {
            return Err(Error::InvalidMask(format!(
                "cannot merge a {}-byte mask into a {}-byte mask",
                other.len(),
                self.bits.len()
            )));
        }
        for (mine, theirs) in self.bits.iter_mut().zip(other) {
            *mine |= theirs;
        }
        Ok(())
    }
}

/// Acceptance predicate over the set of signers of an aggregate
pub trait Policy: Send + Sync {
    /// Whether the signers enabled in `mask` are enough
    fn check(&self, mask: &Mask) -> bool;
}

/// Accept when at least `threshold` participants signed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    threshold: usize,
}

impl ThresholdPolicy {
    /// Create a policy requiring `threshold` signers
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// The byzantine-tolerant default for a roster of `n`
    pub fn default_for(n: usize) -> Self {
        Self::new(default_threshold(n))
    }

    /// Required number of signers
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl Policy for ThresholdPolicy {
    fn check(&self, mask: &Mask) -> bool {
        mask.count_enabled() >= self.threshold
    }
}

/// Accept only when every participant signed
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletePolicy;

impl Policy for CompletePolicy {
    fn check(&self, mask: &Mask) -> bool {
        mask.count_enabled() == mask.len()
    }
}
