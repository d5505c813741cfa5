//! Hop budget of a crawl, with optional trailing half hop.

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;

use crate::error::SocialGraphError;

/// How a node at a given hop is expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionMode {
    /// Register every account seen and enqueue it for the next hop.
    Full,
    /// Only record edges between accounts that are already registered.
    EdgesOnly,
}

/// Maximum crawl depth: `hops` full expansion levels, plus an edges-only
/// level when `half_hop` is set (written `n.5`).
///
/// The seed sits at hop 0, so a depth of 1 expands only the seed and a depth
/// of 0 expands nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaxDepth {
    hops: u32,
    half_hop: bool,
}

impl MaxDepth {
    pub fn new(hops: u32) -> Self {
        Self { hops, half_hop: false }
    }

    pub fn with_half_hop(hops: u32) -> Self {
        Self { hops, half_hop: true }
    }

    pub fn hops(&self) -> u32 {
        self.hops
    }

    pub fn half_hop(&self) -> bool {
        self.half_hop
    }

    /// Expansion mode for nodes at `hop`, or `None` if they are not expanded.
    pub fn mode_at(&self, hop: u32) -> Option<ExpansionMode> {
        if hop < self.hops {
            Some(ExpansionMode::Full)
        } else if hop == self.hops && self.half_hop {
            Some(ExpansionMode::EdgesOnly)
        } else {
            None
        }
    }
}

impl TryFrom<f64> for MaxDepth {
    type Error = SocialGraphError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value < 0.0 || value > u32::MAX as f64 {
            return Err(SocialGraphError::Config(format!(
                "depth must be a non-negative number, got {}",
                value
            )));
        }

        let hops = value.trunc();
        let fraction = value - hops;
        let half_hop = if fraction == 0.0 {
            false
        } else if fraction == 0.5 {
            true
        } else {
            return Err(SocialGraphError::Config(format!(
                "depth must be a whole number or end in .5, got {}",
                value
            )));
        };

        Ok(Self { hops: hops as u32, half_hop })
    }
}

impl FromStr for MaxDepth {
    type Err = SocialGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|_| SocialGraphError::Config(format!("invalid depth: '{}'", s)))?;
        MaxDepth::try_from(value)
    }
}

impl fmt::Display for MaxDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.half_hop {
            write!(f, "{}.5", self.hops)
        } else {
            write!(f, "{}", self.hops)
        }
    }
}

impl<'de> Deserialize<'de> for MaxDepth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(u32),
            Float(f64),
            Text(String),
        }

        let parsed = match Repr::deserialize(deserializer)? {
            Repr::Int(hops) => Ok(MaxDepth::new(hops)),
            Repr::Float(value) => MaxDepth::try_from(value),
            Repr::Text(text) => text.parse(),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}
