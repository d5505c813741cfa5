//! Social graph model: the account registry and the discovered edge set.
//!
//! Edges reference accounts by numeric ID only; adjacency is derived from the
//! edge set, never stored on the account.

mod registry;

pub use registry::{AccountRegistry, RegistryEntry};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A follow relation: `follower` follows `followed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub follower: u64,
    pub followed: u64,
}

impl Edge {
    pub fn new(follower: u64, followed: u64) -> Self {
        Self { follower, followed }
    }
}

/// Set of edges that remembers discovery order.
#[derive(Debug, Clone, Default)]
pub struct EdgeSet {
    seen: HashSet<Edge>,
    order: Vec<Edge>,
}

impl EdgeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an edge. Returns false if it was already present.
    pub fn insert(&mut self, edge: Edge) -> bool {
        if !self.seen.insert(edge) {
            return false;
        }
        self.order.push(edge);
        true
    }

    pub fn contains(&self, edge: &Edge) -> bool {
        self.seen.contains(edge)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Edges in discovery order.
    pub fn as_slice(&self) -> &[Edge] {
        &self.order
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Edge> {
        self.order.iter()
    }
}

impl FromIterator<Edge> for EdgeSet {
    fn from_iter<I: IntoIterator<Item = Edge>>(iter: I) -> Self {
        let mut set = EdgeSet::new();
        for edge in iter {
            set.insert(edge);
        }
        set
    }
}
