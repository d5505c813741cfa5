//! Level-ordered frontier with a run-wide enqueue guard.

use std::collections::{HashSet, VecDeque};

use crate::error::{Result, SocialGraphError};

/// An account waiting to be expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierEntry {
    pub external_id: String,
    pub id: u64,
    pub hop: u32,
}

/// Work queues for the current and next hop.
///
/// Every external identifier is enqueued at most once per run; the first hop
/// it was seen at wins. Since expanded nodes were all enqueued once, the
/// guard covers both the visited set and the pending queues.
#[derive(Debug, Default)]
pub struct Frontier {
    level: u32,
    current: VecDeque<FrontierEntry>,
    next: VecDeque<FrontierEntry>,
    enqueued: HashSet<String>,
}

impl Frontier {
    /// Frontier holding only the seed at hop 0.
    pub fn with_seed(external_id: &str, id: u64) -> Self {
        let mut frontier = Self::default();
        frontier.enqueued.insert(external_id.to_string());
        frontier.current.push_back(FrontierEntry {
            external_id: external_id.to_string(),
            id,
            hop: 0,
        });
        frontier
    }

    /// Rebuild from checkpointed entries, given in enqueue order with their
    /// expanded flag.
    pub fn restore(entries: Vec<(FrontierEntry, bool)>) -> Result<Self> {
        let mut frontier = Self::default();
        let level = entries
            .iter()
            .filter(|(_, expanded)| !expanded)
            .map(|(entry, _)| entry.hop)
            .min();

        for (entry, expanded) in entries {
            if !frontier.enqueued.insert(entry.external_id.clone()) {
                return Err(SocialGraphError::Config(format!(
                    "checkpoint frontier lists {} twice",
                    entry.external_id
                )));
            }
            if expanded {
                continue;
            }
            let Some(level) = level else { continue };
            if entry.hop == level {
                frontier.current.push_back(entry);
            } else if entry.hop == level + 1 {
                frontier.next.push_back(entry);
            } else {
                return Err(SocialGraphError::Config(format!(
                    "checkpoint frontier entry {} at hop {} is not adjacent to hop {}",
                    entry.external_id, entry.hop, level
                )));
            }
        }

        frontier.level = level.unwrap_or(0);
        Ok(frontier)
    }

    /// Hop of the entries in the current queue.
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn pop_current(&mut self) -> Option<FrontierEntry> {
        self.current.pop_front()
    }

    /// Queue `external_id` for the next hop. Returns the new entry, or
    /// `None` if it was already enqueued at some point in the run.
    pub fn enqueue_next(&mut self, external_id: &str, id: u64) -> Option<&FrontierEntry> {
        if self.enqueued.contains(external_id) {
            return None;
        }
        self.enqueued.insert(external_id.to_string());
        self.next.push_back(FrontierEntry {
            external_id: external_id.to_string(),
            id,
            hop: self.level + 1,
        });
        self.next.back()
    }

    pub fn is_enqueued(&self, external_id: &str) -> bool {
        self.enqueued.contains(external_id)
    }

    /// Promote the next queue once the current one is drained. Returns false
    /// when there is nothing left to expand.
    pub fn advance(&mut self) -> bool {
        debug_assert!(self.current.is_empty(), "advancing with pending entries");
        if self.next.is_empty() {
            return false;
        }
        self.current = std::mem::take(&mut self.next);
        self.level += 1;
        true
    }

    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    pub fn next_len(&self) -> usize {
        self.next.len()
    }
}
