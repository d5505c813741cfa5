//! Account registry: external identifier <-> dense numeric ID.

use std::collections::{BTreeSet, HashMap};

use crate::error::{Result, SocialGraphError};

/// One registered account, as stored and restored by the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub id: u64,
    pub external_id: String,
    pub username: String,
}

/// Assigns numeric IDs in first-sighting order, starting at 1.
///
/// Usernames follow last-seen-wins: resolving a known account with a new
/// username overwrites the stored one, the ID never changes.
#[derive(Debug, Clone, Default)]
pub struct AccountRegistry {
    ids: HashMap<String, u64>,
    // index = id - 1
    entries: Vec<(String, String)>,
    track_changes: bool,
    changed: BTreeSet<u64>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from checkpointed entries. IDs must be dense and
    /// start at 1.
    pub fn restore(mut entries: Vec<RegistryEntry>) -> Result<Self> {
        entries.sort_by_key(|e| e.id);
        let mut registry = Self::new();

        for entry in entries {
            let expected = registry.entries.len() as u64 + 1;
            if entry.id != expected {
                return Err(SocialGraphError::Config(format!(
                    "checkpoint account ids are not dense: expected {}, found {}",
                    expected, entry.id
                )));
            }
            if registry.ids.contains_key(&entry.external_id) {
                return Err(SocialGraphError::Config(format!(
                    "checkpoint lists account {} twice",
                    entry.external_id
                )));
            }
            registry.ids.insert(entry.external_id.clone(), entry.id);
            registry.entries.push((entry.external_id, entry.username));
        }

        Ok(registry)
    }

    /// Return the numeric ID for `external_id`, assigning the next one on
    /// first sighting.
    pub fn resolve(&mut self, external_id: &str, username: &str) -> u64 {
        if let Some(&id) = self.ids.get(external_id) {
            let stored = &mut self.entries[(id - 1) as usize].1;
            if stored != username {
                log::debug!("Username for {} changed: {} -> {}", external_id, stored, username);
                *stored = username.to_string();
                if self.track_changes {
                    self.changed.insert(id);
                }
            }
            return id;
        }

        let id = self.entries.len() as u64 + 1;
        self.ids.insert(external_id.to_string(), id);
        self.entries.push((external_id.to_string(), username.to_string()));
        if self.track_changes {
            self.changed.insert(id);
        }
        id
    }

    pub fn get(&self, external_id: &str) -> Option<u64> {
        self.ids.get(external_id).copied()
    }

    pub fn username(&self, id: u64) -> Option<&str> {
        self.entry(id).map(|(_, username)| username.as_str())
    }

    pub fn external_id(&self, id: u64) -> Option<&str> {
        self.entry(id).map(|(external_id, _)| external_id.as_str())
    }

    /// `(numeric_id, username)` in ID-assignment order.
    pub fn all_mappings(&self) -> impl Iterator<Item = (u64, &str)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, (_, username))| (idx as u64 + 1, username.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start recording which entries are added or renamed, for
    /// [`AccountRegistry::take_changes`].
    pub fn track_changes(&mut self) {
        self.track_changes = true;
    }

    /// Entries added or renamed since the last call, in ID order.
    pub fn take_changes(&mut self) -> Vec<RegistryEntry> {
        let changed = std::mem::take(&mut self.changed);
        changed
            .into_iter()
            .filter_map(|id| {
                self.entry(id).map(|(external_id, username)| RegistryEntry {
                    id,
                    external_id: external_id.clone(),
                    username: username.clone(),
                })
            })
            .collect()
    }

    fn entry(&self, id: u64) -> Option<&(String, String)> {
        id.checked_sub(1).and_then(|idx| self.entries.get(idx as usize))
    }
}
