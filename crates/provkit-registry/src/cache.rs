use std::collections::HashMap;

use crate::profile::Profile;

/// Capacity-bounded, least-recently-used cache of canonical profiles.
/// Purely an optimization: every read path falls back to the snapshot
/// store, so eviction and wholesale invalidation are always safe.
#[derive(Debug)]
pub(crate) struct ProfileCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, CacheEntry>,
}

#[derive(Debug)]
struct CacheEntry {
    profile: Profile,
    last_use: u64,
}

impl ProfileCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn get(&mut self, profile_id: &str) -> Option<&Profile> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(profile_id)?;
        entry.last_use = tick;
        Some(&entry.profile)
    }

    pub(crate) fn insert(&mut self, profile: Profile) {
        self.tick += 1;
        if !self.entries.contains_key(profile.id()) && self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(
            profile.id().to_string(),
            CacheEntry {
                profile,
                last_use: self.tick,
            },
        );
    }

    pub(crate) fn invalidate(&mut self, profile_id: &str) {
        self.entries.remove(profile_id);
    }

    pub(crate) fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn evict_one(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_use)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.entries.remove(&id);
        }
    }
}
