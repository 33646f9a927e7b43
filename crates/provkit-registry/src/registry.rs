use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::cache::ProfileCache;
use crate::escape::unescape_profile_id;
use crate::layout::RegistryLayout;
use crate::lock::{LockToken, ProfileLockManager};
use crate::profile::Profile;
use crate::store;

const DEFAULT_CACHE_CAPACITY: usize = 32;

/// Host-tunable registry knobs, loadable from a TOML document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistryOptions {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl RegistryOptions {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(input).context("failed to parse registry options")?;
        if options.cache_capacity == 0 {
            return Err(anyhow!("registry cache_capacity must be at least 1"));
        }
        Ok(options)
    }
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

/// Persistent, timestamped store of profile snapshots. Every profile is
/// an append-only sequence of immutable snapshot files; the in-memory
/// cache is an evictable optimization rebuilt from disk on demand.
#[derive(Debug)]
pub struct ProfileRegistry {
    layout: RegistryLayout,
    locks: ProfileLockManager,
    cache: Mutex<ProfileCache>,
}

impl ProfileRegistry {
    pub fn open(root: impl Into<std::path::PathBuf>) -> Result<Self> {
        Self::open_with_options(root, RegistryOptions::default())
    }

    pub fn open_with_options(
        root: impl Into<std::path::PathBuf>,
        options: RegistryOptions,
    ) -> Result<Self> {
        if options.cache_capacity == 0 {
            return Err(anyhow!("registry cache_capacity must be at least 1"));
        }
        let layout = RegistryLayout::new(root);
        layout.ensure_root()?;
        Ok(Self {
            locks: ProfileLockManager::new(layout.clone()),
            cache: Mutex::new(ProfileCache::new(options.cache_capacity)),
            layout,
        })
    }

    pub fn layout(&self) -> &RegistryLayout {
        &self.layout
    }

    pub fn locks(&self) -> &ProfileLockManager {
        &self.locks
    }

    /// Latest snapshot of the profile, or `None` when unknown. The
    /// returned profile is a private copy; submit changes through
    /// `update_profile`.
    pub fn get_profile(&self, profile_id: &str) -> Result<Option<Profile>> {
        let mut cache = self.cache_guard();
        if let Some(profile) = cache.get(profile_id) {
            return Ok(Some(profile.snapshot()));
        }
        drop(cache);

        let Some(profile) = store::read_latest_snapshot(&self.layout, profile_id)? else {
            return Ok(None);
        };
        let snapshot = profile.snapshot();
        self.cache_guard().insert(profile);
        Ok(Some(snapshot))
    }

    /// Exact historical snapshot, bypassing the cache.
    pub fn get_profile_at(&self, profile_id: &str, timestamp: u64) -> Result<Option<Profile>> {
        store::read_snapshot(&self.layout, profile_id, timestamp)
    }

    pub fn list_timestamps(&self, profile_id: &str) -> Result<Vec<u64>> {
        store::list_timestamps(&self.layout, profile_id)
    }

    pub fn list_profile_ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.layout.root()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "failed reading registry root: {}",
                        self.layout.root().display()
                    )
                });
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!(
                    "failed reading registry root: {}",
                    self.layout.root().display()
                )
            })?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(escaped) = name.strip_suffix(".profile") else {
                continue;
            };
            // Foreign directories dropped into the root must not poison
            // the whole listing.
            match unescape_profile_id(escaped) {
                Ok(id) => ids.push(id),
                Err(err) => {
                    log::debug!("skipping foreign entry in registry root: {name}: {err}");
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Registers a new, empty profile and persists its first snapshot.
    /// Fails when the id is already present or the parent is unknown.
    pub fn add_profile(
        &self,
        profile_id: &str,
        properties: BTreeMap<String, String>,
        parent_id: Option<&str>,
    ) -> Result<Profile> {
        if self.profile_exists(profile_id)? {
            return Err(anyhow!("profile '{profile_id}' already exists"));
        }
        if let Some(parent_id) = parent_id {
            if self.get_profile(parent_id)?.is_none() {
                return Err(anyhow!(
                    "parent profile '{parent_id}' does not exist for new profile '{profile_id}'"
                ));
            }
        }

        let mut profile = Profile::new(profile_id, parent_id.map(str::to_string))?;
        for (key, value) in properties {
            profile.set_property(key, Some(value));
        }
        profile.set_timestamp(next_timestamp(0));
        store::write_snapshot(&self.layout, &profile)
            .with_context(|| format!("failed persisting new profile '{profile_id}'"))?;
        profile.clear_dirty();

        let snapshot = profile.snapshot();
        self.cache_guard().insert(profile);
        Ok(snapshot)
    }

    /// Replaces the canonical profile's local state 1:1 from the
    /// supplied copy and persists a new snapshot with a strictly greater
    /// timestamp. The caller must already hold this profile's lock; the
    /// copy's timestamp is republished to the persisted value.
    pub fn update_profile(&self, profile: &mut Profile) -> Result<()> {
        let profile_id = profile.id().to_string();
        if !self.locks.holds(&profile_id) {
            return Err(anyhow!(
                "update_profile requires the lock for profile '{profile_id}' to be held"
            ));
        }

        let mut canonical = match self.load_canonical(&profile_id)? {
            Some(canonical) => canonical,
            None => return Err(anyhow!("profile '{profile_id}' does not exist")),
        };

        let previous_timestamp = canonical.timestamp();
        let disk_latest = store::latest_timestamp(&self.layout, &profile_id)?.unwrap_or(0);
        canonical.replace_contents_from(profile);
        canonical.set_timestamp(next_timestamp(previous_timestamp.max(disk_latest)));

        if let Err(err) = store::write_snapshot(&self.layout, &canonical) {
            // The partial file is already discarded by the store; drop
            // the diverged cache entry so reads rebuild from disk.
            canonical.set_timestamp(previous_timestamp);
            self.cache_guard().invalidate(&profile_id);
            log::warn!(
                "discarded failed snapshot write for profile '{profile_id}': {err:#}"
            );
            return Err(err)
                .with_context(|| format!("failed persisting profile '{profile_id}'"));
        }

        canonical.clear_dirty();
        profile.set_timestamp(canonical.timestamp());
        profile.clear_dirty();
        self.cache_guard().insert(canonical);
        Ok(())
    }

    /// Removes the profile and all of its snapshots, recursively
    /// removing sub-profiles first. Acquires the lock chain internally.
    pub fn remove_profile(&self, profile_id: &str) -> Result<()> {
        if !self.profile_exists(profile_id)? {
            return Err(anyhow!("profile '{profile_id}' does not exist"));
        }

        let token = self.lock_profile(profile_id)?;
        let result = self.remove_locked(profile_id);
        let unlock_result = self.locks.unlock(token);
        result?;
        unlock_result?;

        // Best effort: the marker file and directory are only reclaimed
        // once the advisory lock is gone.
        let dir = self.layout.profile_dir(profile_id);
        if let Err(err) = fs::remove_dir_all(&dir) {
            if err.kind() != io::ErrorKind::NotFound {
                log::debug!(
                    "leaving profile directory behind after removal: {}: {err}",
                    dir.display()
                );
            }
        }
        Ok(())
    }

    fn remove_locked(&self, profile_id: &str) -> Result<()> {
        for child in self.children_of(profile_id)? {
            self.remove_profile(&child)?;
        }

        for timestamp in store::list_timestamps(&self.layout, profile_id)? {
            let path = self.layout.snapshot_path(profile_id, timestamp);
            fs::remove_file(&path).with_context(|| {
                format!("failed deleting profile snapshot: {}", path.display())
            })?;
        }
        self.cache_guard().invalidate(profile_id);
        Ok(())
    }

    pub fn children_of(&self, profile_id: &str) -> Result<Vec<String>> {
        let mut children = Vec::new();
        for candidate in self.list_profile_ids()? {
            if candidate == profile_id {
                continue;
            }
            if let Some(profile) = self.get_profile(&candidate)? {
                if profile.parent_id() == Some(profile_id) {
                    children.push(candidate);
                }
            }
        }
        Ok(children)
    }

    /// Effective property lookup: local value when present, otherwise a
    /// read-through walk up the parent chain.
    pub fn effective_property(&self, profile_id: &str, key: &str) -> Result<Option<String>> {
        let mut current = profile_id.to_string();
        let mut visited = std::collections::HashSet::new();
        loop {
            if !visited.insert(current.clone()) {
                return Err(anyhow!(
                    "profile parent chain contains a cycle at '{current}'"
                ));
            }
            let Some(profile) = self.get_profile(&current)? else {
                return Err(anyhow!("profile '{current}' does not exist"));
            };
            if let Some(value) = profile.local_property(key) {
                return Ok(Some(value.to_string()));
            }
            match profile.parent_id() {
                Some(parent) => current = parent.to_string(),
                None => return Ok(None),
            }
        }
    }

    /// The profile's lock chain: itself first, then every ancestor
    /// child-to-root.
    pub fn parent_chain(&self, profile_id: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut current = profile_id.to_string();
        let mut visited = std::collections::HashSet::new();
        loop {
            if !visited.insert(current.clone()) {
                return Err(anyhow!(
                    "profile parent chain contains a cycle at '{current}'"
                ));
            }
            let Some(profile) = self.get_profile(&current)? else {
                return Err(anyhow!("profile '{current}' does not exist"));
            };
            chain.push(current.clone());
            match profile.parent_id() {
                Some(parent) => current = parent.to_string(),
                None => return Ok(chain),
            }
        }
    }

    pub fn lock_profile(&self, profile_id: &str) -> Result<LockToken> {
        let chain = self.parent_chain(profile_id)?;
        self.locks.lock(&chain)
    }

    pub fn unlock_profile(&self, token: LockToken) -> Result<()> {
        self.locks.unlock(token)
    }

    /// Drops every cached profile; all subsequent reads rebuild from the
    /// snapshot store.
    pub fn invalidate_cache(&self) {
        self.cache_guard().invalidate_all();
    }

    #[cfg(test)]
    pub(crate) fn cached_profile_count(&self) -> usize {
        self.cache_guard().len()
    }

    fn profile_exists(&self, profile_id: &str) -> Result<bool> {
        if self.cache_guard().get(profile_id).is_some() {
            return Ok(true);
        }
        Ok(store::latest_timestamp(&self.layout, profile_id)?.is_some())
    }

    fn load_canonical(&self, profile_id: &str) -> Result<Option<Profile>> {
        let mut cache = self.cache_guard();
        if let Some(profile) = cache.get(profile_id) {
            return Ok(Some(profile.snapshot()));
        }
        drop(cache);
        store::read_latest_snapshot(&self.layout, profile_id)
    }

    fn cache_guard(&self) -> MutexGuard<'_, ProfileCache> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Snapshot timestamps are milliseconds since the epoch, bumped by at
/// least one when the clock does not advance past the previous value.
fn next_timestamp(previous: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0);
    now.max(previous + 1)
}
