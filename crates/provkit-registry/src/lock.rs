use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;

use crate::layout::RegistryLayout;

/// Hierarchical, cross-process mutual exclusion keyed by profile id.
///
/// Two halves back each lock: an in-process holder/waiter record guarded
/// by one mutex + condvar, and an OS advisory lock on the profile's
/// `.lock` marker file. A second thread in the same process blocks on
/// the condvar until the holder unlocks; a holder in another process
/// makes acquisition fail with a "profile in use" error. Advisory lock
/// semantics mean a dead holder process releases the marker without any
/// help from this layer.
#[derive(Debug)]
pub struct ProfileLockManager {
    layout: RegistryLayout,
    state: Mutex<HashMap<String, LockState>>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<ThreadId>,
    waiters: usize,
    os_lock: Option<File>,
}

/// Receipt for one successful chain acquisition: exactly the ids that
/// were newly locked, in acquisition order. Ids already held by the
/// caller when `lock` ran are not listed and stay held after `unlock`.
#[derive(Debug)]
pub struct LockToken {
    acquired: Vec<String>,
}

impl LockToken {
    pub fn acquired(&self) -> &[String] {
        &self.acquired
    }

    pub fn is_empty(&self) -> bool {
        self.acquired.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn test_token(acquired: Vec<String>) -> Self {
        Self { acquired }
    }
}

impl ProfileLockManager {
    pub(crate) fn new(layout: RegistryLayout) -> Self {
        Self {
            layout,
            state: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Locks every id in `chain` (the profile first, then its ancestors
    /// child-to-root). If an ancestor cannot be secured, everything this
    /// call acquired is released before the error returns.
    pub fn lock(&self, chain: &[String]) -> Result<LockToken> {
        let mut acquired: Vec<String> = Vec::new();
        for profile_id in chain {
            match self.lock_one(profile_id) {
                Ok(true) => acquired.push(profile_id.clone()),
                Ok(false) => {}
                Err(err) => {
                    for held in acquired.iter().rev() {
                        if let Err(release_err) = self.unlock_one(held) {
                            log::warn!(
                                "failed releasing partially acquired lock for profile '{held}': {release_err}"
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(LockToken { acquired })
    }

    /// Releases exactly what the token's `lock` call acquired, in
    /// reverse acquisition order.
    pub fn unlock(&self, token: LockToken) -> Result<()> {
        let mut first_err = None;
        for profile_id in token.acquired.iter().rev() {
            if let Err(err) = self.unlock_one(profile_id) {
                log::warn!("failed releasing lock for profile '{profile_id}': {err}");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether the calling thread currently holds the lock for this id.
    pub fn holds(&self, profile_id: &str) -> bool {
        let current = thread::current().id();
        let state = self.state_guard();
        state
            .get(profile_id)
            .map(|entry| entry.holder == Some(current))
            .unwrap_or(false)
    }

    /// Returns `Ok(true)` when this call acquired the lock and
    /// `Ok(false)` when the calling thread already held it (re-locking
    /// does not nest).
    fn lock_one(&self, profile_id: &str) -> Result<bool> {
        let current = thread::current().id();
        let mut state = self.state_guard();

        loop {
            let entry = state.entry(profile_id.to_string()).or_default();
            match entry.holder {
                Some(holder) if holder == current => return Ok(false),
                None => break,
                Some(_) => {
                    entry.waiters += 1;
                    state = match self.released.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if let Some(entry) = state.get_mut(profile_id) {
                        entry.waiters -= 1;
                    }
                }
            }
        }

        let already_location_locked = state
            .get(profile_id)
            .map(|entry| entry.os_lock.is_some())
            .unwrap_or(false);
        if !already_location_locked {
            let file = self.claim_location_lock(profile_id)?;
            let entry = state.entry(profile_id.to_string()).or_default();
            entry.os_lock = Some(file);
        }

        let entry = state.entry(profile_id.to_string()).or_default();
        entry.holder = Some(current);
        Ok(true)
    }

    fn unlock_one(&self, profile_id: &str) -> Result<()> {
        let current = thread::current().id();
        let mut state = self.state_guard();

        let entry = state
            .get_mut(profile_id)
            .ok_or_else(|| anyhow!("profile '{profile_id}' is not locked"))?;
        match entry.holder {
            Some(holder) if holder == current => {}
            _ => {
                return Err(anyhow!(
                    "profile '{profile_id}' is not locked by the calling thread"
                ));
            }
        }

        entry.holder = None;
        if entry.waiters > 0 {
            // Keep the OS lock: it is handed over in-process to the next
            // waiter. All waiters are woken; each re-checks its own id
            // and exactly one acquirer per id proceeds.
            self.released.notify_all();
            return Ok(());
        }

        if let Some(file) = entry.os_lock.take() {
            if let Err(err) = FileExt::unlock(&file) {
                log::warn!("failed releasing advisory lock for profile '{profile_id}': {err}");
            }
        }
        state.remove(profile_id);
        Ok(())
    }

    fn claim_location_lock(&self, profile_id: &str) -> Result<File> {
        self.layout.ensure_profile_dir(profile_id)?;
        let marker = self.layout.lock_marker_path(profile_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&marker)
            .with_context(|| format!("failed opening lock marker: {}", marker.display()))?;
        if let Err(err) = file.try_lock_exclusive() {
            return Err(anyhow!(
                "profile '{profile_id}' is in use by another process: {err}"
            ));
        }
        Ok(file)
    }

    fn state_guard(&self) -> MutexGuard<'_, HashMap<String, LockState>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
