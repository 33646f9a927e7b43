use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::escape::escape_profile_id;

/// Path arithmetic for the on-disk registry. One directory per profile
/// (`<root>/<escaped-id>.profile/`), one immutable snapshot file per
/// timestamp inside it, plus a lock marker claimed via an advisory lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryLayout {
    root: PathBuf,
}

impl RegistryLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn profile_dir(&self, profile_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.profile", escape_profile_id(profile_id)))
    }

    pub fn snapshot_path(&self, profile_id: &str, timestamp: u64) -> PathBuf {
        self.profile_dir(profile_id)
            .join(format!("{timestamp}.profile"))
    }

    pub fn snapshot_staging_path(&self, profile_id: &str, timestamp: u64) -> PathBuf {
        self.profile_dir(profile_id)
            .join(format!(".{timestamp}.profile.tmp"))
    }

    pub fn lock_marker_path(&self, profile_id: &str) -> PathBuf {
        self.profile_dir(profile_id).join(".lock")
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create registry root: {}", self.root.display()))
    }

    pub fn ensure_profile_dir(&self, profile_id: &str) -> Result<PathBuf> {
        let dir = self.profile_dir(profile_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create profile directory: {}", dir.display()))?;
        Ok(dir)
    }
}
