use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use provkit_core::Unit;

use crate::layout::RegistryLayout;
use crate::profile::Profile;

const SNAPSHOT_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ProfileSnapshotFile {
    version: u32,
    id: String,
    parent_id: Option<String>,
    timestamp: u64,
    #[serde(default)]
    properties: BTreeMap<String, String>,
    #[serde(default)]
    units: Vec<Unit>,
    #[serde(default)]
    unit_properties: Vec<UnitPropertiesEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UnitPropertiesEntry {
    unit: Unit,
    properties: BTreeMap<String, String>,
}

/// Persists one immutable snapshot for the profile's current timestamp.
/// The document is staged next to its final location and renamed into
/// place; a failed write never leaves a partial snapshot behind.
pub(crate) fn write_snapshot(layout: &RegistryLayout, profile: &Profile) -> Result<()> {
    layout.ensure_profile_dir(profile.id())?;

    let snapshot = ProfileSnapshotFile {
        version: SNAPSHOT_FILE_VERSION,
        id: profile.id().to_string(),
        parent_id: profile.parent_id().map(str::to_string),
        timestamp: profile.timestamp(),
        properties: profile.properties().clone(),
        units: profile.units().cloned().collect(),
        unit_properties: profile
            .unit_properties_map()
            .iter()
            .map(|(unit, properties)| UnitPropertiesEntry {
                unit: unit.clone(),
                properties: properties.clone(),
            })
            .collect(),
    };

    let staging_path = layout.snapshot_staging_path(profile.id(), profile.timestamp());
    let final_path = layout.snapshot_path(profile.id(), profile.timestamp());

    let content = serde_json::to_string_pretty(&snapshot).with_context(|| {
        format!(
            "failed serializing profile snapshot: {}",
            final_path.display()
        )
    })?;

    if let Err(err) = fs::write(&staging_path, content) {
        let _ = fs::remove_file(&staging_path);
        return Err(err).with_context(|| {
            format!(
                "failed writing profile snapshot: {}",
                staging_path.display()
            )
        });
    }

    if let Err(err) = fs::rename(&staging_path, &final_path) {
        let _ = fs::remove_file(&staging_path);
        return Err(err).with_context(|| {
            format!(
                "failed publishing profile snapshot: {}",
                final_path.display()
            )
        });
    }

    Ok(())
}

pub(crate) fn read_snapshot(
    layout: &RegistryLayout,
    profile_id: &str,
    timestamp: u64,
) -> Result<Option<Profile>> {
    let path = layout.snapshot_path(profile_id, timestamp);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed reading profile snapshot: {}", path.display()));
        }
    };

    let snapshot: ProfileSnapshotFile = serde_json::from_str(&content)
        .with_context(|| format!("failed parsing profile snapshot: {}", path.display()))?;
    if snapshot.version != SNAPSHOT_FILE_VERSION {
        return Err(anyhow!(
            "unsupported profile snapshot version {} in {}",
            snapshot.version,
            path.display()
        ));
    }
    if snapshot.id != profile_id {
        return Err(anyhow!(
            "profile snapshot id mismatch: expected '{}', found '{}' in {}",
            profile_id,
            snapshot.id,
            path.display()
        ));
    }

    let units: BTreeSet<Unit> = snapshot.units.into_iter().collect();
    let unit_properties: BTreeMap<Unit, BTreeMap<String, String>> = snapshot
        .unit_properties
        .into_iter()
        .map(|entry| (entry.unit, entry.properties))
        .collect();

    let profile = Profile::from_parts(
        snapshot.id,
        snapshot.parent_id,
        snapshot.properties,
        units,
        unit_properties,
        snapshot.timestamp,
    )?;
    Ok(Some(profile))
}

/// Snapshot timestamps for a profile, sorted ascending. Files that are
/// not `<decimal>.profile` are ignored.
pub(crate) fn list_timestamps(layout: &RegistryLayout, profile_id: &str) -> Result<Vec<u64>> {
    let dir = layout.profile_dir(profile_id);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed reading profile directory: {}", dir.display()));
        }
    };

    let mut timestamps = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed reading profile directory: {}", dir.display()))?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("profile") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if let Ok(timestamp) = stem.parse::<u64>() {
            timestamps.push(timestamp);
        }
    }

    timestamps.sort_unstable();
    Ok(timestamps)
}

pub(crate) fn latest_timestamp(layout: &RegistryLayout, profile_id: &str) -> Result<Option<u64>> {
    Ok(list_timestamps(layout, profile_id)?.last().copied())
}

pub(crate) fn read_latest_snapshot(
    layout: &RegistryLayout,
    profile_id: &str,
) -> Result<Option<Profile>> {
    match latest_timestamp(layout, profile_id)? {
        Some(timestamp) => read_snapshot(layout, profile_id, timestamp),
        None => Ok(None),
    }
}
