use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};

use provkit_core::Unit;

/// A named, versioned aggregate of installed units and properties for
/// one install target. Canonical instances live inside the registry;
/// callers work on private copies and submit them through
/// `ProfileRegistry::update_profile` while holding the profile lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    id: String,
    parent_id: Option<String>,
    properties: BTreeMap<String, String>,
    units: BTreeSet<Unit>,
    unit_properties: BTreeMap<Unit, BTreeMap<String, String>>,
    timestamp: u64,
    dirty: bool,
}

impl Profile {
    pub(crate) fn new(id: impl Into<String>, parent_id: Option<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(anyhow!("profile id must not be empty"));
        }
        Ok(Self {
            id,
            parent_id,
            properties: BTreeMap::new(),
            units: BTreeSet::new(),
            unit_properties: BTreeMap::new(),
            timestamp: 0,
            dirty: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: String,
        parent_id: Option<String>,
        properties: BTreeMap<String, String>,
        units: BTreeSet<Unit>,
        unit_properties: BTreeMap<Unit, BTreeMap<String, String>>,
        timestamp: u64,
    ) -> Result<Self> {
        let mut profile = Self::new(id, parent_id)?;
        profile.properties = properties;
        profile.units = units;
        profile.unit_properties = unit_properties;
        profile.timestamp = timestamp;
        Ok(profile)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Logical version of the profile: the timestamp of the snapshot it
    /// was loaded from, strictly increasing across persists.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn local_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Sets (`Some`) or clears (`None`) a local property.
    pub fn set_property(&mut self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        match value {
            Some(value) => {
                self.properties.insert(key, value);
            }
            None => {
                self.properties.remove(&key);
            }
        }
        self.dirty = true;
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.iter()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn has_unit(&self, unit: &Unit) -> bool {
        self.units.contains(unit)
    }

    pub fn add_unit(&mut self, unit: Unit) {
        self.units.insert(unit);
        self.dirty = true;
    }

    /// Removes the unit but keeps its per-unit properties so rollback
    /// can still inspect them; see `clear_orphaned_unit_properties`.
    pub fn remove_unit(&mut self, unit: &Unit) -> bool {
        let removed = self.units.remove(unit);
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn unit_property(&self, unit: &Unit, key: &str) -> Option<&str> {
        self.unit_properties
            .get(unit)
            .and_then(|properties| properties.get(key))
            .map(String::as_str)
    }

    pub fn unit_properties(&self, unit: &Unit) -> Option<&BTreeMap<String, String>> {
        self.unit_properties.get(unit)
    }

    pub fn set_unit_property(
        &mut self,
        unit: Unit,
        key: impl Into<String>,
        value: Option<String>,
    ) {
        let key = key.into();
        match value {
            Some(value) => {
                self.unit_properties.entry(unit).or_default().insert(key, value);
            }
            None => {
                if let Some(properties) = self.unit_properties.get_mut(&unit) {
                    properties.remove(&key);
                    if properties.is_empty() {
                        self.unit_properties.remove(&unit);
                    }
                }
            }
        }
        self.dirty = true;
    }

    /// Drops property maps for units no longer installed. Kept separate
    /// from `remove_unit` so intermediate transactional states can still
    /// read stale per-unit properties during rollback.
    pub fn clear_orphaned_unit_properties(&mut self) {
        let orphaned: Vec<Unit> = self
            .unit_properties
            .keys()
            .filter(|unit| !self.units.contains(unit))
            .cloned()
            .collect();
        if orphaned.is_empty() {
            return;
        }
        for unit in orphaned {
            self.unit_properties.remove(&unit);
        }
        self.dirty = true;
    }

    /// Deep, independent copy safe to hand outside the registry.
    pub fn snapshot(&self) -> Profile {
        self.clone()
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// 1:1 replacement of local state from a caller-supplied copy; the
    /// identity fields (id, parent) are not touched.
    pub(crate) fn replace_contents_from(&mut self, other: &Profile) {
        self.properties = other.properties.clone();
        self.units = other.units.clone();
        self.unit_properties = other.unit_properties.clone();
        self.dirty = true;
    }

    pub(crate) fn unit_properties_map(&self) -> &BTreeMap<Unit, BTreeMap<String, String>> {
        &self.unit_properties
    }
}
