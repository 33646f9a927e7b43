use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Unit;

/// One atomic requested change. Operands are produced by an external
/// planner and consumed in list order by the phase pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    UnitChange(UnitChange),
    ProfilePropertyChange {
        key: String,
        old_value: Option<String>,
        new_value: Option<String>,
    },
    UnitPropertyChange {
        unit: Unit,
        key: String,
        old_value: Option<String>,
        new_value: Option<String>,
    },
}

/// A unit-level install, uninstall, or replace. The two-sided empty
/// form is unrepresentable; both construction and decoding reject it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitChange(UnitChangeKind);

#[derive(Debug, Clone, PartialEq, Eq)]
enum UnitChangeKind {
    Install(Unit),
    Uninstall(Unit),
    Replace { removed: Unit, added: Unit },
}

impl UnitChange {
    pub fn new(removed: Option<Unit>, added: Option<Unit>) -> Result<Self> {
        match (removed, added) {
            (None, None) => Err(anyhow!(
                "unit change operand requires at least one of removed or added"
            )),
            (None, Some(added)) => Ok(Self(UnitChangeKind::Install(added))),
            (Some(removed), None) => Ok(Self(UnitChangeKind::Uninstall(removed))),
            (Some(removed), Some(added)) => Ok(Self(UnitChangeKind::Replace { removed, added })),
        }
    }

    pub fn removed(&self) -> Option<&Unit> {
        match &self.0 {
            UnitChangeKind::Install(_) => None,
            UnitChangeKind::Uninstall(removed) | UnitChangeKind::Replace { removed, .. } => {
                Some(removed)
            }
        }
    }

    pub fn added(&self) -> Option<&Unit> {
        match &self.0 {
            UnitChangeKind::Uninstall(_) => None,
            UnitChangeKind::Install(added) | UnitChangeKind::Replace { added, .. } => Some(added),
        }
    }
}

// On the wire a unit change stays a `{ removed, added }` pair; the
// validating constructor guards the decode path.

#[derive(Serialize)]
struct RawUnitChangeRef<'a> {
    removed: Option<&'a Unit>,
    added: Option<&'a Unit>,
}

#[derive(Deserialize)]
struct RawUnitChange {
    #[serde(default)]
    removed: Option<Unit>,
    #[serde(default)]
    added: Option<Unit>,
}

impl Serialize for UnitChange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        RawUnitChangeRef {
            removed: self.removed(),
            added: self.added(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for UnitChange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawUnitChange::deserialize(deserializer)?;
        Self::new(raw.removed, raw.added).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for UnitChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            UnitChangeKind::Install(added) => write!(f, "install {added}"),
            UnitChangeKind::Uninstall(removed) => write!(f, "uninstall {removed}"),
            UnitChangeKind::Replace { removed, added } => {
                write!(f, "replace {removed} with {added}")
            }
        }
    }
}

impl Operand {
    pub fn unit_change(removed: Option<Unit>, added: Option<Unit>) -> Result<Self> {
        Ok(Self::UnitChange(UnitChange::new(removed, added)?))
    }

    pub fn install(unit: Unit) -> Self {
        Self::UnitChange(UnitChange(UnitChangeKind::Install(unit)))
    }

    pub fn uninstall(unit: Unit) -> Self {
        Self::UnitChange(UnitChange(UnitChangeKind::Uninstall(unit)))
    }

    pub fn replace(removed: Unit, added: Unit) -> Self {
        Self::UnitChange(UnitChange(UnitChangeKind::Replace { removed, added }))
    }

    pub fn profile_property(
        key: impl Into<String>,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        Self::ProfilePropertyChange {
            key: key.into(),
            old_value,
            new_value,
        }
    }

    pub fn unit_property(
        unit: Unit,
        key: impl Into<String>,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        Self::UnitPropertyChange {
            unit,
            key: key.into(),
            old_value,
            new_value,
        }
    }

    pub fn added_unit(&self) -> Option<&Unit> {
        match self {
            Self::UnitChange(change) => change.added(),
            _ => None,
        }
    }

    pub fn removed_unit(&self) -> Option<&Unit> {
        match self {
            Self::UnitChange(change) => change.removed(),
            _ => None,
        }
    }

    pub fn is_unit_change(&self) -> bool {
        matches!(self, Self::UnitChange(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnitChange(change) => change.fmt(f),
            Self::ProfilePropertyChange { key, .. } => {
                write!(f, "set profile property '{key}'")
            }
            Self::UnitPropertyChange { unit, key, .. } => {
                write!(f, "set property '{key}' on {unit}")
            }
        }
    }
}
