use std::fmt;

use anyhow::{anyhow, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

/// An identified, versioned installable item. Opaque to the engine:
/// units are compared by equality only and carry no behavior.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Unit {
    id: String,
    version: Version,
}

impl Unit {
    pub fn new(id: impl Into<String>, version: Version) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(anyhow!("unit id must not be empty"));
        }
        Ok(Self { id, version })
    }

    pub fn parse(id: impl Into<String>, version: &str) -> Result<Self> {
        let version = Version::parse(version)
            .map_err(|err| anyhow!("invalid unit version '{version}': {err}"))?;
        Self::new(id, version)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &Version {
        &self.version
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}
