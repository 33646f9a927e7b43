use std::collections::BTreeMap;

/// Execution environment handed to phases and actions for the duration
/// of one transaction. Plain key/value data; the engine never interprets
/// it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningContext {
    environment: BTreeMap<String, String>,
}

impl ProvisioningContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_environment(environment: BTreeMap<String, String>) -> Self {
        Self { environment }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.environment.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.environment.insert(key.into(), value.into());
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }
}
