use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use semver::{Version, VersionReq};

use provkit_core::{Operand, Status};
use provkit_registry::Profile;

use crate::context::ProvisioningContext;

/// A pluggable handler invoked by a phase for one operand. Actions are
/// the only place real side effects happen; `undo` must tolerate a
/// partially completed `execute`.
pub trait ProvisioningAction: Send + Sync {
    fn id(&self) -> &str;

    fn execute(
        &self,
        profile: &mut Profile,
        context: &ProvisioningContext,
        operand: &Operand,
    ) -> Status;

    fn undo(
        &self,
        profile: &mut Profile,
        context: &ProvisioningContext,
        operand: &Operand,
    ) -> Status;
}

/// Result of an action lookup. Unresolved lookups yield the `Missing`
/// sentinel instead of an error so every miss across a whole plan can
/// be batched into one validation failure.
#[derive(Clone)]
pub enum ResolvedAction {
    Resolved(Arc<dyn ProvisioningAction>),
    Missing {
        action_id: String,
        version_range: Option<VersionReq>,
    },
}

impl ResolvedAction {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }
}

/// External collaborator that maps (action id, optional version range)
/// to an action. Implementations never fail; see `ResolvedAction`.
pub trait ActionResolver: Send + Sync {
    fn resolve(&self, action_id: &str, version_range: Option<&VersionReq>) -> ResolvedAction;
}

/// Explicit action registration map built by the host at startup.
/// Several versions of one action id may coexist; resolution picks the
/// highest version matching the requested range. Resolutions are
/// memoized until `invalidate` drops the memo.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Vec<(Version, Arc<dyn ProvisioningAction>)>>,
    resolved: Mutex<HashMap<String, Arc<dyn ProvisioningAction>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, version: Version, action: Arc<dyn ProvisioningAction>) {
        let versions = self.actions.entry(action.id().to_string()).or_default();
        versions.push((version, action));
        versions.sort_by(|a, b| b.0.cmp(&a.0));
    }

    /// Drops memoized resolutions; the registration map itself is kept.
    pub fn invalidate(&self) {
        self.resolved_guard().clear();
    }

    pub fn registered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.actions.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn resolved_guard(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn ProvisioningAction>>> {
        match self.resolved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ActionResolver for ActionRegistry {
    fn resolve(&self, action_id: &str, version_range: Option<&VersionReq>) -> ResolvedAction {
        let memo_key = match version_range {
            Some(range) => format!("{action_id} {range}"),
            None => action_id.to_string(),
        };
        if let Some(action) = self.resolved_guard().get(&memo_key) {
            return ResolvedAction::Resolved(Arc::clone(action));
        }

        let missing = || ResolvedAction::Missing {
            action_id: action_id.to_string(),
            version_range: version_range.cloned(),
        };

        let Some(candidates) = self.actions.get(action_id) else {
            return missing();
        };
        // Candidates are kept sorted newest-first.
        let best = candidates.iter().find(|(version, _)| {
            version_range.map_or(true, |range| range.matches(version))
        });
        match best {
            Some((_, action)) => {
                self.resolved_guard()
                    .insert(memo_key, Arc::clone(action));
                ResolvedAction::Resolved(Arc::clone(action))
            }
            None => missing(),
        }
    }
}
