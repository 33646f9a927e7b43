use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use semver::VersionReq;

use provkit_core::{Operand, PauseGate, ProgressMonitor, Severity, Status, SubProgress};
use provkit_registry::Profile;

use crate::action::{ActionResolver, ResolvedAction};
use crate::context::ProvisioningContext;
use crate::session::EngineSession;

/// One action lookup a phase requests for an operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    pub action_id: String,
    pub version_range: Option<VersionReq>,
}

impl ActionSpec {
    pub fn new(action_id: impl Into<String>, version_range: Option<VersionReq>) -> Self {
        Self {
            action_id: action_id.into(),
            version_range,
        }
    }

    pub fn describe(&self) -> String {
        match &self.version_range {
            Some(range) => format!("'{}' (range {})", self.action_id, range),
            None => format!("'{}' (any version)", self.action_id),
        }
    }
}

/// One named stage of the provisioning pipeline. A phase filters the
/// operand list by applicability and runs one resolved action list per
/// operand; the optional hooks let it finalize resources at commit time
/// and maintain the profile itself.
pub trait Phase: Send + Sync {
    fn id(&self) -> &str;

    /// Relative share of the overall progress budget.
    fn weight(&self) -> u64;

    fn is_applicable(&self, operand: &Operand) -> bool;

    /// Action lookups for one applicable operand, in execution order.
    fn action_specs(&self, operand: &Operand) -> Vec<ActionSpec>;

    /// Built-in profile mutation applied after an operand's actions
    /// succeed (e.g. the install phase records the added unit).
    fn apply_change(&self, _profile: &mut Profile, _operand: &Operand) {}

    /// Reverses `apply_change` during rollback.
    fn revert_change(&self, _profile: &mut Profile, _operand: &Operand) {}

    /// Pre-commit hook; merged into the transaction status.
    fn prepare(&self, _profile: &Profile, _context: &ProvisioningContext) -> Status {
        Status::ok()
    }

    /// Commit-time finalization (release temporary resources).
    fn commit(&self, _profile: &Profile, _context: &ProvisioningContext) -> Status {
        Status::ok()
    }
}

/// The pipeline stages shipped with the engine. Order is fixed by the
/// phase set configuration, never computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Collect,
    VerifyTrust,
    Unconfigure,
    Uninstall,
    SetProperties,
    Install,
    Configure,
}

impl PhaseKind {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::VerifyTrust => "verify-trust",
            Self::Unconfigure => "unconfigure",
            Self::Uninstall => "uninstall",
            Self::SetProperties => "set-properties",
            Self::Install => "install",
            Self::Configure => "configure",
        }
    }

    fn default_weight(&self) -> u64 {
        match self {
            Self::Collect => 100,
            Self::VerifyTrust => 10,
            Self::Unconfigure => 10,
            Self::Uninstall => 50,
            Self::SetProperties => 10,
            Self::Install => 50,
            Self::Configure => 10,
        }
    }
}

/// Concrete phase whose applicability and profile bookkeeping are
/// driven by its kind. The incoming side of a unit change flows through
/// collect/verify-trust/install/configure, the outgoing side through
/// unconfigure/uninstall, property operands through set-properties.
pub struct PipelinePhase {
    kind: PhaseKind,
    weight: u64,
}

impl PipelinePhase {
    pub fn new(kind: PhaseKind) -> Self {
        Self {
            weight: kind.default_weight(),
            kind,
        }
    }

    pub fn with_weight(kind: PhaseKind, weight: u64) -> Self {
        Self { kind, weight }
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }
}

impl Phase for PipelinePhase {
    fn id(&self) -> &str {
        self.kind.id()
    }

    fn weight(&self) -> u64 {
        self.weight
    }

    fn is_applicable(&self, operand: &Operand) -> bool {
        match self.kind {
            PhaseKind::Collect | PhaseKind::VerifyTrust | PhaseKind::Install
            | PhaseKind::Configure => operand.added_unit().is_some(),
            PhaseKind::Unconfigure | PhaseKind::Uninstall => operand.removed_unit().is_some(),
            PhaseKind::SetProperties => !operand.is_unit_change(),
        }
    }

    fn action_specs(&self, _operand: &Operand) -> Vec<ActionSpec> {
        vec![ActionSpec::new(self.kind.id(), None)]
    }

    fn apply_change(&self, profile: &mut Profile, operand: &Operand) {
        match self.kind {
            PhaseKind::Install => {
                if let Some(added) = operand.added_unit() {
                    profile.add_unit(added.clone());
                }
            }
            PhaseKind::Uninstall => {
                if let Some(removed) = operand.removed_unit() {
                    profile.remove_unit(removed);
                }
            }
            PhaseKind::SetProperties => match operand {
                Operand::ProfilePropertyChange { key, new_value, .. } => {
                    profile.set_property(key.clone(), new_value.clone());
                }
                Operand::UnitPropertyChange {
                    unit, key, new_value, ..
                } => {
                    profile.set_unit_property(unit.clone(), key.clone(), new_value.clone());
                }
                Operand::UnitChange(_) => {}
            },
            _ => {}
        }
    }

    fn revert_change(&self, profile: &mut Profile, operand: &Operand) {
        match self.kind {
            PhaseKind::Install => {
                if let Some(added) = operand.added_unit() {
                    profile.remove_unit(added);
                }
            }
            PhaseKind::Uninstall => {
                if let Some(removed) = operand.removed_unit() {
                    profile.add_unit(removed.clone());
                }
            }
            PhaseKind::SetProperties => match operand {
                Operand::ProfilePropertyChange { key, old_value, .. } => {
                    profile.set_property(key.clone(), old_value.clone());
                }
                Operand::UnitPropertyChange {
                    unit, key, old_value, ..
                } => {
                    profile.set_unit_property(unit.clone(), key.clone(), old_value.clone());
                }
                Operand::UnitChange(_) => {}
            },
            _ => {}
        }
    }
}

/// The fixed, ordered pipeline executed for one transaction, plus the
/// cooperative pause flag every phase honors between operand steps.
pub struct PhaseSet {
    phases: Vec<Arc<dyn Phase>>,
    pause_gate: Arc<PauseGate>,
}

impl PhaseSet {
    pub fn new(phases: Vec<Arc<dyn Phase>>) -> Self {
        Self {
            phases,
            pause_gate: Arc::new(PauseGate::new()),
        }
    }

    /// The full seven-phase pipeline in its canonical order.
    pub fn default_set() -> Self {
        Self::new(vec![
            Arc::new(PipelinePhase::new(PhaseKind::Collect)),
            Arc::new(PipelinePhase::new(PhaseKind::VerifyTrust)),
            Arc::new(PipelinePhase::new(PhaseKind::Unconfigure)),
            Arc::new(PipelinePhase::new(PhaseKind::Uninstall)),
            Arc::new(PipelinePhase::new(PhaseKind::SetProperties)),
            Arc::new(PipelinePhase::new(PhaseKind::Install)),
            Arc::new(PipelinePhase::new(PhaseKind::Configure)),
        ])
    }

    pub fn phases(&self) -> &[Arc<dyn Phase>] {
        &self.phases
    }

    pub fn pause_gate(&self) -> Arc<PauseGate> {
        Arc::clone(&self.pause_gate)
    }

    /// Runs every phase in order against the session's working profile.
    /// Cancellation is polled before each phase; the first ERROR or
    /// CANCEL stops the pipeline from advancing. Every phase that began
    /// executing is recorded on the session for ordered undo.
    pub fn perform(
        &self,
        session: &mut EngineSession,
        resolver: &dyn ActionResolver,
        operands: &[Operand],
        progress: &mut dyn ProgressMonitor,
    ) -> Status {
        let total_weight: u64 = self.phases.iter().map(|phase| phase.weight()).sum();
        progress.begin_task("provisioning", total_weight);

        let mut overall = Status::ok_with("provisioning");
        for phase in &self.phases {
            if progress.is_canceled() {
                overall.merge(Status::cancel(format!(
                    "provisioning canceled before phase '{}'",
                    phase.id()
                )));
                break;
            }

            let applicable: Vec<&Operand> = operands
                .iter()
                .filter(|operand| phase.is_applicable(operand))
                .collect();
            let allocation = phase_allocation(phase.as_ref(), applicable.len(), operands.len());

            session.phase_started(Arc::clone(phase));
            let mut phase_progress = SubProgress::new(progress, allocation);
            let phase_status =
                self.run_phase(phase.as_ref(), session, resolver, &applicable, &mut phase_progress);
            phase_progress.done();

            let stop = !phase_status.is_ok();
            if phase_status.severity() > Severity::Ok {
                overall.merge(phase_status);
            }
            if stop {
                break;
            }
        }
        overall
    }

    /// Dry applicability/resolution walk: surfaces every unresolved
    /// action as one aggregated error without executing anything.
    pub fn validate(
        &self,
        _profile: &Profile,
        operands: &[Operand],
        _context: &ProvisioningContext,
        resolver: &dyn ActionResolver,
    ) -> Status {
        let mut missing: Vec<String> = Vec::new();
        for phase in &self.phases {
            for operand in operands {
                if !phase.is_applicable(operand) {
                    continue;
                }
                for spec in phase.action_specs(operand) {
                    if resolver
                        .resolve(&spec.action_id, spec.version_range.as_ref())
                        .is_missing()
                    {
                        let description = spec.describe();
                        if !missing.contains(&description) {
                            missing.push(description);
                        }
                    }
                }
            }
        }

        if missing.is_empty() {
            return Status::ok();
        }
        let mut status = Status::error(format!(
            "{} action(s) could not be resolved",
            missing.len()
        ));
        for description in missing {
            status.merge(Status::error(format!(
                "no action registered for {description}"
            )));
        }
        status
    }

    fn run_phase(
        &self,
        phase: &dyn Phase,
        session: &mut EngineSession,
        resolver: &dyn ActionResolver,
        applicable: &[&Operand],
        progress: &mut dyn ProgressMonitor,
    ) -> Status {
        let mut status = Status::ok_with(format!("phase '{}'", phase.id()));
        progress.begin_task(phase.id(), applicable.len() as u64);

        'operands: for operand in applicable {
            self.pause_gate.wait_while_paused();

            for spec in phase.action_specs(operand) {
                let action = match resolver.resolve(&spec.action_id, spec.version_range.as_ref()) {
                    ResolvedAction::Resolved(action) => action,
                    ResolvedAction::Missing { .. } => {
                        status.merge(Status::error(format!(
                            "phase '{}' has no action registered for {}",
                            phase.id(),
                            spec.describe()
                        )));
                        break 'operands;
                    }
                };

                // Recorded before execution so a failing action is also
                // asked to undo whatever part of its work happened.
                session.record_action(Arc::clone(&action), (*operand).clone());

                let (profile, context) = session.transaction_parts();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    action.execute(profile, context, operand)
                }));
                let action_status = match outcome {
                    Ok(action_status) => action_status,
                    Err(payload) => Status::error(format!(
                        "action '{}' panicked during phase '{}' on {}: {}",
                        action.id(),
                        phase.id(),
                        operand,
                        panic_message(payload.as_ref())
                    )),
                };

                let failed = !action_status.is_ok();
                if action_status.severity() > Severity::Ok {
                    status.merge(action_status);
                }
                if failed {
                    break 'operands;
                }
            }

            phase.apply_change(session.profile_mut(), operand);
            session.record_profile_change((*operand).clone());
            progress.worked(1);
        }

        status
    }
}

/// Per-phase progress share. The truncating integer division is
/// deliberate: `weight * applicable / total`, falling back to the raw
/// weight when the operand list is empty.
fn phase_allocation(phase: &dyn Phase, applicable: usize, total: usize) -> u64 {
    if total == 0 {
        return phase.weight();
    }
    phase.weight() * applicable as u64 / total as u64
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
