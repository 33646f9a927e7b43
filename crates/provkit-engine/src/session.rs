use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use provkit_core::{Operand, Severity, Status};
use provkit_registry::Profile;

use crate::action::ProvisioningAction;
use crate::context::ProvisioningContext;
use crate::phase::{panic_message, Phase};

/// Per-call transaction context. Owns the working copy of the profile
/// and records, in forward order, every phase that began executing and
/// every step inside it, so the whole run can be undone in reverse.
/// A session is single use: it ends in exactly one `commit` or
/// `rollback`.
pub struct EngineSession {
    profile: Profile,
    context: ProvisioningContext,
    completed: Vec<CompletedPhase>,
}

struct CompletedPhase {
    phase: Arc<dyn Phase>,
    steps: Vec<ExecutedStep>,
}

enum ExecutedStep {
    Action {
        action: Arc<dyn ProvisioningAction>,
        operand: Operand,
    },
    ProfileChange {
        operand: Operand,
    },
}

impl EngineSession {
    pub fn new(profile: Profile, context: ProvisioningContext) -> Self {
        Self {
            profile,
            context,
            completed: Vec::new(),
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn profile_mut(&mut self) -> &mut Profile {
        &mut self.profile
    }

    pub fn context(&self) -> &ProvisioningContext {
        &self.context
    }

    pub(crate) fn transaction_parts(&mut self) -> (&mut Profile, &ProvisioningContext) {
        (&mut self.profile, &self.context)
    }

    /// Phases are recorded when they *begin*, not when they succeed, so
    /// a phase that errored half way is still undone.
    pub(crate) fn phase_started(&mut self, phase: Arc<dyn Phase>) {
        self.completed.push(CompletedPhase {
            phase,
            steps: Vec::new(),
        });
    }

    pub(crate) fn record_action(&mut self, action: Arc<dyn ProvisioningAction>, operand: Operand) {
        if let Some(current) = self.completed.last_mut() {
            current.steps.push(ExecutedStep::Action { action, operand });
        }
    }

    pub(crate) fn record_profile_change(&mut self, operand: Operand) {
        if let Some(current) = self.completed.last_mut() {
            current.steps.push(ExecutedStep::ProfileChange { operand });
        }
    }

    pub fn started_phase_ids(&self) -> Vec<String> {
        self.completed
            .iter()
            .map(|completed| completed.phase.id().to_string())
            .collect()
    }

    /// Pre-commit hook: every started phase may finalize resources
    /// before the profile is persisted.
    pub fn prepare(&mut self) -> Status {
        let mut status = Status::ok_with("prepare");
        for completed in &self.completed {
            let phase_status = completed.phase.prepare(&self.profile, &self.context);
            if phase_status.severity() > Severity::Ok {
                status.merge(phase_status);
            }
        }
        status
    }

    /// Finalizes every started phase in forward order and consumes the
    /// session.
    pub fn commit(self) -> Status {
        let mut status = Status::ok_with("commit");
        for completed in &self.completed {
            let phase_status = completed.phase.commit(&self.profile, &self.context);
            if phase_status.severity() > Severity::Ok {
                status.merge(phase_status);
            }
        }
        status
    }

    /// Undoes every started phase in reverse order, and the steps inside
    /// each phase in reverse order. A failing or panicking undo is
    /// logged and folded into the returned status, but never stops the
    /// rest of the sequence.
    pub fn rollback(mut self, severity: Severity) -> Status {
        let mut status = Status::new(
            Severity::Ok,
            format!("rollback after {severity} outcome"),
        );

        while let Some(completed) = self.completed.pop() {
            let phase = completed.phase;
            for step in completed.steps.into_iter().rev() {
                match step {
                    ExecutedStep::ProfileChange { operand } => {
                        phase.revert_change(&mut self.profile, &operand);
                    }
                    ExecutedStep::Action { action, operand } => {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            action.undo(&mut self.profile, &self.context, &operand)
                        }));
                        let undo_status = match outcome {
                            Ok(undo_status) => undo_status,
                            Err(payload) => Status::error(format!(
                                "undo of action '{}' panicked on {}: {}",
                                action.id(),
                                operand,
                                panic_message(payload.as_ref())
                            )),
                        };
                        if !undo_status.is_ok() {
                            log::warn!(
                                "undo failed during phase '{}' for action '{}' on {}: {}",
                                phase.id(),
                                action.id(),
                                operand,
                                undo_status
                            );
                            status.merge(undo_status);
                        }
                    }
                }
            }
        }

        status
    }
}
