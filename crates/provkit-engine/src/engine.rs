use std::sync::Arc;

use anyhow::{anyhow, Result};

use provkit_core::{Operand, ProgressMonitor, Status};
use provkit_registry::{Profile, ProfileRegistry};

use crate::action::ActionResolver;
use crate::context::ProvisioningContext;
use crate::phase::PhaseSet;
use crate::plan::ProvisioningPlan;
use crate::session::EngineSession;

/// Orchestrates one transaction: validates input, takes the profile
/// lock chain, drives the phase set over a fresh session, and commits
/// or rolls back based on the aggregated outcome. The action resolver
/// and registry are injected; the engine holds no ambient state.
pub struct Engine {
    registry: Arc<ProfileRegistry>,
    resolver: Arc<dyn ActionResolver>,
}

impl Engine {
    pub fn new(registry: Arc<ProfileRegistry>, resolver: Arc<dyn ActionResolver>) -> Self {
        Self { registry, resolver }
    }

    pub fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }

    /// Pure constructor helper: an empty plan for the profile.
    pub fn create_plan(&self, profile: &Profile, context: &ProvisioningContext) -> ProvisioningPlan {
        ProvisioningPlan::new(profile.id(), context.clone())
    }

    /// Dry-run resolution walk over the whole plan; every unresolved
    /// action is reported in one aggregated error before any execution
    /// is attempted.
    pub fn validate(
        &self,
        profile: &Profile,
        phase_set: &PhaseSet,
        operands: &[Operand],
        context: &ProvisioningContext,
    ) -> Result<Status> {
        let canonical = self.canonical_profile(profile)?;
        Ok(phase_set.validate(&canonical, operands, context, self.resolver.as_ref()))
    }

    /// Applies the operand list to the profile through the phase
    /// pipeline, all or nothing.
    ///
    /// `Err` is reserved for contract violations (unknown profile,
    /// lock already held elsewhere, registry faults); every phase-level
    /// outcome, including cancellation, comes back as a `Status`.
    pub fn perform(
        &self,
        profile: &Profile,
        phase_set: &PhaseSet,
        operands: &[Operand],
        context: &ProvisioningContext,
        progress: &mut dyn ProgressMonitor,
    ) -> Result<Status> {
        if operands.is_empty() {
            // Short circuit: no lock taken, nothing touched.
            return Ok(Status::ok_with("nothing to provision"));
        }

        // The caller may hold a stale snapshot; the transaction always
        // starts from the canonical in-registry state.
        let canonical = self.canonical_profile(profile)?;
        let token = self.registry.lock_profile(canonical.id())?;

        let result = self.perform_locked(canonical, phase_set, operands, context, progress);

        // This block runs on every path out of the transaction.
        let unlock_result = self.registry.unlock_profile(token);
        progress.done();

        let status = result?;
        unlock_result?;
        Ok(status.flatten())
    }

    fn perform_locked(
        &self,
        canonical: Profile,
        phase_set: &PhaseSet,
        operands: &[Operand],
        context: &ProvisioningContext,
        progress: &mut dyn ProgressMonitor,
    ) -> Result<Status> {
        let profile_id = canonical.id().to_string();
        let mut session = EngineSession::new(canonical, context.clone());
        let mut status = phase_set.perform(
            &mut session,
            self.resolver.as_ref(),
            operands,
            progress,
        );

        if status.is_ok() {
            let prepare_status = session.prepare();
            if !prepare_status.is_ok() {
                status.merge(prepare_status);
            }
        }

        if status.is_ok() && session.profile().is_dirty() {
            let mut updated = session.profile().snapshot();
            if let Err(err) = self.registry.update_profile(&mut updated) {
                log::warn!("failed persisting profile '{profile_id}': {err:#}");
                status.merge(Status::error(format!(
                    "failed persisting profile '{profile_id}': {err:#}"
                )));
            }
        }

        if status.is_ok() {
            let commit_status = session.commit();
            if !commit_status.is_ok() {
                status.merge(commit_status);
            }
            return Ok(status);
        }

        let rollback_status = session.rollback(status.severity());
        if !rollback_status.is_ok() {
            // Rollback failures never override the original outcome.
            log::warn!(
                "rollback for profile '{profile_id}' reported failures: {rollback_status}"
            );
        } else {
            log::debug!("rolled back provisioning of profile '{profile_id}'");
        }
        Ok(status)
    }

    fn canonical_profile(&self, profile: &Profile) -> Result<Profile> {
        self.registry
            .get_profile(profile.id())?
            .ok_or_else(|| anyhow!("profile '{}' does not exist in the registry", profile.id()))
    }
}
