use provkit_core::{Operand, Status};

use crate::context::ProvisioningContext;

/// A requested set of changes for one profile: the ordered operand list
/// plus the context the phases will see. The optional nested installer
/// plan covers self-update scenarios where the provisioning system
/// itself must be replaced before the main plan can run.
#[derive(Clone)]
pub struct ProvisioningPlan {
    profile_id: String,
    operands: Vec<Operand>,
    context: ProvisioningContext,
    status: Status,
    installer_plan: Option<Box<ProvisioningPlan>>,
}

impl ProvisioningPlan {
    pub fn new(profile_id: impl Into<String>, context: ProvisioningContext) -> Self {
        Self {
            profile_id: profile_id.into(),
            operands: Vec::new(),
            context,
            status: Status::ok(),
            installer_plan: None,
        }
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub fn context(&self) -> &ProvisioningContext {
        &self.context
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn add_operand(&mut self, operand: Operand) {
        self.operands.push(operand);
    }

    pub fn is_empty(&self) -> bool {
        self.operands.is_empty()
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn installer_plan(&self) -> Option<&ProvisioningPlan> {
        self.installer_plan.as_deref()
    }

    pub fn set_installer_plan(&mut self, plan: ProvisioningPlan) {
        self.installer_plan = Some(Box::new(plan));
    }
}
