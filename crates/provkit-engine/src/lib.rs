mod action;
mod context;
mod engine;
mod phase;
mod plan;
mod session;

pub use action::{ActionRegistry, ActionResolver, ProvisioningAction, ResolvedAction};
pub use context::ProvisioningContext;
pub use engine::Engine;
pub use phase::{ActionSpec, Phase, PhaseKind, PhaseSet, PipelinePhase};
pub use plan::ProvisioningPlan;
pub use session::EngineSession;

#[cfg(test)]
mod tests;
