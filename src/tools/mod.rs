pub mod bash;

pub use bash::BashTool;

use crate::registry::{CapabilityRegistry, DependencyKind, RegistryError, ToolFactory, ToolRegistry};
use crate::timeline::{SendCorrectionTool, SEND_CORRECTION};
use crate::types::AgentTool;

/// Factory for the correction tool, bound to the registered timeline.
pub fn send_correction_factory() -> ToolFactory {
    ToolFactory::new(
        SEND_CORRECTION,
        vec![DependencyKind::Timeline],
        |registry| {
            let timeline = registry.require(
                SEND_CORRECTION,
                DependencyKind::Timeline,
                CapabilityRegistry::timeline,
            )?;
            Ok(Box::new(SendCorrectionTool::new(timeline.clone())) as Box<dyn AgentTool>)
        },
    )
}

/// The standard tools: shell and checkpoint correction.
pub fn default_registry() -> Result<ToolRegistry, RegistryError> {
    ToolRegistry::new()
        .with(BashTool::factory())?
        .with(send_correction_factory())
}
