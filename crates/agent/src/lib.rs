//! The reasoning engine — the heart of Merlin.
//!
//! A query goes through a **Plan → Execute → Synthesize** cycle:
//!
//! 1. **Plan**: the planner turns the query into an ordered list of tool steps
//! 2. **Execute**: steps run one at a time; later steps may use earlier results
//! 3. **Replan**: a failed step throws away the rest of the plan and asks for
//!    a new one, keeping what already ran
//! 4. **Synthesize**: the step history becomes a free-text answer
//!
//! A chain that cannot finish ends ABORTED with a partial answer built from
//! whatever completed.

pub mod engine;
pub mod executor;
pub mod planner;
pub mod registry;
pub mod replan;

#[cfg(test)]
mod test_helpers;

pub use engine::ReasoningEngine;
pub use executor::{StepContext, StepExecutor};
pub use planner::{ProviderPlanner, parse_plan};
pub use registry::{ActiveChains, ChainRegistry};
pub use replan::{ReplanOnFailure, ReplanPolicy, ReplanReason};

use merlin_config::AppConfig;
use merlin_core::error::Result;
use merlin_tools::{FsSearcher, ShellRunner};
use std::sync::Arc;

/// Build an engine wired to the configured language model, the local shell
/// and the file system.
pub fn build_engine(config: &AppConfig) -> Result<ReasoningEngine> {
    let router = merlin_providers::build_from_config(config);
    let provider = router.planning_provider()?;
    let planner = Arc::new(ProviderPlanner::from_config(provider, config));

    ReasoningEngine::from_config(
        config,
        planner,
        Arc::new(ShellRunner::new()),
        Arc::new(FsSearcher::new(config.search.max_content_bytes)),
    )
}
