//! # Merlin Core
//!
//! Domain types, traits, and error definitions for the Merlin multi-step
//! reasoning engine. This crate has **no I/O of its own** — it defines the
//! model every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (language model, command runner, file index)
//! is a trait here. Implementations live in their respective crates. This
//! enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted mock collaborators
//! - Clean dependency graph (all crates depend inward on core)

pub mod binding;
pub mod chain;
pub mod collaborator;
pub mod error;
pub mod event;
pub mod message;
pub mod planner;
pub mod provider;
pub mod text;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use chain::{
    AbortInfo, ChainId, ChainState, FinalAnswer, PlannedStep, ReasoningChain, ReasoningStep,
    StepOutcome, StepProposal, StepStatus,
};
pub use collaborator::{CommandOutput, CommandRunner, FileSearcher, SearchQuery};
pub use error::{ChainError, Error, ErrorKind, ProviderError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, Role};
pub use planner::{PlanRequest, Planner, SynthesisRequest};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use tool::{ParamSpec, ParamType, ToolKind, ToolRegistry, ToolSchema, ValidatedCall};
