//! LLM provider implementations for Merlin.
//!
//! All providers implement the `merlin_core::Provider` trait.
//! The router builds them from configuration.

pub mod fallback;
pub mod openai_compat;
pub mod router;

pub use fallback::FallbackProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use router::{ProviderRouter, build_from_config};
