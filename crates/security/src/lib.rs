//! Security policy for Merlin — what a reasoning step may touch.
//!
//! Provides:
//! - **Command policy**: allow-listed commands, denied patterns, approved directories
//! - **Path validation**: confining searches and file operations to approved roots
//! - **Audit logging**: structured record of every policy decision

pub mod audit;
pub mod command;
pub mod path;

pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditOutcome, AuditSink, TracingSink};
pub use command::{CommandPolicy, PolicyDecision, PolicyError};
pub use path::{PathValidationError, expand_tilde, normalize, validate_path};
