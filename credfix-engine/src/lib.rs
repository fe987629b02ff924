//! Credfix engine - diagnose and repair Docker credential helpers
//!
//! A scan runs platform detection, the OS probe set and the Docker checks
//! concurrently, folds their findings into deduplicated issues, maps fixable
//! issues to fix actions and applies them behind a backup and consent gate.
//!
//! Entry points:
//! - [`doctor::session::Scanner`] for a read-only quick scan
//! - [`repair::CredentialRepairer`] to analyze results and execute fixes
//! - [`doctor::Doctor`] for the full scan, consent, fix and verify loop

pub mod consent;
pub mod context;
pub mod diff;
pub mod docker;
pub mod docker_config;
pub mod doctor;
pub mod execution;
pub mod model;
pub mod platform;
pub mod probes;
pub mod repair;
pub mod settings;

#[cfg(test)]
mod testing;

pub use context::ProbeContext;
pub use model::{Issue, IssueType, Severity};
pub use settings::Settings;
