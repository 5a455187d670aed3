//! change-gate: decides which checks run on pending version-control changes,
//! whether their findings block an operation such as a push, and how results
//! are reused across invocations.
//!
//! The gate produces one of three decisions: [`eval::Decision::Allow`],
//! [`eval::Decision::Warn`], or [`eval::Decision::Block`]. Changed files are
//! classified from the working tree, matched against path rules, looked up in
//! a content-addressed cache, and only the misses are sent to the configured
//! analyses. Analyses themselves are opaque collaborators.
//!
//! # Architecture
//!
//! - **[`change`]**: Change classification: git status/diff, fingerprints, oversized files.
//! - **[`rules`]**: Path rules compiled into glob sets, one pass per file.
//! - **[`cache`]**: Incremental cache keyed by path + fingerprint, durable backends.
//! - **[`analysis`]**: Analysis trait, external command analyses, concurrent dispatcher.
//! - **[`eval`]**: Policy evaluation: modes, severity actions, scopes, exemptions.
//! - **[`gate`]**: One invocation end to end, producing a [`gate::GateReport`].
//! - **[`config`]**: Configuration loading: embedded defaults + project overlay merge.
//! - **[`logging`]**: File logging and the decision log under `~/.local/share/change-gate/`.

/// Analysis trait, command analyses and the task dispatcher.
pub mod analysis;
/// Content-addressed result cache.
pub mod cache;
/// Changed-file classification from a git working tree.
pub mod change;
/// Injectable wall clock.
pub mod clock;
/// Configuration types, loading, and overlay merge logic.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Policy evaluation engine: modes, actions, decision.
pub mod eval;
/// Findings and severities.
pub mod finding;
/// Invocation orchestration and report.
pub mod gate;
/// File-based logging.
pub mod logging;
/// Rate-limited reminders.
pub mod reminder;
/// Path rule compilation and matching.
pub mod rules;

use std::path::Path;

use error::Result;
use gate::{Gate, GateOptions, GateReport};

/// Discover the repository at `path`, load its configuration and run the gate.
///
/// This is the main entry point for the CLI and simple usage. For custom
/// analyses or cache backends, build a [`Gate`] directly.
pub fn check_worktree(
    path: &Path,
    config_path: Option<&Path>,
    options: &GateOptions,
) -> Result<GateReport> {
    let tree = change::GitWorkTree::discover(path)?;
    let config = config::Config::load(change::ChangeSource::root(&tree), config_path)?;
    let mut gate = Gate::for_worktree(&tree, config, options)?;
    gate.check(&tree)
}
