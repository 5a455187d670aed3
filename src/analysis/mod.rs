//! Analyses and their concurrent dispatch.
//!
//! An [`Analysis`] is an opaque collaborator: it receives one changed file and
//! its diff and returns findings. The gate never looks inside.

/// External-command analyses configured in TOML.
pub mod command;
/// Fan-out/fan-in execution of analysis tasks.
pub mod dispatch;

pub use command::CommandAnalysis;
pub use dispatch::{Dispatcher, Task, TaskOutcome, TaskResult};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::change::ChangedFile;
use crate::config::Config;
use crate::error::{AnalysisError, Result};
use crate::finding::Finding;

/// Invocation-wide time limit. Analyses must check it cooperatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// The earlier of this deadline and `limit` from now.
    pub fn capped(&self, limit: Option<Duration>) -> Self {
        match limit {
            Some(limit) => Self {
                at: self.at.min(Instant::now() + limit),
            },
            None => *self,
        }
    }
}

/// One check run against one file.
///
/// Implementations must be safe to call concurrently and must not mutate
/// shared state.
pub trait Analysis: Send + Sync {
    fn name(&self) -> &str;

    /// Analyze `diff` (the file's change content). Return promptly with
    /// [`AnalysisError::Timeout`] once `deadline` has passed.
    fn analyze(
        &self,
        file: &ChangedFile,
        diff: &str,
        deadline: &Deadline,
    ) -> std::result::Result<Vec<Finding>, AnalysisError>;
}

/// Analyses available to this invocation, keyed by name.
#[derive(Default, Clone)]
pub struct AnalysisRegistry {
    analyses: HashMap<String, Arc<dyn Analysis>>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from `[analyses.commands]`. Commands run in `root`.
    pub fn from_config(config: &Config, root: &Path) -> Result<Self> {
        let mut registry = Self::new();
        for (name, cmd) in &config.analyses.commands {
            registry.register(Arc::new(CommandAnalysis::from_config(name, cmd, root)?));
        }
        Ok(registry)
    }

    /// Add or replace an analysis under its own name.
    pub fn register(&mut self, analysis: Arc<dyn Analysis>) {
        self.analyses.insert(analysis.name().to_string(), analysis);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Analysis>> {
        self.analyses.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.analyses.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Analysis for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn analyze(
            &self,
            _: &ChangedFile,
            _: &str,
            _: &Deadline,
        ) -> std::result::Result<Vec<Finding>, AnalysisError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn deadline_caps_to_earlier() {
        let long = Deadline::after(Duration::from_secs(60));
        let short = long.capped(Some(Duration::from_millis(10)));
        assert!(short.remaining() <= Duration::from_millis(10));
        assert_eq!(long.capped(None), long);
    }

    #[test]
    fn past_deadline_is_expired() {
        let d = Deadline::after(Duration::ZERO);
        assert!(d.expired());
        assert_eq!(d.remaining(), Duration::ZERO);
    }

    #[test]
    fn registry_registers_by_name() {
        let mut registry = AnalysisRegistry::new();
        registry.register(Arc::new(Named("security")));
        registry.register(Arc::new(Named("bugs")));
        assert_eq!(registry.names(), vec!["bugs", "security"]);
        assert!(registry.get("style").is_none());
    }

    #[test]
    fn registry_from_config_builds_commands() {
        let config = Config::from_overlay_str(
            r#"
            [analyses.commands.security]
            command = "scan --json"
        "#,
        )
        .unwrap();
        let registry = AnalysisRegistry::from_config(&config, Path::new(".")).unwrap();
        assert_eq!(registry.names(), vec!["security"]);
    }
}
