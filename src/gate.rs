//! One gate invocation: classify, consult the cache, dispatch what is left,
//! evaluate policy, write the cache back.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::analysis::{AnalysisRegistry, Deadline, Dispatcher, Task, TaskOutcome};
use crate::cache::{CacheBackend, CacheStore, JsonFileBackend, MemoryBackend};
use crate::change::{ChangeClassifier, ChangeSource, ChangedFile, GitWorkTree};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::eval::{Decision, FileOutcome, GateDecision, PolicyEvaluator, ReportedFinding};
use crate::finding::Finding;
use crate::reminder::ReminderThrottle;
use crate::rules::RuleMatcher;

const SECS_PER_DAY: u64 = 86_400;

/// An analysis that did not complete for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisFailure {
    pub path: String,
    pub analysis: String,
    pub reason: String,
}

/// Everything the calling workflow needs to act on and display.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    #[serde(flatten)]
    pub decision: GateDecision,
    pub findings: Vec<ReportedFinding>,
    pub failures: Vec<AnalysisFailure>,
    /// Oversized files skipped by automatic analysis.
    pub manual_review: Vec<String>,
    pub files: usize,
    pub cache_hits: usize,
    /// Files sent to analysis this run.
    pub dispatched: Vec<String>,
    pub cache_warnings: Vec<String>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reminder: Option<String>,
}

impl GateReport {
    /// Some check did not complete; "no findings" does not mean "checked".
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn decision(&self) -> Decision {
        self.decision.decision
    }
}

/// Options the caller can set per invocation.
#[derive(Debug, Clone, Default)]
pub struct GateOptions {
    pub role: Option<String>,
    /// Skip the durable cache entirely.
    pub no_cache: bool,
    /// Drop every cached entry before running.
    pub clear_cache: bool,
}

pub struct Gate {
    config: Config,
    rules: RuleMatcher,
    evaluator: PolicyEvaluator,
    registry: AnalysisRegistry,
    cache: CacheStore,
    backend: Box<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    reminders: ReminderThrottle,
}

impl Gate {
    /// Compile rules and policy from `config` and read the cache through
    /// `backend`. Configuration errors surface here, before any analysis.
    pub fn new(
        config: Config,
        registry: AnalysisRegistry,
        backend: Box<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        role: Option<&str>,
    ) -> Result<Self> {
        let rules = RuleMatcher::new(&config.rules)?;
        let evaluator = PolicyEvaluator::from_config(&config, role)?;
        let cache = CacheStore::open(backend.as_ref());
        let reminders = ReminderThrottle::new(
            clock.clone(),
            config.notifications.interval_secs,
            config.notifications.enabled,
        );
        Ok(Self {
            config,
            rules,
            evaluator,
            registry,
            cache,
            backend,
            clock,
            reminders,
        })
    }

    /// A gate for a git working tree: command analyses from configuration and
    /// the JSON cache under the git directory (or `cache.dir`).
    pub fn for_worktree(tree: &GitWorkTree, config: Config, options: &GateOptions) -> Result<Self> {
        let registry = AnalysisRegistry::from_config(&config, tree.root())?;
        let backend: Box<dyn CacheBackend> = if options.no_cache || !config.cache.enabled {
            Box::new(MemoryBackend::new())
        } else {
            let dir: PathBuf = config
                .cache_dir()
                .unwrap_or_else(|| tree.git_dir().join("change-gate"));
            Box::new(JsonFileBackend::in_dir(&dir))
        };
        let gate = Self::new(
            config,
            registry,
            backend,
            Arc::new(SystemClock),
            options.role.as_deref(),
        )?;
        if options.clear_cache {
            gate.cache.invalidate_all();
        }
        Ok(gate)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn reset_reminders(&mut self) {
        self.reminders.reset();
    }

    /// Classify the pending changes of `source` and run the gate on them.
    pub fn check(&mut self, source: &dyn ChangeSource) -> Result<GateReport> {
        let files = ChangeClassifier::new(self.config.settings.max_lines).classify(source)?;
        Ok(self.run(&files))
    }

    /// Run the gate over already classified files.
    pub fn run(&mut self, files: &[ChangedFile]) -> GateReport {
        let deadline = Deadline::after(Duration::from_secs(self.config.settings.timeout_secs));
        let now = self.clock.now_secs();

        let mut cache_warnings = Vec::new();
        if let Some(why) = self.cache.unavailable() {
            cache_warnings.push(format!("{why}; all files analyzed"));
        }

        let mut outcomes: Vec<FileOutcome> = Vec::with_capacity(files.len());
        let mut required_by_path: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        let mut manual_review = Vec::new();
        let mut tasks = Vec::new();
        let mut cache_hits = 0;

        for file in files {
            let matched = self.rules.matched(&file.path);
            let mut required: BTreeSet<String> =
                self.config.analyses.default.iter().cloned().collect();
            for rule in &matched {
                required.extend(rule.required.iter().cloned());
            }
            let mut outcome = FileOutcome {
                path: file.path.clone(),
                rules: matched.into_iter().cloned().collect(),
                oversized: file.oversized,
                ..FileOutcome::default()
            };

            if file.oversized {
                manual_review.push(file.path.clone());
            } else if !required.is_empty() {
                match self.cache.lookup(&file.path, &file.fingerprint, &required) {
                    Some(entry) => {
                        cache_hits += 1;
                        // Entries may cover analyses that are no longer required.
                        outcome.completed = entry
                            .analyses
                            .intersection(&required)
                            .cloned()
                            .collect();
                        outcome.findings = entry
                            .findings
                            .into_iter()
                            .filter(|f| required.contains(&f.analysis))
                            .collect();
                    }
                    None => {
                        tasks.extend(required.iter().map(|analysis| Task {
                            file,
                            analysis: analysis.clone(),
                        }));
                        required_by_path.insert(&file.path, required);
                    }
                }
            }
            outcomes.push(outcome);
        }

        let dispatched: Vec<String> = required_by_path.keys().map(|p| p.to_string()).collect();
        log::info!(
            "{} file(s): {cache_hits} cached, {} to analyze, {} oversized",
            files.len(),
            dispatched.len(),
            manual_review.len()
        );

        let results = Dispatcher::new(&self.registry, self.config.settings.workers)
            .dispatch(tasks, &deadline);

        // Fold task results back into per-file outcomes. Failures are kept.
        let mut fresh: BTreeMap<String, (Vec<Finding>, BTreeSet<String>, bool)> = BTreeMap::new();
        let mut failures = Vec::new();
        for result in results {
            let slot = fresh
                .entry(result.path.clone())
                .or_insert_with(|| (Vec::new(), BTreeSet::new(), true));
            match result.outcome {
                TaskOutcome::Completed(findings) => {
                    slot.0.extend(findings);
                    slot.1.insert(result.analysis);
                }
                TaskOutcome::Failed(error) => {
                    slot.2 = false;
                    failures.push(AnalysisFailure {
                        path: result.path,
                        analysis: result.analysis,
                        reason: error.to_string(),
                    });
                }
            }
        }

        for file in files {
            let Some((findings, completed, all_ok)) = fresh.remove(&file.path) else {
                continue;
            };
            if all_ok && let Some(required) = required_by_path.get(file.path.as_str()) {
                self.cache.put(
                    &file.path,
                    &file.fingerprint,
                    required.clone(),
                    findings.clone(),
                    now,
                );
            }
            if let Some(outcome) = outcomes.iter_mut().find(|o| o.path == file.path) {
                outcome.findings = findings;
                outcome.completed = completed;
            }
        }

        let keep: BTreeSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
        self.cache
            .evict_stale(&keep, now, self.config.cache.max_age_days * SECS_PER_DAY);
        if let Err(e) = self.cache.persist(self.backend.as_ref()) {
            log::warn!("could not save cache to {}: {e}", self.backend.describe());
            cache_warnings.push(format!("could not save cache: {e}"));
        }

        let evaluation = self.evaluator.evaluate(&outcomes);
        let degraded = !failures.is_empty();
        let reminder = self.reminder(&evaluation.findings, degraded, manual_review.len());

        log::info!(
            "decision {}{}: {}",
            evaluation.decision.decision.label(),
            if degraded { " (degraded)" } else { "" },
            evaluation.decision.reason
        );

        GateReport {
            decision: evaluation.decision,
            findings: evaluation.findings,
            failures,
            manual_review,
            files: files.len(),
            cache_hits,
            dispatched,
            cache_warnings,
            degraded,
            reminder,
        }
    }

    fn reminder(
        &mut self,
        findings: &[ReportedFinding],
        degraded: bool,
        manual: usize,
    ) -> Option<String> {
        let message = if degraded {
            "some checks did not complete; rerun change-gate before merging".to_string()
        } else if manual > 0 {
            format!("{manual} file(s) are too large for automatic analysis; review them by hand")
        } else if !findings.is_empty() {
            format!("{} finding(s) reported; review them before merging", findings.len())
        } else {
            return None;
        };
        self.reminders.try_notify().then_some(message)
    }
}
