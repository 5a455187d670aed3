//! Policy evaluation: merged findings in, one [`GateDecision`] out.

pub mod decision;
pub mod policy;

pub use decision::{Decision, GateDecision};
pub use policy::{Action, ActionTable, EffectivePolicy, Mode, Policy};

use std::cmp::Reverse;
use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::{Config, PathRule};
use crate::error::Result;
use crate::finding::{Finding, merge_order};
use crate::rules::{PathSet, RuleHits};

/// Everything known about one changed file once analysis is over.
#[derive(Debug, Clone, Default)]
pub struct FileOutcome {
    pub path: String,
    /// Rules matching the path.
    pub rules: Vec<PathRule>,
    /// Analyses that produced a result, fresh or cached.
    pub completed: BTreeSet<String>,
    /// Findings in discovery order.
    pub findings: Vec<Finding>,
    pub oversized: bool,
}

/// A finding as reported to the caller, with the action it mapped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedFinding {
    #[serde(flatten)]
    pub finding: Finding,
    pub action: Action,
    /// Removed from consideration by an exemption; reported as info only.
    pub exempt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: GateDecision,
    /// All findings, ordered by path then severity.
    pub findings: Vec<ReportedFinding>,
}

/// Computes the gate decision from analysis outcomes.
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    policy: Policy,
    skip_paths: PathSet,
    skip_analyses: BTreeSet<String>,
    exempt_rules: BTreeSet<String>,
    default_analyses: BTreeSet<String>,
}

impl PolicyEvaluator {
    pub fn from_config(config: &Config, role: Option<&str>) -> Result<Self> {
        Ok(Self {
            policy: Policy::from_config(config, role)?,
            skip_paths: PathSet::new(&config.exemptions.skip_paths)?,
            skip_analyses: config.exemptions.skip_analyses.iter().cloned().collect(),
            exempt_rules: config.exemptions.rules.iter().cloned().collect(),
            default_analyses: config.analyses.default.iter().cloned().collect(),
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn evaluate(&self, outcomes: &[FileOutcome]) -> Evaluation {
        let mut state = Evaluating {
            evaluator: self,
            findings: Vec::new(),
            review_gaps: Vec::new(),
        };
        for outcome in outcomes {
            state.observe(outcome);
        }
        state.decide()
    }
}

/// Evaluation in progress. Consumed by [`Evaluating::decide`].
struct Evaluating<'a> {
    evaluator: &'a PolicyEvaluator,
    findings: Vec<ReportedFinding>,
    review_gaps: Vec<String>,
}

impl Evaluating<'_> {
    fn observe(&mut self, outcome: &FileOutcome) {
        let ev = self.evaluator;
        let skipped_path = ev.skip_paths.is_match(&outcome.path);
        let active_rules: Vec<&PathRule> = outcome
            .rules
            .iter()
            .filter(|r| !ev.exempt_rules.contains(&r.label))
            .collect();
        let rules_exempt = !outcome.rules.is_empty() && active_rules.is_empty();
        let file_exempt = skipped_path || rules_exempt;

        let effective = ev.policy.resolve(&outcome.path);
        for finding in &outcome.findings {
            let exempt = file_exempt || ev.skip_analyses.contains(&finding.analysis);
            let action = if exempt {
                Action::Info
            } else {
                effective.action(finding.severity)
            };
            self.findings.push(ReportedFinding {
                finding: finding.clone(),
                action,
                exempt,
            });
        }

        if skipped_path {
            return;
        }
        let hits = RuleHits::from_rules(active_rules);
        if !hits.block_without_review {
            return;
        }
        let needed: BTreeSet<&String> = if hits.required.is_empty() {
            ev.default_analyses.iter().collect()
        } else {
            hits.required.iter().collect()
        };
        let needed: Vec<&String> = needed
            .into_iter()
            .filter(|a| !ev.skip_analyses.contains(*a))
            .collect();
        let missing: Vec<&str> = needed
            .iter()
            .filter(|a| outcome.oversized || !outcome.completed.contains(**a))
            .map(|a| a.as_str())
            .collect();

        let labels = hits.labels.join(", ");
        if needed.is_empty() {
            self.review_gaps
                .push(format!("{} ({labels}): no analysis configured", outcome.path));
        } else if !missing.is_empty() {
            let why = if outcome.oversized { "oversized, " } else { "" };
            self.review_gaps.push(format!(
                "{} ({labels}): {why}missing {}",
                outcome.path,
                missing.join(", ")
            ));
        }
    }

    fn decide(mut self) -> Evaluation {
        self.findings
            .sort_by(|a, b| merge_order(&a.finding, &b.finding));

        let with_action = |action: Action| -> Vec<Finding> {
            let mut out: Vec<Finding> = self
                .findings
                .iter()
                .filter(|f| f.action == action)
                .map(|f| f.finding.clone())
                .collect();
            out.sort_by_key(|f| Reverse(f.severity));
            out
        };
        let blocking = with_action(Action::Block);
        let warning = with_action(Action::Warn);

        let decision = if !self.review_gaps.is_empty() {
            let gaps = self.review_gaps.join("; ");
            let reason = match blocking.first() {
                Some(top) => format!(
                    "blocked by {}; required review incomplete: {gaps}",
                    top.summary()
                ),
                None => format!("required review incomplete: {gaps}"),
            };
            GateDecision {
                decision: Decision::Block,
                triggering: blocking,
                reason,
            }
        } else if let Some(top) = blocking.first() {
            GateDecision {
                decision: Decision::Block,
                reason: format!(
                    "{} blocking finding(s); highest: {}",
                    blocking.len(),
                    top.summary()
                ),
                triggering: blocking,
            }
        } else if let Some(top) = warning.first() {
            GateDecision {
                decision: Decision::Warn,
                reason: format!(
                    "{} finding(s) need attention; highest: {}",
                    warning.len(),
                    top.summary()
                ),
                triggering: warning,
            }
        } else {
            GateDecision {
                decision: Decision::Allow,
                triggering: Vec::new(),
                reason: "no blocking findings".into(),
            }
        };

        log::debug!("decided {}: {}", decision.decision.label(), decision.reason);
        Evaluation {
            decision,
            findings: self.findings,
        }
    }
}
