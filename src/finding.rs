//! Findings reported by analyses.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Finding severity. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A single issue reported by one analysis for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub category: String,
    /// Repository-relative path of the file.
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
    /// Name of the analysis that produced this finding.
    pub analysis: String,
}

impl Finding {
    /// `path:line` (or just `path`).
    pub fn location(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{line}", self.file),
            None => self.file.clone(),
        }
    }

    /// One-line summary, e.g. `CRITICAL [secrets] src/a.rs:3: hardcoded key (security)`.
    pub fn summary(&self) -> String {
        format!(
            "{} [{}] {}: {} ({})",
            self.severity,
            self.category,
            self.location(),
            self.message,
            self.analysis
        )
    }
}

/// Merge order: by path, then most severe first. Used with a stable sort so
/// ties keep discovery order.
pub fn merge_order(a: &Finding, b: &Finding) -> Ordering {
    a.file.cmp(&b.file).then(b.severity.cmp(&a.severity))
}
