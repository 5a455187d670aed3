//! Path rule compilation and matching.
//!
//! Patterns are compiled once per invocation into a [`globset::GlobSet`], so
//! matching a file is a single pass over the set rather than one pass per rule.
//! `*` never crosses a `/`, `**` spans any number of segments, and matching is
//! case-sensitive against the whole repository-relative path.

use std::collections::BTreeSet;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::config::PathRule;
use crate::error::Result;

/// An immutable set of compiled path patterns.
#[derive(Debug, Clone)]
pub struct PathSet {
    set: GlobSet,
    patterns: Vec<String>,
}

impl PathSet {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .backslash_escape(true)
                .build()?;
            builder.add(glob);
            kept.push(pattern.to_string());
        }
        Ok(Self {
            set: builder.build()?,
            patterns: kept,
        })
    }

    pub fn empty() -> Self {
        Self {
            set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.set.is_match(path)
    }

    /// Indices of every pattern matching `path`, in declaration order.
    pub fn matching(&self, path: &str) -> Vec<usize> {
        let mut hits = self.set.matches(path);
        hits.sort_unstable();
        hits
    }

    pub fn pattern(&self, index: usize) -> &str {
        &self.patterns[index]
    }
}

/// Number of non-wildcard characters in a pattern. More literal text means a
/// more specific pattern.
pub fn specificity(pattern: &str) -> usize {
    pattern
        .chars()
        .filter(|c| !matches!(c, '*' | '?' | '[' | ']' | '{' | '}'))
        .count()
}

/// Accumulated requirements from every rule matching one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleHits {
    pub labels: Vec<String>,
    /// Union of the matched rules' required analyses.
    pub required: BTreeSet<String>,
    /// OR of the matched rules' `block_without_review` flags.
    pub block_without_review: bool,
}

impl RuleHits {
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a PathRule>) -> Self {
        let mut hits = Self::default();
        for rule in rules {
            hits.labels.push(rule.label.clone());
            hits.required.extend(rule.required.iter().cloned());
            hits.block_without_review |= rule.block_without_review;
        }
        hits
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Compiled critical-path rules.
#[derive(Debug, Clone)]
pub struct RuleMatcher {
    rules: Vec<PathRule>,
    set: PathSet,
}

impl RuleMatcher {
    /// Compile every rule's pattern. Invalid patterns are a configuration error.
    pub fn new(rules: &[PathRule]) -> Result<Self> {
        let set = PathSet::new(rules.iter().map(|r| r.pattern.as_str()))?;
        log::debug!("compiled {} path rule(s)", rules.len());
        Ok(Self {
            rules: rules.to_vec(),
            set,
        })
    }

    /// Rules matching `path`, in declaration order.
    pub fn matched(&self, path: &str) -> Vec<&PathRule> {
        self.set
            .matching(path)
            .into_iter()
            .map(|i| &self.rules[i])
            .collect()
    }

    /// Combined requirements of every rule matching `path`.
    pub fn matches(&self, path: &str) -> RuleHits {
        RuleHits::from_rules(self.matched(path))
    }

    pub fn rules(&self) -> &[PathRule] {
        &self.rules
    }
}
