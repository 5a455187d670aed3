//! Change classification: which files differ from the last commit, how, and
//! what content each one carries into analysis.

/// Git working-tree access.
pub mod git;

pub use git::GitWorkTree;

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Renamed { from: String },
    Deleted,
    Untracked,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Renamed { .. } => "renamed",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Untracked => "untracked",
        }
    }

    /// Precedence when staged and unstaged entries for one path are merged.
    fn weight(&self) -> u8 {
        match self {
            ChangeKind::Modified => 0,
            ChangeKind::Untracked => 1,
            ChangeKind::Renamed { .. } => 2,
            ChangeKind::Added => 3,
            ChangeKind::Deleted => 4,
        }
    }
}

/// One path as reported by a [`ChangeSource`], before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub path: String,
    pub kind: ChangeKind,
    /// Post-change bytes as stored on disk. `None` for deleted files.
    pub content: Option<Vec<u8>>,
    /// Diff against the baseline. `None` means the full content is the diff.
    pub diff: Option<String>,
}

/// Anything that can list the pending changes of a working tree.
pub trait ChangeSource {
    fn root(&self) -> &Path;
    fn raw_changes(&self) -> Result<Vec<RawChange>>;
}

/// A changed file, created fresh on every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangedFile {
    /// Repository-relative path with forward slashes.
    pub path: String,
    pub kind: ChangeKind,
    /// SHA-256 of the post-change content.
    pub fingerprint: String,
    pub lines: usize,
    /// Lower-cased extension, or `unknown`.
    pub language: String,
    #[serde(skip)]
    pub diff: String,
    /// Too large for automatic analysis; flagged for manual review.
    pub oversized: bool,
}

/// Hex SHA-256 of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Lines in `bytes`, counting a trailing line without a newline.
fn line_count(bytes: &[u8]) -> usize {
    let newlines = bytes.iter().filter(|&&b| b == b'\n').count();
    match bytes.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

fn language_of(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => "unknown".into(),
    }
}

/// Turns raw repository changes into [`ChangedFile`]s.
#[derive(Debug, Clone)]
pub struct ChangeClassifier {
    max_lines: usize,
}

impl ChangeClassifier {
    pub fn new(max_lines: usize) -> Self {
        Self { max_lines }
    }

    /// Classify every pending change in `source`, ordered by path.
    pub fn classify(&self, source: &dyn ChangeSource) -> Result<Vec<ChangedFile>> {
        let raw = source.raw_changes()?;
        let files = self.classify_raw(raw);
        log::info!(
            "{} changed file(s) in {}",
            files.len(),
            source.root().display()
        );
        Ok(files)
    }

    /// Merge duplicate paths, fingerprint contents and flag oversized files.
    pub fn classify_raw(&self, raw: Vec<RawChange>) -> Vec<ChangedFile> {
        let mut merged: BTreeMap<String, RawChange> = BTreeMap::new();
        for change in raw {
            match merged.get_mut(&change.path) {
                Some(existing) => merge_into(existing, change),
                None => {
                    merged.insert(change.path.clone(), change);
                }
            }
        }

        merged
            .into_values()
            .map(|change| self.to_changed_file(change))
            .collect()
    }

    fn to_changed_file(&self, change: RawChange) -> ChangedFile {
        let (fp, lines) = match (&change.kind, &change.content) {
            (ChangeKind::Deleted, _) | (_, None) => {
                (format!("deleted:{}", fingerprint(b"")), 0)
            }
            (_, Some(content)) => (fingerprint(content), line_count(content)),
        };
        let oversized = lines > self.max_lines;
        if oversized {
            log::warn!(
                "{} has {lines} lines (limit {}), flagged for manual review",
                change.path,
                self.max_lines
            );
        }
        let diff = change
            .diff
            .or_else(|| {
                change
                    .content
                    .as_deref()
                    .map(|c| String::from_utf8_lossy(c).into_owned())
            })
            .unwrap_or_default();
        ChangedFile {
            language: language_of(&change.path),
            path: change.path,
            kind: change.kind,
            fingerprint: fp,
            lines,
            diff,
            oversized,
        }
    }
}

/// Staged and unstaged entries for one path become one logical change.
fn merge_into(existing: &mut RawChange, other: RawChange) {
    if other.kind.weight() > existing.kind.weight() {
        existing.kind = other.kind;
    }
    if existing.kind == ChangeKind::Deleted {
        existing.content = None;
    } else if other.content.is_some() {
        existing.content = other.content;
    }
    existing.diff = match (existing.diff.take(), other.diff) {
        (Some(a), Some(b)) if a == b => Some(a),
        (Some(a), Some(b)) => Some(format!("{a}\n{b}")),
        (a, b) => a.or(b),
    };
}
