use std::path::{Path, PathBuf};
use std::process::Command;

use crate::change::{ChangeKind, ChangeSource, RawChange};
use crate::error::{GateError, Result};

/// A git working tree, discovered from any path inside it.
#[derive(Debug, Clone)]
pub struct GitWorkTree {
    root: PathBuf,
    git_dir: PathBuf,
}

impl GitWorkTree {
    /// Locate the repository containing `path`.
    pub fn discover(path: &Path) -> Result<Self> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel", "--absolute-git-dir"])
            .current_dir(path)
            .output()?;

        if !output.status.success() {
            log::debug!(
                "rev-parse in {} failed: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(GateError::NotAVersionedTree(path.to_path_buf()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        let (Some(root), Some(git_dir)) = (lines.next(), lines.next()) else {
            return Err(GateError::NotAVersionedTree(path.to_path_buf()));
        };

        Ok(Self {
            root: PathBuf::from(root.trim()),
            git_dir: PathBuf::from(git_dir.trim()),
        })
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()?;

        if !output.status.success() {
            return Err(GateError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn has_head(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", "HEAD"])
            .current_dir(&self.root)
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn read_content(&self, path: &str) -> Option<Vec<u8>> {
        match std::fs::read(self.root.join(path)) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("cannot read {path}: {e}");
                None
            }
        }
    }
}

impl ChangeSource for GitWorkTree {
    fn root(&self) -> &Path {
        &self.root
    }

    fn raw_changes(&self) -> Result<Vec<RawChange>> {
        let status = self.git(&["status", "--porcelain=v1", "-z", "--untracked-files=all"])?;
        let entries = parse_status(&status);
        let has_head = self.has_head();

        let mut changes = Vec::with_capacity(entries.len());
        for entry in entries {
            let kind = if has_head {
                entry.kind
            } else {
                // Without a baseline commit every surviving file is new.
                match entry.kind {
                    ChangeKind::Deleted => continue,
                    ChangeKind::Untracked => ChangeKind::Untracked,
                    _ => ChangeKind::Added,
                }
            };

            let content = match kind {
                ChangeKind::Deleted => None,
                _ => match self.read_content(&entry.path) {
                    Some(c) => Some(c),
                    None => continue,
                },
            };

            let diff = match &kind {
                ChangeKind::Modified | ChangeKind::Deleted => {
                    Some(self.git(&["diff", "HEAD", "-M", "--", &entry.path])?)
                }
                ChangeKind::Renamed { from } => {
                    Some(self.git(&["diff", "HEAD", "-M", "--", from, &entry.path])?)
                }
                ChangeKind::Added | ChangeKind::Untracked => None,
            };

            changes.push(RawChange {
                path: entry.path,
                kind,
                content,
                diff,
            });
        }
        Ok(changes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusEntry {
    pub path: String,
    pub kind: ChangeKind,
}

/// Parse `git status --porcelain=v1 -z`. Rename and copy entries are followed
/// by an extra NUL-separated field holding the source path.
pub(crate) fn parse_status(raw: &str) -> Vec<StatusEntry> {
    let mut fields = raw.split('\0').filter(|f| !f.is_empty());
    let mut entries = Vec::new();

    while let Some(field) = fields.next() {
        if field.len() < 4 {
            continue;
        }
        let (xy, path) = field.split_at(2);
        let path = path[1..].to_string();
        let mut chars = xy.chars();
        let (x, y) = (chars.next().unwrap_or(' '), chars.next().unwrap_or(' '));

        let kind = match (x, y) {
            ('?', '?') => ChangeKind::Untracked,
            ('!', '!') => continue,
            ('R', _) | ('C', _) => {
                let from = fields.next().unwrap_or_default().to_string();
                if x == 'C' {
                    ChangeKind::Added
                } else {
                    ChangeKind::Renamed { from }
                }
            }
            ('D', _) | (_, 'D') => ChangeKind::Deleted,
            ('A', _) => ChangeKind::Added,
            _ => ChangeKind::Modified,
        };
        entries.push(StatusEntry { path, kind });
    }
    entries
}
