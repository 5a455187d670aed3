use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};
use crate::eval::{Action, Mode};
use crate::finding::Severity;

/// Embedded default configuration.
const DEFAULT_CONFIG: &str = include_str!("../config.default.toml");

/// Project configuration file, looked up at the repository root.
pub const PROJECT_CONFIG_FILE: &str = ".change-gate.toml";

// ── Final (merged) config types ──

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub severity: SeverityConfig,
    #[serde(default)]
    pub analyses: AnalysesConfig,
    #[serde(default)]
    pub exemptions: Exemptions,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Critical path rules.
    #[serde(default)]
    pub rules: Vec<PathRule>,
    /// Path- or role-selected policy overrides.
    #[serde(default)]
    pub scopes: Vec<ScopeConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 0 means available parallelism.
    #[serde(default)]
    pub workers: usize,
}

fn default_max_lines() -> usize {
    5000
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            max_lines: default_max_lines(),
            timeout_secs: default_timeout_secs(),
            workers: 0,
        }
    }
}

/// Severity → action overrides, keyed by severity label (`CRITICAL`, `HIGH`, ...).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SeverityConfig {
    #[serde(default)]
    pub overrides: BTreeMap<String, Action>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AnalysesConfig {
    /// Analyses required for every changed file.
    #[serde(default)]
    pub default: Vec<String>,
    /// External analysis commands keyed by analysis name.
    #[serde(default)]
    pub commands: BTreeMap<String, AnalysisCommand>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AnalysisCommand {
    /// Command line, split with shell quoting rules. The program path is
    /// tilde/env expanded.
    pub command: String,
    /// Per-analysis limit; the invocation deadline still applies.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Paths, analyses and rules removed from policy consideration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Exemptions {
    #[serde(default)]
    pub skip_paths: Vec<String>,
    #[serde(default)]
    pub skip_analyses: Vec<String>,
    /// Rule labels whose matches do not block.
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_age_days() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_days: default_max_age_days(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    3600
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
        }
    }
}

/// A critical-path rule.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PathRule {
    /// `*` matches within one path segment, `**` any number of segments.
    pub pattern: String,
    pub label: String,
    /// Analyses that must run on matching files.
    #[serde(default)]
    pub required: Vec<String>,
    /// Block unless every required analysis completed.
    #[serde(default)]
    pub block_without_review: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScopeConfig {
    pub name: String,
    /// Path patterns this scope applies to. Empty: every path.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Roles this scope applies to. Empty: every role.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub overrides: BTreeMap<String, Action>,
}

// ── Overlay types (project config that merges with defaults) ──

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigOverlay {
    #[serde(default)]
    settings: SettingsOverlay,
    #[serde(default)]
    severity: SeverityOverlay,
    #[serde(default)]
    analyses: AnalysesOverlay,
    #[serde(default)]
    exemptions: ExemptionsOverlay,
    #[serde(default)]
    cache: CacheOverlay,
    #[serde(default)]
    notifications: NotificationsOverlay,
    #[serde(default)]
    rules: Vec<PathRule>,
    #[serde(default)]
    remove_rules: Vec<String>,
    #[serde(default)]
    scopes: Vec<ScopeConfig>,
    #[serde(default)]
    remove_scopes: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SettingsOverlay {
    mode: Option<Mode>,
    max_lines: Option<usize>,
    timeout_secs: Option<u64>,
    workers: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SeverityOverlay {
    #[serde(default)]
    replace: bool,
    #[serde(default)]
    overrides: BTreeMap<String, Action>,
    #[serde(default)]
    remove_overrides: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AnalysesOverlay {
    #[serde(default)]
    replace: bool,
    #[serde(default)]
    default: Vec<String>,
    #[serde(default)]
    remove_default: Vec<String>,
    #[serde(default)]
    commands: BTreeMap<String, AnalysisCommand>,
    #[serde(default)]
    remove_commands: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ExemptionsOverlay {
    #[serde(default)]
    replace: bool,
    #[serde(default)]
    skip_paths: Vec<String>,
    #[serde(default)]
    skip_analyses: Vec<String>,
    #[serde(default)]
    rules: Vec<String>,
    #[serde(default)]
    remove_skip_paths: Vec<String>,
    #[serde(default)]
    remove_skip_analyses: Vec<String>,
    #[serde(default)]
    remove_rules: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CacheOverlay {
    enabled: Option<bool>,
    max_age_days: Option<u64>,
    dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct NotificationsOverlay {
    enabled: Option<bool>,
    interval_secs: Option<u64>,
}

// ── Merge logic ──

/// Merge an overlay list into a default list.
/// In replace mode: overlay list replaces default entirely.
/// In merge mode: remove items first, then extend with additions (deduped).
fn merge_list(base: &mut Vec<String>, add: Vec<String>, remove: &[String], replace: bool) {
    if replace {
        *base = add;
    } else {
        base.retain(|item| !remove.contains(item));
        for item in add {
            if !base.contains(&item) {
                base.push(item);
            }
        }
    }
}

/// Same as [`merge_list`] for keyed maps: overlay keys override.
fn merge_map<V>(
    base: &mut BTreeMap<String, V>,
    add: BTreeMap<String, V>,
    remove: &[String],
    replace: bool,
) {
    if replace {
        *base = add;
    } else {
        base.retain(|key, _| !remove.contains(key));
        base.extend(add);
    }
}

/// Merge labelled entries. Removals apply first, then every inherited entry
/// sharing a key with an added entry is replaced. Added entries never replace
/// each other, so two overlay rules may share a label.
fn merge_keyed<T>(base: &mut Vec<T>, add: Vec<T>, remove: &[String], key: impl Fn(&T) -> &str) {
    let replaced: Vec<String> = add.iter().map(|item| key(item).to_string()).collect();
    base.retain(|item| {
        let k = key(item);
        !remove.iter().any(|r| r == k) && !replaced.iter().any(|r| r == k)
    });
    base.extend(add);
}

impl Config {
    /// Load the default embedded configuration.
    pub fn default_config() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("embedded default config must parse")
    }

    /// Load configuration with resolution order:
    /// 1. Start with embedded defaults
    /// 2. Merge the overlay from `explicit`, or `<repo_root>/.change-gate.toml`
    ///
    /// A missing project file yields the defaults. A missing explicit file, or
    /// any file that fails to parse or validate, is [`GateError::ConfigInvalid`].
    pub fn load(repo_root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let path: PathBuf = match explicit {
            Some(p) => {
                if !p.is_file() {
                    return Err(GateError::ConfigInvalid(format!(
                        "config file not found: {}",
                        p.display()
                    )));
                }
                p.to_path_buf()
            }
            None => repo_root.join(PROJECT_CONFIG_FILE),
        };

        if !path.is_file() {
            log::debug!("no {} at {}, using defaults", PROJECT_CONFIG_FILE, path.display());
            let config = Self::default_config();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path)?;
        log::debug!("loading config overlay from {}", path.display());
        Self::from_overlay_str(&content)
            .map_err(|e| GateError::ConfigInvalid(format!("{}: {e}", path.display())))
    }

    /// Defaults merged with an overlay given as TOML text, then validated.
    pub fn from_overlay_str(toml_str: &str) -> Result<Self> {
        let overlay: ConfigOverlay = toml::from_str(toml_str)?;
        let mut config = Self::default_config();
        config.apply_overlay(overlay);
        config.validate()?;
        Ok(config)
    }

    /// Apply an overlay on top of this config (merge semantics).
    fn apply_overlay(&mut self, overlay: ConfigOverlay) {
        // Settings: scalar overrides
        let s = overlay.settings;
        if let Some(v) = s.mode {
            self.settings.mode = v;
        }
        if let Some(v) = s.max_lines {
            self.settings.max_lines = v;
        }
        if let Some(v) = s.timeout_secs {
            self.settings.timeout_secs = v;
        }
        if let Some(v) = s.workers {
            self.settings.workers = v;
        }

        // Severity
        let sv = overlay.severity;
        merge_map(
            &mut self.severity.overrides,
            sv.overrides,
            &sv.remove_overrides,
            sv.replace,
        );

        // Analyses
        let a = overlay.analyses;
        merge_list(
            &mut self.analyses.default,
            a.default,
            &a.remove_default,
            a.replace,
        );
        merge_map(
            &mut self.analyses.commands,
            a.commands,
            &a.remove_commands,
            a.replace,
        );

        // Exemptions
        let e = overlay.exemptions;
        merge_list(
            &mut self.exemptions.skip_paths,
            e.skip_paths,
            &e.remove_skip_paths,
            e.replace,
        );
        merge_list(
            &mut self.exemptions.skip_analyses,
            e.skip_analyses,
            &e.remove_skip_analyses,
            e.replace,
        );
        merge_list(
            &mut self.exemptions.rules,
            e.rules,
            &e.remove_rules,
            e.replace,
        );

        // Cache
        let c = overlay.cache;
        if let Some(v) = c.enabled {
            self.cache.enabled = v;
        }
        if let Some(v) = c.max_age_days {
            self.cache.max_age_days = v;
        }
        if c.dir.is_some() {
            self.cache.dir = c.dir;
        }

        // Notifications
        let n = overlay.notifications;
        if let Some(v) = n.enabled {
            self.notifications.enabled = v;
        }
        if let Some(v) = n.interval_secs {
            self.notifications.interval_secs = v;
        }

        // Rules and scopes, keyed by label / name
        merge_keyed(&mut self.rules, overlay.rules, &overlay.remove_rules, |r| {
            r.label.as_str()
        });
        merge_keyed(
            &mut self.scopes,
            overlay.scopes,
            &overlay.remove_scopes,
            |s| s.name.as_str(),
        );
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        parse_overrides(&self.severity.overrides)?;
        for scope in &self.scopes {
            parse_overrides(&scope.overrides)
                .map_err(|e| GateError::ConfigInvalid(format!("scope {}: {e}", scope.name)))?;
        }
        for rule in &self.rules {
            if rule.pattern.trim().is_empty() {
                return Err(GateError::ConfigInvalid(format!(
                    "rule {} has an empty pattern",
                    rule.label
                )));
            }
        }
        for (name, cmd) in &self.analyses.commands {
            if shlex::split(&cmd.command).is_none_or(|words| words.is_empty()) {
                return Err(GateError::ConfigInvalid(format!(
                    "analysis {name}: unparsable command {:?}",
                    cmd.command
                )));
            }
        }
        if self.settings.timeout_secs == 0 {
            return Err(GateError::ConfigInvalid(
                "settings.timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Global severity overrides with parsed keys.
    pub fn severity_overrides(&self) -> Result<BTreeMap<Severity, Action>> {
        parse_overrides(&self.severity.overrides)
    }

    /// Cache directory from configuration, tilde/env expanded.
    pub fn cache_dir(&self) -> Option<PathBuf> {
        let dir = self.cache.dir.as_deref()?;
        match shellexpand::full(dir) {
            Ok(expanded) => Some(PathBuf::from(expanded.as_ref())),
            Err(e) => {
                log::warn!("cache.dir {dir:?} could not be expanded: {e}");
                Some(PathBuf::from(dir))
            }
        }
    }
}

/// Parse `{ "HIGH" = "block" }` style maps, rejecting unknown severity labels.
pub fn parse_overrides(raw: &BTreeMap<String, Action>) -> Result<BTreeMap<Severity, Action>> {
    raw.iter()
        .map(|(key, action)| {
            Severity::ALL
                .into_iter()
                .find(|s| s.label().eq_ignore_ascii_case(key))
                .map(|s| (s, *action))
                .ok_or_else(|| GateError::ConfigInvalid(format!("unknown severity {key:?}")))
        })
        .collect()
}
