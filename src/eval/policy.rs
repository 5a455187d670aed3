//! Enforcement modes, severity actions and scope resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{Config, ScopeConfig, parse_overrides};
use crate::error::Result;
use crate::finding::Severity;
use crate::rules::{PathSet, specificity};

/// Global enforcement stance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Strict,
    #[default]
    Hybrid,
    Advisory,
    Educational,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Strict => "strict",
            Mode::Hybrid => "hybrid",
            Mode::Advisory => "advisory",
            Mode::Educational => "educational",
        }
    }

    /// Built-in action for `severity` in this mode.
    pub fn default_action(self, severity: Severity) -> Action {
        use Severity::*;
        match (self, severity) {
            (Mode::Strict, Critical | High) => Action::Block,
            (Mode::Strict, Medium) => Action::Warn,
            (Mode::Hybrid, Critical) => Action::Block,
            (Mode::Hybrid, High | Medium) => Action::Warn,
            (Mode::Advisory, Critical | High | Medium) => Action::Warn,
            (Mode::Educational, Critical | High | Medium | Low) => Action::Warn,
            _ => Action::Info,
        }
    }
}

/// What a finding of a given severity does to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Info,
    Warn,
    Block,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Info => "info",
            Action::Warn => "warn",
            Action::Block => "block",
        }
    }
}

/// Severity → action mapping for one mode plus explicit overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTable {
    pub mode: Mode,
    pub overrides: BTreeMap<Severity, Action>,
}

impl ActionTable {
    pub fn new(mode: Mode, overrides: BTreeMap<Severity, Action>) -> Self {
        Self { mode, overrides }
    }

    pub fn action(&self, severity: Severity) -> Action {
        self.overrides
            .get(&severity)
            .copied()
            .unwrap_or_else(|| self.mode.default_action(severity))
    }
}

#[derive(Debug, Clone)]
struct Scope {
    name: String,
    paths: PathSet,
    roles: Vec<String>,
    mode: Option<Mode>,
    overrides: BTreeMap<Severity, Action>,
}

/// The resolved policy for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePolicy<'a> {
    pub scope: Option<&'a str>,
    pub mode: Mode,
    global: &'a ActionTable,
    scope_overrides: Option<&'a BTreeMap<Severity, Action>>,
    scope_mode: Option<Mode>,
}

impl EffectivePolicy<'_> {
    /// Scope overrides, then scope mode defaults, then global overrides,
    /// then global mode defaults.
    pub fn action(&self, severity: Severity) -> Action {
        if let Some(action) = self.scope_overrides.and_then(|o| o.get(&severity)) {
            return *action;
        }
        match self.scope_mode {
            Some(mode) => mode.default_action(severity),
            None => self.global.action(severity),
        }
    }
}

/// Global action table plus scopes, compiled once per invocation.
#[derive(Debug, Clone)]
pub struct Policy {
    global: ActionTable,
    scopes: Vec<Scope>,
    role: Option<String>,
}

impl Policy {
    pub fn from_config(config: &Config, role: Option<&str>) -> Result<Self> {
        let global = ActionTable::new(config.settings.mode, config.severity_overrides()?);
        let scopes = config
            .scopes
            .iter()
            .map(compile_scope)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            global,
            scopes,
            role: role.map(String::from),
        })
    }

    pub fn global(&self) -> &ActionTable {
        &self.global
    }

    /// Resolve scopes for `path`. The most specific matching scope wins; a
    /// scope without paths has specificity zero. Ties go to the first declared.
    pub fn resolve(&self, path: &str) -> EffectivePolicy<'_> {
        let mut best: Option<(usize, &Scope)> = None;
        for scope in &self.scopes {
            if !scope.roles.is_empty()
                && !self
                    .role
                    .as_ref()
                    .is_some_and(|role| scope.roles.contains(role))
            {
                continue;
            }
            let score = if scope.paths.is_empty() {
                Some(0)
            } else {
                scope
                    .paths
                    .matching(path)
                    .into_iter()
                    .map(|i| specificity(scope.paths.pattern(i)))
                    .max()
            };
            if let Some(score) = score
                && best.is_none_or(|(s, _)| score > s)
            {
                best = Some((score, scope));
            }
        }

        match best {
            Some((_, scope)) => EffectivePolicy {
                scope: Some(&scope.name),
                mode: scope.mode.unwrap_or(self.global.mode),
                global: &self.global,
                scope_overrides: Some(&scope.overrides),
                scope_mode: scope.mode,
            },
            None => EffectivePolicy {
                scope: None,
                mode: self.global.mode,
                global: &self.global,
                scope_overrides: None,
                scope_mode: None,
            },
        }
    }
}

fn compile_scope(scope: &ScopeConfig) -> Result<Scope> {
    Ok(Scope {
        name: scope.name.clone(),
        paths: PathSet::new(&scope.paths)?,
        roles: scope.roles.clone(),
        mode: scope.mode,
        overrides: parse_overrides(&scope.overrides)?,
    })
}
