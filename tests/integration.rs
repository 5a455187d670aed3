use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use change_gate::analysis::{Analysis, AnalysisRegistry, Deadline};
use change_gate::cache::{CacheBackend, CacheSnapshot, MemoryBackend};
use change_gate::change::{ChangeClassifier, ChangeKind, ChangeSource, ChangedFile, RawChange};
use change_gate::clock::ManualClock;
use change_gate::config::Config;
use change_gate::error::{AnalysisError, CacheError, GateError};
use change_gate::eval::Decision;
use change_gate::finding::{Finding, Severity};
use change_gate::gate::{Gate, GateReport};

// ── Fakes ──

/// Returns scripted findings per path and counts calls per path.
struct Scripted {
    name: &'static str,
    findings: HashMap<String, Vec<(Severity, u32)>>,
    fail_on: Vec<String>,
    hang_on: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            findings: HashMap::new(),
            fail_on: Vec::new(),
            hang_on: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn finding(mut self, path: &str, severity: Severity, line: u32) -> Self {
        self.findings
            .entry(path.to_string())
            .or_default()
            .push((severity, line));
        self
    }

    fn failing_on(mut self, path: &str) -> Self {
        self.fail_on.push(path.to_string());
        self
    }

    fn hanging_on(mut self, path: &str) -> Self {
        self.hang_on.push(path.to_string());
        self
    }

    fn calls(&self) -> Vec<String> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }
}

impl Analysis for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn analyze(
        &self,
        file: &ChangedFile,
        _diff: &str,
        deadline: &Deadline,
    ) -> Result<Vec<Finding>, AnalysisError> {
        self.calls.lock().unwrap().push(file.path.clone());
        if self.fail_on.contains(&file.path) {
            return Err(AnalysisError::Crashed("exit 101".into()));
        }
        if self.hang_on.contains(&file.path) {
            while !deadline.expired() {
                std::thread::sleep(Duration::from_millis(5));
            }
            return Err(AnalysisError::Timeout);
        }
        Ok(self
            .findings
            .get(&file.path)
            .into_iter()
            .flatten()
            .map(|(severity, line)| Finding {
                severity: *severity,
                category: "test".into(),
                file: file.path.clone(),
                line: Some(*line),
                message: format!("{severity} problem"),
                analysis: self.name.into(),
            })
            .collect())
    }
}

struct UnreadableBackend {
    saves: AtomicUsize,
}

impl CacheBackend for UnreadableBackend {
    fn load(&self) -> Result<Option<CacheSnapshot>, CacheError> {
        Err(CacheError::Version(0))
    }
    fn save(&self, _: &CacheSnapshot) -> Result<(), CacheError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn describe(&self) -> String {
        "unreadable".into()
    }
}

// ── Helpers ──

fn changed(path: &str, content: &str) -> ChangedFile {
    ChangeClassifier::new(5000)
        .classify_raw(vec![RawChange {
            path: path.into(),
            kind: ChangeKind::Modified,
            content: Some(content.as_bytes().to_vec()),
            diff: Some(format!("+{content}")),
        }])
        .remove(0)
}

fn build(toml: &str, analyses: Vec<Arc<Scripted>>, backend: Box<dyn CacheBackend>) -> Gate {
    let config = Config::from_overlay_str(toml).expect("test config must parse");
    let mut registry = AnalysisRegistry::new();
    for a in analyses {
        registry.register(a);
    }
    Gate::new(config, registry, backend, Arc::new(ManualClock::new(1_000)), None)
        .expect("gate must build")
}

fn run_once(toml: &str, analyses: Vec<Arc<Scripted>>, files: &[ChangedFile]) -> GateReport {
    build(toml, analyses, Box::new(MemoryBackend::new())).run(files)
}

const SECURITY_AND_BUGS: &str = r#"
[analyses]
default = ["security", "bugs"]
"#;

const AUTH_REVIEW: &str = r#"
[analyses]
default = ["bugs"]

[[rules]]
pattern = "**/auth/**"
label = "authentication"
required = ["security"]
block_without_review = true
"#;

/// One file, one finding of `severity` under `mode`; expect `decision`.
macro_rules! severity_test {
    ($name:ident, $mode:expr, $severity:ident, $decision:ident) => {
        #[test]
        fn $name() {
            let toml = format!("[settings]\nmode = \"{}\"\n{}", $mode, SECURITY_AND_BUGS);
            let security =
                Arc::new(Scripted::new("security").finding("src/a.rs", Severity::$severity, 7));
            let report = run_once(
                &toml,
                vec![security, Arc::new(Scripted::new("bugs"))],
                &[changed("src/a.rs", "x")],
            );
            assert_eq!(
                report.decision(),
                Decision::$decision,
                "mode {} severity {:?}: {}",
                $mode,
                Severity::$severity,
                report.decision.reason
            );
        }
    };
}

// ── Severity × mode ──

severity_test!(hybrid_critical_blocks, "hybrid", Critical, Block);
severity_test!(hybrid_high_warns, "hybrid", High, Warn);
severity_test!(hybrid_medium_warns, "hybrid", Medium, Warn);
severity_test!(hybrid_low_allows, "hybrid", Low, Allow);
severity_test!(strict_high_blocks, "strict", High, Block);
severity_test!(strict_medium_warns, "strict", Medium, Warn);
severity_test!(strict_info_allows, "strict", Info, Allow);
severity_test!(advisory_critical_warns, "advisory", Critical, Warn);
severity_test!(advisory_low_allows, "advisory", Low, Allow);
severity_test!(educational_critical_warns, "educational", Critical, Warn);
severity_test!(educational_low_warns, "educational", Low, Warn);

// ── Decisions ──

#[test]
fn no_rules_and_no_blocking_findings_allows() {
    let files: Vec<ChangedFile> = (0..5)
        .map(|i| changed(&format!("src/m{i}.rs"), "x"))
        .collect();
    let report = run_once(
        SECURITY_AND_BUGS,
        vec![
            Arc::new(Scripted::new("security").finding("src/m3.rs", Severity::Low, 1)),
            Arc::new(Scripted::new("bugs")),
        ],
        &files,
    );
    assert_eq!(report.decision(), Decision::Allow);
    assert!(!report.is_degraded());
}

#[test]
fn critical_finding_blocks_and_reason_names_it() {
    let report = run_once(
        SECURITY_AND_BUGS,
        vec![
            Arc::new(Scripted::new("security").finding("src/db.rs", Severity::Critical, 42)),
            Arc::new(Scripted::new("bugs")),
        ],
        &[changed("src/db.rs", "query"), changed("src/ui.rs", "view")],
    );
    assert_eq!(report.decision(), Decision::Block);
    assert!(report.decision.reason.contains("src/db.rs:42"), "{}", report.decision.reason);
    assert!(report.decision.reason.contains("CRITICAL"));
    assert_eq!(report.decision.triggering.len(), 1);
}

#[test]
fn empty_change_set_allows() {
    let report = run_once(SECURITY_AND_BUGS, vec![], &[]);
    assert_eq!(report.decision(), Decision::Allow);
    assert_eq!(report.files, 0);
}

#[test]
fn findings_are_merged_in_path_then_severity_order() {
    let report = run_once(
        SECURITY_AND_BUGS,
        vec![
            Arc::new(
                Scripted::new("security")
                    .finding("b.rs", Severity::Low, 1)
                    .finding("a.rs", Severity::Medium, 2),
            ),
            Arc::new(Scripted::new("bugs").finding("b.rs", Severity::High, 3)),
        ],
        &[changed("a.rs", "1"), changed("b.rs", "2")],
    );
    let order: Vec<(&str, Severity)> = report
        .findings
        .iter()
        .map(|f| (f.finding.file.as_str(), f.finding.severity))
        .collect();
    assert_eq!(
        order,
        vec![
            ("a.rs", Severity::Medium),
            ("b.rs", Severity::High),
            ("b.rs", Severity::Low),
        ]
    );
}

// ── Cache ──

#[test]
fn unchanged_files_are_not_dispatched() {
    let backend = MemoryBackend::new();
    let files: Vec<ChangedFile> = (0..20)
        .map(|i| changed(&format!("src/file{i:02}.rs"), &format!("v1-{i}")))
        .collect();

    let first = Arc::new(Scripted::new("bugs").finding("src/file05.rs", Severity::Medium, 9));
    let mut gate = build(
        "[analyses]\ndefault = [\"bugs\"]",
        vec![first.clone()],
        Box::new(backend.clone()),
    );
    let initial = gate.run(&files);
    assert_eq!(first.calls().len(), 20);
    assert_eq!(initial.dispatched.len(), 20);

    // Fresh process, same durable cache, two files edited.
    let second = Arc::new(Scripted::new("bugs"));
    let mut gate = build(
        "[analyses]\ndefault = [\"bugs\"]",
        vec![second.clone()],
        Box::new(backend.clone()),
    );
    let mut edited = files.clone();
    edited[3] = changed("src/file03.rs", "v2");
    edited[17] = changed("src/file17.rs", "v2");
    let report = gate.run(&edited);

    assert_eq!(second.calls(), vec!["src/file03.rs", "src/file17.rs"]);
    assert_eq!(report.dispatched, vec!["src/file03.rs", "src/file17.rs"]);
    assert_eq!(report.cache_hits, 18);

    // The cached finding for file05 is reused verbatim.
    let cached: Vec<&Finding> = report
        .findings
        .iter()
        .map(|f| &f.finding)
        .filter(|f| f.file == "src/file05.rs")
        .collect();
    let original: Vec<&Finding> = initial
        .findings
        .iter()
        .map(|f| &f.finding)
        .filter(|f| f.file == "src/file05.rs")
        .collect();
    assert_eq!(cached, original);
    assert_eq!(report.decision(), Decision::Warn);
}

#[test]
fn repeat_run_is_idempotent() {
    let backend = MemoryBackend::new();
    let files = vec![changed("src/a.rs", "a"), changed("src/b.rs", "b")];
    let analysis = Arc::new(Scripted::new("bugs").finding("src/a.rs", Severity::High, 1));
    let mut gate = build(
        "[analyses]\ndefault = [\"bugs\"]",
        vec![analysis.clone()],
        Box::new(backend.clone()),
    );

    let first = gate.run(&files);
    let stored = backend.stored().expect("first run writes the cache");
    let second = gate.run(&files);

    assert_eq!(first.decision, second.decision);
    assert_eq!(first.findings, second.findings);
    assert_eq!(backend.stored(), Some(stored));
    assert_eq!(analysis.calls().len(), 2);
}

#[test]
fn new_required_analysis_invalidates_cache_hit() {
    let backend = MemoryBackend::new();
    let files = vec![changed("src/a.rs", "a")];
    build(
        "[analyses]\ndefault = [\"bugs\"]",
        vec![Arc::new(Scripted::new("bugs"))],
        Box::new(backend.clone()),
    )
    .run(&files);

    let security = Arc::new(Scripted::new("security"));
    let report = build(
        SECURITY_AND_BUGS,
        vec![Arc::new(Scripted::new("bugs")), security.clone()],
        Box::new(backend.clone()),
    )
    .run(&files);
    assert_eq!(report.cache_hits, 0);
    assert_eq!(security.calls(), vec!["src/a.rs"]);
}

#[test]
fn unreadable_cache_analyzes_everything() {
    let analysis = Arc::new(Scripted::new("bugs"));
    let backend = Box::new(UnreadableBackend {
        saves: AtomicUsize::new(0),
    });
    let mut gate = build("[analyses]\ndefault = [\"bugs\"]", vec![analysis.clone()], backend);
    let report = gate.run(&[changed("a.rs", "a"), changed("b.rs", "b")]);
    assert_eq!(analysis.calls().len(), 2);
    assert_eq!(report.cache_hits, 0);
    assert_eq!(report.cache_warnings.len(), 1);
    assert_eq!(report.decision(), Decision::Allow);
}

#[test]
fn failed_analysis_leaves_cache_entry_untouched() {
    let backend = MemoryBackend::new();
    let files = vec![changed("src/a.rs", "a")];
    let report = build(
        SECURITY_AND_BUGS,
        vec![
            Arc::new(Scripted::new("security").failing_on("src/a.rs")),
            Arc::new(Scripted::new("bugs")),
        ],
        Box::new(backend.clone()),
    )
    .run(&files);
    assert!(report.is_degraded());
    assert!(backend.stored().is_none_or(|s| s.entries.is_empty()));

    // Retry recomputes.
    let security = Arc::new(Scripted::new("security"));
    let report = build(
        SECURITY_AND_BUGS,
        vec![security.clone(), Arc::new(Scripted::new("bugs"))],
        Box::new(backend.clone()),
    )
    .run(&files);
    assert_eq!(security.calls(), vec!["src/a.rs"]);
    assert!(!report.is_degraded());
}

#[test]
fn cached_findings_of_dropped_analysis_are_ignored() {
    let backend = MemoryBackend::new();
    let files = vec![changed("a.rs", "a")];
    let first = build(
        SECURITY_AND_BUGS,
        vec![
            Arc::new(Scripted::new("security").finding("a.rs", Severity::Critical, 1)),
            Arc::new(Scripted::new("bugs")),
        ],
        Box::new(backend.clone()),
    )
    .run(&files);
    assert_eq!(first.decision(), Decision::Block);

    let bugs = Arc::new(Scripted::new("bugs"));
    let second = build(
        "[analyses]\ndefault = [\"bugs\"]",
        vec![bugs.clone()],
        Box::new(backend.clone()),
    )
    .run(&files);
    assert_eq!(second.cache_hits, 1);
    assert!(bugs.calls().is_empty());
    assert_eq!(second.decision(), Decision::Allow, "{}", second.decision.reason);
    assert!(second.findings.is_empty());
}

// ── Failures and fail-closed review ──

#[test]
fn timeout_on_one_file_is_degraded_allow() {
    let toml = format!("{SECURITY_AND_BUGS}\n[settings]\ntimeout_secs = 1\nworkers = 4");
    let files: Vec<ChangedFile> = (0..4)
        .map(|i| changed(&format!("src/f{i}.rs"), "x"))
        .collect();
    let report = run_once(
        &toml,
        vec![
            Arc::new(Scripted::new("security").hanging_on("src/f2.rs")),
            Arc::new(Scripted::new("bugs")),
        ],
        &files,
    );
    assert_eq!(report.decision(), Decision::Allow);
    assert!(report.is_degraded());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, "src/f2.rs");
    assert_eq!(report.failures[0].analysis, "security");
    assert_eq!(report.failures[0].reason, "timeout");
}

#[test]
fn critical_path_blocks_when_required_review_failed() {
    let report = run_once(
        AUTH_REVIEW,
        vec![
            Arc::new(
                Scripted::new("security")
                    .failing_on("src/auth/login.rs")
                    .failing_on("lib/auth/token.rs"),
            ),
            Arc::new(Scripted::new("bugs")),
        ],
        &[
            changed("src/auth/login.rs", "a"),
            changed("lib/auth/token.rs", "b"),
            changed("src/ui.rs", "c"),
        ],
    );
    assert_eq!(report.decision(), Decision::Block);
    assert!(report.decision.reason.contains("required review incomplete"));
    assert!(report.decision.reason.contains("authentication"));
    assert!(report.decision.triggering.is_empty());
}

#[test]
fn critical_path_allows_when_review_completed() {
    let report = run_once(
        AUTH_REVIEW,
        vec![
            Arc::new(Scripted::new("security")),
            Arc::new(Scripted::new("bugs")),
        ],
        &[changed("src/auth/login.rs", "a")],
    );
    assert_eq!(report.decision(), Decision::Allow);
}

#[test]
fn critical_path_fails_closed_when_analysis_unconfigured() {
    let report = run_once(
        AUTH_REVIEW,
        vec![Arc::new(Scripted::new("bugs"))],
        &[changed("src/auth/login.rs", "a")],
    );
    assert_eq!(report.decision(), Decision::Block);
    assert_eq!(report.failures[0].reason, "not configured");
}

#[test]
fn rules_sharing_a_label_each_fail_closed() {
    let toml = r#"
[[rules]]
pattern = "src/auth/**"
label = "critical"
required = ["security"]
block_without_review = true

[[rules]]
pattern = "migrations/**"
label = "critical"
required = ["security"]
block_without_review = true
"#;
    for path in ["src/auth/login.rs", "migrations/001.sql"] {
        let report = run_once(toml, vec![], &[changed(path, "x")]);
        assert_eq!(report.decision(), Decision::Block, "{path}");
        assert!(
            report.decision.reason.contains("required review incomplete"),
            "{}",
            report.decision.reason
        );
    }
}

#[test]
fn authorization_is_not_auth() {
    let report = run_once(
        AUTH_REVIEW,
        vec![Arc::new(Scripted::new("bugs"))],
        &[changed("src/authorization/login.rs", "a")],
    );
    assert_eq!(report.decision(), Decision::Allow);
}

#[test]
fn skipped_critical_path_is_not_held() {
    let toml = format!("{AUTH_REVIEW}\n[exemptions]\nskip_paths = [\"src/auth/fixtures/**\"]");
    let report = run_once(
        &toml,
        vec![
            Arc::new(Scripted::new("security").failing_on("src/auth/fixtures/user.json")),
            Arc::new(Scripted::new("bugs")),
        ],
        &[changed("src/auth/fixtures/user.json", "{}")],
    );
    assert_eq!(report.decision(), Decision::Allow);
    assert!(report.is_degraded());
}

#[test]
fn exempt_findings_are_reported_as_info() {
    let toml = format!("{SECURITY_AND_BUGS}\n[exemptions]\nskip_analyses = [\"bugs\"]");
    let report = run_once(
        &toml,
        vec![
            Arc::new(Scripted::new("security")),
            Arc::new(Scripted::new("bugs").finding("a.rs", Severity::Critical, 1)),
        ],
        &[changed("a.rs", "a")],
    );
    assert_eq!(report.decision(), Decision::Allow);
    assert_eq!(report.findings.len(), 1);
    assert!(report.findings[0].exempt);
}

// ── Classification through a change source ──

struct FakeTree(Vec<RawChange>);

impl ChangeSource for FakeTree {
    fn root(&self) -> &std::path::Path {
        std::path::Path::new("/repo")
    }
    fn raw_changes(&self) -> change_gate::error::Result<Vec<RawChange>> {
        Ok(self.0.clone())
    }
}

#[test]
fn check_classifies_and_flags_oversized_files() {
    let huge = "line\n".repeat(10);
    let tree = FakeTree(vec![
        RawChange {
            path: "src/auth/big.rs".into(),
            kind: ChangeKind::Untracked,
            content: Some(huge.into_bytes()),
            diff: None,
        },
        RawChange {
            path: "src/small.rs".into(),
            kind: ChangeKind::Added,
            content: Some(b"fn main() {}\n".to_vec()),
            diff: None,
        },
    ]);
    let toml = format!("{AUTH_REVIEW}\n[settings]\nmax_lines = 5");
    let security = Arc::new(Scripted::new("security"));
    let mut gate = build(
        &toml,
        vec![security.clone(), Arc::new(Scripted::new("bugs"))],
        Box::new(MemoryBackend::new()),
    );
    let report = gate.check(&tree).unwrap();
    assert_eq!(report.manual_review, vec!["src/auth/big.rs"]);
    assert!(security.calls().is_empty());
    // Oversized critical file cannot be reviewed automatically: fail closed.
    assert_eq!(report.decision(), Decision::Block);
}

// ── Configuration errors are fatal before analysis ──

#[test]
fn invalid_rule_pattern_fails_gate_construction() {
    let config = Config::from_overlay_str(
        r#"
        [[rules]]
        pattern = "src/[oops"
        label = "broken"
    "#,
    )
    .unwrap();
    let err = Gate::new(
        config,
        AnalysisRegistry::new(),
        Box::new(MemoryBackend::new()),
        Arc::new(ManualClock::new(0)),
        None,
    )
    .err()
    .unwrap();
    assert!(matches!(err, GateError::ConfigInvalid(_)));
}
