//! change-gate: pre-push gate for pending changes.
//!
//! Classifies the working tree's pending changes, runs the configured
//! analyses on files the cache cannot vouch for, and maps the policy
//! decision to an exit status:
//!   - ALLOW → 0
//!   - WARN  → 0, findings printed
//!   - BLOCK → 1, findings and reason printed
//!   - fatal error (bad config, not a repository) → 2

use std::path::PathBuf;

use change_gate::eval::{Action, Decision};
use change_gate::gate::{GateOptions, GateReport};

const USAGE: &str = "\
usage: change-gate [options]

options:
  --repo <dir>      repository to check (default: current directory)
  --config <file>   configuration overlay (default: <repo>/.change-gate.toml)
  --role <name>     activate role-scoped policy overrides
  --override        exit 0 even if the decision is BLOCK (decision still reported)
  --no-cache        do not read or write the result cache
  --clear-cache     drop all cached results before running
  --json            print the report as JSON
  --quiet           print only the decision line
  -h, --help        show this help
  -V, --version     show version";

#[derive(Debug, Default)]
struct Args {
    repo: Option<PathBuf>,
    config: Option<PathBuf>,
    options: GateOptions,
    force: bool,
    json: bool,
    quiet: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--repo" => args.repo = Some(it.next().ok_or("--repo needs a value")?.into()),
            "--config" => args.config = Some(it.next().ok_or("--config needs a value")?.into()),
            "--role" => args.options.role = Some(it.next().ok_or("--role needs a value")?),
            "--override" => args.force = true,
            "--no-cache" => args.options.no_cache = true,
            "--clear-cache" => args.options.clear_cache = true,
            "--json" => args.json = true,
            "--quiet" => args.quiet = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            "-V" | "--version" => {
                println!("change-gate {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    if std::env::var("CHANGE_GATE_OVERRIDE").is_ok_and(|v| v == "1") {
        args.force = true;
    }
    Ok(args)
}

fn print_text(report: &GateReport, quiet: bool) {
    let degraded = if report.is_degraded() { " (DEGRADED)" } else { "" };
    println!(
        "change-gate: {}{degraded}: {}",
        report.decision().label(),
        report.decision.reason
    );
    if quiet {
        return;
    }

    let visible: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.action != Action::Info || report.decision() == Decision::Block)
        .collect();
    if !visible.is_empty() {
        println!("\nfindings:");
        for f in &visible {
            let exempt = if f.exempt { " [exempt]" } else { "" };
            println!("  {:<5} {}{exempt}", f.action.as_str(), f.finding.summary());
        }
    }
    let info = report.findings.len() - visible.len();
    if info > 0 {
        println!("  ({info} informational finding(s) not shown)");
    }

    if !report.failures.is_empty() {
        println!("\nincomplete checks:");
        for failure in &report.failures {
            println!(
                "  {} on {}: {}",
                failure.analysis, failure.path, failure.reason
            );
        }
    }
    if !report.manual_review.is_empty() {
        println!("\nmanual review required (too large to analyze):");
        for path in &report.manual_review {
            println!("  {path}");
        }
    }
    for warning in &report.cache_warnings {
        println!("\ncache: {warning}");
    }
    println!(
        "\n{} file(s), {} from cache, {} analyzed",
        report.files,
        report.cache_hits,
        report.dispatched.len()
    );
    if let Some(reminder) = &report.reminder {
        println!("note: {reminder}");
    }
}

fn main() {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("change-gate: {e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };
    change_gate::logging::init();

    let repo = args.repo.clone().unwrap_or_else(|| PathBuf::from("."));
    let report = match change_gate::check_worktree(&repo, args.config.as_deref(), &args.options) {
        Ok(r) => r,
        Err(e) => {
            log::error!("{e}");
            eprintln!("change-gate: {e}");
            std::process::exit(2);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("change-gate: cannot encode report: {e}");
                std::process::exit(2);
            }
        }
    } else {
        print_text(&report, args.quiet);
    }

    let blocked = report.decision() == Decision::Block;
    let overridden = blocked && args.force;
    if overridden {
        log::warn!("BLOCK overridden by caller: {}", report.decision.reason);
        eprintln!("change-gate: BLOCK overridden; proceeding anyway");
    }
    change_gate::logging::log_decision(&repo.display().to_string(), &report, overridden);

    std::process::exit(if blocked && !overridden { 1 } else { 0 });
}
