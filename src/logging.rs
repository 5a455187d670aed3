use crate::gate::GateReport;
use log::LevelFilter;
use simplelog::{ConfigBuilder, WriteLogger};
use std::io::Write;
use std::path::PathBuf;

/// `~/.local/share/change-gate`, if HOME is set.
fn data_dir() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(std::path::Path::new(&home).join(".local/share/change-gate"))
}

/// Route `log` records to ~/.local/share/change-gate/gate.log.
/// `CHANGE_GATE_LOG` sets the level (default `info`).
/// Best-effort: failures are silently ignored (logging must never block the gate).
pub fn init() {
    let level = std::env::var("CHANGE_GATE_LOG")
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);

    let Some(dir) = data_dir() else {
        return;
    };
    let _ = std::fs::create_dir_all(&dir);
    let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("gate.log"))
    else {
        return;
    };

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_thread_level(LevelFilter::Debug)
        .build();
    let _ = WriteLogger::init(level, config, file);
}

/// Append a decision record to ~/.local/share/change-gate/decisions.log.
/// Best-effort, like [`init`].
pub fn log_decision(repo: &str, report: &GateReport, overridden: bool) {
    let Some(log_dir) = data_dir() else {
        return;
    };
    let _ = std::fs::create_dir_all(&log_dir);

    let log_path = log_dir.join("decisions.log");
    let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
    else {
        return;
    };

    // Compact single-line reason for the log (replace newlines with "; ")
    let reason_oneline = report.decision.reason.replace('\n', "; ");
    let mut flags = Vec::new();
    if report.is_degraded() {
        flags.push("degraded");
    }
    if overridden {
        flags.push("overridden");
    }
    let ts = timestamp_now();

    let _ = writeln!(
        file,
        "{ts}\t{decision}\t{repo}\t{files} file(s)\t{flags}\t{reason}",
        decision = report.decision().as_str(),
        files = report.files,
        flags = flags.join(","),
        reason = reason_oneline,
    );
}

/// Simple UTC timestamp without external deps.
fn timestamp_now() -> String {
    let dur = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_timestamp(dur.as_secs())
}

fn format_timestamp(secs: u64) -> String {
    let days = secs / 86400;
    let rem = secs % 86400;
    let h = rem / 3600;
    let m = (rem % 3600) / 60;
    let s = rem % 60;
    let (year, month, day) = epoch_days_to_date(days);
    format!("{year:04}-{month:02}-{day:02}T{h:02}:{m:02}:{s:02}Z")
}

/// Convert days since Unix epoch to (year, month, day).
fn epoch_days_to_date(days: u64) -> (u64, u64, u64) {
    // Civil calendar from days algorithm (Howard Hinnant)
    let z = days + 719468;
    let era = z / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}
