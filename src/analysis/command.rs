use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use serde::Deserialize;

use crate::analysis::{Analysis, Deadline};
use crate::change::ChangedFile;
use crate::config::AnalysisCommand;
use crate::error::{AnalysisError, GateError, Result};
use crate::finding::{Finding, Severity};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One finding as printed by an external analysis.
#[derive(Debug, Deserialize)]
struct ReportedItem {
    severity: Severity,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    line: Option<u32>,
    message: String,
}

fn default_category() -> String {
    "general".into()
}

/// Runs an external program per file.
///
/// The diff is written to stdin; `CHANGE_GATE_PATH`, `CHANGE_GATE_KIND` and
/// `CHANGE_GATE_LANGUAGE` describe the file. Stdout must be a JSON array of
/// `{severity, category, line, message}` objects (empty output means no
/// findings). A non-zero exit is a crash.
#[derive(Debug, Clone)]
pub struct CommandAnalysis {
    name: String,
    program: String,
    args: Vec<String>,
    root: PathBuf,
    timeout: Option<Duration>,
}

impl CommandAnalysis {
    pub fn from_config(name: &str, cmd: &AnalysisCommand, root: &Path) -> Result<Self> {
        let words = shlex::split(&cmd.command).unwrap_or_default();
        let Some((program, args)) = words.split_first() else {
            return Err(GateError::ConfigInvalid(format!(
                "analysis {name}: unparsable command {:?}",
                cmd.command
            )));
        };
        let program = shellexpand::full(program)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| program.clone());

        Ok(Self {
            name: name.to_string(),
            program,
            args: args.to_vec(),
            root: root.to_path_buf(),
            timeout: cmd.timeout_secs.map(Duration::from_secs),
        })
    }

    fn spawn(&self, file: &ChangedFile) -> std::result::Result<Child, AnalysisError> {
        Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.root)
            .env("CHANGE_GATE_PATH", &file.path)
            .env("CHANGE_GATE_KIND", file.kind.as_str())
            .env("CHANGE_GATE_LANGUAGE", &file.language)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AnalysisError::Spawn(format!("{}: {e}", self.program)))
    }

    fn parse(
        &self,
        file: &ChangedFile,
        stdout: &str,
    ) -> std::result::Result<Vec<Finding>, AnalysisError> {
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<ReportedItem> = serde_json::from_str(stdout)
            .map_err(|e| AnalysisError::MalformedOutput(e.to_string()))?;
        Ok(items
            .into_iter()
            .map(|item| Finding {
                severity: item.severity,
                category: item.category,
                file: file.path.clone(),
                line: item.line,
                message: item.message,
                analysis: self.name.clone(),
            })
            .collect())
    }
}

impl Analysis for CommandAnalysis {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(
        &self,
        file: &ChangedFile,
        diff: &str,
        deadline: &Deadline,
    ) -> std::result::Result<Vec<Finding>, AnalysisError> {
        let deadline = deadline.capped(self.timeout);
        let mut child = self.spawn(file)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, out, err) = std::thread::scope(|s| {
            if let Some(mut stdin) = stdin {
                s.spawn(move || {
                    // The child may exit without reading; a broken pipe is fine.
                    let _ = stdin.write_all(diff.as_bytes());
                });
            }
            let out = s.spawn(move || read_all(stdout));
            let err = s.spawn(move || read_all(stderr));
            let status = wait_until(&mut child, &deadline);
            (
                status,
                out.join().unwrap_or_default(),
                err.join().unwrap_or_default(),
            )
        });

        let status = status?;
        if !status.success() {
            let detail = err.lines().next().unwrap_or("").trim().to_string();
            let code = status
                .code()
                .map_or_else(|| "signal".to_string(), |c| format!("exit {c}"));
            return Err(AnalysisError::Crashed(if detail.is_empty() {
                code
            } else {
                format!("{code}: {detail}")
            }));
        }
        self.parse(file, &out)
    }
}

fn read_all<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Poll until the child exits or the deadline passes; kill it on timeout.
fn wait_until(
    child: &mut Child,
    deadline: &Deadline,
) -> std::result::Result<ExitStatus, AnalysisError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if deadline.expired() => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(AnalysisError::Timeout);
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL.min(deadline.remaining())),
            Err(e) => return Err(AnalysisError::Crashed(e.to_string())),
        }
    }
}
