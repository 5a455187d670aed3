use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError, mpsc};

use crate::analysis::{AnalysisRegistry, Deadline};
use crate::change::ChangedFile;
use crate::error::AnalysisError;
use crate::finding::Finding;

/// One {file, analysis} pair to run.
#[derive(Debug, Clone)]
pub struct Task<'a> {
    pub file: &'a ChangedFile,
    pub analysis: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(Vec<Finding>),
    Failed(AnalysisError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub path: String,
    pub analysis: String,
    pub outcome: TaskOutcome,
}

/// Runs tasks on a bounded pool of scoped worker threads.
pub struct Dispatcher<'r> {
    registry: &'r AnalysisRegistry,
    workers: usize,
}

impl<'r> Dispatcher<'r> {
    /// `workers == 0` uses the available parallelism.
    pub fn new(registry: &'r AnalysisRegistry, workers: usize) -> Self {
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            workers
        };
        Self { registry, workers }
    }

    /// Run every task and return one result per task, in task order.
    ///
    /// Tasks not started before `deadline`, or finishing after it, are
    /// recorded as [`AnalysisError::Timeout`] and their findings dropped.
    pub fn dispatch(&self, tasks: Vec<Task<'_>>, deadline: &Deadline) -> Vec<TaskResult> {
        if tasks.is_empty() {
            return Vec::new();
        }
        let total = tasks.len();
        let workers = self.workers.clamp(1, total);
        log::info!("dispatching {total} analysis task(s) on {workers} worker(s)");

        let queue = Mutex::new(tasks.into_iter().enumerate().collect::<VecDeque<_>>());
        let (tx, rx) = mpsc::channel();

        std::thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                s.spawn(move || {
                    loop {
                        let next = queue
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .pop_front();
                        let Some((index, task)) = next else {
                            break;
                        };
                        let outcome = self.run(&task, deadline);
                        let result = TaskResult {
                            path: task.file.path.clone(),
                            analysis: task.analysis,
                            outcome,
                        };
                        if tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut results: Vec<(usize, TaskResult)> = rx.into_iter().collect();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    fn run(&self, task: &Task<'_>, deadline: &Deadline) -> TaskOutcome {
        let path = &task.file.path;
        if deadline.expired() {
            log::warn!("{} on {path}: deadline passed before start", task.analysis);
            return TaskOutcome::Failed(AnalysisError::Timeout);
        }
        let Some(analysis) = self.registry.get(&task.analysis) else {
            log::warn!("{} on {path}: analysis not configured", task.analysis);
            return TaskOutcome::Failed(AnalysisError::NotConfigured);
        };

        let result = catch_unwind(AssertUnwindSafe(|| {
            analysis.analyze(task.file, &task.file.diff, deadline)
        }))
        .unwrap_or_else(|_| Err(AnalysisError::Crashed("analysis panicked".into())));

        match result {
            Ok(_) if deadline.expired() => {
                log::warn!("{} on {path}: finished after the deadline", task.analysis);
                TaskOutcome::Failed(AnalysisError::Timeout)
            }
            Ok(findings) => {
                log::debug!("{} on {path}: {} finding(s)", task.analysis, findings.len());
                TaskOutcome::Completed(findings)
            }
            Err(e) => {
                log::warn!("{} on {path}: {e}", task.analysis);
                TaskOutcome::Failed(e)
            }
        }
    }
}
