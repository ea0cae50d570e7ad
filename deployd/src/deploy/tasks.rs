//! Deployment tasks
//!
//! Shell commands configured on a deployment and executed on the target
//! server before or after the file transfer. Tasks are best effort: a failing
//! task is reported and the run continues.

use tracing::{info, warn};

use crate::models::deployment::TaskDefinition;
use crate::progress::ProgressReporter;
use crate::target::TransportTarget;

/// Result of running one batch of tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Execute `tasks` in order on `target` with `cwd` as working directory
pub async fn run_tasks(
    target: &dyn TransportTarget,
    progress: &ProgressReporter,
    tasks: &[&TaskDefinition],
    cwd: &str,
) -> TaskReport {
    let mut report = TaskReport::default();

    for task in tasks {
        progress.info(format!("Running task {}...", task.name));
        match target.execute(&task.command, cwd).await {
            Ok(output) => {
                info!("Task {} ({}) finished", task.id, task.name);
                for line in output.lines().filter(|l| !l.trim().is_empty()) {
                    progress.info(line.to_string());
                }
                progress.success(format!("Task {}: success", task.name));
                report.succeeded += 1;
            }
            Err(e) => {
                warn!("Task {} ({}) failed: {}", task.id, task.name, e);
                progress.danger(format!("Task {}: failed", task.name));
                report.failed += 1;
            }
        }
    }

    report
}
