//! Task Runner (component H): executes a parsed task list sequentially,
//! committing after each task and invoking a checkpoint callback every N
//! successful tasks.
//!
//! Grounded on the donor's `ralph_loop::run` outer loop (git commit after
//! each unit of work, cooperative stop) generalized from its fixed
//! searcher/builder/validator pipeline to the spec's per-task agent
//! invocation and checkpoint cadence.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::agent::{self, AgentInvocation, AgentKind, SandboxConfig, TokenUsage};
use crate::git;
use crate::process::AbortHandle;
use crate::tasks::{self, Task};

/// Default for `TaskRunFlags::checkpoint_interval` when a caller has no
/// configured value (§4.H names N=3).
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDecision {
    Continue,
    Pause,
    Abort,
}

#[derive(Debug, Clone)]
pub struct TaskRunFlags {
    pub agent: AgentKind,
    pub model: Option<String>,
    pub skip_permissions: bool,
    pub sandbox: Option<SandboxConfig>,
    pub timeout: std::time::Duration,
    pub binary_override: Option<String>,
    pub checkpoint_interval: usize,
}

pub struct TaskRunRequest<'a, 'b> {
    pub feature: String,
    pub spec_dir: PathBuf,
    pub working_dir: PathBuf,
    /// Index into the *pending* (not-yet-completed) task list to start from.
    /// Since every completed task is marked in `tasks.md` the moment it
    /// commits, `pending` already excludes everything done in a prior run —
    /// callers resuming from a persisted state should pass `0`.
    pub start_from_task: usize,
    pub flags: TaskRunFlags,
    pub on_progress: Box<dyn FnMut(usize, usize, &Task) + Send + 'a>,
    pub on_checkpoint: Box<dyn FnMut(usize, usize) -> CheckpointDecision + Send + 'b>,
}

#[derive(Debug, Clone)]
pub struct TaskRunResult {
    pub success: bool,
    pub completed_tasks: usize,
    pub total_tasks: usize,
    pub paused_at: Option<usize>,
    pub error: Option<String>,
    /// Token usage for every task completed in this run, in completion
    /// order, for the caller to fold into each `TaskEntry.tokenUsage`.
    pub task_usage: Vec<(String, Option<TokenUsage>)>,
}

pub struct TaskRunner {
    abort: AbortHandle,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self {
            abort: AbortHandle::new(),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Sets the cooperative abort flag; the currently running agent
    /// invocation is terminated promptly because it shares the same handle.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub async fn execute(&self, mut req: TaskRunRequest<'_, '_>) -> TaskRunResult {
        let all_tasks = match tasks::parse(&req.spec_dir) {
            Ok(t) => t,
            Err(e) => {
                return TaskRunResult {
                    success: false,
                    completed_tasks: 0,
                    total_tasks: 0,
                    paused_at: None,
                    error: Some(e.to_string()),
                    task_usage: Vec::new(),
                }
            }
        };

        let pending: Vec<Task> = all_tasks.into_iter().filter(|t| !t.completed).collect();
        let total = pending.len();
        let slice: Vec<Task> = pending
            .into_iter()
            .skip(req.start_from_task.min(total))
            .collect();

        let mut completed_count = 0usize;
        let mut task_usage: Vec<(String, Option<TokenUsage>)> = Vec::new();

        for task in &slice {
            if self.abort.is_aborted() {
                return TaskRunResult {
                    success: false,
                    completed_tasks: completed_count,
                    total_tasks: total,
                    paused_at: None,
                    error: Some("aborted by user".to_string()),
                    task_usage,
                };
            }

            let prompt = format!(
                "Implement task {id}: {title}\n\nFeature: {feature}\n\n{description}",
                id = task.id,
                title = task.title,
                feature = req.feature,
                description = task.description,
            );

            info!(task_id = %task.id, "invoking agent for task");

            let invocation = AgentInvocation {
                prompt,
                working_directory: req.working_dir.clone(),
                skip_permissions: req.flags.skip_permissions,
                tier: None,
                agent: req.flags.agent,
                model: req.flags.model.clone(),
                sandbox: req.flags.sandbox.clone(),
                timeout: Some(req.flags.timeout),
                binary_override: req.flags.binary_override.clone(),
                env: Vec::new(),
            };

            let result = agent::invoke(invocation, self.abort.clone()).await;

            if !result.success {
                warn!(task_id = %task.id, "task agent invocation failed");
                return TaskRunResult {
                    success: false,
                    completed_tasks: completed_count,
                    total_tasks: total,
                    paused_at: None,
                    error: Some(result.stderr),
                    task_usage,
                };
            }

            let commit_message = format!("{}: {}", task.id, task.title);
            let commit = git::commit(&req.working_dir, &commit_message).await;
            if !commit.success {
                warn!(task_id = %task.id, error = ?commit.error, "commit failed after successful task");
                return TaskRunResult {
                    success: false,
                    completed_tasks: completed_count,
                    total_tasks: total,
                    paused_at: None,
                    error: commit.error,
                    task_usage,
                };
            }

            if let Err(e) = tasks::mark_task_complete(&req.spec_dir, &task.id) {
                warn!(task_id = %task.id, error = %e, "failed to mark task complete on disk");
            }

            completed_count += 1;
            task_usage.push((task.id.clone(), result.usage.clone()));
            (req.on_progress)(completed_count, total, task);

            let interval = req.flags.checkpoint_interval.max(1);
            if completed_count % interval == 0 {
                match (req.on_checkpoint)(completed_count, total) {
                    CheckpointDecision::Continue => {}
                    CheckpointDecision::Pause => {
                        return TaskRunResult {
                            success: true,
                            completed_tasks: completed_count,
                            total_tasks: total,
                            paused_at: Some(completed_count),
                            error: None,
                            task_usage,
                        };
                    }
                    CheckpointDecision::Abort => {
                        return TaskRunResult {
                            success: false,
                            completed_tasks: completed_count,
                            total_tasks: total,
                            paused_at: None,
                            error: Some("aborted by user".to_string()),
                            task_usage,
                        };
                    }
                }
            }
        }

        TaskRunResult {
            success: true,
            completed_tasks: completed_count,
            total_tasks: total,
            paused_at: None,
            error: None,
            task_usage,
        }
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}
