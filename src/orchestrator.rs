//! Orchestrator Facade (component L): composes F-K, consumes UI callbacks,
//! and persists after every transition.
//!
//! Grounded on the donor's `workflow::runner::WorkflowRunner::run` (drive
//! stages until a gate, persist, wait for external approval) generalized
//! from the donor's fixed requirements/design/tasks pipeline to the full
//! greenfield/brownfield phase graph and task-runner delegation this spec
//! requires.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::agent::{AgentKind, SandboxConfig, TokenUsage};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::{Event, FlowMachine};
use crate::git;
use crate::health::{self, HealthCheckRequest};
use crate::phase_executor::{self, ExecutionFlags};
use crate::process::AbortHandle;
use crate::spec_init;
use crate::state::{
    compute_context_usage, FlowState, GroupedTaskProgress, HistoryEntry, Mode, Phase, PhaseMetric, StateStore,
    TaskEntry, TaskStatus,
};
use crate::task_runner::{CheckpointDecision, TaskRunFlags, TaskRunRequest, TaskRunner};
use crate::tasks;

#[derive(Debug, Clone)]
pub struct StartFlags {
    pub agent: AgentKind,
    pub model: Option<String>,
    pub skip_permissions: bool,
    pub sandbox: Option<SandboxConfig>,
}

pub struct Orchestrator {
    work_dir: PathBuf,
    store: StateStore,
    config: Config,
    machine: FlowMachine,
    abort: AbortHandle,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

impl Orchestrator {
    pub fn new(work_dir: impl Into<PathBuf>, config: Config) -> Self {
        let work_dir = work_dir.into();
        Self {
            store: StateStore::new(&work_dir),
            work_dir,
            config,
            machine: FlowMachine::new(),
            abort: AbortHandle::new(),
        }
    }

    fn execution_flags(&self, flags: &StartFlags) -> ExecutionFlags {
        let binary = self
            .config
            .agents
            .for_agent(flags.agent)
            .binary
            .clone();
        let model = flags
            .model
            .clone()
            .or_else(|| self.config.agents.for_agent(flags.agent).model.clone());
        ExecutionFlags {
            agent: flags.agent,
            model,
            skip_permissions: flags.skip_permissions,
            sandbox: flags.sandbox.clone(),
            timeout: self.config.timeouts.agent(),
            base_delay: Duration::from_millis(self.config.base_delay_ms),
            max_attempts: self.config.max_attempts,
            binary_override: binary,
        }
    }

    fn working_directory_for(&self, feature: &str) -> PathBuf {
        self.work_dir
            .join("worktrees")
            .join(git::sanitize_feature_name(feature))
    }

    fn spec_dir_for(&self, feature: &str) -> PathBuf {
        self.work_dir
            .join(".red64")
            .join("specs")
            .join(git::sanitize_feature_name(feature))
    }

    fn new_state(&self, feature: &str, mode: Mode) -> FlowState {
        let now = now_iso();
        FlowState {
            version: crate::state::CURRENT_STATE_VERSION,
            feature: feature.to_string(),
            phase: Phase::Idle,
            mode,
            created_at: now.clone(),
            updated_at: now,
            history: Vec::new(),
            task_progress: None,
            phase_metrics: None,
            metadata: Default::default(),
        }
    }

    fn record_transition(&self, state: &mut FlowState, event: &Event) {
        let phase = self.machine.phase().clone();
        state.phase = phase.clone();
        state.updated_at = now_iso();
        state.history.push(HistoryEntry {
            phase,
            timestamp: state.updated_at.clone(),
            event: Some(event_name(event)),
            sub_step: None,
            metadata: None,
        });
    }

    fn persist(&self, state: &FlowState) -> Result<()> {
        self.store.save(state)
    }

    /// Run the phase-executor loop starting from the current phase until an
    /// approval-gate phase, `implementing`, or a terminal phase is reached.
    async fn drive_generating_phases(&mut self, state: &mut FlowState, flags: &StartFlags) -> Result<()> {
        loop {
            let phase = self.machine.phase().clone();
            if phase.is_terminal() || is_gate_or_pause_phase(&phase) {
                return Ok(());
            }
            if matches!(phase, Phase::Implementing { .. }) {
                return Ok(());
            }

            let exec_flags = self.execution_flags(flags);
            let working_dir = self.working_directory_for(state.feature.as_str());
            let result = phase_executor::execute(&phase, &exec_flags, working_dir, self.abort.clone()).await;

            if result.success {
                let mut metric = PhaseMetric {
                    started_at: Some(result.started_at.clone()),
                    completed_at: Some(result.completed_at.clone()),
                    elapsed_ms: Some(result.elapsed_ms),
                    ..Default::default()
                };
                if let Some(usage) = &result.usage {
                    metric.cost_usd = usage.cost_usd;
                    metric.input_tokens = Some(usage.input_tokens);
                    metric.output_tokens = Some(usage.output_tokens);
                }
                state
                    .phase_metrics
                    .get_or_insert_with(HashMap::new)
                    .insert(phase.type_tag().to_string(), metric);

                let event = Event::PhaseComplete;
                self.machine.dispatch_with_mode(event.clone(), state.mode);
                self.record_transition(state, &event);
                self.persist(state)?;
                continue;
            }

            let recoverable = result
                .claude_error
                .as_ref()
                .map(|d| d.recoverable)
                .unwrap_or(true);
            if !recoverable {
                let message = result.error.clone().unwrap_or_default();
                let event = Event::Error(message);
                self.machine.dispatch_with_mode(event.clone(), state.mode);
                self.record_transition(state, &event);
                self.persist(state)?;
                return Err(Error::Agent {
                    detail: result.claude_error.clone().unwrap(),
                });
            }

            let message = result.error.clone().unwrap_or_default();
            let event = Event::Error(message.clone());
            self.machine.dispatch_with_mode(event.clone(), state.mode);
            self.record_transition(state, &event);
            self.persist(state)?;
            return Err(Error::Git(message));
        }
    }

    /// Start a feature: health check, spec init, worktree creation, and
    /// drive generating phases until the first approval gate.
    pub async fn start(
        &mut self,
        feature: &str,
        description: &str,
        mode: Mode,
        flags: StartFlags,
    ) -> Result<FlowState> {
        let sanitized = git::sanitize_feature_name(feature);
        if sanitized.is_empty() {
            return Err(Error::validation("feature name sanitizes to an empty string"));
        }

        if self.store.exists(&sanitized) {
            if let Some(existing) = self.store.load(&sanitized)? {
                info!(feature = %sanitized, "resuming existing flow state");
                self.machine = FlowMachine::resume(existing.phase.clone(), existing.mode);
                return Ok(existing);
            }
        }

        let health = health::check(HealthCheckRequest {
            agent: flags.agent,
            tier: None,
            sandbox: flags.sandbox.clone(),
            timeout: Some(self.config.timeouts.health()),
            working_directory: self.work_dir.clone(),
            binary_override: self.config.agents.for_agent(flags.agent).binary.clone(),
        })
        .await;
        if !health.success {
            warn!(?health.error, "health check failed before starting flow");
            return Err(Error::Agent {
                detail: health.error.unwrap_or(crate::error::AgentErrorDetail {
                    code: crate::error::AgentErrorCode::Unknown,
                    message: "health check failed".to_string(),
                    recoverable: true,
                    suggestion: None,
                    retry_after_ms: None,
                }),
            });
        }

        spec_init::init(&self.work_dir, &sanitized, description, &now_iso())?;

        let worktree = git::worktree_create(&self.work_dir, &sanitized).await;
        if !worktree.success {
            warn!(error = ?worktree.error, "worktree create failed (may already exist)");
        }

        let mut state = self.new_state(&sanitized, mode);
        self.machine = FlowMachine::new();

        let start_event = Event::Start {
            feature: sanitized.clone(),
            description: description.to_string(),
        };
        self.machine.dispatch_with_mode(start_event.clone(), mode);
        self.record_transition(&mut state, &start_event);
        self.persist(&state)?;

        self.drive_generating_phases(&mut state, &flags).await?;
        Ok(state)
    }

    /// Load a feature's persisted state and resume the flow machine from it.
    pub fn load_state(&mut self, feature: &str) -> Result<Option<FlowState>> {
        let sanitized = git::sanitize_feature_name(feature);
        match self.store.load(&sanitized)? {
            Some(state) => {
                self.machine = FlowMachine::resume(state.phase.clone(), state.mode);
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub fn approve(&mut self, state: &mut FlowState) -> Result<()> {
        let event = Event::Approve;
        self.machine.dispatch_with_mode(event.clone(), state.mode);
        self.record_transition(state, &event);
        self.persist(state)
    }

    pub fn reject(&mut self, state: &mut FlowState) -> Result<()> {
        let event = Event::Reject;
        self.machine.dispatch_with_mode(event.clone(), state.mode);
        self.record_transition(state, &event);
        self.persist(state)
    }

    /// Continue driving generating phases after an approval/rejection.
    pub async fn resume_driving(&mut self, state: &mut FlowState, flags: &StartFlags) -> Result<()> {
        self.drive_generating_phases(state, flags).await
    }

    /// Run the Task Runner from `tasks-approval`'s `APPROVE` transition
    /// through to `validation`, `pr`, and (unless `skip_merge`) completion.
    pub async fn run_implementation<'a>(
        &mut self,
        state: &mut FlowState,
        flags: &StartFlags,
        mut on_progress: Box<dyn FnMut(usize, usize, &tasks::Task) + Send + 'a>,
        on_checkpoint: Box<dyn FnMut(usize, usize) -> CheckpointDecision + Send + 'a>,
    ) -> Result<()> {
        let feature = state.feature.clone();
        let spec_dir = self.spec_dir_for(&feature);
        let working_dir = self.working_directory_for(&feature);

        // `tasks.md`'s checkboxes already exclude everything a prior run
        // committed (see `task_runner::TaskRunner::execute`), so the pending
        // list handed to the runner is always the true remainder and the
        // index to resume from is always 0.
        let start_from_task = 0;

        let runner = TaskRunner::new();
        self.abort = runner.abort_handle();

        let exec_flags = self.execution_flags(flags);
        let run_flags = TaskRunFlags {
            agent: exec_flags.agent,
            model: exec_flags.model,
            skip_permissions: exec_flags.skip_permissions,
            sandbox: exec_flags.sandbox,
            timeout: exec_flags.timeout,
            binary_override: exec_flags.binary_override,
            checkpoint_interval: self.config.checkpoint_interval,
        };

        // Record a HistoryEntry for each completed task as it lands, not
        // just once at the end of the batch.
        let mode = state.mode;
        let machine = &mut self.machine;
        let phase_slot = &mut state.phase;
        let updated_at_slot = &mut state.updated_at;
        let history = &mut state.history;
        let recording_progress: Box<dyn FnMut(usize, usize, &tasks::Task) + Send + '_> =
            Box::new(move |done, total, task| {
                let event = Event::TaskComplete(done as u32);
                let phase = machine.dispatch_with_mode(event.clone(), mode);
                *phase_slot = phase.clone();
                *updated_at_slot = now_iso();
                history.push(HistoryEntry {
                    phase,
                    timestamp: updated_at_slot.clone(),
                    event: Some(event_name(&event)),
                    sub_step: None,
                    metadata: None,
                });
                on_progress(done, total, task);
            });

        let result = runner
            .execute(TaskRunRequest {
                feature: feature.clone(),
                spec_dir,
                working_dir,
                start_from_task,
                flags: run_flags,
                on_progress: recording_progress,
                on_checkpoint,
            })
            .await;

        let total_tasks = result.total_tasks as u32;
        let completed = result.completed_tasks as u32;
        let task_usage: HashMap<String, TokenUsage> = result
            .task_usage
            .iter()
            .filter_map(|(id, usage)| usage.clone().map(|u| (id.clone(), u)))
            .collect();
        state.task_progress = task_progress_from_disk(&self.spec_dir_for(&feature), &task_usage);

        if !result.success {
            if result.error.as_deref() == Some("aborted by user") {
                let event = Event::Abort(result.error.clone().unwrap_or_default());
                self.machine.dispatch_with_mode(event.clone(), state.mode);
                self.record_transition(state, &event);
                self.persist(state)?;
                return Err(Error::Abort("aborted by user".to_string()));
            }
            let event = Event::Error(result.error.clone().unwrap_or_default());
            self.machine.dispatch_with_mode(event.clone(), state.mode);
            self.record_transition(state, &event);
            self.persist(state)?;
            return Err(Error::Git(result.error.unwrap_or_default()));
        }

        if result.paused_at.is_some() {
            // `recording_progress` already drove `implementing.current_task`
            // to the paused count via the last `TASK_COMPLETE`.
            let event = Event::Pause;
            self.machine.dispatch_with_mode(event.clone(), state.mode);
            self.record_transition(state, &event);
            self.persist(state)?;
            return Ok(());
        }

        self.machine
            .dispatch_with_mode(Event::TaskComplete(completed.max(total_tasks)), state.mode);
        let event = Event::PhaseComplete;
        self.machine.dispatch_with_mode(event.clone(), state.mode);
        self.record_transition(state, &event);
        self.persist(state)
    }

    pub fn resume_from_pause(&mut self, state: &mut FlowState) -> Result<()> {
        let event = Event::Resume;
        self.machine.dispatch_with_mode(event.clone(), state.mode);
        self.record_transition(state, &event);
        self.persist(state)
    }

    pub async fn create_pr(&mut self, state: &mut FlowState, base_branch: &str) -> Result<()> {
        let feature = state.feature.clone();
        let working_dir = self.working_directory_for(&feature);
        let spec_dir = self.spec_dir_for(&feature);

        crate::pr::push(&working_dir, "origin")
            .await
            .map_err(Error::Git)?;

        let result = crate::pr::create_pr(crate::pr::CreatePrRequest {
            work_dir: &working_dir,
            feature: &feature,
            spec_dir: &spec_dir,
            base_branch,
        })
        .await;

        if !result.success {
            let message = result.error.unwrap_or_default();
            let event = Event::Error(message.clone());
            self.machine.dispatch_with_mode(event.clone(), state.mode);
            self.record_transition(state, &event);
            self.persist(state)?;
            return Err(Error::Git(message));
        }

        if let Some(number) = result.pr_number {
            state.metadata.insert("prNumber".to_string(), number.to_string());
        }

        let event = Event::PrCreated(result.pr_url.unwrap_or_default());
        self.machine.dispatch_with_mode(event.clone(), state.mode);
        self.record_transition(state, &event);
        self.persist(state)
    }

    /// Merge the feature's pull request (squash, deleting the branch) and
    /// complete the flow.
    pub async fn merge(&mut self, state: &mut FlowState) -> Result<()> {
        let working_dir = self.working_directory_for(&state.feature);
        let pr_number: u64 = state
            .metadata
            .get("prNumber")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::validation("no pull request recorded for this feature"))?;

        crate::pr::merge_pr(&working_dir, pr_number, true, true)
            .await
            .map_err(Error::Git)?;

        let event = Event::Merge;
        self.machine.dispatch_with_mode(event.clone(), state.mode);
        self.record_transition(state, &event);
        self.persist(state)
    }

    /// Leave the feature's pull request open and complete the flow without
    /// merging it.
    pub fn skip_merge(&mut self, state: &mut FlowState) -> Result<()> {
        let event = Event::SkipMerge;
        self.machine.dispatch_with_mode(event.clone(), state.mode);
        self.record_transition(state, &event);
        self.persist(state)
    }

    /// Abort the in-flight feature: stop any running agent/task runner,
    /// close any open PR, delete the branch (local + remote), remove the
    /// worktree, and archive the state file. Every teardown step's failure
    /// is reported but does not prevent the others from running.
    pub async fn abort(&mut self, state: &mut FlowState, reason: &str) -> Result<Vec<String>> {
        self.abort.abort();

        let mut failures = Vec::new();
        let feature = state.feature.clone();
        let branch = format!("feature/{feature}");
        let working_dir = self.working_directory_for(&feature);

        let status = git::status(&working_dir).await;
        if let Err(e) = status {
            failures.push(format!("status check failed: {e}"));
        }

        if let Some(pr_number) = state.metadata.get("prNumber").and_then(|s| s.parse::<u64>().ok()) {
            if let Err(e) = crate::pr::close_pr(&working_dir, pr_number).await {
                failures.push(format!("pr close failed: {e}"));
            }
        }

        let remove = git::worktree_remove(&self.work_dir, &feature, true).await;
        if !remove.success {
            failures.push(format!(
                "worktree remove failed: {}",
                remove.error.unwrap_or_default()
            ));
        }

        let local_delete = git::branch_delete(&self.work_dir, &branch, true, false).await;
        if !local_delete.success {
            failures.push(format!(
                "local branch delete failed: {}",
                local_delete.error.unwrap_or_default()
            ));
        }

        let remote_delete = git::branch_delete(&self.work_dir, &branch, true, true).await;
        if !remote_delete.success {
            failures.push(format!(
                "remote branch delete failed: {}",
                remote_delete.error.unwrap_or_default()
            ));
        }

        let event = Event::Abort(reason.to_string());
        self.machine.dispatch_with_mode(event.clone(), state.mode);
        self.record_transition(state, &event);

        if let Err(e) = self.persist(state) {
            failures.push(format!("final state persist failed: {e}"));
        }
        if let Err(e) = self.store.archive(&feature) {
            failures.push(format!("archive failed: {e}"));
        }

        Ok(failures)
    }
}

/// Re-derive `taskProgress` from `tasks.md` after a Task Runner pass, so the
/// persisted `completedGroups` / `taskEntries` always reflect what's on disk
/// rather than an in-memory ledger that could drift from it.
/// Build per-task progress from `tasks.md`, attaching `tokenUsage` for
/// tasks this run completed and a post-hoc `contextUsage` accumulated from
/// every completed task that precedes it in file order.
fn task_progress_from_disk(
    spec_dir: &std::path::Path,
    task_usage: &HashMap<String, TokenUsage>,
) -> Option<GroupedTaskProgress> {
    let all = tasks::parse(spec_dir).ok()?;
    let groups = tasks::group_tasks(&all);

    let completed_groups: Vec<u32> = groups
        .iter()
        .filter(|g| g.completed)
        .map(|g| g.group)
        .collect();

    let mut prior_completed: Vec<TaskEntry> = Vec::new();
    let task_entries: Vec<TaskEntry> = all
        .iter()
        .map(|t| {
            let usage = task_usage.get(&t.id).cloned();
            let context_usage = usage.as_ref().map(|u| {
                let prior_refs: Vec<&TaskEntry> = prior_completed.iter().collect();
                compute_context_usage(u, &prior_refs)
            });
            let entry = TaskEntry {
                id: t.id.clone(),
                title: t.title.clone(),
                started_at: None,
                completed_at: None,
                status: if t.completed {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Pending
                },
                token_usage: usage,
                context_usage,
            };
            if entry.status == TaskStatus::Completed {
                prior_completed.push(entry.clone());
            }
            entry
        })
        .collect();

    Some(GroupedTaskProgress {
        completed_groups,
        total_groups: groups.len() as u32,
        current_group: None,
        task_entries,
        current_task_id: None,
    })
}

fn is_gate_or_pause_phase(phase: &Phase) -> bool {
    matches!(
        phase,
        Phase::RequirementsApproval { .. }
            | Phase::GapReview { .. }
            | Phase::DesignApproval { .. }
            | Phase::DesignValidationReview { .. }
            | Phase::TasksApproval { .. }
            | Phase::Paused { .. }
            | Phase::MergeDecision { .. }
    )
}

fn event_name(event: &Event) -> String {
    match event {
        Event::Start { .. } => "START".to_string(),
        Event::PhaseComplete => "PHASE_COMPLETE".to_string(),
        Event::Approve => "APPROVE".to_string(),
        Event::Reject => "REJECT".to_string(),
        Event::TaskComplete(i) => format!("TASK_COMPLETE({i})"),
        Event::Pause => "PAUSE".to_string(),
        Event::Resume => "RESUME".to_string(),
        Event::PrCreated(_) => "PR_CREATED".to_string(),
        Event::Merge => "MERGE".to_string(),
        Event::SkipMerge => "SKIP_MERGE".to_string(),
        Event::Abort(_) => "ABORT".to_string(),
        Event::Error(_) => "ERROR".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_phases_halt_the_drive_loop() {
        assert!(is_gate_or_pause_phase(&Phase::RequirementsApproval {
            feature: "f".into()
        }));
        assert!(is_gate_or_pause_phase(&Phase::Paused {
            feature: "f".into(),
            paused_at: 1,
            total_tasks: 4
        }));
        assert!(!is_gate_or_pause_phase(&Phase::Validation { feature: "f".into() }));
    }
}
