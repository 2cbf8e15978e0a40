//! Phase Executor (component G): synthesizes a prompt for a generating
//! phase and invokes the Agent Invoker with a retry+backoff loop.
//!
//! Grounded on the donor's `workflow::runner::WorkflowRunner::build_stage_prompt`
//! / `run_stage` (prompt-template substitution followed by a single harness
//! call) generalized into the linear-backoff retry loop §4.G specifies.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::agent::{self, AgentInvocation, AgentKind, SandboxConfig, TokenUsage};
use crate::error::AgentErrorDetail;
use crate::process::AbortHandle;
use crate::state::Phase;

/// Default retry cap when a caller has no configured value (§4.G names 3).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ExecutionFlags {
    pub agent: AgentKind,
    pub model: Option<String>,
    pub skip_permissions: bool,
    pub sandbox: Option<SandboxConfig>,
    pub timeout: Duration,
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub binary_override: Option<String>,
}

impl Default for ExecutionFlags {
    fn default() -> Self {
        Self {
            agent: AgentKind::Claude,
            model: None,
            skip_permissions: false,
            sandbox: None,
            timeout: Duration::from_secs(600),
            base_delay: Duration::from_secs(2),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            binary_override: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub claude_error: Option<AgentErrorDetail>,
    /// RFC3339 timestamps and wall-clock duration for this call, surfaced
    /// by the Orchestrator Facade as the feature's `phaseMetrics` entry.
    pub started_at: String,
    pub completed_at: String,
    pub elapsed_ms: u64,
    pub usage: Option<TokenUsage>,
}

/// A generating phase's prompt template. Only these phases (plus per-task
/// work handled separately by the Task Runner) invoke an agent; every other
/// phase returns success immediately with no output.
fn prompt_template(phase: &Phase) -> Option<String> {
    match phase {
        Phase::Initializing { .. } => Some(
            "You are starting a new feature named {feature}. Produce an initial \
             project description from: {description}"
                .to_string(),
        ),
        Phase::RequirementsGenerating { .. } => Some(
            "Write requirements.md for feature {feature} based on the project \
             description already on disk."
                .to_string(),
        ),
        Phase::DesignGenerating { .. } => Some(
            "Write design.md for feature {feature} based on the approved \
             requirements.md."
                .to_string(),
        ),
        Phase::TasksGenerating { .. } => Some(
            "Write tasks.md for feature {feature} decomposing the approved design \
             into a checklist of numbered tasks."
                .to_string(),
        ),
        _ => None,
    }
}

fn render_prompt(template: &str, phase: &Phase) -> String {
    let feature = phase.feature().to_string();
    let mut rendered = template.replace("{feature}", &feature);
    if let Phase::Initializing { description, .. } = phase {
        rendered = rendered.replace("{description}", description);
    }
    rendered
}

/// Execute a single phase. Non-generating phases succeed immediately.
pub async fn execute(
    phase: &Phase,
    flags: &ExecutionFlags,
    working_directory: PathBuf,
    abort: AbortHandle,
) -> PhaseResult {
    let started_at = Utc::now();

    let template = match prompt_template(phase) {
        Some(t) => t,
        None => {
            let now = started_at.to_rfc3339();
            return PhaseResult {
                success: true,
                output: None,
                error: None,
                claude_error: None,
                started_at: now.clone(),
                completed_at: now,
                elapsed_ms: 0,
                usage: None,
            };
        }
    };

    let prompt = render_prompt(&template, phase);
    let mut last_stderr = String::new();

    let max_attempts = flags.max_attempts.max(1);

    let elapsed = |started_at: chrono::DateTime<Utc>| -> (String, u64) {
        let completed_at = Utc::now();
        let elapsed_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        (completed_at.to_rfc3339(), elapsed_ms)
    };

    for attempt in 1..=max_attempts {
        if abort.is_aborted() {
            let (completed_at, elapsed_ms) = elapsed(started_at);
            return PhaseResult {
                success: false,
                output: None,
                error: Some("aborted".to_string()),
                claude_error: None,
                started_at: started_at.to_rfc3339(),
                completed_at,
                elapsed_ms,
                usage: None,
            };
        }

        info!(phase = phase.type_tag(), attempt, "invoking agent for phase");

        let invocation = AgentInvocation {
            prompt: prompt.clone(),
            working_directory: working_directory.clone(),
            skip_permissions: flags.skip_permissions,
            tier: None,
            agent: flags.agent,
            model: flags.model.clone(),
            sandbox: flags.sandbox.clone(),
            timeout: Some(flags.timeout),
            binary_override: flags.binary_override.clone(),
            env: Vec::new(),
        };

        let result = agent::invoke(invocation, abort.clone()).await;

        if result.success {
            let (completed_at, elapsed_ms) = elapsed(started_at);
            return PhaseResult {
                success: true,
                output: Some(result.stdout),
                error: None,
                claude_error: None,
                started_at: started_at.to_rfc3339(),
                completed_at,
                elapsed_ms,
                usage: result.usage,
            };
        }

        last_stderr = result.stderr.clone();

        if let Some(detail) = &result.claude_error {
            if !detail.recoverable {
                warn!(
                    phase = phase.type_tag(),
                    code = %detail.code,
                    "non-recoverable agent error, aborting retry loop"
                );
                let (completed_at, elapsed_ms) = elapsed(started_at);
                return PhaseResult {
                    success: false,
                    output: None,
                    error: Some(detail.message.clone()),
                    claude_error: Some(detail.clone()),
                    started_at: started_at.to_rfc3339(),
                    completed_at,
                    elapsed_ms,
                    usage: None,
                };
            }
        }

        if attempt < max_attempts {
            let delay = flags.base_delay * attempt;
            warn!(phase = phase.type_tag(), attempt, ?delay, "retrying after failed agent invocation");
            tokio::time::sleep(delay).await;
        }
    }

    let (completed_at, elapsed_ms) = elapsed(started_at);
    PhaseResult {
        success: false,
        output: None,
        error: Some(last_stderr),
        claude_error: None,
        started_at: started_at.to_rfc3339(),
        completed_at,
        elapsed_ms,
        usage: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_generating_phases_have_no_template() {
        assert!(prompt_template(&Phase::Idle).is_none());
        assert!(prompt_template(&Phase::RequirementsApproval { feature: "f".into() }).is_none());
        assert!(prompt_template(&Phase::Complete { feature: "f".into() }).is_none());
    }

    #[test]
    fn renders_feature_and_description_placeholders() {
        let phase = Phase::Initializing {
            feature: "user-auth".into(),
            description: "add login".into(),
        };
        let rendered = render_prompt(prompt_template(&phase).unwrap().as_str(), &phase);
        assert!(rendered.contains("user-auth"));
        assert!(rendered.contains("add login"));
    }
}
