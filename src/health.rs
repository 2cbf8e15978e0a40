//! Health Checker (component J): verify credentials, connectivity, and CLI
//! presence with a minimal agent call.

use std::path::PathBuf;
use std::time::Duration;

use crate::agent::{self, AgentInvocation, AgentKind, SandboxConfig};
use crate::error::{AgentErrorCode, AgentErrorDetail};
use crate::process::AbortHandle;

const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_PROMPT: &str = "Reply with exactly: OK";

pub struct HealthCheckRequest {
    pub agent: AgentKind,
    pub tier: Option<String>,
    pub sandbox: Option<SandboxConfig>,
    pub timeout: Option<Duration>,
    pub working_directory: PathBuf,
    pub binary_override: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub success: bool,
    pub error: Option<AgentErrorDetail>,
}

fn install_instructions(agent: AgentKind) -> String {
    match agent {
        AgentKind::Claude => "install with `npm install -g @anthropic-ai/claude-code`".to_string(),
        AgentKind::Gemini => "install the gemini CLI and ensure it is on PATH".to_string(),
        AgentKind::Codex => "install the codex CLI and ensure it is on PATH".to_string(),
    }
}

pub async fn check(req: HealthCheckRequest) -> HealthCheckResult {
    let invocation = AgentInvocation {
        prompt: HEALTH_PROMPT.to_string(),
        working_directory: req.working_directory,
        skip_permissions: true,
        tier: req.tier,
        agent: req.agent,
        model: None,
        sandbox: req.sandbox,
        timeout: Some(req.timeout.unwrap_or(DEFAULT_HEALTH_TIMEOUT)),
        binary_override: req.binary_override,
        env: Vec::new(),
    };

    let result = agent::invoke(invocation, AbortHandle::new()).await;

    if let Some(detail) = result.claude_error {
        if detail.code == AgentErrorCode::CliNotFound {
            return HealthCheckResult {
                success: false,
                error: Some(AgentErrorDetail {
                    suggestion: Some(install_instructions(req.agent)),
                    ..detail
                }),
            };
        }
        return HealthCheckResult {
            success: false,
            error: Some(detail),
        };
    }

    if result.timed_out {
        return HealthCheckResult {
            success: false,
            error: Some(AgentErrorDetail {
                code: AgentErrorCode::NetworkError,
                message: "health check timed out".to_string(),
                recoverable: true,
                suggestion: Some("check network connectivity and retry".to_string()),
                retry_after_ms: None,
            }),
        };
    }

    HealthCheckResult {
        success: result.success,
        error: None,
    }
}
