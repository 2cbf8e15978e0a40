//! Agent Invoker (component B): builds agent-specific argv/env, optionally
//! wraps the call in a container, and parses token usage / known error
//! signatures out of the child's output.
//!
//! Per-agent argv construction is grounded on the donor's
//! `harness::claude_code::ClaudeCodeHarness::build_args` and
//! `harness::codex::CodexHarness`, generalized into the enum -> struct table
//! the design notes call for instead of one struct per harness trait impl.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AgentErrorCode, AgentErrorDetail};
use crate::process::{self, AbortHandle, RunOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Gemini,
    Codex,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Claude => write!(f, "claude"),
            AgentKind::Gemini => write!(f, "gemini"),
            AgentKind::Codex => write!(f, "codex"),
        }
    }
}

impl AgentKind {
    fn default_binary(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Gemini => "gemini",
            AgentKind::Codex => "codex",
        }
    }

    /// Environment variable the sandboxed container forwards for this agent.
    pub fn api_key_env_name(self) -> &'static str {
        match self {
            AgentKind::Claude => "ANTHROPIC_API_KEY",
            AgentKind::Gemini => "GEMINI_API_KEY",
            AgentKind::Codex => "OPENAI_API_KEY",
        }
    }

    fn build_argv(self, prompt: &str, model: Option<&str>, skip_permissions: bool) -> Vec<String> {
        match self {
            AgentKind::Claude => {
                let mut args = vec!["-p".to_string(), prompt.to_string()];
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                if skip_permissions {
                    args.push("--dangerously-skip-permissions".to_string());
                }
                args
            }
            AgentKind::Gemini => {
                let mut args = vec!["-p".to_string(), prompt.to_string()];
                if let Some(m) = model {
                    args.push("-m".to_string());
                    args.push(m.to_string());
                }
                if skip_permissions {
                    args.push("--approval-mode=yolo".to_string());
                }
                args
            }
            AgentKind::Codex => {
                let mut args = vec!["exec".to_string(), prompt.to_string()];
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                args
            }
        }
    }
}

/// Per-agent invocation request (§3.1 AgentInvocation).
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub prompt: String,
    pub working_directory: PathBuf,
    pub skip_permissions: bool,
    pub tier: Option<String>,
    pub agent: AgentKind,
    pub model: Option<String>,
    pub sandbox: Option<SandboxConfig>,
    pub timeout: Option<Duration>,
    pub binary_override: Option<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
}

/// Token usage extracted from agent output (§3.1 TokenUsage).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub model: Option<String>,
    pub cache_read_tokens: Option<u64>,
    pub cache_creation_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
}

/// Result of an agent invocation (§3.1 AgentResult, transient).
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub claude_error: Option<AgentErrorDetail>,
    pub usage: Option<TokenUsage>,
}

/// Invoke an agent, returning a result that is never an `Err` for agent-side
/// failures (those are carried in `AgentResult`), mirroring the Process
/// Runner's "never throws" contract.
pub async fn invoke(invocation: AgentInvocation, abort: AbortHandle) -> AgentResult {
    let binary = invocation
        .binary_override
        .clone()
        .unwrap_or_else(|| invocation.agent.default_binary().to_string());

    let argv = invocation.agent.build_argv(
        &invocation.prompt,
        invocation.model.as_deref(),
        invocation.skip_permissions,
    );

    let (command, args, cwd, mut env) = if let Some(sandbox) = &invocation.sandbox {
        build_sandboxed_command(&invocation, sandbox, &binary, argv)
    } else {
        (binary, argv, Some(invocation.working_directory.clone()), Vec::new())
    };
    env.extend(invocation.env.clone());

    let outcome = process::run(
        &command,
        &args,
        RunOptions {
            cwd,
            env,
            timeout: invocation.timeout,
        },
        abort,
        |line| debug!(target: "agent.stdout", "{line}"),
        |line| debug!(target: "agent.stderr", "{line}"),
    )
    .await;

    if outcome.cli_not_found() {
        return AgentResult {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: outcome.spawn_error.clone().unwrap_or_default(),
            timed_out: false,
            claude_error: Some(AgentErrorDetail {
                code: AgentErrorCode::CliNotFound,
                message: format!("{command} was not found on PATH"),
                recoverable: false,
                suggestion: Some(format!("install the {} CLI", invocation.agent)),
                retry_after_ms: None,
            }),
            usage: None,
        };
    }

    let usage = parse_usage(&outcome.stdout);
    let success = outcome.success();

    let claude_error = if !success && invocation.agent == AgentKind::Claude {
        detect_claude_error(&format!("{}\n{}", outcome.stdout, outcome.stderr))
    } else {
        None
    };

    AgentResult {
        success,
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        timed_out: outcome.timed_out,
        claude_error,
        usage,
    }
}

fn build_sandboxed_command(
    invocation: &AgentInvocation,
    sandbox: &SandboxConfig,
    binary: &str,
    mut argv: Vec<String>,
) -> (String, Vec<String>, Option<PathBuf>, Vec<(String, String)>) {
    let mount = format!("{}:/workspace", invocation.working_directory.display());
    let api_key_var = invocation.agent.api_key_env_name();
    let api_key = discover_api_key(invocation.agent).unwrap_or_default();

    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-v".to_string(),
        mount,
        "-w".to_string(),
        "/workspace".to_string(),
        "-e".to_string(),
        format!("{api_key_var}={api_key}"),
        sandbox.image.clone(),
        binary.to_string(),
    ];
    args.append(&mut argv);
    if !args.contains(&"--dangerously-skip-permissions".to_string())
        && invocation.agent == AgentKind::Claude
    {
        args.push("--dangerously-skip-permissions".to_string());
    }
    ("docker".to_string(), args, None, Vec::new())
}

/// Look up an agent's API key from the environment, falling back to a
/// per-agent credentials file under the user's home directory.
pub fn discover_api_key(agent: AgentKind) -> Option<String> {
    if let Ok(v) = std::env::var(agent.api_key_env_name()) {
        if !v.is_empty() {
            return Some(v);
        }
    }
    let home = dirs::home_dir()?;
    let path: PathBuf = match agent {
        AgentKind::Claude => home.join(".claude").join("credentials"),
        AgentKind::Gemini => home.join(".gemini").join("credentials"),
        AgentKind::Codex => home.join(".codex").join("auth.json"),
    };
    read_credential_file(&path)
}

fn read_credential_file(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Claude-CLI result JSON, per §4.B.
#[derive(Debug, Deserialize)]
struct ResultDocument {
    #[serde(rename = "type")]
    doc_type: Option<String>,
    usage: Option<UsageDocument>,
    #[serde(rename = "modelUsage")]
    model_usage: Option<std::collections::HashMap<String, UsageDocument>>,
    #[serde(rename = "total_cost_usd")]
    total_cost_usd: Option<f64>,
    #[allow(dead_code)]
    result: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct UsageDocument {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
}

fn parse_usage(stdout: &str) -> Option<TokenUsage> {
    let trimmed = stdout.trim();
    if let Ok(doc) = serde_json::from_str::<ResultDocument>(trimmed) {
        if doc.doc_type.as_deref() == Some("result") {
            if let Some(model_usage) = &doc.model_usage {
                if let Some((model, usage)) = model_usage.iter().next() {
                    let input = usage.input_tokens.unwrap_or(0);
                    let output = usage.output_tokens.unwrap_or(0);
                    return Some(TokenUsage {
                        input_tokens: input,
                        output_tokens: output,
                        total_tokens: input + output,
                        model: Some(model.clone()),
                        cache_read_tokens: usage.cache_read_input_tokens,
                        cache_creation_tokens: usage.cache_creation_input_tokens,
                        cost_usd: doc.total_cost_usd,
                    });
                }
            }
            if let Some(usage) = &doc.usage {
                let input = usage.input_tokens.unwrap_or(0);
                let output = usage.output_tokens.unwrap_or(0);
                return Some(TokenUsage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: input + output,
                    model: None,
                    cache_read_tokens: usage.cache_read_input_tokens,
                    cache_creation_tokens: usage.cache_creation_input_tokens,
                    cost_usd: doc.total_cost_usd,
                });
            }
        }
    }
    parse_usage_regex(stdout)
}

/// Prioritized line-oriented fallback patterns for non-JSON agent output.
fn parse_usage_regex(stdout: &str) -> Option<TokenUsage> {
    let patterns: &[(&str, &str)] = &[
        (r"(?i)input[_ ]tokens?[:=]\s*(\d+)", "input"),
        (r"(?i)output[_ ]tokens?[:=]\s*(\d+)", "output"),
        (r"(?i)cache[_ ]read[_ ]tokens?[:=]\s*(\d+)", "cache_read"),
        (
            r"(?i)cache[_ ]creation[_ ]tokens?[:=]\s*(\d+)",
            "cache_creation",
        ),
        (r"(?i)model[:=]\s*([a-zA-Z0-9._-]+)", "model"),
    ];

    let mut input_tokens = None;
    let mut output_tokens = None;
    let mut cache_read = None;
    let mut cache_creation = None;
    let mut model = None;

    for line in stdout.lines() {
        for (pattern, field) in patterns {
            let re = Regex::new(pattern).expect("static regex is valid");
            if let Some(caps) = re.captures(line) {
                let value = caps.get(1).map(|m| m.as_str().to_string());
                match *field {
                    "input" => input_tokens = value.and_then(|v| v.parse().ok()),
                    "output" => output_tokens = value.and_then(|v| v.parse().ok()),
                    "cache_read" => cache_read = value.and_then(|v| v.parse().ok()),
                    "cache_creation" => cache_creation = value.and_then(|v| v.parse().ok()),
                    "model" => model = value,
                    _ => {}
                }
            }
        }
    }

    match (input_tokens, output_tokens) {
        (Some(input), Some(output)) => Some(TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            model,
            cache_read_tokens: cache_read,
            cache_creation_tokens: cache_creation,
            cost_usd: None,
        }),
        _ => None,
    }
}

/// Ordered pattern -> code catalogue for claude CLI failures (§4.B). First
/// match wins.
fn detect_claude_error(combined_output: &str) -> Option<AgentErrorDetail> {
    let catalogue: &[(&str, AgentErrorCode, bool, &str)] = &[
        (
            r"(?i)credit balance is too low",
            AgentErrorCode::CreditExhausted,
            false,
            "add credit to the account before retrying",
        ),
        (
            r"(?i)rate limit exceeded",
            AgentErrorCode::RateLimited,
            true,
            "wait for the rate limit window to reset",
        ),
        (
            r"(?i)(invalid api key|unauthorized|authentication failed)",
            AgentErrorCode::AuthFailed,
            false,
            "check the configured API key or credentials file",
        ),
        (
            r"(?i)(command not found|no such file or directory)",
            AgentErrorCode::CliNotFound,
            false,
            "install the claude CLI and ensure it is on PATH",
        ),
        (
            r"(?i)(model .* (not available|unavailable)|overloaded)",
            AgentErrorCode::ModelUnavailable,
            true,
            "retry with a different model or wait and retry",
        ),
        (
            r"(?i)(context length exceeded|prompt is too long|context_length_exceeded)",
            AgentErrorCode::ContextExceeded,
            false,
            "shorten the prompt or split the task",
        ),
        (
            r"(?i)(network error|econnrefused|connection reset|timed out)",
            AgentErrorCode::NetworkError,
            true,
            "check network connectivity and retry",
        ),
        (
            r"(?i)(permission denied|forbidden)",
            AgentErrorCode::PermissionDenied,
            false,
            "check file and credential permissions",
        ),
    ];

    for (pattern, code, recoverable, suggestion) in catalogue {
        let re = Regex::new(pattern).expect("static regex is valid");
        if let Some(m) = re.find(combined_output) {
            return Some(AgentErrorDetail {
                code: *code,
                message: m.as_str().to_string(),
                recoverable: *recoverable,
                suggestion: Some(suggestion.to_string()),
                retry_after_ms: None,
            });
        }
    }

    if combined_output.trim().is_empty() {
        return None;
    }

    warn!("claude exited non-zero with an unrecognized error pattern");
    Some(AgentErrorDetail {
        code: AgentErrorCode::Unknown,
        message: combined_output.lines().next().unwrap_or("").to_string(),
        recoverable: true,
        suggestion: None,
        retry_after_ms: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_argv_includes_model_and_skip_permissions() {
        let argv = AgentKind::Claude.build_argv("do the thing", Some("opus"), true);
        assert_eq!(
            argv,
            vec![
                "-p",
                "do the thing",
                "--model",
                "opus",
                "--dangerously-skip-permissions"
            ]
        );
    }

    #[test]
    fn gemini_argv_uses_approval_mode_yolo() {
        let argv = AgentKind::Gemini.build_argv("x", None, true);
        assert_eq!(argv, vec!["-p", "x", "--approval-mode=yolo"]);
    }

    #[test]
    fn codex_argv_is_exec_subcommand() {
        let argv = AgentKind::Codex.build_argv("x", Some("o3"), false);
        assert_eq!(argv, vec!["exec", "x", "--model", "o3"]);
    }

    #[test]
    fn rate_limited_is_recoverable() {
        let detail = detect_claude_error("Error: rate limit exceeded, try later").unwrap();
        assert_eq!(detail.code, AgentErrorCode::RateLimited);
        assert!(detail.recoverable);
    }

    #[test]
    fn credit_exhausted_is_not_recoverable() {
        let detail = detect_claude_error("Your credit balance is too low").unwrap();
        assert_eq!(detail.code, AgentErrorCode::CreditExhausted);
        assert!(!detail.recoverable);
    }

    #[test]
    fn first_matching_pattern_wins() {
        let detail =
            detect_claude_error("credit balance is too low, also rate limit exceeded").unwrap();
        assert_eq!(detail.code, AgentErrorCode::CreditExhausted);
    }

    #[test]
    fn parses_result_json_usage() {
        let stdout = r#"{"type":"result","usage":{"input_tokens":100,"output_tokens":50,"cache_read_input_tokens":10,"cache_creation_input_tokens":5},"total_cost_usd":0.02,"result":"done"}"#;
        let usage = parse_usage(stdout).unwrap();
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 50);
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(usage.cost_usd, Some(0.02));
    }

    #[test]
    fn model_usage_takes_precedence() {
        let stdout = r#"{"type":"result","usage":{"input_tokens":1,"output_tokens":1},"modelUsage":{"claude-opus-4":{"input_tokens":200,"output_tokens":80}},"result":"done"}"#;
        let usage = parse_usage(stdout).unwrap();
        assert_eq!(usage.input_tokens, 200);
        assert_eq!(usage.model, Some("claude-opus-4".to_string()));
    }

    #[test]
    fn falls_back_to_regex_when_not_json() {
        let stdout = "input_tokens: 12\noutput_tokens: 34\nmodel: sonnet";
        let usage = parse_usage(stdout).unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 34);
        assert_eq!(usage.total_tokens, 46);
        assert_eq!(usage.model, Some("sonnet".to_string()));
    }

    #[test]
    fn no_usage_when_nothing_matches() {
        assert!(parse_usage("nothing useful here").is_none());
    }
}
