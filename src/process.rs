//! Process Runner (component A): spawn a child, stream its output, enforce a
//! timeout, and support cooperative abort.
//!
//! Grounded on the donor's `harness::claude_code::ClaudeCodeHarness::send`
//! (tokio `Command` + piped stdio + `BufReader::lines`) generalized to a
//! timeout-aware, abortable single operation instead of a one-shot harness
//! call.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Grace window between a soft terminate and an escalated kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

/// Cooperative cancellation flag shared between a caller and an in-flight run.
/// Setting it is semantically equivalent to the timeout firing immediately.
#[derive(Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the child process stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exited,
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Set when the binary itself could not be spawned (e.g. ENOENT).
    pub spawn_error: Option<String>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.spawn_error.is_none() && !self.timed_out && self.exit_code == Some(0)
    }

    /// True when the spawn failure looks like the binary is missing from PATH.
    pub fn cli_not_found(&self) -> bool {
        self.spawn_error
            .as_deref()
            .map(|e| e.contains("No such file or directory") || e.contains("os error 2"))
            .unwrap_or(false)
    }
}

/// Run `command args...`, streaming stdout/stderr chunks to the supplied
/// callbacks while accumulating the full text, and never panicking or
/// returning an `Err` for process-level failures (spawn errors are reported
/// in the outcome, per §4.A).
pub async fn run<FOut, FErr>(
    command: &str,
    args: &[String],
    opts: RunOptions,
    abort: AbortHandle,
    mut on_stdout: FOut,
    mut on_stderr: FErr,
) -> RunOutcome
where
    FOut: FnMut(&str) + Send,
    FErr: FnMut(&str) + Send,
{
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in &opts.env {
        cmd.env(k, v);
    }

    debug!(%command, ?args, "spawning process");

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return RunOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
                spawn_error: Some(e.to_string()),
            };
        }
    };

    let pid = child.id();
    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();

    let timeout = opts.timeout.unwrap_or(Duration::from_secs(600));
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut poll_abort = tokio::time::interval(Duration::from_millis(200));
    let mut stop_reason = StopReason::Exited;
    let status;

    loop {
        tokio::select! {
            line = stdout_lines.next_line() => {
                match line {
                    Ok(Some(l)) => {
                        on_stdout(&l);
                        stdout_buf.push_str(&l);
                        stdout_buf.push('\n');
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "error reading child stdout"),
                }
            }
            line = stderr_lines.next_line() => {
                match line {
                    Ok(Some(l)) => {
                        on_stderr(&l);
                        stderr_buf.push_str(&l);
                        stderr_buf.push('\n');
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "error reading child stderr"),
                }
            }
            wait = child.wait() => {
                status = wait;
                break;
            }
            _ = &mut deadline => {
                stop_reason = StopReason::TimedOut;
                status = terminate_then_kill(&mut child, pid).await;
                break;
            }
            _ = poll_abort.tick() => {
                if abort.is_aborted() {
                    stop_reason = StopReason::Aborted;
                    status = terminate_then_kill(&mut child, pid).await;
                    break;
                }
            }
        }
    }

    // Drain any remaining buffered output after the child has stopped.
    while let Ok(Some(l)) = stdout_lines.next_line().await {
        on_stdout(&l);
        stdout_buf.push_str(&l);
        stdout_buf.push('\n');
    }
    while let Ok(Some(l)) = stderr_lines.next_line().await {
        on_stderr(&l);
        stderr_buf.push_str(&l);
        stderr_buf.push('\n');
    }

    let exit_code = status.ok().and_then(|s| s.code());
    let timed_out = matches!(stop_reason, StopReason::TimedOut | StopReason::Aborted);

    RunOutcome {
        exit_code,
        stdout: stdout_buf,
        stderr: stderr_buf,
        timed_out,
        spawn_error: None,
    }
}

async fn terminate_then_kill(
    child: &mut tokio::process::Child,
    pid: Option<u32>,
) -> std::io::Result<std::process::ExitStatus> {
    if let Some(pid) = pid {
        #[cfg(unix)]
        {
            let _ = std::process::Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .output();
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(?pid, "process did not exit after terminate, escalating to kill");
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_failure_is_reported_not_thrown() {
        let outcome = run(
            "definitely-not-a-real-binary-xyz",
            &[],
            RunOptions::default(),
            AbortHandle::new(),
            |_| {},
            |_| {},
        )
        .await;
        assert!(outcome.spawn_error.is_some());
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let outcome = run(
            "sh",
            &["-c".to_string(), "echo hello".to_string()],
            RunOptions::default(),
            AbortHandle::new(),
            |_| {},
            |_| {},
        )
        .await;
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout.contains("hello"));
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn timeout_is_flagged() {
        let outcome = run(
            "sh",
            &["-c".to_string(), "sleep 5".to_string()],
            RunOptions {
                timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
            AbortHandle::new(),
            |_| {},
            |_| {},
        )
        .await;
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn abort_flag_stops_child_like_a_timeout() {
        let abort = AbortHandle::new();
        let abort2 = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abort2.abort();
        });
        let outcome = run(
            "sh",
            &["-c".to_string(), "sleep 5".to_string()],
            RunOptions::default(),
            abort,
            |_| {},
            |_| {},
        )
        .await;
        assert!(outcome.timed_out);
    }
}
