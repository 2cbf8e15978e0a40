//! End-to-end coverage driving the Orchestrator Facade against a real git
//! repository and a fake agent binary standing in for `claude`.

use std::path::Path;

use red64::task_runner::CheckpointDecision;
use red64::{AgentKind, Config, Mode, Orchestrator, Phase, StartFlags};

fn run_git(repo: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(repo)
        .status()
        .expect("git is on PATH");
    assert!(status.success(), "git {args:?} failed");
}

/// Initialize a git repo with one commit and a usable identity so `git
/// commit` in the worktree never fails for lack of author info.
fn init_repo(dir: &Path) {
    run_git(dir, &["init", "-q"]);
    run_git(dir, &["config", "user.email", "test@example.com"]);
    run_git(dir, &["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "seed\n").unwrap();
    run_git(dir, &["add", "-A"]);
    run_git(dir, &["commit", "-q", "-m", "initial"]);
}

#[cfg(unix)]
fn write_fake_agent(dir: &Path, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-agent");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn config_with_agent(binary: &std::path::Path, checkpoint_interval: usize, max_attempts: u32) -> Config {
    let mut config = Config::default();
    config.agents.claude.binary = Some(binary.display().to_string());
    config.checkpoint_interval = checkpoint_interval;
    config.max_attempts = max_attempts;
    config.base_delay_ms = 10;
    config.timeouts.agent_secs = 10;
    config.timeouts.health_secs = 10;
    config
}

fn flags() -> StartFlags {
    StartFlags {
        agent: AgentKind::Claude,
        model: None,
        skip_permissions: true,
        sandbox: None,
    }
}

fn write_tasks_md(spec_dir: &Path, n: usize) {
    let mut body = String::from("# Tasks\n\n");
    for i in 1..=n {
        body.push_str(&format!("- [ ] {i}. Task number {i}\n  - do thing {i}\n"));
    }
    std::fs::write(spec_dir.join("tasks.md"), body).unwrap();
}

/// S1-ish happy path through every approval gate, plus S6: a checkpoint
/// pause followed by resume and completion.
#[tokio::test]
async fn greenfield_flow_pauses_at_checkpoint_and_resumes_to_completion() {
    let repo = tempfile::tempdir().unwrap();
    init_repo(repo.path());

    let agent = write_fake_agent(repo.path(), "echo ok >> progress.log\nexit 0");
    let config = config_with_agent(&agent, 2, 3);
    let mut orchestrator = Orchestrator::new(repo.path(), config);

    let mut state = orchestrator
        .start("e2e feature", "build the thing", Mode::Greenfield, flags())
        .await
        .expect("start succeeds");
    assert!(matches!(state.phase, Phase::RequirementsApproval { .. }));

    orchestrator.approve(&mut state).unwrap();
    orchestrator.resume_driving(&mut state, &flags()).await.unwrap();
    assert!(matches!(state.phase, Phase::DesignApproval { .. }));

    orchestrator.approve(&mut state).unwrap();
    orchestrator.resume_driving(&mut state, &flags()).await.unwrap();
    assert!(matches!(state.phase, Phase::TasksApproval { .. }));

    let spec_dir = repo.path().join(".red64/specs/e2e-feature");
    write_tasks_md(&spec_dir, 3);

    orchestrator.approve(&mut state).unwrap();
    assert!(matches!(state.phase, Phase::Implementing { current_task: 1, total_tasks: 0, .. }));

    let mut seen = Vec::new();
    orchestrator
        .run_implementation(
            &mut state,
            &flags(),
            Box::new(|done, total, task| seen.push((done, total, task.id.clone()))),
            Box::new(|_done, _total| CheckpointDecision::Pause),
        )
        .await
        .unwrap();

    assert_eq!(seen, vec![(1, 3, "1".to_string()), (2, 3, "2".to_string())]);
    match &state.phase {
        Phase::Paused { paused_at, total_tasks, .. } => {
            assert_eq!(*paused_at, 2);
            assert_eq!(*total_tasks, 3);
        }
        other => panic!("expected Paused, got {other:?}"),
    }

    let progress = std::fs::read_to_string(
        repo.path().join("worktrees/e2e-feature/progress.log"),
    )
    .unwrap();
    assert_eq!(progress.lines().count(), 2);

    orchestrator.resume_from_pause(&mut state).unwrap();
    assert!(matches!(state.phase, Phase::Implementing { .. }));

    orchestrator
        .run_implementation(
            &mut state,
            &flags(),
            Box::new(|_, _, _| {}),
            Box::new(|_, _| CheckpointDecision::Continue),
        )
        .await
        .unwrap();

    assert!(matches!(state.phase, Phase::Validation { .. }));
    let progress = std::fs::read_to_string(
        repo.path().join("worktrees/e2e-feature/progress.log"),
    )
    .unwrap();
    assert_eq!(progress.lines().count(), 3);

    let all_tasks = red64::tasks::parse(&spec_dir).unwrap();
    assert!(all_tasks.iter().all(|t| t.completed));
}

/// S3: a recoverable rate-limit error on the second agent call (the
/// Initializing phase, right after a passing health check) retries and
/// then succeeds without the flow ever seeing an error.
#[tokio::test]
async fn rate_limited_phase_retries_then_succeeds() {
    let repo = tempfile::tempdir().unwrap();
    init_repo(repo.path());

    let counter = repo.path().join("invocations");
    let agent = write_fake_agent(
        repo.path(),
        &format!(
            "N=0\n\
             if [ -f '{counter}' ]; then N=$(cat '{counter}'); fi\n\
             N=$((N+1))\n\
             echo \"$N\" > '{counter}'\n\
             if [ \"$N\" -eq 2 ]; then\n\
             echo 'Error: rate limit exceeded, try later' 1>&2\n\
             exit 1\n\
             fi\n\
             echo ok >> progress.log\n\
             exit 0",
            counter = counter.display(),
        ),
    );
    let config = config_with_agent(&agent, 3, 3);
    let mut orchestrator = Orchestrator::new(repo.path(), config);

    let state = orchestrator
        .start("retry feature", "something flaky", Mode::Greenfield, flags())
        .await
        .expect("retry loop recovers from the single rate-limited attempt");

    assert!(matches!(state.phase, Phase::RequirementsApproval { .. }));
    let count: u32 = std::fs::read_to_string(&counter).unwrap().trim().parse().unwrap();
    assert_eq!(count, 4, "health check + failed attempt + retry + requirements generation");
}

/// S4: a non-recoverable credit-exhaustion error surfaces as an error and
/// halts the drive loop without retrying.
#[tokio::test]
async fn credit_exhaustion_is_not_retried() {
    let repo = tempfile::tempdir().unwrap();
    init_repo(repo.path());

    let counter = repo.path().join("invocations");
    let agent = write_fake_agent(
        repo.path(),
        &format!(
            "N=0\n\
             if [ -f '{counter}' ]; then N=$(cat '{counter}'); fi\n\
             N=$((N+1))\n\
             echo \"$N\" > '{counter}'\n\
             if [ \"$N\" -ge 3 ]; then\n\
             echo 'Your credit balance is too low' 1>&2\n\
             exit 1\n\
             fi\n\
             echo ok >> progress.log\n\
             exit 0",
            counter = counter.display(),
        ),
    );
    let config = config_with_agent(&agent, 3, 3);
    let mut orchestrator = Orchestrator::new(repo.path(), config);

    let result = orchestrator
        .start("broke feature", "can't afford it", Mode::Greenfield, flags())
        .await;
    assert!(result.is_err());

    let count: u32 = std::fs::read_to_string(&counter).unwrap().trim().parse().unwrap();
    assert_eq!(count, 3, "non-recoverable error aborts on the first failing attempt");

    let mut orchestrator = Orchestrator::new(repo.path(), Config::default());
    let state = orchestrator.load_state("broke feature").unwrap().expect("state was persisted");
    match state.phase {
        Phase::Error { error_message, .. } => {
            assert!(error_message.contains("credit balance"));
        }
        other => panic!("expected Error phase, got {other:?}"),
    }
}

/// Abort tears down the worktree and branch regardless of individual
/// step failures, and always leaves the flow in `Aborted`.
#[tokio::test]
async fn abort_tears_down_worktree_and_branch() {
    let repo = tempfile::tempdir().unwrap();
    init_repo(repo.path());

    let agent = write_fake_agent(repo.path(), "echo ok >> progress.log\nexit 0");
    let config = config_with_agent(&agent, 5, 3);
    let mut orchestrator = Orchestrator::new(repo.path(), config);

    let mut state = orchestrator
        .start("abort feature", "will not finish", Mode::Greenfield, flags())
        .await
        .unwrap();

    let failures = orchestrator.abort(&mut state, "user cancelled").await.unwrap();
    assert!(failures.is_empty(), "teardown should succeed cleanly: {failures:?}");
    assert!(matches!(state.phase, Phase::Aborted { .. }));
    assert!(!repo.path().join("worktrees/abort-feature").exists());

    let mut orchestrator = Orchestrator::new(repo.path(), Config::default());
    assert!(orchestrator.load_state("abort feature").unwrap().is_none());
}
