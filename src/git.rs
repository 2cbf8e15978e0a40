//! Git Gateway (component C): worktree/branch/status/commit plumbing around
//! the `git` and `gh` binaries.
//!
//! Grounded on the donor's `ralph_loop::git_commit`/`git_push` (shell out,
//! treat "nothing to commit" as success, never propagate a hard error for a
//! non-zero git exit) generalized to the fuller worktree/branch/status
//! surface the design calls for.

use std::path::{Path, PathBuf};

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

pub const PROTECTED_BRANCHES: &[&str] =
    &["main", "master", "develop", "development", "release"];

#[derive(Debug, Clone, Default)]
pub struct GitOutcome {
    pub success: bool,
    pub stdout: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GitStatus {
    pub staged: usize,
    pub unstaged: usize,
    pub untracked: usize,
}

impl GitStatus {
    pub fn has_changes(&self) -> bool {
        self.staged > 0 || self.unstaged > 0 || self.untracked > 0
    }
}

/// Normalize a feature name for branch/worktree/state-directory use (§4.C
/// Sanitize, §3.3, §8 property 6). The result always matches
/// `^[a-z][a-z0-9-]*$`, or is empty if `raw` contains no letters at all —
/// callers treat an empty sanitized name as a validation error.
pub fn sanitize_feature_name(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut prev_was_hyphen = false;
    for ch in lowered.chars() {
        let mapped = if ch == ' ' || ch == '_' {
            '-'
        } else if ch.is_ascii_alphanumeric() || ch == '-' {
            ch
        } else {
            continue;
        };
        if mapped == '-' {
            if prev_was_hyphen || out.is_empty() {
                continue;
            }
            prev_was_hyphen = true;
        } else {
            prev_was_hyphen = false;
        }
        out.push(mapped);
    }
    while out.ends_with('-') {
        out.pop();
    }
    match out.find(|c: char| c.is_ascii_lowercase()) {
        Some(0) => out,
        Some(i) => out[i..].to_string(),
        None => String::new(),
    }
}

fn is_protected(name: &str) -> bool {
    PROTECTED_BRANCHES
        .iter()
        .any(|p| p.eq_ignore_ascii_case(name))
}

async fn run_git(repo: &Path, args: &[&str]) -> GitOutcome {
    debug!(?args, "git invocation");
    match Command::new("git").args(args).current_dir(repo).output().await {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if output.status.success() {
                GitOutcome {
                    success: true,
                    stdout,
                    error: None,
                }
            } else {
                GitOutcome {
                    success: false,
                    stdout,
                    error: Some(stderr),
                }
            }
        }
        Err(e) => GitOutcome {
            success: false,
            stdout: String::new(),
            error: Some(e.to_string()),
        },
    }
}

pub async fn worktree_create(repo: &Path, feature: &str) -> GitOutcome {
    let sanitized = sanitize_feature_name(feature);
    let branch = format!("feature/{sanitized}");
    let path = format!("worktrees/{sanitized}");
    run_git(repo, &["worktree", "add", "-b", &branch, &path]).await
}

pub async fn worktree_list(repo: &Path) -> Result<Vec<WorktreeEntry>, String> {
    let outcome = run_git(repo, &["worktree", "list", "--porcelain"]).await;
    if !outcome.success {
        return Err(outcome.error.unwrap_or_default());
    }
    let mut entries = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;
    for line in outcome.stdout.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            if let Some(path) = current_path.take() {
                entries.push(WorktreeEntry {
                    path,
                    branch: current_branch.take(),
                });
            }
            current_path = Some(PathBuf::from(p));
        } else if let Some(b) = line.strip_prefix("branch ") {
            current_branch = Some(b.trim_start_matches("refs/heads/").to_string());
        } else if line.is_empty() {
            if let Some(path) = current_path.take() {
                entries.push(WorktreeEntry {
                    path,
                    branch: current_branch.take(),
                });
            }
        }
    }
    if let Some(path) = current_path.take() {
        entries.push(WorktreeEntry {
            path,
            branch: current_branch.take(),
        });
    }
    Ok(entries)
}

pub async fn worktree_remove(repo: &Path, feature: &str, force: bool) -> GitOutcome {
    let sanitized = sanitize_feature_name(feature);
    let path = format!("worktrees/{sanitized}");
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(&path);
    run_git(repo, &args).await
}

pub async fn branch_delete(repo: &Path, branch: &str, force: bool, remote: bool) -> GitOutcome {
    if is_protected(branch) {
        return GitOutcome {
            success: false,
            stdout: String::new(),
            error: Some(format!("refusing to delete protected branch {branch}")),
        };
    }
    if remote {
        return run_git(repo, &["push", "origin", "--delete", branch]).await;
    }
    let flag = if force { "-D" } else { "-d" };
    run_git(repo, &["branch", flag, branch]).await
}

pub async fn status(work_dir: &Path) -> Result<GitStatus, String> {
    let outcome = run_git(work_dir, &["status", "--porcelain"]).await;
    if !outcome.success {
        return Err(outcome.error.unwrap_or_default());
    }
    let mut s = GitStatus::default();
    for line in outcome.stdout.lines() {
        if line.len() < 2 {
            continue;
        }
        let bytes = line.as_bytes();
        let (x, y) = (bytes[0] as char, bytes[1] as char);
        if x == '!' && y == '!' {
            continue;
        }
        if x == '?' && y == '?' {
            s.untracked += 1;
            continue;
        }
        if x != ' ' {
            s.staged += 1;
        }
        if y != ' ' {
            s.unstaged += 1;
        }
    }
    Ok(s)
}

pub async fn stage_all(work_dir: &Path) -> GitOutcome {
    run_git(work_dir, &["add", "-A"]).await
}

/// Stage and commit; "nothing to commit" is treated as success with no hash.
pub async fn commit(work_dir: &Path, message: &str) -> GitOutcome {
    let staged = stage_all(work_dir).await;
    if !staged.success {
        return staged;
    }

    let diff = run_git(work_dir, &["diff", "--cached", "--quiet"]).await;
    if diff.success {
        debug!("nothing to commit");
        return GitOutcome {
            success: true,
            stdout: String::new(),
            error: None,
        };
    }

    let outcome = run_git(work_dir, &["commit", "-m", message]).await;
    if !outcome.success {
        warn!(error = ?outcome.error, "git commit failed");
        return outcome;
    }

    let hash_re = Regex::new(r"\[[^\]]*?\s+([0-9a-f]{7,})\]").expect("static regex is valid");
    let hash = hash_re
        .captures(&outcome.stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    GitOutcome {
        success: true,
        stdout: hash,
        error: None,
    }
}

pub async fn count_feature_commits(repo: &Path, base: Option<&str>) -> Result<u64, String> {
    let bases: Vec<&str> = match base {
        Some(b) => vec![b, "master"],
        None => vec!["master"],
    };
    for candidate in bases {
        let range = format!("^{candidate}");
        let outcome = run_git(repo, &["rev-list", "--count", "HEAD", &range]).await;
        if outcome.success {
            if let Ok(n) = outcome.stdout.trim().parse() {
                return Ok(n);
            }
        }
    }
    let outcome = run_git(repo, &["rev-list", "--count", "HEAD"]).await;
    outcome
        .stdout
        .trim()
        .parse()
        .map_err(|_| outcome.error.unwrap_or_else(|| "git rev-list failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_lowercases_and_hyphenates_spaces() {
        assert_eq!(sanitize_feature_name("User Auth"), "user-auth");
    }

    #[test]
    fn sanitize_strips_invalid_chars_and_collapses_hyphens() {
        assert_eq!(sanitize_feature_name("foo!!--bar__baz"), "foo-bar-baz");
    }

    #[test]
    fn sanitize_maps_underscores_to_hyphens() {
        assert_eq!(sanitize_feature_name("foo_bar"), "foo-bar");
    }

    #[test]
    fn sanitize_strips_leading_digits_and_hyphens() {
        assert_eq!(sanitize_feature_name("123-abc"), "abc");
        assert_eq!(sanitize_feature_name("--42feature"), "feature");
    }

    #[test]
    fn sanitize_with_no_letters_is_empty() {
        assert_eq!(sanitize_feature_name("123 456"), "");
    }

    #[test]
    fn sanitize_trims_trailing_hyphens() {
        assert_eq!(sanitize_feature_name("feature---"), "feature");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_feature_name("  Weird Name!! ");
        let twice = sanitize_feature_name(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn protected_branch_names_are_case_insensitive() {
        assert!(is_protected("Main"));
        assert!(is_protected("MASTER"));
        assert!(!is_protected("feature/x"));
    }
}
