//! PR Gateway (component I): push the feature branch, create a pull request
//! whose body is composed from the spec artifacts, and merge it.
//!
//! The three-section body composition is grounded on the donor's
//! `handoff::Handoff` section-based rendering (`render_default`), adapted
//! from the donor's free-form artifact sections to the fixed
//! requirements/design/tasks triple §4.I specifies.

use std::path::Path;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct PrResult {
    pub success: bool,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    pub error: Option<String>,
}

async fn run_command(bin: &str, args: &[&str], cwd: &Path) -> (bool, String, String) {
    debug!(bin, ?args, "invoking");
    match Command::new(bin).args(args).current_dir(cwd).output().await {
        Ok(output) => (
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ),
        Err(e) => (false, String::new(), e.to_string()),
    }
}

pub async fn push(work_dir: &Path, remote: &str) -> Result<(), String> {
    let (ok, _out, err) = run_command("git", &["push", "-u", remote, "HEAD"], work_dir).await;
    if ok {
        Ok(())
    } else {
        warn!(error = %err, "git push failed");
        Err(err)
    }
}

fn first_n_non_heading_lines(content: &str, n: usize) -> String {
    content
        .lines()
        .filter(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty())
        .take(n)
        .collect::<Vec<_>>()
        .join("\n")
}

fn section_or_first_lines(content: &str, heading: &str, n: usize) -> String {
    let mut in_section = false;
    let mut collected = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            if trimmed.trim_start_matches('#').trim().eq_ignore_ascii_case(heading) {
                in_section = true;
                continue;
            } else if in_section {
                break;
            }
        } else if in_section && !trimmed.is_empty() {
            collected.push(line);
        }
    }
    if collected.is_empty() {
        first_n_non_heading_lines(content, n)
    } else {
        collected.into_iter().take(n).collect::<Vec<_>>().join("\n")
    }
}

fn task_completion_count(content: &str) -> (usize, usize) {
    let re = Regex::new(r"^-\s+\[([ x])\]").expect("static regex is valid");
    let mut completed = 0;
    let mut total = 0;
    for line in content.lines() {
        if let Some(caps) = re.captures(line.trim_start()) {
            total += 1;
            if &caps[1] == "x" {
                completed += 1;
            }
        }
    }
    (completed, total)
}

fn compose_body(spec_dir: &Path, feature: &str) -> String {
    let requirements = std::fs::read_to_string(spec_dir.join("requirements.md")).unwrap_or_default();
    let design = std::fs::read_to_string(spec_dir.join("design.md")).unwrap_or_default();
    let tasks = std::fs::read_to_string(spec_dir.join("tasks.md")).unwrap_or_default();

    let requirements_section = first_n_non_heading_lines(&requirements, 3);
    let design_section = section_or_first_lines(&design, "Overview", 3);
    let (completed, total) = task_completion_count(&tasks);

    format!(
        "## Requirements\n{requirements_section}\n\n## Design\n{design_section}\n\n## Tasks\n{completed}/{total} completed\n\n---\nGenerated for feature `{feature}`."
    )
}

pub struct CreatePrRequest<'a> {
    pub work_dir: &'a Path,
    pub feature: &'a str,
    pub spec_dir: &'a Path,
    pub base_branch: &'a str,
}

pub async fn create_pr(req: CreatePrRequest<'_>) -> PrResult {
    let body = compose_body(req.spec_dir, req.feature);
    let title = format!("feat: {}", req.feature);

    let (ok, stdout, stderr) = run_command(
        "gh",
        &[
            "pr",
            "create",
            "--title",
            &title,
            "--body",
            &body,
            "--base",
            req.base_branch,
        ],
        req.work_dir,
    )
    .await;

    if !ok {
        return PrResult {
            success: false,
            pr_url: None,
            pr_number: None,
            error: Some(stderr),
        };
    }

    let combined = format!("{stdout}\n{stderr}");
    let re = Regex::new(r"/pull/(\d+)").expect("static regex is valid");
    let last_match = re.captures_iter(&combined).last();
    match last_match {
        Some(caps) => {
            let number: u64 = caps[1].parse().unwrap_or(0);
            let url = combined
                .lines()
                .find(|l| l.contains("/pull/"))
                .unwrap_or("")
                .trim()
                .to_string();
            PrResult {
                success: true,
                pr_url: Some(url),
                pr_number: Some(number),
                error: None,
            }
        }
        None => PrResult {
            success: false,
            pr_url: None,
            pr_number: None,
            error: Some("could not parse PR URL from gh output".to_string()),
        },
    }
}

pub async fn merge_pr(
    work_dir: &Path,
    pr_number: u64,
    squash: bool,
    delete_branch: bool,
) -> Result<(), String> {
    let number = pr_number.to_string();
    let mut args = vec!["pr", "merge", number.as_str()];
    if squash {
        args.push("--squash");
    }
    if delete_branch {
        args.push("--delete-branch");
    }
    let (ok, _out, err) = run_command("gh", &args, work_dir).await;
    if ok {
        Ok(())
    } else {
        Err(err)
    }
}

/// Close a pull request without merging it, used when a feature is aborted
/// with an open PR outstanding.
pub async fn close_pr(work_dir: &Path, pr_number: u64) -> Result<(), String> {
    let number = pr_number.to_string();
    let (ok, _out, err) = run_command("gh", &["pr", "close", number.as_str()], work_dir).await;
    if ok {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_completed_and_total_checkboxes() {
        let tasks = "- [x] 1. a\n- [ ] 2. b\n- [x] 3. c\n";
        assert_eq!(task_completion_count(tasks), (2, 3));
    }

    #[test]
    fn extracts_overview_section_when_present() {
        let design = "# Design\n\n## Overview\nThis does X.\nAnd Y.\n\n## Details\nskip this\n";
        let section = section_or_first_lines(design, "Overview", 3);
        assert!(section.contains("This does X."));
        assert!(!section.contains("skip this"));
    }

    #[test]
    fn falls_back_to_first_lines_when_no_overview_heading() {
        let design = "# Design\nLine one.\nLine two.\nLine three.\nLine four.\n";
        let section = section_or_first_lines(design, "Overview", 3);
        assert_eq!(section.lines().count(), 3);
    }

    #[test]
    fn extracts_last_pull_number_from_gh_output() {
        let combined = "Creating pull request\nhttps://github.com/o/r/pull/42\n";
        let re = Regex::new(r"/pull/(\d+)").unwrap();
        let caps = re.captures_iter(combined).last().unwrap();
        assert_eq!(&caps[1], "42");
    }
}
