//! Task Parser (component E): parses the checkbox task list in
//! `<specDir>/tasks.md`, marks individual tasks complete atomically, and
//! groups tasks by their integer id prefix.
//!
//! The `Task`/grouping shapes are grounded on the donor's
//! `scud::{Task, TaskStatus}`, but the parsing itself is new: the donor
//! parses its own SCG DAG format, not a markdown checkbox list, so the
//! regex-driven line parser here is authored fresh against §4.E and §6.5.

use std::path::{Path, PathBuf};

use regex::Regex;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub completed: bool,
    pub has_asterisk: bool,
    pub priority: bool,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskGroup {
    pub group: u32,
    pub tasks: Vec<Task>,
    pub completed: bool,
}

fn task_line_re() -> Regex {
    Regex::new(r"^-\s+\[([ x])\](\*)?\s+(\d+(?:\.\d+)?)\.?\s+(?:\(P\)\s+)?(.+)$")
        .expect("static regex is valid")
}

fn indented_bullet_re() -> Regex {
    Regex::new(r"^\s+-\s+.+$").expect("static regex is valid")
}

fn tasks_path(spec_dir: &Path) -> PathBuf {
    spec_dir.join("tasks.md")
}

/// Parse every checkbox task line in `tasks.md` (§4.E, §6.5).
pub fn parse(spec_dir: &Path) -> Result<Vec<Task>> {
    let content = std::fs::read_to_string(tasks_path(spec_dir))?;
    Ok(parse_str(&content))
}

pub fn parse_str(content: &str) -> Vec<Task> {
    let mut tasks: Vec<Task> = Vec::new();
    let mut description_lines: Vec<&str> = Vec::new();

    let flush = |tasks: &mut Vec<Task>, description_lines: &mut Vec<&str>| {
        if let Some(last) = tasks.last_mut() {
            last.description = description_lines.join("\n").trim().to_string();
        }
        description_lines.clear();
    };

    for line in content.lines() {
        if let Some(caps) = task_line_re().captures(line) {
            flush(&mut tasks, &mut description_lines);
            let completed = &caps[1] == "x";
            let has_asterisk = caps.get(2).is_some();
            let id = caps[3].to_string();
            let rest = caps[4].to_string();
            let priority = rest.contains("(P)") || line.contains("(P) ");
            tasks.push(Task {
                id,
                completed,
                has_asterisk,
                priority: priority || has_priority_marker(line),
                title: rest.trim().to_string(),
                description: String::new(),
            });
        } else if indented_bullet_re().is_match(line) {
            description_lines.push(line.trim());
        }
    }
    flush(&mut tasks, &mut description_lines);
    tasks
}

fn has_priority_marker(line: &str) -> bool {
    Regex::new(r"^-\s+\[[ x]\]\*?\s+\d+(?:\.\d+)?\.?\s+\(P\)\s")
        .expect("static regex is valid")
        .is_match(line)
}

/// Mark task `id` complete, rewriting only its checkbox character and
/// atomic-renaming the file. A no-op if already checked. Errors if `id`
/// does not exist.
pub fn mark_task_complete(spec_dir: &Path, id: &str) -> Result<()> {
    let path = tasks_path(spec_dir);
    let content = std::fs::read_to_string(&path)?;

    let mut found = false;
    let mut already_complete = false;
    let mut out_lines: Vec<String> = Vec::with_capacity(content.lines().count());

    for line in content.lines() {
        if let Some(caps) = task_line_re().captures(line) {
            if &caps[3] == id {
                found = true;
                if &caps[1] == "x" {
                    already_complete = true;
                    out_lines.push(line.to_string());
                } else {
                    let checkbox_index = line.find('[').unwrap();
                    let mut rewritten = line.to_string();
                    rewritten.replace_range(checkbox_index..checkbox_index + 3, "[x]");
                    out_lines.push(rewritten);
                }
                continue;
            }
        }
        out_lines.push(line.to_string());
    }

    if !found {
        return Err(Error::validation(format!("no task with id {id}")));
    }
    if already_complete {
        return Ok(());
    }

    let mut new_content = out_lines.join("\n");
    if content.ends_with('\n') {
        new_content.push('\n');
    }

    let tmp_path = spec_dir.join(format!("tasks.{}.tmp", Uuid::new_v4()));
    std::fs::write(&tmp_path, new_content).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        Error::Io(e)
    })?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Group tasks by their integer id prefix, preserving ascending order.
pub fn group_tasks(tasks: &[Task]) -> Vec<TaskGroup> {
    let mut groups: Vec<TaskGroup> = Vec::new();
    for task in tasks {
        let group_num: u32 = task
            .id
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        if let Some(last) = groups.last_mut() {
            if last.group == group_num {
                last.tasks.push(task.clone());
                continue;
            }
        }
        groups.push(TaskGroup {
            group: group_num,
            tasks: vec![task.clone()],
            completed: false,
        });
    }
    for group in &mut groups {
        group.completed = !group.tasks.is_empty() && group.tasks.iter().all(|t| t.completed);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Tasks

- [ ] 1. First group header task
  - do the setup
  - and the wiring
- [x] 1.1 Already done subtask
- [ ] 1.2 (P) Priority subtask
- [ ] 2. Second group task
";

    #[test]
    fn parses_ids_and_completion() {
        let tasks = parse_str(SAMPLE);
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[0].id, "1");
        assert!(!tasks[0].completed);
        assert_eq!(tasks[1].id, "1.1");
        assert!(tasks[1].completed);
    }

    #[test]
    fn parses_description_from_indented_bullets() {
        let tasks = parse_str(SAMPLE);
        assert_eq!(tasks[0].description, "- do the setup\n- and the wiring");
    }

    #[test]
    fn parses_priority_marker() {
        let tasks = parse_str(SAMPLE);
        assert!(tasks[2].priority);
        assert!(!tasks[0].priority);
    }

    #[test]
    fn groups_by_integer_prefix() {
        let tasks = parse_str(SAMPLE);
        let groups = group_tasks(&tasks);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group, 1);
        assert_eq!(groups[0].tasks.len(), 3);
        assert!(!groups[0].completed);
        assert_eq!(groups[1].group, 2);
    }

    #[test]
    fn mark_complete_flips_only_target_checkbox() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tasks.md"), SAMPLE).unwrap();

        mark_task_complete(dir.path(), "2").unwrap();
        let after = parse(dir.path()).unwrap();

        assert!(!after[0].completed);
        assert!(after[1].completed);
        assert!(!after[2].completed);
        assert!(after[3].completed);
    }

    #[test]
    fn mark_complete_on_already_complete_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tasks.md"), SAMPLE).unwrap();
        mark_task_complete(dir.path(), "1.1").unwrap();
        let after = parse(dir.path()).unwrap();
        assert!(after[1].completed);
    }

    #[test]
    fn mark_complete_on_unknown_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tasks.md"), SAMPLE).unwrap();
        assert!(mark_task_complete(dir.path(), "99").is_err());
    }
}
