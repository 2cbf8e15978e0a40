//! State Store (component D): atomic persistence, versioned migration, and
//! archive-on-abort for a feature's `FlowState`.
//!
//! The atomic temp-file-plus-rename write pattern is grounded on the pattern
//! referenced by `other_examples/.../cortex-commands-src-builtin-state.rs`
//! (`atomic_write_str` used around a structured state document); the
//! donor's own `workflow::state::StateManager` grounds the directory-per-
//! feature layout and load/list/cleanup shape, generalized from YAML to the
//! JSON schema and migration pipeline this spec requires.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::agent::TokenUsage;
use crate::error::{Error, Result};
use crate::git::sanitize_feature_name;

pub const CURRENT_STATE_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Greenfield,
    Brownfield,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    pub title: String,
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub status: TaskStatus,
    #[serde(rename = "tokenUsage", skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(rename = "contextUsage", skip_serializing_if = "Option::is_none")]
    pub context_usage: Option<ContextUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    #[serde(flatten)]
    pub usage: TokenUsage,
    #[serde(rename = "contextWindowSize")]
    pub context_window_size: u64,
    #[serde(rename = "utilizationPercent")]
    pub utilization_percent: f64,
    #[serde(rename = "cumulativeInputTokens")]
    pub cumulative_input_tokens: u64,
    #[serde(rename = "cumulativeUtilization")]
    pub cumulative_utilization: f64,
    #[serde(rename = "modelFamily")]
    pub model_family: Option<String>,
}

/// Context window size and family for a model name, keyed by substring
/// match on the agent-reported model string (donor's `ModelPricing` table
/// in `cost_tracker.rs` groups by provider the same way).
fn context_window_for(model: &str) -> (u64, String) {
    let lower = model.to_lowercase();
    if lower.contains("gemini") {
        (1_000_000, "gemini".to_string())
    } else if lower.contains("claude") || lower.contains("opus") || lower.contains("sonnet") || lower.contains("haiku") {
        (200_000, "claude".to_string())
    } else if lower.contains("gpt") || lower.contains("o3") || lower.contains("o4") || lower.contains("codex") {
        (200_000, "gpt".to_string())
    } else {
        (200_000, "unknown".to_string())
    }
}

/// Derive a TaskEntry's `contextUsage` from its own usage plus every prior
/// completed TaskEntry of the same feature (§3.1 ContextUsage: "computed
/// post-hoc from the prior completed TaskEntries of the same feature").
pub fn compute_context_usage(usage: &TokenUsage, prior_completed: &[&TaskEntry]) -> ContextUsage {
    let model = usage.model.clone().unwrap_or_default();
    let (context_window_size, model_family) = context_window_for(&model);

    let cumulative_input_tokens: u64 = prior_completed
        .iter()
        .filter_map(|t| t.token_usage.as_ref())
        .map(|u| u.input_tokens)
        .sum::<u64>()
        + usage.input_tokens;

    let utilization_percent = usage.input_tokens as f64 / context_window_size as f64 * 100.0;
    let cumulative_utilization = cumulative_input_tokens as f64 / context_window_size as f64 * 100.0;

    ContextUsage {
        usage: usage.clone(),
        context_window_size,
        utilization_percent,
        cumulative_input_tokens,
        cumulative_utilization,
        model_family: if model.is_empty() { None } else { Some(model_family) },
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupedTaskProgress {
    #[serde(rename = "completedGroups")]
    pub completed_groups: Vec<u32>,
    #[serde(rename = "totalGroups")]
    pub total_groups: u32,
    #[serde(rename = "currentGroup", skip_serializing_if = "Option::is_none")]
    pub current_group: Option<u32>,
    #[serde(rename = "taskEntries", default)]
    pub task_entries: Vec<TaskEntry>,
    #[serde(rename = "currentTaskId", skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetric {
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(rename = "elapsedMs", skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(rename = "costUsd", skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(rename = "inputTokens", skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(rename = "outputTokens", skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// Tagged phase variant (§3.2). Serialized as `{"type": "<tag>", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Phase {
    Idle,
    Initializing {
        feature: String,
        description: String,
    },
    RequirementsGenerating {
        feature: String,
    },
    RequirementsApproval {
        feature: String,
    },
    GapAnalysis {
        feature: String,
    },
    GapReview {
        feature: String,
    },
    DesignGenerating {
        feature: String,
    },
    DesignApproval {
        feature: String,
    },
    DesignValidation {
        feature: String,
    },
    DesignValidationReview {
        feature: String,
    },
    TasksGenerating {
        feature: String,
    },
    TasksApproval {
        feature: String,
    },
    Implementing {
        feature: String,
        #[serde(rename = "currentTask")]
        current_task: u32,
        #[serde(rename = "totalTasks")]
        total_tasks: u32,
    },
    Paused {
        feature: String,
        #[serde(rename = "pausedAt")]
        paused_at: u32,
        #[serde(rename = "totalTasks")]
        total_tasks: u32,
    },
    Validation {
        feature: String,
    },
    Pr {
        feature: String,
    },
    MergeDecision {
        feature: String,
        #[serde(rename = "prUrl")]
        pr_url: String,
    },
    Complete {
        feature: String,
    },
    Aborted {
        feature: String,
        reason: String,
    },
    Error {
        feature: String,
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

impl Phase {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Initializing { .. } => "initializing",
            Phase::RequirementsGenerating { .. } => "requirements-generating",
            Phase::RequirementsApproval { .. } => "requirements-approval",
            Phase::GapAnalysis { .. } => "gap-analysis",
            Phase::GapReview { .. } => "gap-review",
            Phase::DesignGenerating { .. } => "design-generating",
            Phase::DesignApproval { .. } => "design-approval",
            Phase::DesignValidation { .. } => "design-validation",
            Phase::DesignValidationReview { .. } => "design-validation-review",
            Phase::TasksGenerating { .. } => "tasks-generating",
            Phase::TasksApproval { .. } => "tasks-approval",
            Phase::Implementing { .. } => "implementing",
            Phase::Paused { .. } => "paused",
            Phase::Validation { .. } => "validation",
            Phase::Pr { .. } => "pr",
            Phase::MergeDecision { .. } => "merge-decision",
            Phase::Complete { .. } => "complete",
            Phase::Aborted { .. } => "aborted",
            Phase::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete { .. } | Phase::Aborted { .. } | Phase::Error { .. })
    }

    pub fn feature(&self) -> &str {
        match self {
            Phase::Idle => "",
            Phase::Initializing { feature, .. }
            | Phase::RequirementsGenerating { feature }
            | Phase::RequirementsApproval { feature }
            | Phase::GapAnalysis { feature }
            | Phase::GapReview { feature }
            | Phase::DesignGenerating { feature }
            | Phase::DesignApproval { feature }
            | Phase::DesignValidation { feature }
            | Phase::DesignValidationReview { feature }
            | Phase::TasksGenerating { feature }
            | Phase::TasksApproval { feature }
            | Phase::Implementing { feature, .. }
            | Phase::Paused { feature, .. }
            | Phase::Validation { feature }
            | Phase::Pr { feature }
            | Phase::MergeDecision { feature, .. }
            | Phase::Complete { feature }
            | Phase::Aborted { feature, .. }
            | Phase::Error { feature, .. } => feature,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub phase: Phase,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(rename = "subStep", skip_serializing_if = "Option::is_none")]
    pub sub_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowState {
    pub version: u32,
    pub feature: String,
    pub phase: Phase,
    pub mode: Mode,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
    pub history: Vec<HistoryEntry>,
    #[serde(rename = "taskProgress", skip_serializing_if = "Option::is_none")]
    pub task_progress: Option<GroupedTaskProgress>,
    #[serde(rename = "phaseMetrics", skip_serializing_if = "Option::is_none")]
    pub phase_metrics: Option<HashMap<String, PhaseMetric>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

pub struct StateStore {
    work_dir: PathBuf,
}

impl StateStore {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    fn feature_dir(&self, feature: &str) -> PathBuf {
        self.work_dir
            .join(".red64")
            .join("flows")
            .join(sanitize_feature_name(feature))
    }

    fn state_path(&self, feature: &str) -> PathBuf {
        self.feature_dir(feature).join("state.json")
    }

    fn archived_path(&self, feature: &str) -> PathBuf {
        self.feature_dir(feature).join("state.archived.json")
    }

    /// Atomic save: write to a uniquely-named temp file in the same
    /// directory, then rename over `state.json`. `state.json` is never
    /// truncated in place; on error the temp file is unlinked.
    pub fn save(&self, state: &FlowState) -> Result<()> {
        let dir = self.feature_dir(&state.feature);
        std::fs::create_dir_all(&dir)?;
        let final_path = self.state_path(&state.feature);
        let tmp_path = dir.join(format!("state.{}.tmp", uuid::Uuid::new_v4()));

        let body = serde_json::to_vec_pretty(state)?;
        let write_result = std::fs::write(&tmp_path, &body);
        match write_result {
            Ok(()) => match std::fs::rename(&tmp_path, &final_path) {
                Ok(()) => {
                    debug!(feature = %state.feature, "state saved");
                    Ok(())
                }
                Err(e) => {
                    let _ = std::fs::remove_file(&tmp_path);
                    Err(Error::Io(e))
                }
            },
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(Error::Io(e))
            }
        }
    }

    /// Load and migrate a feature's state. A missing or malformed file is
    /// reported as `Ok(None)`, not an error.
    pub fn load(&self, feature: &str) -> Result<Option<FlowState>> {
        let path = self.state_path(feature);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut value: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                warn!(feature, error = %e, "state.json is not valid JSON, treating as not found");
                return Ok(None);
            }
        };

        if !has_valid_shape(&value) {
            warn!(feature, "state.json has an invalid shape, treating as not found");
            return Ok(None);
        }

        migrate(&mut value);

        match serde_json::from_value::<FlowState>(value) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(feature, error = %e, "state.json failed to deserialize after migration");
                Ok(None)
            }
        }
    }

    pub fn exists(&self, feature: &str) -> bool {
        self.state_path(feature).exists()
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let flows_dir = self.work_dir.join(".red64").join("flows");
        if !flows_dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&flows_dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn delete(&self, feature: &str) -> Result<()> {
        let dir = self.feature_dir(feature);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Rename `state.json` to `state.archived.json`; absent file is a no-op.
    pub fn archive(&self, feature: &str) -> Result<()> {
        let from = self.state_path(feature);
        if !from.exists() {
            return Ok(());
        }
        let to = self.archived_path(feature);
        std::fs::rename(from, to)?;
        Ok(())
    }
}

fn has_valid_shape(value: &Value) -> bool {
    let obj = match value.as_object() {
        Some(o) => o,
        None => return false,
    };
    obj.get("feature").map(|v| v.is_string()).unwrap_or(false)
        && obj
            .get("phase")
            .and_then(|p| p.get("type"))
            .map(|t| t.is_string())
            .unwrap_or(false)
        && obj.get("createdAt").map(|v| v.is_string()).unwrap_or(false)
        && obj.get("updatedAt").map(|v| v.is_string()).unwrap_or(false)
        && obj.get("history").map(|v| v.is_array()).unwrap_or(false)
        && obj
            .get("metadata")
            .map(|v| v.is_object())
            .unwrap_or(true)
}

const LEGACY_PHASE_RENAMES: &[(&str, &str)] = &[
    ("requirements-review", "requirements-approval"),
    ("design-review", "design-approval"),
    ("tasks-review", "tasks-approval"),
];

fn rename_legacy_tag(value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        if let Some(Value::String(tag)) = obj.get_mut("type") {
            for (old, new) in LEGACY_PHASE_RENAMES {
                if tag == old {
                    *tag = new.to_string();
                }
            }
        }
    }
}

/// Migrate a raw JSON document to `CURRENT_STATE_VERSION` in place.
fn migrate(value: &mut Value) {
    let version = value
        .get("version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;

    if version >= CURRENT_STATE_VERSION {
        return;
    }

    if let Some(obj) = value.as_object_mut() {
        if let Some(phase) = obj.get_mut("phase") {
            rename_legacy_tag(phase);
        }

        let created_at = obj
            .get("createdAt")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if let Some(Value::Array(history)) = obj.get_mut("history") {
            for entry in history.iter_mut() {
                if entry.is_string() {
                    // legacy: bare phase tag string
                    let tag = entry.as_str().unwrap_or_default().to_string();
                    let mut phase_val = json!({ "type": tag });
                    rename_legacy_tag(&mut phase_val);
                    *entry = json!({
                        "phase": phase_val,
                        "timestamp": created_at,
                    });
                } else if let Some(entry_obj) = entry.as_object_mut() {
                    if let Some(phase) = entry_obj.get_mut("phase") {
                        rename_legacy_tag(phase);
                    }
                }
            }
        }

        if let Some(Value::Object(legacy_tp)) = obj.get("taskProgress").cloned() {
            if legacy_tp.contains_key("completedTasks") && !legacy_tp.contains_key("taskEntries") {
                let completed_ids: Vec<String> = legacy_tp
                    .get("completedTasks")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                let total_tasks = legacy_tp
                    .get("totalTasks")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);

                let mut completed_groups: Vec<u32> = completed_ids
                    .iter()
                    .filter_map(|id| id.split('.').next())
                    .filter_map(|g| g.parse::<u32>().ok())
                    .collect();
                completed_groups.sort_unstable();
                completed_groups.dedup();

                let task_entries: Vec<Value> = completed_ids
                    .iter()
                    .map(|id| {
                        json!({
                            "id": id,
                            "title": "",
                            "status": "completed",
                            "startedAt": "migration",
                            "completedAt": "migration",
                        })
                    })
                    .collect();

                obj.insert(
                    "taskProgress".to_string(),
                    json!({
                        "completedGroups": completed_groups,
                        "totalGroups": total_tasks,
                        "taskEntries": task_entries,
                    }),
                );
            }
        }

        obj.insert("version".to_string(), json!(CURRENT_STATE_VERSION));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_state(feature: &str) -> FlowState {
        FlowState {
            version: CURRENT_STATE_VERSION,
            feature: feature.to_string(),
            phase: Phase::Idle,
            mode: Mode::Greenfield,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            history: Vec::new(),
            task_progress: None,
            phase_metrics: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn save_then_load_is_identity_at_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = sample_state("user-auth");
        store.save(&state).unwrap();
        let loaded = store.load("user-auth").unwrap().unwrap();
        assert_eq!(loaded.feature, state.feature);
        assert_eq!(loaded.version, CURRENT_STATE_VERSION);
        assert_eq!(loaded.phase, state.phase);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn archive_renames_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&sample_state("user-auth")).unwrap();
        store.archive("user-auth").unwrap();
        assert!(!store.state_path("user-auth").exists());
        assert!(store.archived_path("user-auth").exists());
    }

    #[test]
    fn archive_on_missing_state_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.archive("nothing-here").is_ok());
    }

    #[test]
    fn migration_renames_legacy_phase_tags() {
        let mut value = json!({
            "feature": "x",
            "phase": {"type": "requirements-review", "feature": "x"},
            "mode": "greenfield",
            "createdAt": "2025-01-01T00:00:00Z",
            "updatedAt": "2025-01-01T00:00:00Z",
            "history": ["requirements-review"],
            "metadata": {},
        });
        migrate(&mut value);
        assert_eq!(value["phase"]["type"], "requirements-approval");
        assert_eq!(value["version"], CURRENT_STATE_VERSION);
        assert_eq!(value["history"][0]["phase"]["type"], "requirements-approval");
        assert_eq!(value["history"][0]["timestamp"], "2025-01-01T00:00:00Z");
    }

    #[test]
    fn migration_synthesizes_task_entries_with_empty_titles() {
        let mut value = json!({
            "feature": "x",
            "phase": {"type": "idle"},
            "mode": "greenfield",
            "createdAt": "2025-01-01T00:00:00Z",
            "updatedAt": "2025-01-01T00:00:00Z",
            "history": [],
            "metadata": {},
            "taskProgress": {
                "completedTasks": ["1.1", "1.2", "2.1"],
                "totalTasks": 2,
            },
        });
        migrate(&mut value);
        let entries = value["taskProgress"]["taskEntries"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["title"], "");
        assert_eq!(entries[0]["status"], "completed");
        assert_eq!(
            value["taskProgress"]["completedGroups"],
            json!([1, 2])
        );
    }

    #[test]
    fn invalid_shape_is_treated_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let path = store.feature_dir("bad");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("state.json"), r#"{"not":"a state file"}"#).unwrap();
        assert!(store.load("bad").unwrap().is_none());
    }

    fn completed_entry(id: &str, input_tokens: u64) -> TaskEntry {
        TaskEntry {
            id: id.to_string(),
            title: String::new(),
            started_at: None,
            completed_at: None,
            status: TaskStatus::Completed,
            token_usage: Some(TokenUsage {
                input_tokens,
                output_tokens: 0,
                total_tokens: input_tokens,
                model: Some("claude-opus-4".to_string()),
                cache_read_tokens: None,
                cache_creation_tokens: None,
                cost_usd: None,
            }),
            context_usage: None,
        }
    }

    #[test]
    fn context_usage_accumulates_input_tokens_across_prior_tasks() {
        let prior = vec![completed_entry("1.1", 1_000), completed_entry("1.2", 2_000)];
        let prior_refs: Vec<&TaskEntry> = prior.iter().collect();
        let usage = TokenUsage {
            input_tokens: 3_000,
            output_tokens: 100,
            total_tokens: 3_100,
            model: Some("claude-opus-4".to_string()),
            cache_read_tokens: None,
            cache_creation_tokens: None,
            cost_usd: None,
        };
        let ctx = compute_context_usage(&usage, &prior_refs);
        assert_eq!(ctx.context_window_size, 200_000);
        assert_eq!(ctx.cumulative_input_tokens, 6_000);
        assert_eq!(ctx.model_family, Some("claude".to_string()));
        assert!((ctx.utilization_percent - 1.5).abs() < 1e-9);
    }

    #[test]
    fn context_usage_without_model_has_no_family() {
        let usage = TokenUsage::default();
        let ctx = compute_context_usage(&usage, &[]);
        assert_eq!(ctx.model_family, None);
        assert_eq!(ctx.cumulative_input_tokens, 0);
    }
}
