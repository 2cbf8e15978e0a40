//! Spec Initializer (component K): idempotently creates the per-feature
//! spec directory with template files.

use std::path::{Path, PathBuf};

use serde_json::json;

use crate::error::Result;
use crate::git::sanitize_feature_name;

pub struct SpecInit {
    pub feature_name: String,
    pub spec_dir: PathBuf,
}

fn default_spec_json(feature_name: &str, timestamp: &str) -> String {
    serde_json::to_string_pretty(&json!({
        "feature_name": feature_name,
        "created_at": timestamp,
        "updated_at": timestamp,
        "language": "en",
        "phase": "initialized",
        "approvals": {
            "requirements": {"generated": false, "approved": false},
            "design": {"generated": false, "approved": false},
            "tasks": {"generated": false, "approved": false},
        },
        "ready_for_implementation": false,
    }))
    .expect("static value always serializes")
}

fn default_requirements_md(description: &str) -> String {
    format!("# Requirements\n\n## Project Description (Input)\n\n{description}\n")
}

fn apply_placeholders(template: &str, feature_name: &str, timestamp: &str, description: &str) -> String {
    template
        .replace("{{FEATURE_NAME}}", feature_name)
        .replace("{{TIMESTAMP}}", timestamp)
        .replace("{{PROJECT_DESCRIPTION}}", description)
}

/// Create `.red64/specs/<sanitized>/` with `spec.json` and
/// `requirements.md`. Idempotent: if `spec.json` already exists, returns
/// success unchanged.
pub fn init(work_dir: &Path, feature_name: &str, description: &str, timestamp: &str) -> Result<SpecInit> {
    let sanitized = sanitize_feature_name(feature_name);
    if sanitized.is_empty() {
        return Err(crate::error::Error::validation(
            "feature name sanitizes to an empty string",
        ));
    }

    let spec_dir = work_dir.join(".red64").join("specs").join(&sanitized);
    let spec_json_path = spec_dir.join("spec.json");

    if spec_json_path.exists() {
        return Ok(SpecInit {
            feature_name: sanitized,
            spec_dir,
        });
    }

    std::fs::create_dir_all(&spec_dir)?;

    let templates_dir = work_dir.join(".red64").join("settings").join("templates").join("specs");
    let spec_json_template = templates_dir.join("init.json");
    let requirements_template = templates_dir.join("requirements-init.md");

    let spec_json = if spec_json_template.exists() {
        let raw = std::fs::read_to_string(&spec_json_template)?;
        apply_placeholders(&raw, &sanitized, timestamp, description)
    } else {
        default_spec_json(&sanitized, timestamp)
    };
    std::fs::write(&spec_json_path, spec_json)?;

    let requirements_md = if requirements_template.exists() {
        let raw = std::fs::read_to_string(&requirements_template)?;
        apply_placeholders(&raw, &sanitized, timestamp, description)
    } else {
        default_requirements_md(description)
    };
    std::fs::write(spec_dir.join("requirements.md"), requirements_md)?;

    Ok(SpecInit {
        feature_name: sanitized,
        spec_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_spec_json_and_requirements_md() {
        let dir = tempfile::tempdir().unwrap();
        let result = init(dir.path(), "User Auth", "add login", "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(result.feature_name, "user-auth");
        assert!(result.spec_dir.join("spec.json").exists());
        let requirements = std::fs::read_to_string(result.spec_dir.join("requirements.md")).unwrap();
        assert!(requirements.contains("add login"));
    }

    #[test]
    fn is_idempotent_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path(), "user-auth", "add login", "t1").unwrap();
        std::fs::write(
            dir.path()
                .join(".red64/specs/user-auth/requirements.md"),
            "custom edits",
        )
        .unwrap();
        init(dir.path(), "user-auth", "different description", "t2").unwrap();
        let requirements = std::fs::read_to_string(
            dir.path().join(".red64/specs/user-auth/requirements.md"),
        )
        .unwrap();
        assert_eq!(requirements, "custom edits");
    }

    #[test]
    fn empty_sanitized_name_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = init(dir.path(), "!!!", "d", "t");
        assert!(result.is_err());
    }

    #[test]
    fn template_override_applies_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let templates_dir = dir
            .path()
            .join(".red64/settings/templates/specs");
        std::fs::create_dir_all(&templates_dir).unwrap();
        std::fs::write(
            templates_dir.join("requirements-init.md"),
            "# {{FEATURE_NAME}} at {{TIMESTAMP}}\n\n{{PROJECT_DESCRIPTION}}\n",
        )
        .unwrap();

        let result = init(dir.path(), "billing", "charge cards", "2026-02-02").unwrap();
        let requirements = std::fs::read_to_string(result.spec_dir.join("requirements.md")).unwrap();
        assert!(requirements.contains("billing at 2026-02-02"));
        assert!(requirements.contains("charge cards"));
    }
}
