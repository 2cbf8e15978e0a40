//! Configuration loading: agent binaries/models, sandbox settings, timeouts,
//! and retry/checkpoint cadence.
//!
//! Grounded on the donor's `Config::load` two-tier fallback (explicit path,
//! then `<workDir>/.red64/settings/config.toml`, then defaults), kept on
//! TOML as the donor uses rather than switched to this crate's otherwise
//! JSON-first on-disk conventions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentKind;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agents: AgentBinaries,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_checkpoint_interval() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agents: AgentBinaries::default(),
            sandbox: SandboxSettings::default(),
            timeouts: Timeouts::default(),
            checkpoint_interval: default_checkpoint_interval(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentBinaryConfig {
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBinaries {
    #[serde(default)]
    pub claude: AgentBinaryConfig,
    #[serde(default)]
    pub gemini: AgentBinaryConfig,
    #[serde(default)]
    pub codex: AgentBinaryConfig,
}

impl Default for AgentBinaries {
    fn default() -> Self {
        Self {
            claude: AgentBinaryConfig {
                binary: None,
                model: Some("opus".to_string()),
            },
            gemini: AgentBinaryConfig {
                binary: None,
                model: Some("gemini-2.5-pro".to_string()),
            },
            codex: AgentBinaryConfig {
                binary: None,
                model: Some("o3".to_string()),
            },
        }
    }
}

impl AgentBinaries {
    pub fn for_agent(&self, agent: AgentKind) -> &AgentBinaryConfig {
        match agent {
            AgentKind::Claude => &self.claude,
            AgentKind::Gemini => &self.gemini,
            AgentKind::Codex => &self.codex,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sandbox_image")]
    pub image: String,
}

fn default_sandbox_image() -> String {
    "red64/agent-sandbox:latest".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub health_secs: u64,
    #[serde(default = "default_image_pull_timeout_secs")]
    pub image_pull_secs: u64,
}

fn default_agent_timeout_secs() -> u64 {
    600
}
fn default_health_timeout_secs() -> u64 {
    30
}
fn default_image_pull_timeout_secs() -> u64 {
    300
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            agent_secs: default_agent_timeout_secs(),
            health_secs: default_health_timeout_secs(),
            image_pull_secs: default_image_pull_timeout_secs(),
        }
    }
}

impl Timeouts {
    pub fn agent(&self) -> Duration {
        Duration::from_secs(self.agent_secs)
    }
    pub fn health(&self) -> Duration {
        Duration::from_secs(self.health_secs)
    }
}

impl Config {
    /// Load configuration from an explicit path, `<workDir>/.red64/settings/config.toml`,
    /// or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            let local = PathBuf::from(".red64/settings/config.toml");
            if local.exists() {
                Some(local)
            } else {
                None
            }
        });

        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                let config: Config = toml::from_str(&content)
                    .map_err(|e| crate::error::Error::Config(e.to_string()))?;
                Ok(config)
            }
            _ => Ok(Config::default()),
        }
    }
}
