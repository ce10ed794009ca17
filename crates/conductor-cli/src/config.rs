//! `conductor.toml` layout.

use conductor_orchestrator::{GuardConfig, OrchestratorConfig, RateLimitConfig};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub checkpoint: Option<CheckpointHooks>,
    #[serde(default)]
    pub event_log: Option<EventLogConfig>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Shell commands run around each run. `{label}` is substituted in `create`,
/// `{id}` in `commit` and `rollback`. The last stdout line of `create`
/// becomes the checkpoint id (the label when it prints nothing).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointHooks {
    #[serde(default)]
    pub create: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub rollback: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventLogConfig {
    #[serde(default = "default_event_log_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Glob patterns; a changed file matching one selects this agent.
    #[serde(default)]
    pub watch: Vec<String>,
    /// Fields set here override `[orchestrator.default_guard]`.
    #[serde(default)]
    pub guard: Option<GuardOverrides>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct GuardOverrides {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitOverrides>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RateLimitOverrides {
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub max_count: Option<u32>,
}

impl GuardOverrides {
    pub fn apply(&self, base: GuardConfig) -> GuardConfig {
        let rate_limit = self.rate_limit.unwrap_or_default();
        GuardConfig {
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            cooldown_ms: self.cooldown_ms.unwrap_or(base.cooldown_ms),
            rate_limit: RateLimitConfig {
                window_ms: rate_limit.window_ms.unwrap_or(base.rate_limit.window_ms),
                max_count: rate_limit.max_count.unwrap_or(base.rate_limit.max_count),
            },
        }
    }
}

fn default_event_log_path() -> PathBuf {
    PathBuf::from("./data/events.jsonl")
}

impl ConductorConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.orchestrator.validate()?;
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                anyhow::bail!("agent with command '{}' has an empty name", agent.command);
            }
            if agent.command.trim().is_empty() {
                anyhow::bail!("agent '{}' has an empty command", agent.name);
            }
            if !seen.insert(agent.name.as_str()) {
                anyhow::bail!("agent '{}' is defined more than once", agent.name);
            }
            if let Some(guard) = &agent.guard {
                if guard.rate_limit.and_then(|r| r.max_count) == Some(0) {
                    anyhow::bail!("agent '{}': rate_limit.max_count must be at least 1", agent.name);
                }
            }
        }
        Ok(())
    }
}

impl AgentConfig {
    /// The orchestrator default guard with this agent's overrides applied.
    pub fn guard_or(&self, default: GuardConfig) -> GuardConfig {
        match &self.guard {
            Some(overrides) => overrides.apply(default),
            None => default,
        }
    }

    /// Working directory resolved against the config file's directory.
    pub fn resolved_dir(&self, base: &Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base.join(dir),
            None => base.to_path_buf(),
        }
    }
}
