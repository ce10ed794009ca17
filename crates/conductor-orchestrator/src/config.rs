use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Sliding-window execution budget for one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_rate_max_count")]
    pub max_count: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_rate_window_ms(),
            max_count: default_rate_max_count(),
        }
    }
}

/// Per-agent guard rails enforced by the agent pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Upper bound on a single execution. `0` disables the timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Minimum gap between the end of one execution and the start of the next.
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl GuardConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_cooldown_ms(mut self, cooldown_ms: u64) -> Self {
        self.cooldown_ms = cooldown_ms;
        self
    }

    pub fn with_rate_limit(mut self, window_ms: u64, max_count: u32) -> Self {
        self.rate_limit = RateLimitConfig {
            window_ms,
            max_count,
        };
        self
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            cooldown_ms: 0,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Pool-wide circular-update detection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Executions of one agent inside the window at which the next one is
    /// refused as a feedback loop.
    #[serde(default = "default_circular_update_threshold")]
    pub circular_update_threshold: u32,
    #[serde(default = "default_circular_update_window_ms")]
    pub circular_update_window_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            circular_update_threshold: default_circular_update_threshold(),
            circular_update_window_ms: default_circular_update_window_ms(),
        }
    }
}

/// Orchestrator configuration, loadable from the `[orchestrator]` table of
/// `conductor.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_circular_update_threshold")]
    pub circular_update_threshold: u32,
    #[serde(default = "default_circular_update_window_ms")]
    pub circular_update_window_ms: u64,
    /// Roll back when a run is stopped. When false the checkpoint of a
    /// stopped run is committed instead.
    #[serde(default = "default_true")]
    pub rollback_on_stop: bool,
    /// Guard applied to agents registered without one.
    #[serde(default)]
    pub default_guard: GuardConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            circular_update_threshold: default_circular_update_threshold(),
            circular_update_window_ms: default_circular_update_window_ms(),
            rollback_on_stop: true,
            default_guard: GuardConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse from a TOML document holding the bare orchestrator table.
    pub fn from_toml_str(raw: &str) -> ConductorResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConductorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> ConductorResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> ConductorResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConductorError::Config(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.circular_update_threshold == 0 {
            return Err(ConductorError::Config(
                "circular_update_threshold must be at least 1".into(),
            ));
        }
        if self.default_guard.rate_limit.max_count == 0 {
            return Err(ConductorError::Config(
                "rate_limit.max_count must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            circular_update_threshold: self.circular_update_threshold,
            circular_update_window_ms: self.circular_update_window_ms,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_default_guard(mut self, guard: GuardConfig) -> Self {
        self.default_guard = guard;
        self
    }
}

fn default_max_concurrency() -> usize {
    4
}
fn default_circular_update_threshold() -> u32 {
    5
}
fn default_circular_update_window_ms() -> u64 {
    60_000
}
fn default_timeout_ms() -> u64 {
    300_000
}
fn default_rate_window_ms() -> u64 {
    60_000
}
fn default_rate_max_count() -> u32 {
    30
}
fn default_true() -> bool {
    true
}
