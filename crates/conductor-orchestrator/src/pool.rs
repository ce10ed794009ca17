use crate::config::{GuardConfig, PoolConfig};
use chrono::{DateTime, Duration, Utc};
use conductor_core::{Clock, ConductorError, ConductorResult, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Execution counters for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Executions that actually ran (successful + failed).
    pub total_executions: u64,
    /// Attempts refused by a guard before running.
    pub rejected_executions: u64,
    pub last_duration_ms: Option<u64>,
    pub last_executed_at: Option<DateTime<Utc>>,
}

struct GuardState {
    config: GuardConfig,
    recent_executions: VecDeque<DateTime<Utc>>,
    stats: AgentStats,
    cooldown_until: Option<DateTime<Utc>>,
}

impl GuardState {
    fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.recent_executions.iter().filter(|t| **t > since).count()
    }

    /// Drop timestamps outside every window and keep no more than the guards
    /// can ever need.
    fn prune(&mut self, now: DateTime<Utc>, pool: &PoolConfig) {
        let widest = self
            .config
            .rate_limit
            .window_ms
            .max(pool.circular_update_window_ms);
        let horizon = now - millis(widest);
        while self
            .recent_executions
            .front()
            .is_some_and(|t| *t <= horizon)
        {
            self.recent_executions.pop_front();
        }

        let cap = (self.config.rate_limit.max_count.max(pool.circular_update_threshold)) as usize;
        while self.recent_executions.len() > cap {
            self.recent_executions.pop_front();
        }
    }

    fn rate_limited(&self, now: DateTime<Utc>) -> bool {
        let window_start = now - millis(self.config.rate_limit.window_ms);
        self.count_since(window_start) >= self.config.rate_limit.max_count as usize
    }

    fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<u64> {
        self.cooldown_until
            .filter(|until| now < *until)
            .map(|until| (until - now).num_milliseconds().max(0) as u64)
    }

    fn circular(&self, now: DateTime<Utc>, pool: &PoolConfig) -> bool {
        let window_start = now - millis(pool.circular_update_window_ms);
        self.count_since(window_start) >= pool.circular_update_threshold as usize
    }
}

struct AgentSlot {
    /// Held for the whole check-and-run so one agent never executes twice at
    /// the same time.
    exec: tokio::sync::Mutex<()>,
    state: parking_lot::Mutex<GuardState>,
}

/// Per-agent execution guard: rate limit, cooldown, circular-update
/// detection, timeout, and statistics.
///
/// Guard state of an agent is only mutated inside [`AgentPool::execute_agent`],
/// serialized per agent name. Different agents run fully in parallel.
pub struct AgentPool {
    slots: parking_lot::RwLock<HashMap<String, Arc<AgentSlot>>>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    emergency_stop: AtomicBool,
}

impl AgentPool {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: parking_lot::RwLock::new(HashMap::new()),
            config,
            clock,
            emergency_stop: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Store the guard config for `name`. Re-registering replaces the config
    /// and keeps the history and stats.
    pub fn register_agent(&self, name: impl Into<String>, config: GuardConfig) {
        let name = name.into();
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get(&name) {
            slot.state.lock().config = config;
            debug!(agent = %name, "agent guard updated");
            return;
        }
        slots.insert(
            name,
            Arc::new(AgentSlot {
                exec: tokio::sync::Mutex::new(()),
                state: parking_lot::Mutex::new(GuardState {
                    config,
                    recent_executions: VecDeque::new(),
                    stats: AgentStats::default(),
                    cooldown_until: None,
                }),
            }),
        );
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.slots.read().contains_key(name)
    }

    /// Run `work` for `name` if every guard allows it.
    ///
    /// Checks, in order: emergency stop, rate limit, cooldown, circular
    /// update. When all pass, the execution is recorded, `work` runs under the
    /// agent's timeout, the outcome is counted, and the cooldown restarts.
    /// The work's own result is returned unchanged.
    pub async fn execute_agent<F, Fut, T>(&self, name: &str, work: F) -> ConductorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConductorResult<T>>,
    {
        let slot = self.slot(name)?;
        let _serial = slot.exec.lock().await;

        let config = {
            let mut state = slot.state.lock();
            let now = self.clock.now();
            state.prune(now, &self.config);

            let rejection = if self.is_emergency_stopped() {
                Some(ConductorError::EmergencyStop(name.to_string()))
            } else if state.rate_limited(now) {
                Some(ConductorError::RateLimited(name.to_string()))
            } else if let Some(remaining_ms) = state.cooldown_remaining(now) {
                Some(ConductorError::CooldownActive {
                    agent: name.to_string(),
                    remaining_ms,
                })
            } else if state.circular(now, &self.config) {
                Some(ConductorError::CircularUpdate(name.to_string()))
            } else {
                None
            };

            if let Some(err) = rejection {
                state.stats.rejected_executions += 1;
                warn!(agent = %name, reason = %err, "execution refused");
                return Err(err);
            }

            state.recent_executions.push_back(now);
            state.stats.last_executed_at = Some(now);
            state.config
        };

        debug!(agent = %name, "executing");
        let started = Instant::now();
        let result = match config.timeout() {
            Some(limit) => match tokio::time::timeout(limit, work()).await {
                Ok(result) => result,
                Err(_) => Err(ConductorError::Timeout {
                    agent: name.to_string(),
                    timeout_ms: config.timeout_ms,
                }),
            },
            None => work().await,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        {
            let mut state = slot.state.lock();
            state.stats.total_executions += 1;
            state.stats.last_duration_ms = Some(elapsed_ms);
            match &result {
                Ok(_) => state.stats.successful_executions += 1,
                Err(e) => {
                    state.stats.failed_executions += 1;
                    error!(agent = %name, error = %e, "execution failed");
                }
            }
            state.cooldown_until = Some(self.clock.now() + millis(state.config.cooldown_ms));
        }

        result
    }

    /// Whether the agent has been invoked at least `circular_update_threshold`
    /// times within the circular-update window. Does not mutate state.
    pub fn has_circular_update(&self, name: &str) -> bool {
        self.query(name, |state, now| state.circular(now, &self.config))
    }

    pub fn is_rate_limited(&self, name: &str) -> bool {
        self.query(name, |state, now| state.rate_limited(now))
    }

    pub fn is_in_cooldown(&self, name: &str) -> bool {
        self.query(name, |state, now| state.cooldown_remaining(now).is_some())
    }

    pub fn get_agent_stats(&self, name: &str) -> Option<AgentStats> {
        self.slots
            .read()
            .get(name)
            .map(|slot| slot.state.lock().stats.clone())
    }

    /// Stats for every registered agent, sorted by name.
    pub fn all_stats(&self) -> Vec<(String, AgentStats)> {
        let slots = self.slots.read();
        let mut all: Vec<(String, AgentStats)> = slots
            .iter()
            .map(|(name, slot)| (name.clone(), slot.state.lock().stats.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Refuse every execution until [`AgentPool::reset_emergency_stop`].
    pub fn emergency_stop(&self) {
        self.emergency_stop.store(true, Ordering::SeqCst);
        error!("agent pool emergency stop engaged");
    }

    pub fn reset_emergency_stop(&self) {
        self.emergency_stop.store(false, Ordering::SeqCst);
        info!("agent pool emergency stop cleared");
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    fn slot(&self, name: &str) -> ConductorResult<Arc<AgentSlot>> {
        self.slots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConductorError::UnknownAgent(name.to_string()))
    }

    fn query(&self, name: &str, f: impl FnOnce(&GuardState, DateTime<Utc>) -> bool) -> bool {
        let Ok(slot) = self.slot(name) else {
            return false;
        };
        let state = slot.state.lock();
        f(&state, self.clock.now())
    }
}

impl Default for AgentPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Windows longer than this are treated as this long.
const MAX_WINDOW_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(MAX_WINDOW_MS) as i64)
}
