use crate::pool::AgentStats;
use serde::{Deserialize, Serialize};

/// A dependency edge pointing at an agent that was never registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingDependency {
    pub agent: String,
    pub dependency: String,
}

/// Per-agent part of a [`HealthReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub name: String,
    pub dependencies: Vec<String>,
    pub stats: AgentStats,
    pub in_cooldown: bool,
    pub rate_limited: bool,
    pub circular_update: bool,
}

/// Snapshot of the orchestrator's structural and runtime health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub agent_count: usize,
    pub has_circular_dependencies: bool,
    pub missing_dependencies: Vec<MissingDependency>,
    pub is_executing: bool,
    pub emergency_stopped: bool,
    /// In registration order.
    pub agents: Vec<AgentHealth>,
}

impl HealthReport {
    /// The graph can be scheduled and the pool accepts work.
    pub fn healthy(&self) -> bool {
        !self.has_circular_dependencies
            && self.missing_dependencies.is_empty()
            && !self.emergency_stopped
    }

    /// Aggregate counters across all agents.
    pub fn totals(&self) -> AgentStats {
        let mut total = AgentStats::default();
        for agent in &self.agents {
            total.successful_executions += agent.stats.successful_executions;
            total.failed_executions += agent.stats.failed_executions;
            total.total_executions += agent.stats.total_executions;
            total.rejected_executions += agent.stats.rejected_executions;
        }
        total
    }

    /// Serialize the report with its aggregate and verdict.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "healthy": self.healthy(),
            "report": self,
            "aggregate": self.totals(),
        })
    }
}
