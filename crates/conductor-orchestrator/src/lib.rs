//! Dependency-ordered agent orchestration with guard rails and checkpoints.
//!
//! Agents are registered with their dependencies, sorted topologically, and
//! dispatched with bounded parallelism. Every execution passes through the
//! agent pool's guards (rate limit, cooldown, circular-update detection,
//! timeout), and every run is wrapped in a checkpoint that is committed on
//! success and rolled back otherwise.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Scheduling loop tying graph, pool, and checkpoints together.
//! - [`DependencyGraph`] — Agent dependency relation and topological ordering.
//! - [`AgentPool`] — Per-agent execution guards and statistics.
//! - [`CheckpointManager`] — Restore-point contract; [`MemoryCheckpoints`] is the default.
//! - [`ImpactAnalyzer`] — Maps changed files to agents; [`PathRuleAnalyzer`] uses globs.
//! - [`Executable`] / [`AgentLoader`] — What an agent is and how it is produced.
//! - [`HealthReport`] — Structural and runtime health snapshot.

/// Checkpoint contract and the in-memory implementation.
pub mod checkpoint;
/// Orchestrator, pool, and guard configuration.
pub mod config;
/// The scheduling loop.
pub mod engine;
/// Dependency graph and topological ordering.
pub mod graph;
/// Health reporting.
pub mod health;
/// Change-impact analysis.
pub mod impact;
/// Guarded agent execution.
pub mod pool;
/// Shared agent types and capabilities.
pub mod types;

pub use checkpoint::{CheckpointManager, CheckpointRecord, CheckpointState, MemoryCheckpoints};
pub use config::{GuardConfig, OrchestratorConfig, PoolConfig, RateLimitConfig};
pub use engine::{ExecutionResult, ExecutionStatus, Orchestrator, RunOutcome};
pub use graph::{AgentNode, DependencyGraph};
pub use health::{AgentHealth, HealthReport, MissingDependency};
pub use impact::{FileImpact, ImpactAnalysis, ImpactAnalyzer, PathRuleAnalyzer};
pub use pool::{AgentPool, AgentStats};
pub use types::{
    agent_fn, loader, loader_fn, AgentLoader, AgentOutput, AgentStatus, Executable,
    ExecutionContext, FnAgent, FnLoader, StaticLoader,
};
