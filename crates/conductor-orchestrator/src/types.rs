use async_trait::async_trait;
use conductor_core::{ConductorResult, Transition};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of an agent node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Known to the graph, not part of the current run.
    Registered,
    /// Selected for the current run, waiting for its dependencies or a slot.
    Queued,
    /// Dispatched and not yet settled.
    Running,
    Completed,
    Failed,
    /// Not run because a dependency failed or the run was stopped.
    Skipped,
}

impl AgentStatus {
    /// Completed, failed, or skipped.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Skipped
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Registered => write!(f, "registered"),
            AgentStatus::Queued => write!(f, "queued"),
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::Completed => write!(f, "completed"),
            AgentStatus::Failed => write!(f, "failed"),
            AgentStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// What an agent sees when it runs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub agent: String,
    /// The changed files that triggered this run (empty for a full run).
    pub changed_files: Arc<[String]>,
    /// Cancelled when the orchestrator is asked to stop. Agents may watch it
    /// to wind down early; the scheduler never aborts them.
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    /// A context outside of any run, for driving an agent directly.
    pub fn detached(agent: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::nil(),
            agent: agent.into(),
            changed_files: Arc::from(Vec::new()),
            cancellation: CancellationToken::new(),
        }
    }
}

/// Result of a successful agent execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    pub summary: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Forwarded untouched on `AGENT_COMPLETED`.
    #[serde(default)]
    pub transition: Option<Transition>,
}

impl AgentOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transition = Some(transition);
        self
    }
}

/// A unit of work the orchestrator can run.
#[async_trait]
pub trait Executable: Send + Sync {
    async fn run(&self, ctx: &ExecutionContext) -> ConductorResult<AgentOutput>;
}

/// Produces an agent's [`Executable`]. Called only when the agent is about to
/// be dispatched, never at registration.
#[async_trait]
pub trait AgentLoader: Send + Sync {
    async fn load(&self) -> ConductorResult<Arc<dyn Executable>>;
}

/// Loader handing out an executable that already exists.
pub struct StaticLoader {
    executable: Arc<dyn Executable>,
}

impl StaticLoader {
    pub fn new(executable: Arc<dyn Executable>) -> Self {
        Self { executable }
    }
}

#[async_trait]
impl AgentLoader for StaticLoader {
    async fn load(&self) -> ConductorResult<Arc<dyn Executable>> {
        Ok(self.executable.clone())
    }
}

/// Wrap an executable in a [`StaticLoader`].
pub fn loader(executable: impl Executable + 'static) -> Arc<dyn AgentLoader> {
    Arc::new(StaticLoader::new(Arc::new(executable)))
}

/// An [`Executable`] backed by an async closure.
pub struct FnAgent<F> {
    f: F,
}

/// Build an [`Executable`] from an async closure.
pub fn agent_fn<F, Fut>(f: F) -> FnAgent<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConductorResult<AgentOutput>> + Send + 'static,
{
    FnAgent { f }
}

#[async_trait]
impl<F, Fut> Executable for FnAgent<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConductorResult<AgentOutput>> + Send + 'static,
{
    async fn run(&self, ctx: &ExecutionContext) -> ConductorResult<AgentOutput> {
        (self.f)(ctx.clone()).await
    }
}

/// An [`AgentLoader`] backed by an async closure.
pub struct FnLoader<F> {
    f: F,
}

/// Build an [`AgentLoader`] from an async closure.
pub fn loader_fn<F, Fut>(f: F) -> Arc<dyn AgentLoader>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConductorResult<Arc<dyn Executable>>> + Send + 'static,
{
    Arc::new(FnLoader { f })
}

#[async_trait]
impl<F, Fut> AgentLoader for FnLoader<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConductorResult<Arc<dyn Executable>>> + Send + 'static,
{
    async fn load(&self) -> ConductorResult<Arc<dyn Executable>> {
        (self.f)().await
    }
}
