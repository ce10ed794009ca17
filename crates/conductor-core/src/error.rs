use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor workspace.
///
/// Variants fall into four groups: structural errors raised while building the
/// dependency graph, guard rejections raised by the agent pool, execution
/// failures of an individual agent, and run-level checkpoint failures.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// An agent with this name is already registered.
    #[error("Duplicate agent: '{0}' is already registered")]
    DuplicateAgent(String),

    /// An agent declares a dependency that was never registered.
    #[error("Unknown dependency: '{agent}' depends on unregistered '{dependency}'")]
    UnknownDependency {
        /// The agent declaring the dependency.
        agent: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// The dependency relation contains a cycle. Holds the agents on the cycle.
    #[error("Circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    /// An operation referenced an agent that was never registered.
    #[error("Unknown agent: '{0}'")]
    UnknownAgent(String),

    /// The agent exceeded its execution budget within the rate-limit window.
    #[error("Agent '{0}' is rate limited")]
    RateLimited(String),

    /// The agent ran too recently and is still cooling down.
    #[error("Agent '{agent}' is in cooldown for another {remaining_ms}ms")]
    CooldownActive {
        /// The agent being refused.
        agent: String,
        /// Milliseconds left before the cooldown expires.
        remaining_ms: u64,
    },

    /// The agent was re-invoked too often within the trailing window.
    #[error("cannot execute {0}: circular_update")]
    CircularUpdate(String),

    /// The pool-wide emergency stop is engaged.
    #[error("Emergency stop engaged: refusing to execute '{0}'")]
    EmergencyStop(String),

    /// The agent did not settle within its configured timeout.
    #[error("Agent '{agent}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The agent that timed out.
        agent: String,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The agent's own work failed.
    #[error("Agent '{agent}' failed: {message}")]
    Execution {
        /// The failing agent.
        agent: String,
        /// What went wrong.
        message: String,
    },

    /// The agent's loader could not produce an executable.
    #[error("Loader error for '{agent}': {message}")]
    Loader {
        /// The agent whose loader failed.
        agent: String,
        /// What went wrong.
        message: String,
    },

    /// A run is already in progress on this orchestrator.
    #[error("Orchestrator is already executing a run")]
    AlreadyExecuting,

    /// Creating or committing a checkpoint failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Restoring a checkpoint failed; the system may be inconsistent.
    #[error("Rollback error: {0}")]
    Rollback(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Builds an [`ConductorError::Execution`] from anything printable.
    pub fn execution(agent: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Execution {
            agent: agent.into(),
            message: message.to_string(),
        }
    }

    /// True for refusals raised by the agent pool before any work ran.
    pub fn is_guard_rejection(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_)
                | Self::CooldownActive { .. }
                | Self::CircularUpdate(_)
                | Self::EmergencyStop(_)
        )
    }

    /// True for errors in the shape of the dependency graph.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DuplicateAgent(_)
                | Self::UnknownDependency { .. }
                | Self::CircularDependency(_)
                | Self::UnknownAgent(_)
        )
    }
}
