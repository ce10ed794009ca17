//! Agents and checkpoint hooks backed by external commands.

use crate::config::{AgentConfig, CheckpointHooks};
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use conductor_orchestrator::{
    AgentLoader, AgentOutput, CheckpointManager, Executable, ExecutionContext,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Runs `program args…` as one agent execution.
///
/// A non-zero exit status is a failure. The last non-empty stdout line
/// becomes the output summary. The child is killed when the execution is
/// dropped, e.g. on timeout.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl CommandAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir,
        }
    }
}

#[async_trait]
impl Executable for CommandAgent {
    async fn run(&self, ctx: &ExecutionContext) -> ConductorResult<AgentOutput> {
        debug!(agent = %ctx.agent, program = %self.program, "spawning");
        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .env("CONDUCTOR_RUN_ID", ctx.run_id.to_string())
            .env("CONDUCTOR_AGENT", &ctx.agent)
            .env("CONDUCTOR_CHANGED_FILES", ctx.changed_files.join("\n"))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ConductorError::execution(&ctx.agent, format!("failed to spawn '{}': {e}", self.program))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = last_line(&stderr).or_else(|| last_line(&stdout));
            return Err(ConductorError::execution(
                &ctx.agent,
                match detail {
                    Some(line) => format!("{} ({line})", output.status),
                    None => output.status.to_string(),
                },
            ));
        }

        Ok(AgentOutput {
            summary: last_line(&stdout).map(str::to_string),
            data: serde_json::json!({
                "exit_code": output.status.code(),
                "stdout_bytes": output.stdout.len(),
            }),
            transition: None,
        })
    }
}

/// Builds a [`CommandAgent`] when the agent is dispatched. Fails if the
/// working directory is missing at that point.
pub struct CommandLoader {
    name: String,
    agent: Arc<CommandAgent>,
}

impl CommandLoader {
    pub fn from_config(config: &AgentConfig, base_dir: &Path) -> Self {
        Self {
            name: config.name.clone(),
            agent: Arc::new(CommandAgent::new(
                config.command.clone(),
                config.args.clone(),
                config.resolved_dir(base_dir),
            )),
        }
    }
}

#[async_trait]
impl AgentLoader for CommandLoader {
    async fn load(&self) -> ConductorResult<Arc<dyn Executable>> {
        if !tokio::fs::try_exists(&self.agent.working_dir)
            .await
            .unwrap_or(false)
        {
            return Err(ConductorError::Loader {
                agent: self.name.clone(),
                message: format!(
                    "working directory '{}' does not exist",
                    self.agent.working_dir.display()
                ),
            });
        }
        Ok(self.agent.clone())
    }
}

/// Checkpoints implemented by shell hooks, e.g. `git stash create` /
/// `git stash apply {id}`. A missing hook is a no-op.
pub struct ShellCheckpoints {
    hooks: CheckpointHooks,
    working_dir: PathBuf,
}

impl ShellCheckpoints {
    pub fn new(hooks: CheckpointHooks, working_dir: PathBuf) -> Self {
        Self { hooks, working_dir }
    }

    async fn run_hook(&self, script: &str) -> Result<String, String> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to run '{script}': {e}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "'{script}' {}{}",
                output.status,
                last_line(&stderr).map(|l| format!(": {l}")).unwrap_or_default()
            ))
        }
    }
}

#[async_trait]
impl CheckpointManager for ShellCheckpoints {
    async fn create_checkpoint(&self, label: &str) -> ConductorResult<String> {
        let Some(script) = &self.hooks.create else {
            return Ok(label.to_string());
        };
        let stdout = self
            .run_hook(&script.replace("{label}", label))
            .await
            .map_err(ConductorError::Checkpoint)?;
        let id = last_line(&stdout).unwrap_or(label).to_string();
        info!(checkpoint_id = %id, "checkpoint hook created checkpoint");
        Ok(id)
    }

    async fn commit_checkpoint(&self, checkpoint_id: &str) -> ConductorResult<()> {
        if let Some(script) = &self.hooks.commit {
            self.run_hook(&script.replace("{id}", checkpoint_id))
                .await
                .map_err(ConductorError::Checkpoint)?;
        }
        Ok(())
    }

    async fn rollback(&self, checkpoint_id: &str) -> ConductorResult<()> {
        if let Some(script) = &self.hooks.rollback {
            self.run_hook(&script.replace("{id}", checkpoint_id))
                .await
                .map_err(ConductorError::Rollback)?;
        }
        Ok(())
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|l| !l.is_empty())
}
