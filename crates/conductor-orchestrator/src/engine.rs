use crate::checkpoint::CheckpointManager;
use crate::config::{GuardConfig, OrchestratorConfig};
use crate::graph::DependencyGraph;
use crate::health::{AgentHealth, HealthReport, MissingDependency};
use crate::impact::ImpactAnalyzer;
use crate::pool::AgentPool;
use crate::types::{AgentLoader, AgentOutput, AgentStatus, ExecutionContext};
use conductor_core::{ConductorError, ConductorResult, Event, EventSink, EventTopic};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every selected agent completed. The checkpoint was committed.
    Completed,
    /// At least one agent failed. The checkpoint was rolled back.
    Failed,
    /// [`Orchestrator::stop`] was called during the run.
    Stopped,
}

/// Summary of one `execute()` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub success: bool,
    /// Agents that were dispatched (completed + failed).
    pub agents_executed: usize,
    /// In completion order.
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub duration_ms: u64,
    pub checkpoint_id: String,
}

/// Point-in-time view of the current (or last) run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub is_executing: bool,
    pub run_id: Option<Uuid>,
    pub currently_running: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Default)]
struct RunState {
    run_id: Option<Uuid>,
    statuses: HashMap<String, AgentStatus>,
    currently_running: Vec<String>,
    completed: Vec<String>,
    failed: Vec<String>,
    skipped: Vec<String>,
}

impl RunState {
    fn begin(run_id: Uuid, plan: &[PlannedAgent]) -> Self {
        Self {
            run_id: Some(run_id),
            statuses: plan
                .iter()
                .map(|p| (p.name.clone(), AgentStatus::Queued))
                .collect(),
            ..Self::default()
        }
    }

    fn status(&self, name: &str) -> AgentStatus {
        self.statuses
            .get(name)
            .copied()
            .unwrap_or(AgentStatus::Registered)
    }

    fn set(&mut self, name: &str, to: AgentStatus) {
        if self.status(name) == AgentStatus::Running {
            self.currently_running.retain(|n| n != name);
        }
        match to {
            AgentStatus::Running => self.currently_running.push(name.to_string()),
            AgentStatus::Completed => self.completed.push(name.to_string()),
            AgentStatus::Failed => self.failed.push(name.to_string()),
            AgentStatus::Skipped => self.skipped.push(name.to_string()),
            AgentStatus::Registered | AgentStatus::Queued => {}
        }
        self.statuses.insert(name.to_string(), to);
    }

    fn in_status(&self, plan: &[PlannedAgent], status: AgentStatus) -> Vec<String> {
        plan.iter()
            .filter(|p| self.status(&p.name) == status)
            .map(|p| p.name.clone())
            .collect()
    }
}

struct PlannedAgent {
    name: String,
    dependencies: Vec<String>,
    loader: Arc<dyn AgentLoader>,
}

struct Settlement {
    agent: String,
    elapsed_ms: u64,
    result: ConductorResult<AgentOutput>,
}

/// Clears the executing flag when a run ends, however it ends.
struct ExecutingGuard<'a>(&'a AtomicBool);

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs registered agents in dependency order with bounded parallelism,
/// wrapping every run in a checkpoint.
///
/// Lifecycle: `Idle → Executing → {Completed, Failed, Stopped} → Idle`.
/// Only one run may be active at a time.
pub struct Orchestrator {
    config: OrchestratorConfig,
    graph: RwLock<DependencyGraph>,
    pool: Arc<AgentPool>,
    checkpoints: Arc<dyn CheckpointManager>,
    impact: Option<Arc<dyn ImpactAnalyzer>>,
    events: Arc<dyn EventSink>,
    run: parking_lot::RwLock<RunState>,
    executing: AtomicBool,
    cancel: parking_lot::Mutex<CancellationToken>,
    running: watch::Sender<usize>,
}

impl Orchestrator {
    /// Build an orchestrator with a fresh agent pool configured from `config`.
    pub fn new(
        config: OrchestratorConfig,
        checkpoints: Arc<dyn CheckpointManager>,
        events: Arc<dyn EventSink>,
    ) -> ConductorResult<Self> {
        let pool = Arc::new(AgentPool::new(config.pool_config()));
        Self::with_pool(config, pool, checkpoints, events)
    }

    /// Build an orchestrator around an existing pool, e.g. one driven by a
    /// manual clock.
    pub fn with_pool(
        config: OrchestratorConfig,
        pool: Arc<AgentPool>,
        checkpoints: Arc<dyn CheckpointManager>,
        events: Arc<dyn EventSink>,
    ) -> ConductorResult<Self> {
        config.validate()?;
        let (running, _) = watch::channel(0);
        Ok(Self {
            config,
            graph: RwLock::new(DependencyGraph::new()),
            pool,
            checkpoints,
            impact: None,
            events,
            run: parking_lot::RwLock::new(RunState::default()),
            executing: AtomicBool::new(false),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            running,
        })
    }

    /// Use `analyzer` to narrow runs triggered by changed files.
    pub fn with_impact_analyzer(mut self, analyzer: Arc<dyn ImpactAnalyzer>) -> Self {
        self.impact = Some(analyzer);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    /// Register an agent under the default guard config.
    pub async fn register_agent(
        &self,
        name: &str,
        loader: Arc<dyn AgentLoader>,
        dependencies: &[&str],
    ) -> ConductorResult<()> {
        self.register_agent_with_guard(name, loader, dependencies, self.config.default_guard)
            .await
    }

    /// Register an agent with its own guard config. Refused while a run is
    /// executing.
    pub async fn register_agent_with_guard(
        &self,
        name: &str,
        loader: Arc<dyn AgentLoader>,
        dependencies: &[&str],
        guard: GuardConfig,
    ) -> ConductorResult<()> {
        let mut graph = self.graph.write().await;
        if self.is_executing() {
            return Err(ConductorError::AlreadyExecuting);
        }
        graph.register_agent(name, loader, dependencies)?;
        self.pool.register_agent(name, guard);
        info!(agent = %name, dependencies = ?dependencies, "agent registered");
        Ok(())
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// Run the agents affected by `changed_files`, or every agent when the
    /// list is empty.
    ///
    /// Per-agent failures are reported in the returned [`ExecutionResult`].
    /// Structural problems (cycle, unknown dependency) and checkpoint
    /// failures are returned as errors.
    pub async fn execute(&self, changed_files: &[String]) -> ConductorResult<ExecutionResult> {
        // The token is swapped under the same lock `stop()` reads it through.
        let cancel = {
            let mut current = self.cancel.lock();
            if self
                .executing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(ConductorError::AlreadyExecuting);
            }
            let token = CancellationToken::new();
            *current = token.clone();
            token
        };
        let _executing = ExecutingGuard(&self.executing);

        let run_id = Uuid::new_v4();
        let started = Instant::now();

        let targets = self.select_targets(changed_files).await?;
        let plan = self.plan(targets.as_deref()).await?;
        info!(
            run_id = %run_id,
            agents = plan.len(),
            changed_files = changed_files.len(),
            "run starting"
        );
        *self.run.write() = RunState::begin(run_id, &plan);

        let checkpoint_id = self
            .checkpoints
            .create_checkpoint(&format!("run-{run_id}"))
            .await
            .map_err(|e| match e {
                ConductorError::Checkpoint(_) => e,
                other => ConductorError::Checkpoint(other.to_string()),
            })?;

        let mut abandoned = AbandonedRun {
            orchestrator: self,
            run_id,
            plan: &plan,
            checkpoint_id: Some(checkpoint_id.clone()),
            armed: true,
        };

        let changed: Arc<[String]> = Arc::from(changed_files.to_vec());
        let stopped = self.schedule(run_id, &plan, &changed, &cancel).await;
        abandoned.armed = false;

        let (completed, failed, skipped) = {
            let state = self.run.read();
            (
                state.completed.clone(),
                state.failed.clone(),
                state.skipped.clone(),
            )
        };
        let outcome = if stopped {
            RunOutcome::Stopped
        } else if failed.is_empty() {
            RunOutcome::Completed
        } else {
            RunOutcome::Failed
        };

        let commit = match outcome {
            RunOutcome::Completed => true,
            RunOutcome::Failed => false,
            RunOutcome::Stopped => failed.is_empty() && !self.config.rollback_on_stop,
        };
        let settled = if commit {
            self.checkpoints
                .commit_checkpoint(&checkpoint_id)
                .await
                .map_err(|e| match e {
                    ConductorError::Checkpoint(_) => e,
                    other => ConductorError::Checkpoint(other.to_string()),
                })
        } else {
            warn!(run_id = %run_id, checkpoint_id = %checkpoint_id, ?outcome, "rolling back");
            self.checkpoints
                .rollback(&checkpoint_id)
                .await
                .map_err(|e| match e {
                    ConductorError::Rollback(_) => e,
                    other => ConductorError::Rollback(other.to_string()),
                })
        };

        let result = ExecutionResult {
            run_id,
            outcome,
            success: outcome == RunOutcome::Completed,
            agents_executed: completed.len() + failed.len(),
            completed,
            failed,
            skipped,
            duration_ms: started.elapsed().as_millis() as u64,
            checkpoint_id,
        };

        if let Err(e) = settled {
            error!(run_id = %run_id, error = %e, "checkpoint could not be settled");
            self.events.publish(Event::new(
                EventTopic::RunFailed,
                run_id,
                serde_json::json!({
                    "outcome": result.outcome,
                    "error": e.to_string(),
                    "checkpoint_id": result.checkpoint_id,
                }),
            ));
            return Err(e);
        }

        let topic = if result.success {
            EventTopic::RunCompleted
        } else {
            EventTopic::RunFailed
        };
        self.events.publish(Event::new(
            topic,
            run_id,
            serde_json::json!({
                "outcome": result.outcome,
                "agents_executed": result.agents_executed,
                "completed": result.completed,
                "failed": result.failed,
                "skipped": result.skipped,
                "duration_ms": result.duration_ms,
                "checkpoint_id": result.checkpoint_id,
            }),
        ));
        info!(
            run_id = %run_id,
            outcome = ?result.outcome,
            completed = result.completed.len(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            duration_ms = result.duration_ms,
            "run finished"
        );
        Ok(result)
    }

    /// Snapshot of the current run, or of the last one when idle.
    pub fn get_status(&self) -> ExecutionStatus {
        let state = self.run.read();
        ExecutionStatus {
            is_executing: self.is_executing(),
            run_id: state.run_id,
            currently_running: state.currently_running.clone(),
            completed: state.completed.clone(),
            failed: state.failed.clone(),
            skipped: state.skipped.clone(),
        }
    }

    /// Stop dispatching and skip whatever is still queued. Agents already
    /// running are left to finish; returns once none is running.
    ///
    /// The run ends as [`RunOutcome::Stopped`] only if the stop kept at least
    /// one queued agent from running.
    pub async fn stop(&self) {
        let token = self.cancel.lock().clone();
        token.cancel();
        info!("stop requested");
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|n| *n == 0).await;
    }

    /// The full topological order of every registered agent.
    pub async fn execution_order(&self) -> ConductorResult<Vec<String>> {
        self.graph.write().await.build_execution_order()
    }

    pub async fn health(&self) -> HealthReport {
        let graph = self.graph.read().await;
        let agents = graph
            .agent_names()
            .iter()
            .map(|name| AgentHealth {
                name: name.clone(),
                dependencies: graph
                    .dependencies_of(name)
                    .map(<[String]>::to_vec)
                    .unwrap_or_default(),
                stats: self.pool.get_agent_stats(name).unwrap_or_default(),
                in_cooldown: self.pool.is_in_cooldown(name),
                rate_limited: self.pool.is_rate_limited(name),
                circular_update: self.pool.has_circular_update(name),
            })
            .collect();
        HealthReport {
            agent_count: graph.len(),
            has_circular_dependencies: graph.has_circular_dependencies(),
            missing_dependencies: graph
                .missing_dependencies()
                .into_iter()
                .map(|(agent, dependency)| MissingDependency { agent, dependency })
                .collect(),
            is_executing: self.is_executing(),
            emergency_stopped: self.pool.is_emergency_stopped(),
            agents,
        }
    }

    /// `None` means the whole graph.
    async fn select_targets(&self, changed_files: &[String]) -> ConductorResult<Option<Vec<String>>> {
        if changed_files.is_empty() {
            return Ok(None);
        }
        let Some(analyzer) = &self.impact else {
            debug!("no impact analyzer configured, running full graph");
            return Ok(None);
        };

        let analysis = analyzer.perform_impact_analysis(changed_files).await?;
        let graph = self.graph.read().await;
        let mut targets = Vec::new();
        for agent in analysis.affected_agents {
            if graph.contains(&agent) {
                if !targets.contains(&agent) {
                    targets.push(agent);
                }
            } else {
                warn!(agent = %agent, "impact analysis named an unregistered agent, ignoring");
            }
        }
        debug!(targets = ?targets, "impact analysis selected agents");
        Ok(Some(targets))
    }

    async fn plan(&self, targets: Option<&[String]>) -> ConductorResult<Vec<PlannedAgent>> {
        let mut graph = self.graph.write().await;
        let order = match targets {
            Some(targets) => graph.execution_order_for(targets)?,
            None => graph.build_execution_order()?,
        };
        Ok(order
            .into_iter()
            .filter_map(|name| {
                let node = graph.get(&name)?;
                Some(PlannedAgent {
                    dependencies: node.dependencies.clone(),
                    loader: node.loader(),
                    name,
                })
            })
            .collect())
    }

    /// Greedy dispatch loop: start every ready agent the concurrency budget
    /// allows, wait for one settlement, repeat. Returns whether a stop
    /// skipped any queued agent.
    async fn schedule(
        &self,
        run_id: Uuid,
        plan: &[PlannedAgent],
        changed: &Arc<[String]>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut tasks: JoinSet<Settlement> = JoinSet::new();
        let mut stopped = false;

        loop {
            if cancel.is_cancelled() {
                if self.skip_queued(run_id, plan, "run stopped") > 0 {
                    stopped = true;
                }
            } else {
                let budget = self.config.max_concurrency.saturating_sub(tasks.len());
                for agent in self.ready(plan, budget) {
                    self.dispatch(&mut tasks, run_id, agent, changed, cancel);
                }
            }
            self.running.send_replace(tasks.len());

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(settlement)) => self.settle(run_id, plan, settlement),
                    Some(Err(e)) => error!(run_id = %run_id, error = %e, "agent task aborted"),
                    None => {}
                },
                _ = cancel.cancelled(), if !cancel.is_cancelled() => {
                    debug!(run_id = %run_id, "cancellation observed");
                }
            }
        }

        // Anything left over lost its task or was never reachable.
        self.settle_leftovers(run_id, plan, "agent task aborted");
        self.running.send_replace(0);
        stopped
    }

    /// Fail agents still marked running and skip agents still queued.
    fn settle_leftovers(&self, run_id: Uuid, plan: &[PlannedAgent], running_reason: &str) {
        let mut state = self.run.write();
        for agent in state.in_status(plan, AgentStatus::Running) {
            state.set(&agent, AgentStatus::Failed);
            self.events
                .publish(Event::agent_failed(run_id, &agent, running_reason, 0));
        }
        for agent in state.in_status(plan, AgentStatus::Queued) {
            state.set(&agent, AgentStatus::Skipped);
            self.events
                .publish(Event::agent_skipped(run_id, &agent, "dependencies not satisfied"));
        }
    }

    /// Queued agents whose dependencies have all completed, in plan order.
    fn ready<'p>(&self, plan: &'p [PlannedAgent], budget: usize) -> Vec<&'p PlannedAgent> {
        if budget == 0 {
            return Vec::new();
        }
        let state = self.run.read();
        plan.iter()
            .filter(|p| state.status(&p.name) == AgentStatus::Queued)
            .filter(|p| {
                p.dependencies
                    .iter()
                    .all(|d| state.status(d) == AgentStatus::Completed)
            })
            .take(budget)
            .collect()
    }

    fn dispatch(
        &self,
        tasks: &mut JoinSet<Settlement>,
        run_id: Uuid,
        agent: &PlannedAgent,
        changed: &Arc<[String]>,
        cancel: &CancellationToken,
    ) {
        self.run.write().set(&agent.name, AgentStatus::Running);
        self.events.publish(Event::agent_started(run_id, &agent.name));
        debug!(run_id = %run_id, agent = %agent.name, "dispatching");

        let pool = self.pool.clone();
        let loader = agent.loader.clone();
        let ctx = ExecutionContext {
            run_id,
            agent: agent.name.clone(),
            changed_files: changed.clone(),
            cancellation: cancel.child_token(),
        };

        tasks.spawn(async move {
            let started = Instant::now();
            let (ctx_ref, loader_ref) = (&ctx, &loader);
            let result = pool
                .execute_agent(&ctx.agent, move || async move {
                    let work = async move {
                        let executable = loader_ref.load().await.map_err(|e| match e {
                            ConductorError::Loader { .. } => e,
                            other => ConductorError::Loader {
                                agent: ctx_ref.agent.clone(),
                                message: other.to_string(),
                            },
                        })?;
                        executable.run(ctx_ref).await
                    };
                    AssertUnwindSafe(work)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(ConductorError::execution(
                                &ctx_ref.agent,
                                format!("panicked: {}", panic_message(panic.as_ref())),
                            ))
                        })
                })
                .await;
            Settlement {
                elapsed_ms: started.elapsed().as_millis() as u64,
                agent: ctx.agent,
                result,
            }
        });
    }

    fn settle(&self, run_id: Uuid, plan: &[PlannedAgent], settlement: Settlement) {
        let Settlement {
            agent,
            elapsed_ms,
            result,
        } = settlement;

        match result {
            Ok(output) => {
                self.run.write().set(&agent, AgentStatus::Completed);
                info!(
                    run_id = %run_id,
                    agent = %agent,
                    execution_time_ms = elapsed_ms,
                    summary = output.summary.as_deref().unwrap_or(""),
                    "agent completed"
                );
                self.events.publish(Event::agent_completed(
                    run_id,
                    &agent,
                    elapsed_ms,
                    output.transition.as_ref(),
                ));
            }
            Err(e) => {
                self.run.write().set(&agent, AgentStatus::Failed);
                error!(run_id = %run_id, agent = %agent, error = %e, "agent failed");
                self.events.publish(Event::agent_failed(
                    run_id,
                    &agent,
                    &e.to_string(),
                    elapsed_ms,
                ));

                let reason = format!("dependency '{agent}' failed");
                let mut state = self.run.write();
                for dependent in dependents_in_plan(plan, &agent) {
                    if state.status(dependent) == AgentStatus::Queued {
                        state.set(dependent, AgentStatus::Skipped);
                        warn!(run_id = %run_id, agent = %dependent, reason = %reason, "agent skipped");
                        self.events
                            .publish(Event::agent_skipped(run_id, dependent, &reason));
                    }
                }
            }
        }
    }

    fn skip_queued(&self, run_id: Uuid, plan: &[PlannedAgent], reason: &str) -> usize {
        let mut state = self.run.write();
        let queued = state.in_status(plan, AgentStatus::Queued);
        for agent in &queued {
            state.set(agent, AgentStatus::Skipped);
            self.events.publish(Event::agent_skipped(run_id, agent, reason));
        }
        queued.len()
    }
}

/// Cleans up after an `execute()` future dropped mid-run. Agent tasks die
/// with the dropped `JoinSet`; this settles their state and releases `stop()`
/// waiters. The open checkpoint is rolled back on a background task.
struct AbandonedRun<'a> {
    orchestrator: &'a Orchestrator,
    run_id: Uuid,
    plan: &'a [PlannedAgent],
    checkpoint_id: Option<String>,
    armed: bool,
}

impl Drop for AbandonedRun<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let orchestrator = self.orchestrator;
        let run_id = self.run_id;
        warn!(run_id = %run_id, "run dropped before it finished");

        orchestrator.settle_leftovers(run_id, self.plan, "run abandoned");
        orchestrator.running.send_replace(0);
        orchestrator.events.publish(Event::new(
            EventTopic::RunFailed,
            run_id,
            serde_json::json!({
                "outcome": RunOutcome::Failed,
                "error": "run abandoned before completion",
                "checkpoint_id": self.checkpoint_id,
            }),
        ));

        let Some(checkpoint_id) = self.checkpoint_id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let checkpoints = orchestrator.checkpoints.clone();
                handle.spawn(async move {
                    if let Err(e) = checkpoints.rollback(&checkpoint_id).await {
                        error!(
                            run_id = %run_id,
                            checkpoint_id = %checkpoint_id,
                            error = %e,
                            "abandoned run could not be rolled back"
                        );
                    }
                });
            }
            Err(_) => error!(
                run_id = %run_id,
                checkpoint_id = %checkpoint_id,
                "no runtime to roll back abandoned run"
            ),
        }
    }
}

/// Every planned agent that transitively depends on `failed`, in plan order.
fn dependents_in_plan<'p>(plan: &'p [PlannedAgent], failed: &str) -> Vec<&'p str> {
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    for p in plan {
        for dep in &p.dependencies {
            reverse.entry(dep.as_str()).or_default().push(p.name.as_str());
        }
    }
    let mut found: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([failed]);
    while let Some(current) = queue.pop_front() {
        for dependent in reverse.get(current).into_iter().flatten() {
            if found.insert(*dependent) {
                queue.push_back(*dependent);
            }
        }
    }
    plan.iter()
        .map(|p| p.name.as_str())
        .filter(|n| found.contains(n))
        .collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
