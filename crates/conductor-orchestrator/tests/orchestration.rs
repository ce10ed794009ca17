//! End-to-end scheduling tests: ordering, concurrency, failure propagation,
//! checkpoint discipline, stop, impact-based selection, and events.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conductor_core::{
    ConductorError, ConductorResult, Event, EventBus, EventSink, EventTopic, NullEventSink,
    Transition,
};
use conductor_orchestrator::{
    agent_fn, loader, loader_fn, AgentLoader, AgentOutput, AgentPool, CheckpointManager,
    CheckpointState, Executable, ExecutionContext, ExecutionResult, GuardConfig,
    MemoryCheckpoints, Orchestrator, OrchestratorConfig, PathRuleAnalyzer, RunOutcome,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn orchestrator(config: OrchestratorConfig) -> (Arc<Orchestrator>, Arc<MemoryCheckpoints>) {
    let checkpoints = Arc::new(MemoryCheckpoints::new());
    let orchestrator =
        Orchestrator::new(config, checkpoints.clone(), Arc::new(NullEventSink)).unwrap();
    (Arc::new(orchestrator), checkpoints)
}

/// Agent that sleeps `delay_ms` and appends its name to `log` when done.
fn recording(log: &Arc<Mutex<Vec<String>>>, delay_ms: u64) -> Arc<dyn AgentLoader> {
    let log = log.clone();
    loader(agent_fn(move |ctx: ExecutionContext| {
        let log = log.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            log.lock().push(ctx.agent.clone());
            Ok(AgentOutput::new(format!("{} done", ctx.agent)))
        }
    }))
}

fn failing(message: &'static str) -> Arc<dyn AgentLoader> {
    loader(agent_fn(move |ctx: ExecutionContext| async move {
        Err(ConductorError::execution(&ctx.agent, message))
    }))
}

fn noop() -> Arc<dyn AgentLoader> {
    loader(agent_fn(|_ctx| async { Ok(AgentOutput::default()) }))
}

/// Loader that counts how often it is asked for an executable.
fn counting_loader(loads: &Arc<AtomicUsize>) -> Arc<dyn AgentLoader> {
    let loads = loads.clone();
    loader_fn(move || {
        let loads = loads.clone();
        async move {
            loads.fetch_add(1, Ordering::SeqCst);
            let exec: Arc<dyn Executable> =
                Arc::new(agent_fn(|_ctx| async { Ok(AgentOutput::default()) }));
            Ok(exec)
        }
    })
}

/// Checkpoint manager recording every call in order.
#[derive(Default)]
struct RecordingCheckpoints {
    calls: Mutex<Vec<String>>,
}

impl RecordingCheckpoints {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CheckpointManager for RecordingCheckpoints {
    async fn create_checkpoint(&self, label: &str) -> ConductorResult<String> {
        let mut calls = self.calls.lock();
        calls.push(format!("create:{label}"));
        Ok(format!("cp-{}", calls.len()))
    }

    async fn commit_checkpoint(&self, checkpoint_id: &str) -> ConductorResult<()> {
        self.calls.lock().push(format!("commit:{checkpoint_id}"));
        Ok(())
    }

    async fn rollback(&self, checkpoint_id: &str) -> ConductorResult<()> {
        self.calls.lock().push(format!("rollback:{checkpoint_id}"));
        Ok(())
    }
}

/// Checkpoint manager that refuses to open a checkpoint.
struct BrokenCheckpoints;

#[async_trait]
impl CheckpointManager for BrokenCheckpoints {
    async fn create_checkpoint(&self, _label: &str) -> ConductorResult<String> {
        Err(ConductorError::Io(std::io::Error::other("disk full")))
    }

    async fn commit_checkpoint(&self, _checkpoint_id: &str) -> ConductorResult<()> {
        Ok(())
    }

    async fn rollback(&self, _checkpoint_id: &str) -> ConductorResult<()> {
        Ok(())
    }
}

/// Checkpoint manager that opens checkpoints but fails to settle them.
struct UnsettledCheckpoints {
    commit_fails: bool,
    rollback_fails: bool,
}

#[async_trait]
impl CheckpointManager for UnsettledCheckpoints {
    async fn create_checkpoint(&self, _label: &str) -> ConductorResult<String> {
        Ok("cp-1".to_string())
    }

    async fn commit_checkpoint(&self, _checkpoint_id: &str) -> ConductorResult<()> {
        if self.commit_fails {
            return Err(ConductorError::Io(std::io::Error::other("commit refused")));
        }
        Ok(())
    }

    async fn rollback(&self, _checkpoint_id: &str) -> ConductorResult<()> {
        if self.rollback_fails {
            return Err(ConductorError::Io(std::io::Error::other("rollback refused")));
        }
        Ok(())
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_chain_runs_in_dependency_order() {
    let (orchestrator, checkpoints) = orchestrator(OrchestratorConfig::default());
    let log = Arc::new(Mutex::new(Vec::new()));

    // Registered out of order on purpose.
    orchestrator
        .register_agent("users-agent", recording(&log, 5), &["backend-agent"])
        .await
        .unwrap();
    orchestrator
        .register_agent("backend-agent", recording(&log, 5), &["document-agent"])
        .await
        .unwrap();
    orchestrator
        .register_agent("document-agent", recording(&log, 5), &[])
        .await
        .unwrap();

    let result = orchestrator.execute(&[]).await.unwrap();

    assert!(result.success);
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert!(result.agents_executed >= 3);
    assert_eq!(
        result.completed,
        vec!["document-agent", "backend-agent", "users-agent"]
    );
    assert_eq!(*log.lock(), result.completed);
    assert_eq!(checkpoints.count_in(CheckpointState::Committed), 1);
    assert_eq!(
        checkpoints.get(&result.checkpoint_id).unwrap().label,
        format!("run-{}", result.run_id)
    );
}

#[tokio::test]
async fn test_execution_order_exposed() {
    let (orchestrator, _) = orchestrator(OrchestratorConfig::default());
    orchestrator.register_agent("b", noop(), &["a"]).await.unwrap();
    orchestrator.register_agent("a", noop(), &[]).await.unwrap();
    orchestrator.register_agent("c", noop(), &[]).await.unwrap();
    assert_eq!(
        orchestrator.execution_order().await.unwrap(),
        vec!["a", "c", "b"]
    );
}

#[tokio::test]
async fn test_dependent_starts_only_after_dependency_completes() {
    let (orchestrator, _) = orchestrator(OrchestratorConfig::default().with_max_concurrency(4));
    let finished = Arc::new(AtomicBool::new(false));

    let flag = finished.clone();
    orchestrator
        .register_agent(
            "slow-base",
            loader(agent_fn(move |_ctx| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(AgentOutput::default())
                }
            })),
            &[],
        )
        .await
        .unwrap();

    let flag = finished.clone();
    orchestrator
        .register_agent(
            "dependent",
            loader(agent_fn(move |_ctx| {
                let flag = flag.clone();
                async move {
                    if flag.load(Ordering::SeqCst) {
                        Ok(AgentOutput::default())
                    } else {
                        Err(ConductorError::execution("dependent", "started too early"))
                    }
                }
            })),
            &["slow-base"],
        )
        .await
        .unwrap();

    let result = orchestrator.execute(&[]).await.unwrap();
    assert!(result.success, "{result:?}");
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let (orchestrator, _) = orchestrator(OrchestratorConfig::default().with_max_concurrency(2));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..5 {
        let running = running.clone();
        let peak = peak.clone();
        orchestrator
            .register_agent(
                &format!("worker-{i}"),
                loader(agent_fn(move |_ctx| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(AgentOutput::default())
                    }
                })),
                &[],
            )
            .await
            .unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let orchestrator = orchestrator.clone();
        let done = done.clone();
        let observed = observed.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                let status = orchestrator.get_status();
                observed.fetch_max(status.currently_running.len(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let result = orchestrator.execute(&[]).await.unwrap();
    done.store(true, Ordering::SeqCst);
    sampler.await.unwrap();

    assert!(result.success);
    assert_eq!(result.completed.len(), 5);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert!(observed.load(Ordering::SeqCst) <= 2);
    assert!(orchestrator.get_status().currently_running.is_empty());
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failure_rolls_back_and_skips_dependents() {
    let checkpoints = Arc::new(RecordingCheckpoints::default());
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        checkpoints.clone(),
        Arc::new(NullEventSink),
    )
    .unwrap();
    let loads = Arc::new(AtomicUsize::new(0));

    orchestrator.register_agent("a", failing("boom"), &[]).await.unwrap();
    orchestrator
        .register_agent("b", counting_loader(&loads), &["a"])
        .await
        .unwrap();
    orchestrator
        .register_agent("c", counting_loader(&loads), &["b"])
        .await
        .unwrap();
    orchestrator.register_agent("independent", noop(), &[]).await.unwrap();

    let result = orchestrator.execute(&[]).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.outcome, RunOutcome::Failed);
    assert_eq!(result.failed, vec!["a"]);
    assert_eq!(result.skipped, vec!["b", "c"]);
    assert_eq!(result.completed, vec!["independent"]);
    assert_eq!(result.agents_executed, 2);
    // Skipped agents are never loaded.
    assert_eq!(loads.load(Ordering::SeqCst), 0);

    let calls = checkpoints.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], format!("create:run-{}", result.run_id));
    assert_eq!(calls[1], format!("rollback:{}", result.checkpoint_id));
}

#[tokio::test]
async fn test_loader_failure_is_agent_failure() {
    let (orchestrator, checkpoints) = orchestrator(OrchestratorConfig::default());
    orchestrator
        .register_agent(
            "unloadable",
            loader_fn(|| async {
                Err::<Arc<dyn Executable>, _>(ConductorError::Config("missing binary".into()))
            }),
            &[],
        )
        .await
        .unwrap();

    let result = orchestrator.execute(&[]).await.unwrap();
    assert_eq!(result.failed, vec!["unloadable"]);
    assert_eq!(checkpoints.count_in(CheckpointState::RolledBack), 1);
}

#[tokio::test]
async fn test_panicking_agent_is_contained() {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(MemoryCheckpoints::new()),
        bus.clone(),
    )
    .unwrap();
    orchestrator
        .register_agent(
            "crashy",
            loader(agent_fn(|_ctx| async {
                if true {
                    panic!("agent blew up");
                }
                Ok(AgentOutput::default())
            })),
            &[],
        )
        .await
        .unwrap();
    orchestrator.register_agent("steady", noop(), &[]).await.unwrap();

    let result = orchestrator.execute(&[]).await.unwrap();
    assert_eq!(result.failed, vec!["crashy"]);
    assert_eq!(result.completed, vec!["steady"]);

    let failed = drain(&mut rx)
        .into_iter()
        .find(|e| e.topic == EventTopic::AgentFailed)
        .unwrap();
    assert!(failed.payload["error"]
        .as_str()
        .unwrap()
        .contains("agent blew up"));
}

#[tokio::test]
async fn test_timeout_fails_agent() {
    let (orchestrator, _) = orchestrator(OrchestratorConfig::default());
    orchestrator
        .register_agent_with_guard(
            "sleepy",
            recording(&Arc::new(Mutex::new(Vec::new())), 500),
            &[],
            GuardConfig::default().with_timeout_ms(20),
        )
        .await
        .unwrap();

    let result = orchestrator.execute(&[]).await.unwrap();
    assert_eq!(result.failed, vec!["sleepy"]);
    let stats = orchestrator.pool().get_agent_stats("sleepy").unwrap();
    assert_eq!(stats.failed_executions, 1);
}

#[tokio::test]
async fn test_emergency_stop_rejections_fail_the_run() {
    let (orchestrator, _) = orchestrator(OrchestratorConfig::default());
    orchestrator.register_agent("a", noop(), &[]).await.unwrap();
    orchestrator.register_agent("b", noop(), &["a"]).await.unwrap();
    orchestrator.pool().emergency_stop();

    let result = orchestrator.execute(&[]).await.unwrap();
    assert_eq!(result.failed, vec!["a"]);
    assert_eq!(result.skipped, vec!["b"]);
    assert!(!orchestrator.health().await.healthy());

    orchestrator.pool().reset_emergency_stop();
    assert!(orchestrator.execute(&[]).await.unwrap().success);
}

// ---------------------------------------------------------------------------
// Guards across runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pool_cooldown_in_real_time() {
    let pool = AgentPool::default();
    pool.register_agent("a", GuardConfig::default().with_cooldown_ms(100));

    pool.execute_agent("a", || async { Ok(()) }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = pool
        .execute_agent("a", || async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::CooldownActive { .. }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pool.execute_agent("a", || async { Ok(()) }).await.is_ok());
}

#[tokio::test]
async fn test_cooldown_between_runs_fails_second_run() {
    let (orchestrator, _) = orchestrator(OrchestratorConfig::default());
    orchestrator
        .register_agent_with_guard(
            "a",
            noop(),
            &[],
            GuardConfig::default().with_cooldown_ms(10_000),
        )
        .await
        .unwrap();

    assert!(orchestrator.execute(&[]).await.unwrap().success);
    let second = orchestrator.execute(&[]).await.unwrap();
    assert_eq!(second.failed, vec!["a"]);
    assert_eq!(
        orchestrator.pool().get_agent_stats("a").unwrap().rejected_executions,
        1
    );
}

#[tokio::test]
async fn test_circular_update_detected_across_runs() {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let config = OrchestratorConfig {
        circular_update_threshold: 2,
        ..OrchestratorConfig::default()
    };
    let orchestrator =
        Orchestrator::new(config, Arc::new(MemoryCheckpoints::new()), bus.clone()).unwrap();
    orchestrator.register_agent("writer", noop(), &[]).await.unwrap();

    assert!(orchestrator.execute(&[]).await.unwrap().success);
    assert!(orchestrator.execute(&[]).await.unwrap().success);
    let third = orchestrator.execute(&[]).await.unwrap();
    assert_eq!(third.failed, vec!["writer"]);

    let error = drain(&mut rx)
        .into_iter()
        .filter(|e| e.topic == EventTopic::AgentFailed)
        .map(|e| e.payload["error"].as_str().unwrap().to_string())
        .next()
        .unwrap();
    assert!(error.contains("circular_update"));
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

async fn start_slow_run(config: OrchestratorConfig) -> (Arc<Orchestrator>, Arc<MemoryCheckpoints>) {
    let (orchestrator, checkpoints) = orchestrator(config);
    let log = Arc::new(Mutex::new(Vec::new()));
    orchestrator
        .register_agent("slow", recording(&log, 150), &[])
        .await
        .unwrap();
    orchestrator
        .register_agent("after", recording(&log, 0), &["slow"])
        .await
        .unwrap();
    (orchestrator, checkpoints)
}

#[tokio::test]
async fn test_stop_skips_queued_and_rolls_back() {
    let (orchestrator, checkpoints) = start_slow_run(OrchestratorConfig::default()).await;

    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.execute(&[]).await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(orchestrator.get_status().is_executing);

    orchestrator.stop().await;
    assert!(orchestrator.get_status().currently_running.is_empty());

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.outcome, RunOutcome::Stopped);
    assert!(!result.success);
    // Running agents are allowed to finish.
    assert_eq!(result.completed, vec!["slow"]);
    assert_eq!(result.skipped, vec!["after"]);
    assert_eq!(checkpoints.count_in(CheckpointState::RolledBack), 1);
    assert_eq!(checkpoints.count_in(CheckpointState::Committed), 0);
}

#[tokio::test]
async fn test_stop_commits_when_rollback_disabled() {
    let config = OrchestratorConfig {
        rollback_on_stop: false,
        ..OrchestratorConfig::default()
    };
    let (orchestrator, checkpoints) = start_slow_run(config).await;

    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.execute(&[]).await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    orchestrator.stop().await;

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.outcome, RunOutcome::Stopped);
    assert_eq!(checkpoints.count_in(CheckpointState::Committed), 1);
    assert_eq!(checkpoints.count_in(CheckpointState::RolledBack), 0);
}

#[tokio::test]
async fn test_stopped_run_with_failure_still_rolls_back() {
    let config = OrchestratorConfig {
        rollback_on_stop: false,
        ..OrchestratorConfig::default()
    };
    let (orchestrator, checkpoints) = start_slow_run(config).await;
    orchestrator.register_agent("bad", failing("broken"), &[]).await.unwrap();

    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.execute(&[]).await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    orchestrator.stop().await;

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.outcome, RunOutcome::Stopped);
    assert_eq!(result.failed, vec!["bad"]);
    assert_eq!(result.skipped, vec!["after"]);
    assert_eq!(checkpoints.count_in(CheckpointState::RolledBack), 1);
    assert_eq!(checkpoints.count_in(CheckpointState::Committed), 0);
}

#[tokio::test]
async fn test_stop_with_nothing_queued_keeps_outcome() {
    let (orchestrator, checkpoints) = orchestrator(OrchestratorConfig::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    orchestrator
        .register_agent("slow", recording(&log, 150), &[])
        .await
        .unwrap();

    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.execute(&[]).await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    orchestrator.stop().await;

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert!(result.success);
    assert_eq!(result.completed, vec!["slow"]);
    assert_eq!(checkpoints.count_in(CheckpointState::Committed), 1);
}

#[tokio::test]
async fn test_next_run_after_stop_starts_fresh() {
    let (orchestrator, _) = start_slow_run(OrchestratorConfig::default()).await;
    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.execute(&[]).await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    orchestrator.stop().await;
    run.await.unwrap().unwrap();

    let result = orchestrator.execute(&[]).await.unwrap();
    assert!(result.success);
    assert_eq!(result.completed, vec!["slow", "after"]);
}

#[tokio::test]
async fn test_stop_while_idle_does_not_reach_next_run() {
    let (orchestrator, checkpoints) = start_slow_run(OrchestratorConfig::default()).await;
    tokio::time::timeout(Duration::from_secs(1), orchestrator.stop())
        .await
        .unwrap();

    let result = orchestrator.execute(&[]).await.unwrap();
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(result.completed, vec!["slow", "after"]);
    assert_eq!(checkpoints.count_in(CheckpointState::Committed), 1);
}

#[tokio::test]
async fn test_dropped_execute_releases_the_run() {
    let (orchestrator, checkpoints) = orchestrator(OrchestratorConfig::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    orchestrator
        .register_agent("slow", recording(&log, 500), &[])
        .await
        .unwrap();
    orchestrator
        .register_agent("after", recording(&log, 0), &["slow"])
        .await
        .unwrap();

    let dropped =
        tokio::time::timeout(Duration::from_millis(50), orchestrator.execute(&[])).await;
    assert!(dropped.is_err());

    let status = orchestrator.get_status();
    assert!(!status.is_executing);
    assert!(status.currently_running.is_empty());
    assert_eq!(status.failed, vec!["slow"]);
    assert_eq!(status.skipped, vec!["after"]);

    tokio::time::timeout(Duration::from_secs(1), orchestrator.stop())
        .await
        .expect("stop should not wait on an abandoned run");

    // Rollback of the open checkpoint runs on a background task.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(checkpoints.count_in(CheckpointState::RolledBack), 1);
    assert_eq!(checkpoints.count_in(CheckpointState::Open), 0);
    assert!(log.lock().is_empty());
}

// ---------------------------------------------------------------------------
// Run exclusivity and structural errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_second_execute_rejected_while_running() {
    let (orchestrator, _) = start_slow_run(OrchestratorConfig::default()).await;
    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.execute(&[]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(matches!(
        orchestrator.execute(&[]).await,
        Err(ConductorError::AlreadyExecuting)
    ));
    assert!(matches!(
        orchestrator.register_agent("late", noop(), &[]).await,
        Err(ConductorError::AlreadyExecuting)
    ));

    assert!(run.await.unwrap().unwrap().success);
    assert!(!orchestrator.get_status().is_executing);
}

#[tokio::test]
async fn test_cycle_aborts_before_checkpoint() {
    let (orchestrator, checkpoints) = orchestrator(OrchestratorConfig::default());
    orchestrator.register_agent("a", noop(), &["b"]).await.unwrap();
    orchestrator.register_agent("b", noop(), &["a"]).await.unwrap();

    let err = orchestrator.execute(&[]).await.unwrap_err();
    assert!(matches!(err, ConductorError::CircularDependency(_)));
    assert!(checkpoints.records().is_empty());
    assert!(!orchestrator.get_status().is_executing);
    assert!(orchestrator.health().await.has_circular_dependencies);
}

#[tokio::test]
async fn test_unknown_dependency_aborts_run() {
    let (orchestrator, checkpoints) = orchestrator(OrchestratorConfig::default());
    orchestrator.register_agent("a", noop(), &["ghost"]).await.unwrap();

    let err = orchestrator.execute(&[]).await.unwrap_err();
    assert!(matches!(err, ConductorError::UnknownDependency { .. }));
    assert!(checkpoints.records().is_empty());

    let health = orchestrator.health().await;
    assert_eq!(health.missing_dependencies.len(), 1);
    assert!(!health.healthy());
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let (orchestrator, _) = orchestrator(OrchestratorConfig::default());
    orchestrator.register_agent("a", noop(), &[]).await.unwrap();
    assert!(matches!(
        orchestrator.register_agent("a", noop(), &[]).await,
        Err(ConductorError::DuplicateAgent(_))
    ));
}

#[tokio::test]
async fn test_checkpoint_creation_failure_aborts_run() {
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(BrokenCheckpoints),
        Arc::new(NullEventSink),
    )
    .unwrap();
    let loads = Arc::new(AtomicUsize::new(0));
    orchestrator
        .register_agent("a", counting_loader(&loads), &[])
        .await
        .unwrap();

    let err = orchestrator.execute(&[]).await.unwrap_err();
    assert!(matches!(err, ConductorError::Checkpoint(ref m) if m.contains("disk full")));
    assert_eq!(loads.load(Ordering::SeqCst), 0);
}

async fn unsettled_run(
    checkpoints: UnsettledCheckpoints,
    agent: Arc<dyn AgentLoader>,
) -> (ConductorResult<ExecutionResult>, Vec<Event>) {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(checkpoints),
        bus.clone() as Arc<dyn EventSink>,
    )
    .unwrap();
    orchestrator.register_agent("worker", agent, &[]).await.unwrap();

    let result = orchestrator.execute(&[]).await;
    assert!(!orchestrator.is_executing());
    (result, drain(&mut rx))
}

#[tokio::test]
async fn test_commit_failure_is_checkpoint_error() {
    let (result, events) = unsettled_run(
        UnsettledCheckpoints {
            commit_fails: true,
            rollback_fails: false,
        },
        noop(),
    )
    .await;

    let Err(err) = result else {
        panic!("expected the commit failure to surface");
    };
    assert!(matches!(err, ConductorError::Checkpoint(ref m) if m.contains("commit refused")));

    let last = events.last().unwrap();
    assert_eq!(last.topic, EventTopic::RunFailed);
    assert_eq!(last.payload["outcome"], "completed");
    assert!(last.payload["error"].as_str().unwrap().contains("commit refused"));
}

#[tokio::test]
async fn test_rollback_failure_is_rollback_error() {
    let (result, events) = unsettled_run(
        UnsettledCheckpoints {
            commit_fails: false,
            rollback_fails: true,
        },
        failing("bad output"),
    )
    .await;

    let Err(err) = result else {
        panic!("expected the rollback failure to surface");
    };
    assert!(matches!(err, ConductorError::Rollback(ref m) if m.contains("rollback refused")));

    let last = events.last().unwrap();
    assert_eq!(last.topic, EventTopic::RunFailed);
    assert_eq!(last.payload["outcome"], "failed");
    assert!(last.payload["error"].as_str().unwrap().contains("rollback refused"));
}

// ---------------------------------------------------------------------------
// Impact-based selection
// ---------------------------------------------------------------------------

async fn impact_orchestrator() -> Arc<Orchestrator> {
    let analyzer = PathRuleAnalyzer::new()
        .watch("users-agent", &["src/users/**"])
        .unwrap()
        .watch("frontend-agent", &["web/**"])
        .unwrap()
        .watch("ghost-agent", &["**/*.md"])
        .unwrap();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(MemoryCheckpoints::new()),
        Arc::new(NullEventSink),
    )
    .unwrap()
    .with_impact_analyzer(Arc::new(analyzer));

    orchestrator.register_agent("document-agent", noop(), &[]).await.unwrap();
    orchestrator
        .register_agent("backend-agent", noop(), &["document-agent"])
        .await
        .unwrap();
    orchestrator
        .register_agent("users-agent", noop(), &["backend-agent"])
        .await
        .unwrap();
    orchestrator
        .register_agent("frontend-agent", noop(), &["document-agent"])
        .await
        .unwrap();
    Arc::new(orchestrator)
}

#[tokio::test]
async fn test_changed_files_select_affected_agents_and_dependencies() {
    let orchestrator = impact_orchestrator().await;
    let result = orchestrator
        .execute(&["src/users/model.rs".to_string(), "README.md".to_string()])
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(
        result.completed,
        vec!["document-agent", "backend-agent", "users-agent"]
    );
}

#[tokio::test]
async fn test_changes_affecting_nothing_run_nothing() {
    let orchestrator = impact_orchestrator().await;
    let result = orchestrator
        .execute(&["Cargo.lock".to_string()])
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.agents_executed, 0);
}

#[tokio::test]
async fn test_empty_change_list_runs_everything() {
    let orchestrator = impact_orchestrator().await;
    let result = orchestrator.execute(&[]).await.unwrap();
    assert_eq!(result.completed.len(), 4);
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_lifecycle_events_published() {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(MemoryCheckpoints::new()),
        bus.clone() as Arc<dyn EventSink>,
    )
    .unwrap();

    orchestrator
        .register_agent(
            "learner",
            loader(agent_fn(|_ctx| async {
                Ok(AgentOutput::new("learned").with_transition(Transition {
                    state: serde_json::json!({ "queue": 1 }),
                    action: serde_json::json!("run"),
                    next_state: serde_json::json!({ "queue": 0 }),
                }))
            })),
            &[],
        )
        .await
        .unwrap();
    orchestrator.register_agent("broken", failing("nope"), &["learner"]).await.unwrap();
    orchestrator.register_agent("downstream", noop(), &["broken"]).await.unwrap();

    let result = orchestrator.execute(&[]).await.unwrap();
    let events = drain(&mut rx);
    assert!(events.iter().all(|e| e.run_id == result.run_id));

    let topics: Vec<(EventTopic, Option<String>)> = events
        .iter()
        .map(|e| (e.topic, e.agent().map(str::to_string)))
        .collect();
    assert_eq!(
        topics,
        vec![
            (EventTopic::AgentStarted, Some("learner".into())),
            (EventTopic::AgentCompleted, Some("learner".into())),
            (EventTopic::AgentStarted, Some("broken".into())),
            (EventTopic::AgentFailed, Some("broken".into())),
            (EventTopic::AgentSkipped, Some("downstream".into())),
            (EventTopic::RunFailed, None),
        ]
    );

    let completed = &events[1].payload;
    assert_eq!(completed["success"], true);
    assert_eq!(completed["state"]["queue"], 1);
    assert_eq!(completed["action"], "run");
    assert!(completed["execution_time_ms"].is_u64());

    let failed = &events[3].payload;
    assert_eq!(failed["success"], false);
    assert!(failed["error"].as_str().unwrap().contains("nope"));
}
