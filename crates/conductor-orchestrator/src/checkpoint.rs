use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Restore-point contract used by the orchestrator.
///
/// Exactly one of [`commit_checkpoint`](Self::commit_checkpoint) or
/// [`rollback`](Self::rollback) is called per created checkpoint, once.
#[async_trait]
pub trait CheckpointManager: Send + Sync {
    /// Create a restore point and return its id.
    async fn create_checkpoint(&self, label: &str) -> ConductorResult<String>;

    /// Keep the changes made since the checkpoint.
    async fn commit_checkpoint(&self, checkpoint_id: &str) -> ConductorResult<()>;

    /// Restore the state captured by the checkpoint.
    async fn rollback(&self, checkpoint_id: &str) -> ConductorResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Open,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub label: String,
    pub state: CheckpointState,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Bookkeeping-only checkpoint manager.
///
/// Tracks each checkpoint's state and refuses to settle a checkpoint twice.
/// Suitable when agents have no external state to restore, and as the
/// reference implementation of the contract.
#[derive(Debug, Default)]
pub struct MemoryCheckpoints {
    records: Mutex<Vec<CheckpointRecord>>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, checkpoint_id: &str) -> Option<CheckpointRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.id == checkpoint_id)
            .cloned()
    }

    /// Every checkpoint, oldest first.
    pub fn records(&self) -> Vec<CheckpointRecord> {
        self.records.lock().clone()
    }

    pub fn count_in(&self, state: CheckpointState) -> usize {
        self.records.lock().iter().filter(|r| r.state == state).count()
    }

    fn settle(&self, checkpoint_id: &str, to: CheckpointState) -> Result<(), String> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == checkpoint_id)
            .ok_or_else(|| format!("unknown checkpoint '{checkpoint_id}'"))?;
        if record.state != CheckpointState::Open {
            return Err(format!(
                "checkpoint '{checkpoint_id}' already settled as {:?}",
                record.state
            ));
        }
        record.state = to;
        record.settled_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl CheckpointManager for MemoryCheckpoints {
    async fn create_checkpoint(&self, label: &str) -> ConductorResult<String> {
        let id = format!("cp-{}", Uuid::new_v4());
        self.records.lock().push(CheckpointRecord {
            id: id.clone(),
            label: label.to_string(),
            state: CheckpointState::Open,
            created_at: Utc::now(),
            settled_at: None,
        });
        info!(checkpoint_id = %id, label = %label, "checkpoint created");
        Ok(id)
    }

    async fn commit_checkpoint(&self, checkpoint_id: &str) -> ConductorResult<()> {
        self.settle(checkpoint_id, CheckpointState::Committed)
            .map_err(ConductorError::Checkpoint)?;
        info!(checkpoint_id = %checkpoint_id, "checkpoint committed");
        Ok(())
    }

    async fn rollback(&self, checkpoint_id: &str) -> ConductorResult<()> {
        self.settle(checkpoint_id, CheckpointState::RolledBack)
            .map_err(ConductorError::Rollback)?;
        info!(checkpoint_id = %checkpoint_id, "checkpoint rolled back");
        Ok(())
    }
}
