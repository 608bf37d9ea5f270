use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::run::{BestPointer, Progress, Run, RunItem, RunKind, RunOutcome, RunStatus};
use crate::error::EngineError;

/// Persistence for runs. The stored record is authoritative; events are a convenience tail.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, kind: RunKind, subject: &str, config: Value) -> Result<Uuid, EngineError>;

    /// Returns `false` when an item with the same key was already stored.
    async fn append_result(&self, run_id: Uuid, item: RunItem) -> Result<bool, EngineError>;

    async fn set_status(&self, run_id: Uuid, status: RunStatus, error: Option<String>) -> Result<(), EngineError>;

    async fn update_progress(&self, run_id: Uuid, progress: Progress) -> Result<(), EngineError>;

    async fn set_best(&self, run_id: Uuid, best: BestPointer) -> Result<(), EngineError>;

    async fn set_outcome(&self, run_id: Uuid, outcome: RunOutcome) -> Result<(), EngineError>;

    async fn set_last_seq(&self, run_id: Uuid, seq: u64) -> Result<(), EngineError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError>;

    /// Newest first.
    async fn list_runs(&self) -> Result<Vec<Run>, EngineError>;

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, EngineError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryRunStore {
    runs: Arc<RwLock<HashMap<Uuid, Run>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_run<T>(&self, run_id: Uuid, f: impl FnOnce(&mut Run) -> T) -> Result<T, EngineError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&run_id).ok_or(EngineError::RunNotFound(run_id))?;
        Ok(f(run))
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, kind: RunKind, subject: &str, config: Value) -> Result<Uuid, EngineError> {
        let run = Run::new(kind, subject, config);
        let id = run.id;
        self.runs.write().await.insert(id, run);
        Ok(id)
    }

    async fn append_result(&self, run_id: Uuid, item: RunItem) -> Result<bool, EngineError> {
        self.with_run(run_id, |run| run.push_item(item)).await
    }

    async fn set_status(&self, run_id: Uuid, status: RunStatus, error: Option<String>) -> Result<(), EngineError> {
        self.with_run(run_id, |run| {
            let from = run.status;
            if !run.transition(status) {
                return Err(EngineError::InvalidTransition { run_id, from, to: status });
            }
            if error.is_some() {
                run.error = error;
            }
            Ok(())
        })
        .await?
    }

    async fn update_progress(&self, run_id: Uuid, progress: Progress) -> Result<(), EngineError> {
        self.with_run(run_id, |run| run.advance(progress)).await
    }

    async fn set_best(&self, run_id: Uuid, best: BestPointer) -> Result<(), EngineError> {
        self.with_run(run_id, |run| run.best = Some(best)).await
    }

    async fn set_outcome(&self, run_id: Uuid, outcome: RunOutcome) -> Result<(), EngineError> {
        self.with_run(run_id, |run| run.outcome = Some(outcome)).await
    }

    async fn set_last_seq(&self, run_id: Uuid, seq: u64) -> Result<(), EngineError> {
        self.with_run(run_id, |run| run.last_seq = run.last_seq.max(seq)).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<Run>, EngineError> {
        let mut runs: Vec<Run> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, EngineError> {
        Ok(self.runs.write().await.remove(&run_id).is_some())
    }
}
