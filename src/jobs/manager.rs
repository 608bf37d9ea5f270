use std::{collections::HashMap, future::Future, sync::Arc};

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    events::JobEvent,
    hub::ProgressHub,
    run::{BestPointer, Progress, RunItem, RunKind, RunOutcome, RunStatus},
    store::RunStore,
};
use crate::error::EngineError;

struct ActiveRun {
    run_id: Uuid,
    token: CancellationToken,
}

/// Handle given to a running job for reporting into its run.
#[derive(Clone)]
pub struct JobContext {
    run_id: Uuid,
    store: Arc<dyn RunStore>,
    hub: Arc<ProgressHub>,
    token: CancellationToken,
}

impl JobContext {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn publish(&self, event: JobEvent) -> Result<(), EngineError> {
        if let Some(seq) = self.hub.emit(self.run_id, event).await {
            self.store.set_last_seq(self.run_id, seq).await?;
        }
        Ok(())
    }

    pub async fn init(&self, total: usize, description: impl Into<String>) -> Result<(), EngineError> {
        let description = description.into();
        self.store
            .update_progress(self.run_id, Progress::new(0, total, description.clone()))
            .await?;
        self.publish(JobEvent::Init { total, description }).await
    }

    pub async fn progress(&self, completed: usize, total: usize, activity: impl Into<String>) -> Result<(), EngineError> {
        if self.is_cancelled() {
            return Ok(());
        }
        let progress = Progress::new(completed, total, activity);
        self.store.update_progress(self.run_id, progress.clone()).await?;
        self.publish(JobEvent::Progress {
            fraction: progress.fraction,
            completed: progress.completed,
            total: progress.total,
            activity: progress.activity,
        })
        .await
    }

    /// Stores a fully scored item, then announces it. Items arriving after cancellation are
    /// dropped; the returned flag says whether the item was new.
    pub async fn item(&self, item: RunItem) -> Result<bool, EngineError> {
        if self.is_cancelled() {
            debug!(run_id = %self.run_id, key = %item.key(), "dropping item after cancellation");
            return Ok(false);
        }
        if !self.store.append_result(self.run_id, item.clone()).await? {
            return Ok(false);
        }
        self.publish(JobEvent::ItemResult { item }).await?;
        Ok(true)
    }

    pub async fn set_best(&self, best: BestPointer) -> Result<(), EngineError> {
        self.store.set_best(self.run_id, best).await
    }
}

/// Owns the lifecycle of runs: admission, execution, cancellation and crash recovery.
pub struct JobManager {
    store: Arc<dyn RunStore>,
    hub: Arc<ProgressHub>,
    active: Arc<Mutex<HashMap<String, ActiveRun>>>,
}

impl JobManager {
    pub fn new(store: Arc<dyn RunStore>, hub: Arc<ProgressHub>) -> Self {
        Self {
            store,
            hub,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    /// Active run of `subject`, if any.
    pub async fn active_run(&self, subject: &str) -> Option<Uuid> {
        self.active.lock().await.get(subject).map(|a| a.run_id)
    }

    /// Creates the run record and spawns `job`. At most one run per subject is active;
    /// a second submission is rejected.
    pub async fn submit<F, Fut>(
        &self,
        kind: RunKind,
        subject: &str,
        config: Value,
        job: F,
    ) -> Result<Uuid, EngineError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(RunOutcome, Option<BestPointer>), EngineError>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let run_id = {
            let mut active = self.active.lock().await;
            if let Some(current) = active.get(subject) {
                return Err(EngineError::SubjectBusy {
                    subject: subject.to_string(),
                    run_id: current.run_id,
                });
            }
            let run_id = self.store.create_run(kind, subject, config).await?;
            active.insert(
                subject.to_string(),
                ActiveRun {
                    run_id,
                    token: token.clone(),
                },
            );
            run_id
        };

        let ctx = JobContext {
            run_id,
            store: Arc::clone(&self.store),
            hub: Arc::clone(&self.hub),
            token,
        };
        if let Err(err) = ctx.publish(JobEvent::Start { kind }).await {
            warn!(%run_id, error = %err, "failed to publish start event");
        }
        if let Err(err) = self.store.set_status(run_id, RunStatus::Running, None).await {
            warn!(%run_id, error = %err, "failed to mark run as running");
        }
        info!(%run_id, ?kind, subject, "run started");

        let active = Arc::clone(&self.active);
        let subject = subject.to_string();
        tokio::spawn(async move {
            let job_ctx = ctx.clone();
            // a panicking job must still end its run
            let outcome = tokio::spawn(async move { job(job_ctx).await }).await;

            match outcome {
                Ok(Ok((outcome, best))) => {
                    // partial outcomes of cancelled runs are kept too
                    if let Err(err) = ctx.store.set_outcome(ctx.run_id, outcome.clone()).await {
                        warn!(run_id = %ctx.run_id, error = %err, "failed to store outcome");
                    }
                    if let Some(best) = best.clone() {
                        if let Err(err) = ctx.store.set_best(ctx.run_id, best).await {
                            warn!(run_id = %ctx.run_id, error = %err, "failed to store best pointer");
                        }
                    }
                    if finish(&ctx, RunStatus::Completed, None).await {
                        let event = JobEvent::Complete {
                            best,
                            outcome: Some(outcome),
                        };
                        if let Err(err) = ctx.publish(event).await {
                            warn!(run_id = %ctx.run_id, error = %err, "failed to publish completion");
                        }
                        info!(run_id = %ctx.run_id, "run completed");
                    }
                }
                Ok(Err(err)) => {
                    error!(run_id = %ctx.run_id, error = %err, "run failed");
                    finish(&ctx, RunStatus::Failed, Some(err.to_string())).await;
                }
                Err(join_err) => {
                    let message = if join_err.is_panic() {
                        "job panicked".to_string()
                    } else {
                        join_err.to_string()
                    };
                    error!(run_id = %ctx.run_id, error = %message, "run aborted");
                    finish(&ctx, RunStatus::Failed, Some(message)).await;
                }
            }
            // the subject stays busy until the terminal status is visible
            release(&active, &subject, ctx.run_id).await;
        });

        Ok(run_id)
    }

    /// Stops launching new work for `run_id` and moves it to `cancelled` right away.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let token = {
            let mut active = self.active.lock().await;
            let subject = active
                .iter()
                .find(|(_, a)| a.run_id == run_id)
                .map(|(subject, _)| subject.clone());
            subject
                .and_then(|subject| active.remove(&subject))
                .map(|a| a.token)
        };

        let Some(token) = token else {
            let run = self
                .store
                .get_run(run_id)
                .await?
                .ok_or(EngineError::RunNotFound(run_id))?;
            return Err(EngineError::InvalidTransition {
                run_id,
                from: run.status,
                to: RunStatus::Cancelled,
            });
        };

        token.cancel();
        self.store.set_status(run_id, RunStatus::Cancelled, None).await?;
        if let Some(seq) = self.hub.emit(run_id, JobEvent::Cancelled).await {
            self.store.set_last_seq(run_id, seq).await?;
        }
        info!(%run_id, "run cancelled");
        Ok(())
    }

    /// Marks runs left `pending` or `running` by a previous process as `interrupted`.
    pub async fn recover_interrupted(&self) -> Result<Vec<Uuid>, EngineError> {
        let active: Vec<Uuid> = self.active.lock().await.values().map(|a| a.run_id).collect();
        let mut recovered = Vec::new();
        for run in self.store.list_runs().await? {
            if run.status.is_terminal() || active.contains(&run.id) {
                continue;
            }
            let reason = "interrupted before completion".to_string();
            self.store
                .set_status(run.id, RunStatus::Interrupted, Some(reason.clone()))
                .await?;
            let event = JobEvent::Failed {
                error: reason,
                interrupted: true,
            };
            if let Some(seq) = self.hub.emit(run.id, event).await {
                self.store.set_last_seq(run.id, seq).await?;
            }
            warn!(run_id = %run.id, kind = ?run.kind, "marked run as interrupted");
            recovered.push(run.id);
        }
        Ok(recovered)
    }
}

async fn release(active: &Mutex<HashMap<String, ActiveRun>>, subject: &str, run_id: Uuid) {
    let mut active = active.lock().await;
    if active.get(subject).is_some_and(|a| a.run_id == run_id) {
        active.remove(subject);
    }
}

/// Moves the run to `status` and emits the matching terminal event. Returns `false` when
/// another terminal state won the race (e.g. a cancel).
async fn finish(ctx: &JobContext, status: RunStatus, error: Option<String>) -> bool {
    match ctx.store.set_status(ctx.run_id, status, error.clone()).await {
        Ok(()) => {}
        Err(EngineError::InvalidTransition { from, .. }) => {
            debug!(run_id = %ctx.run_id, ?from, ?status, "run already finished");
            return false;
        }
        Err(err) => {
            warn!(run_id = %ctx.run_id, error = %err, "failed to store final status");
            return false;
        }
    }
    if let Some(error) = error {
        let event = JobEvent::Failed {
            error,
            interrupted: false,
        };
        if let Err(err) = ctx.publish(event).await {
            warn!(run_id = %ctx.run_id, error = %err, "failed to publish failure");
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use serde_json::json;

    use super::JobManager;
    use crate::{
        error::EngineError,
        eval::report::EvalSummary,
        jobs::{
            hub::ProgressHub,
            run::{RunKind, RunOutcome, RunStatus},
            store::{InMemoryRunStore, RunStore},
        },
    };

    fn manager() -> JobManager {
        JobManager::new(Arc::new(InMemoryRunStore::new()), Arc::new(ProgressHub::new(16)))
    }

    async fn wait_for(manager: &JobManager, run_id: uuid::Uuid, status: RunStatus) {
        for _ in 0..200 {
            let run = manager.store().get_run(run_id).await.unwrap().unwrap();
            if run.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run never reached {status:?}");
    }

    #[tokio::test]
    async fn second_run_for_same_subject_is_rejected() {
        let manager = manager();
        let first = manager
            .submit(RunKind::Eval, "alice", json!({}), |ctx| async move {
                ctx.cancellation().cancelled().await;
                Ok::<_, EngineError>((RunOutcome::Eval(EvalSummary::default()), None))
            })
            .await
            .unwrap();

        let err = manager
            .submit(RunKind::Eval, "alice", json!({}), |_| async move {
                Ok::<_, EngineError>((RunOutcome::Eval(EvalSummary::default()), None))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SubjectBusy { run_id, .. } if run_id == first));

        manager.cancel(first).await.unwrap();
        wait_for(&manager, first, RunStatus::Cancelled).await;
    }

    #[tokio::test]
    async fn panicking_job_fails_the_run() {
        let manager = manager();
        let run_id = manager
            .submit(RunKind::Eval, "bob", json!({}), |_| async move {
                if true {
                    panic!("boom");
                }
                Ok::<_, EngineError>((RunOutcome::Eval(EvalSummary::default()), None))
            })
            .await
            .unwrap();
        wait_for(&manager, run_id, RunStatus::Failed).await;
        let events = manager.hub().replay(run_id).await;
        assert_eq!(events.last().map(|e| e.event.name()), Some("failed"));
    }

    #[tokio::test]
    async fn subject_frees_only_after_the_run_finishes() {
        let manager = manager();
        let run_id = manager
            .submit(RunKind::Eval, "dana", json!({}), |_| async move {
                Ok::<_, EngineError>((RunOutcome::Eval(EvalSummary::default()), None))
            })
            .await
            .unwrap();

        for _ in 0..200 {
            if manager.active_run("dana").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.active_run("dana").await, None);

        let run = manager.store().get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let events = manager.hub().replay(run_id).await;
        assert_eq!(events.last().map(|e| e.event.name()), Some("complete"));
    }

    #[tokio::test]
    async fn recovers_runs_left_running() {
        let store = Arc::new(InMemoryRunStore::new());
        let orphan = store.create_run(RunKind::ParamTuning, "carol", json!({})).await.unwrap();
        store.set_status(orphan, RunStatus::Running, None).await.unwrap();

        let manager = JobManager::new(store.clone(), Arc::new(ProgressHub::new(16)));
        assert_eq!(manager.recover_interrupted().await.unwrap(), vec![orphan]);
        let run = store.get_run(orphan).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Interrupted);
        assert!(run.error.is_some());
    }
}
