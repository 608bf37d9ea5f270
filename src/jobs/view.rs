use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    events::{EventEnvelope, JobEvent},
    run::{BestPointer, Run, RunItem, RunKind, RunOutcome, RunStatus},
};

/// Client-side reconstruction of a run from a snapshot plus events.
///
/// Safe to build from any point: duplicate items, replayed progress and anything after
/// the terminal event are ignored.
#[derive(Debug, Clone)]
pub struct RunView {
    pub run_id: Uuid,
    pub kind: Option<RunKind>,
    pub status: RunStatus,
    pub items: Vec<RunItem>,
    pub fraction: f64,
    pub completed: usize,
    pub total: usize,
    pub activity: String,
    pub best: Option<BestPointer>,
    pub outcome: Option<RunOutcome>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_seq: u64,
    /// Events received after the terminal event.
    pub violations: usize,
    keys: HashSet<String>,
}

impl RunView {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            kind: None,
            status: RunStatus::Pending,
            items: Vec::new(),
            fraction: 0.0,
            completed: 0,
            total: 0,
            activity: String::new(),
            best: None,
            outcome: None,
            error: None,
            started_at: None,
            last_seq: 0,
            violations: 0,
            keys: HashSet::new(),
        }
    }

    /// Starting point for a consumer that joins mid-run; subscribe with `after_seq = last_seq`.
    pub fn from_run(run: &Run) -> Self {
        let mut view = Self::new(run.id);
        view.kind = Some(run.kind);
        view.status = run.status;
        view.fraction = run.progress.fraction;
        view.completed = run.progress.completed;
        view.total = run.progress.total;
        view.activity = run.progress.activity.clone();
        view.best = run.best.clone();
        view.outcome = run.outcome.clone();
        view.error = run.error.clone();
        view.started_at = run.started_at.or(Some(run.created_at));
        view.last_seq = run.last_seq;
        for item in &run.items {
            view.push_item(item.clone());
        }
        view
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies one event; returns whether it changed anything.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> bool {
        if envelope.run_id != self.run_id {
            return false;
        }
        if self.is_finished() {
            if envelope.seq > self.last_seq {
                self.violations += 1;
            }
            return false;
        }
        self.last_seq = self.last_seq.max(envelope.seq);

        match &envelope.event {
            JobEvent::Start { kind } => {
                self.kind = Some(*kind);
                self.started_at.get_or_insert(envelope.at);
                if self.status == RunStatus::Pending {
                    self.status = RunStatus::Running;
                }
                true
            }
            JobEvent::Init { total, description } => {
                self.total = *total;
                self.activity = description.clone();
                self.status = RunStatus::Running;
                true
            }
            JobEvent::Progress {
                fraction,
                completed,
                total,
                activity,
            } => {
                self.activity = activity.clone();
                if *fraction + f64::EPSILON < self.fraction {
                    return false;
                }
                self.fraction = *fraction;
                self.completed = *completed;
                self.total = *total;
                self.status = RunStatus::Running;
                true
            }
            JobEvent::ItemResult { item } => self.push_item(item.clone()),
            JobEvent::Complete { best, outcome } => {
                self.status = RunStatus::Completed;
                self.fraction = 1.0;
                if best.is_some() {
                    self.best = best.clone();
                }
                if outcome.is_some() {
                    self.outcome = outcome.clone();
                }
                true
            }
            JobEvent::Failed { error, interrupted } => {
                self.status = if *interrupted {
                    RunStatus::Interrupted
                } else {
                    RunStatus::Failed
                };
                self.error = Some(error.clone());
                true
            }
            JobEvent::Cancelled => {
                self.status = RunStatus::Cancelled;
                true
            }
        }
    }

    fn push_item(&mut self, item: RunItem) -> bool {
        if !self.keys.insert(item.key()) {
            return false;
        }
        self.items.push(item);
        true
    }

    pub fn aggregate_score(&self) -> Option<f64> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.items.iter().map(RunItem::score).sum::<f64>() / self.items.len() as f64)
    }

    /// Remaining time by linear extrapolation of elapsed time over completed fraction.
    pub fn eta(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.is_finished() || self.fraction <= 0.0 || self.fraction >= 1.0 {
            return None;
        }
        let elapsed = (now - self.started_at?).to_std().ok()?;
        let remaining = elapsed.as_secs_f64() * (1.0 - self.fraction) / self.fraction;
        Some(Duration::from_secs_f64(remaining))
    }
}
