use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    eval::report::EvalSummary,
    param_tuning::{ComboResult, ParamTuneOutcome},
    prompt_tuning::{PromptTuneOutcome, PromptVariant},
    scoring::EvalResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Eval,
    ParamTuning,
    PromptTuning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Interrupted
        )
    }

    /// `pending -> running`, and any live state to exactly one terminal state.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (RunStatus::Pending, RunStatus::Running) => true,
            (_, to) => to.is_terminal(),
        }
    }
}

/// One fully scored unit of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RunItem {
    Eval(EvalResult),
    Combo(ComboResult),
    Variant(PromptVariant),
}

impl RunItem {
    /// Identity used to deduplicate repeated deliveries.
    pub fn key(&self) -> String {
        match self {
            RunItem::Eval(result) => format!("eval:{}", result.key()),
            RunItem::Combo(combo) => format!("combo:{}", combo.index),
            RunItem::Variant(variant) => format!("variant:{}:{}", variant.generation, variant.index),
        }
    }

    pub fn score(&self) -> f64 {
        match self {
            RunItem::Eval(result) => result.overall_score,
            RunItem::Combo(combo) => combo.mean_score,
            RunItem::Variant(variant) => variant.score,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub fraction: f64,
    pub completed: usize,
    pub total: usize,
    #[serde(default)]
    pub activity: String,
}

impl Progress {
    pub fn new(completed: usize, total: usize, activity: impl Into<String>) -> Self {
        let fraction = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64).clamp(0.0, 1.0)
        };
        Self {
            fraction,
            completed,
            total,
            activity: activity.into(),
        }
    }
}

/// Pointer to the best item seen so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestPointer {
    pub key: String,
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Eval(EvalSummary),
    ParamTuning(ParamTuneOutcome),
    PromptTuning(PromptTuneOutcome),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub kind: RunKind,
    pub subject: String,
    pub status: RunStatus,
    /// The request the run was submitted with.
    pub config: Value,
    pub items: Vec<RunItem>,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best: Option<BestPointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Sequence number of the last event published for this run.
    #[serde(default)]
    pub last_seq: u64,
    #[serde(skip)]
    item_keys: HashSet<String>,
}

impl Run {
    pub fn new(kind: RunKind, subject: impl Into<String>, config: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            subject: subject.into(),
            status: RunStatus::Pending,
            config,
            items: Vec::new(),
            progress: Progress::default(),
            best: None,
            outcome: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_seq: 0,
            item_keys: HashSet::new(),
        }
    }

    /// Appends unless an item with the same key is already present.
    pub fn push_item(&mut self, item: RunItem) -> bool {
        if self.item_keys.is_empty() && !self.items.is_empty() {
            self.item_keys = self.items.iter().map(RunItem::key).collect();
        }
        if !self.item_keys.insert(item.key()) {
            return false;
        }
        self.items.push(item);
        true
    }

    pub fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        true
    }

    /// Progress only moves forward.
    pub fn advance(&mut self, progress: Progress) {
        if progress.fraction + f64::EPSILON >= self.progress.fraction {
            self.progress = progress;
        } else {
            self.progress.activity = progress.activity;
        }
    }

    /// Mean item score, `None` before the first item.
    pub fn aggregate_score(&self) -> Option<f64> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.items.iter().map(RunItem::score).sum::<f64>() / self.items.len() as f64)
    }
}
