use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{BestPointer, RunItem, RunKind, RunOutcome};

/// The event vocabulary shared by every job kind:
/// `start -> init -> {progress, item_result}* -> complete | failed | cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Start {
        kind: RunKind,
    },
    Init {
        total: usize,
        description: String,
    },
    Progress {
        fraction: f64,
        completed: usize,
        total: usize,
        activity: String,
    },
    ItemResult {
        item: RunItem,
    },
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        best: Option<BestPointer>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<RunOutcome>,
    },
    Failed {
        error: String,
        /// Set when the run was cut short by a process restart rather than an error.
        #[serde(default)]
        interrupted: bool,
    },
    Cancelled,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Complete { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Start { .. } => "start",
            JobEvent::Init { .. } => "init",
            JobEvent::Progress { .. } => "progress",
            JobEvent::ItemResult { .. } => "item_result",
            JobEvent::Complete { .. } => "complete",
            JobEvent::Failed { .. } => "failed",
            JobEvent::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub run_id: Uuid,
    /// 1-based, gap-free per run.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: JobEvent,
}
