pub mod report;
pub mod runner;

use std::{collections::HashSet, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::info;

pub use report::{EvalStats, EvalSummary};
pub use runner::{EvalRunner, InvocationSetup, PreparedSuite};

use crate::{
    error::EngineError,
    jobs::{BestPointer, JobContext, RunItem, RunOutcome},
    params::RequestParams,
    scoring::EvalResult,
    suite::Suite,
};

/// A plain evaluation: every case of a suite against every model, one fixed setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRequest {
    pub suite_id: String,
    pub models: Vec<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub params: RequestParams,
}

impl EvalRequest {
    pub fn new(suite_id: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            suite_id: suite_id.into(),
            models,
            system_prompt: String::new(),
            params: RequestParams::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_params(mut self, params: RequestParams) -> Self {
        self.params = params;
        self
    }

    pub fn validate(&self, suite: &Suite) -> Result<(), EngineError> {
        check_targets(suite, &self.models)
    }
}

/// A suite with cases and a non-empty model list, neither containing duplicates.
/// Results are keyed by case id and model, so a repeat would silently collapse.
pub(crate) fn check_targets(suite: &Suite, models: &[String]) -> Result<(), EngineError> {
    if suite.test_cases.is_empty() {
        return Err(EngineError::NoTestCases(suite.id.clone()));
    }
    if models.is_empty() {
        return Err(EngineError::NoModels);
    }
    let mut seen = HashSet::new();
    for case in &suite.test_cases {
        if !seen.insert(case.id.as_str()) {
            return Err(EngineError::DuplicateId {
                what: "test case",
                id: case.id.clone(),
            });
        }
    }
    let mut seen = HashSet::new();
    for model in models {
        if !seen.insert(model.as_str()) {
            return Err(EngineError::DuplicateId {
                what: "model",
                id: model.clone(),
            });
        }
    }
    Ok(())
}

pub(crate) async fn run_eval_job(
    runner: Arc<EvalRunner>,
    suite: Arc<PreparedSuite>,
    request: EvalRequest,
    ctx: JobContext,
) -> Result<(RunOutcome, Option<BestPointer>), EngineError> {
    let total = suite.cases().len() * request.models.len();
    ctx.init(
        total,
        format!("{} cases x {} models", suite.cases().len(), request.models.len()),
    )
    .await?;

    let setup = InvocationSetup::new(request.system_prompt.clone(), request.params.clone());
    let mut results: Vec<EvalResult> = Vec::with_capacity(total);
    for case in suite.cases() {
        if ctx.is_cancelled() {
            info!(run_id = %ctx.run_id(), "eval cancelled");
            break;
        }
        for result in runner.run_case_across(&suite, case, &request.models, &setup).await {
            ctx.item(RunItem::Eval(result.clone())).await?;
            results.push(result);
        }
        ctx.progress(results.len(), total, format!("case {}", case.id)).await?;
    }

    let summary = EvalSummary::from_results(&results);
    let best = best_model(&request.models, &summary);
    Ok((RunOutcome::Eval(summary), best))
}

/// Model with the highest mean overall score; the earlier model wins ties.
fn best_model(models: &[String], summary: &EvalSummary) -> Option<BestPointer> {
    let mut best: Option<BestPointer> = None;
    for model in models {
        let Some(stats) = summary.per_model.get(model) else {
            continue;
        };
        if best.as_ref().map_or(true, |b| stats.mean_overall > b.score) {
            best = Some(BestPointer {
                key: model.clone(),
                label: model.clone(),
                score: stats.mean_overall,
            });
        }
    }
    best
}
