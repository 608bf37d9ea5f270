//! Search over request parameters.
//!
//! Combos run one after another in the order the strategy yields them; inside a combo every
//! model is evaluated concurrently. The Bayesian strategy observes each combo's mean score
//! before proposing the next one.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    capabilities::{Adjustment, CapabilityTable},
    error::EngineError,
    eval::{check_targets, EvalRunner, InvocationSetup, PreparedSuite},
    jobs::{BestPointer, JobContext, RunItem, RunOutcome},
    params::{Combo, RequestParams},
    scoring::EvalResult,
    search::{BayesianSampler, BayesianSettings, RandomSampler, SearchSpace},
    suite::Suite,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchStrategy {
    Grid,
    Random {
        n_samples: usize,
        #[serde(default)]
        seed: u64,
    },
    Bayesian {
        n_trials: usize,
        #[serde(default)]
        seed: u64,
        /// Falls back to the engine's configured defaults.
        #[serde(default)]
        settings: Option<BayesianSettings>,
    },
}

impl SearchStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SearchStrategy::Grid => "grid",
            SearchStrategy::Random { .. } => "random",
            SearchStrategy::Bayesian { .. } => "bayesian",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamTuningRequest {
    pub suite_id: String,
    pub models: Vec<String>,
    #[serde(default)]
    pub system_prompt: String,
    /// Fixed parameters sent with every combo; combo values win on conflict.
    #[serde(default)]
    pub base_params: RequestParams,
    pub space: SearchSpace,
    pub strategy: SearchStrategy,
}

impl ParamTuningRequest {
    pub fn new(suite_id: impl Into<String>, models: Vec<String>, space: SearchSpace, strategy: SearchStrategy) -> Self {
        Self {
            suite_id: suite_id.into(),
            models,
            system_prompt: String::new(),
            base_params: RequestParams::new(),
            space,
            strategy,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_base_params(mut self, params: RequestParams) -> Self {
        self.base_params = params;
        self
    }

    /// Rejects the request before any run exists.
    pub fn validate(&self, suite: &Suite, max_grid_combos: u64) -> Result<(), EngineError> {
        check_targets(suite, &self.models)?;
        self.space.validate()?;

        let size = self.space.grid_size();
        if size == 0 {
            return Err(EngineError::EmptySearchSpace);
        }
        match &self.strategy {
            SearchStrategy::Grid if size > max_grid_combos => Err(EngineError::SearchSpaceTooLarge {
                size,
                limit: max_grid_combos,
            }),
            SearchStrategy::Random { n_samples: 0, .. } => Err(EngineError::InvalidParameter {
                name: "n_samples".into(),
                reason: "must be at least 1".into(),
            }),
            SearchStrategy::Bayesian { n_trials: 0, .. } => Err(EngineError::InvalidParameter {
                name: "n_trials".into(),
                reason: "must be at least 1".into(),
            }),
            _ => Ok(()),
        }
    }
}

/// Everything measured for one combo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboResult {
    /// Position in evaluation order, from 0.
    pub index: usize,
    pub combo: Combo,
    /// Mean overall score across every (case, model) pair.
    pub mean_score: f64,
    pub per_model: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub adjustments: BTreeMap<String, Vec<Adjustment>>,
    pub errors: usize,
    pub case_results: Vec<EvalResult>,
}

impl ComboResult {
    fn from_results(index: usize, combo: Combo, models: &[String], results: Vec<EvalResult>) -> Self {
        let mean_score = mean(results.iter().map(|r| r.overall_score));
        let mut per_model = BTreeMap::new();
        let mut adjustments: BTreeMap<String, Vec<Adjustment>> = BTreeMap::new();
        for model in models {
            let own: Vec<&EvalResult> = results.iter().filter(|r| &r.model == model).collect();
            per_model.insert(model.clone(), mean(own.iter().map(|r| r.overall_score)));
            let mut seen = Vec::new();
            for result in &own {
                crate::capabilities::merge_adjustments(&mut seen, result.adjustments.iter().cloned());
            }
            if !seen.is_empty() {
                adjustments.insert(model.clone(), seen);
            }
        }
        Self {
            index,
            errors: results.iter().filter(|r| r.error.is_some()).count(),
            combo,
            mean_score,
            per_model,
            adjustments,
            case_results: results,
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestCombo {
    pub index: usize,
    pub combo: Combo,
    pub model: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTuneOutcome {
    pub strategy: String,
    /// Grid size, sample count or trial budget.
    pub planned: usize,
    pub evaluated: usize,
    pub best: Option<BestCombo>,
    /// Bayesian search stopped early because the best score stopped improving.
    #[serde(default)]
    pub converged: bool,
    #[serde(default)]
    pub cancelled: bool,
    /// Range-level adjustments per model, known before the first combo ran.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub planned_adjustments: BTreeMap<String, Vec<Adjustment>>,
}

/// Keeps the best (combo, model) pair. Only a strictly higher score replaces it, so ties
/// resolve to the first pair evaluated.
#[derive(Debug, Default)]
struct BestTracker {
    best: Option<BestCombo>,
}

impl BestTracker {
    fn offer(&mut self, result: &ComboResult, models: &[String]) -> bool {
        let mut changed = false;
        for model in models {
            let Some(score) = result.per_model.get(model).copied() else {
                continue;
            };
            if self.best.as_ref().map_or(true, |b| score > b.score) {
                self.best = Some(BestCombo {
                    index: result.index,
                    combo: result.combo.clone(),
                    model: model.clone(),
                    score,
                });
                changed = true;
            }
        }
        changed
    }

    fn pointer(&self) -> Option<BestPointer> {
        self.best.as_ref().map(|b| BestPointer {
            key: format!("combo:{}", b.index),
            label: format!("{} @ {}", b.model, b.combo),
            score: b.score,
        })
    }
}

/// Capability context for planning adjustments per model.
#[derive(Debug, Clone)]
pub struct CapabilityPlan {
    pub table: CapabilityTable,
    /// Provider key for models without a `provider/` prefix.
    pub fallback_provider: String,
}

impl CapabilityPlan {
    pub fn plan(&self, models: &[String], space: &SearchSpace) -> BTreeMap<String, Vec<Adjustment>> {
        models
            .iter()
            .filter_map(|model| {
                let provider = CapabilityTable::provider_for(model, &self.fallback_provider);
                let adjustments = self.table.plan(provider, space);
                (!adjustments.is_empty()).then(|| (model.clone(), adjustments))
            })
            .collect()
    }
}

enum ComboSource {
    Fixed(std::vec::IntoIter<Combo>),
    Bayesian(Box<BayesianSampler>),
}

impl ComboSource {
    fn next(&mut self) -> Option<Combo> {
        match self {
            ComboSource::Fixed(combos) => combos.next(),
            ComboSource::Bayesian(sampler) => sampler.propose(),
        }
    }

    fn observe(&mut self, combo: &Combo, score: f64) {
        if let ComboSource::Bayesian(sampler) = self {
            sampler.observe(combo, score);
        }
    }

    fn converged(&self) -> bool {
        matches!(self, ComboSource::Bayesian(sampler) if sampler.is_converged())
    }
}

pub(crate) async fn run_param_tuning_job(
    runner: Arc<EvalRunner>,
    suite: Arc<PreparedSuite>,
    request: ParamTuningRequest,
    capabilities: CapabilityPlan,
    bayesian_defaults: BayesianSettings,
    ctx: JobContext,
) -> Result<(RunOutcome, Option<BestPointer>), EngineError> {
    let planned_adjustments = capabilities.plan(&request.models, &request.space);
    for (model, adjustments) in &planned_adjustments {
        info!(run_id = %ctx.run_id(), model = %model, ?adjustments, "parameters adjusted for model");
    }

    let (mut source, planned) = match &request.strategy {
        SearchStrategy::Grid => {
            let combos = request.space.grid();
            let planned = combos.len();
            (ComboSource::Fixed(combos.into_iter()), planned)
        }
        SearchStrategy::Random { n_samples, seed } => {
            let combos = RandomSampler::new(request.space.clone(), *seed).sample(*n_samples);
            let planned = combos.len();
            (ComboSource::Fixed(combos.into_iter()), planned)
        }
        SearchStrategy::Bayesian { n_trials, seed, settings } => {
            let settings = settings.clone().unwrap_or_else(|| bayesian_defaults.clone());
            let sampler = BayesianSampler::new(request.space.clone(), *n_trials, *seed, settings);
            (ComboSource::Bayesian(Box::new(sampler)), *n_trials)
        }
    };

    let models = request.models.clone();
    let total = planned * models.len();
    ctx.init(
        total,
        format!("{} search: {} combos x {} models", request.strategy.name(), planned, models.len()),
    )
    .await?;

    let mut best = BestTracker::default();
    let mut evaluated = 0usize;
    let mut cancelled = false;
    while let Some(combo) = source.next() {
        if ctx.is_cancelled() {
            cancelled = true;
            break;
        }

        let params = request.base_params.merged(&combo);
        let setup = InvocationSetup::new(request.system_prompt.clone(), params);
        let key = combo.key();
        let results: Vec<EvalResult> = runner
            .run_suite(&suite, &models, &setup)
            .await
            .into_iter()
            .map(|r| r.with_config(key.clone()))
            .collect();
        if ctx.is_cancelled() {
            // the in-flight combo is abandoned
            cancelled = true;
            break;
        }

        let result = ComboResult::from_results(evaluated, combo.clone(), &models, results);
        source.observe(&combo, result.mean_score);
        debug!(run_id = %ctx.run_id(), combo = %key, score = result.mean_score, "combo evaluated");

        if best.offer(&result, &models) {
            if let Some(pointer) = best.pointer() {
                ctx.set_best(pointer).await?;
            }
        }
        if !ctx.item(RunItem::Combo(result)).await? && ctx.is_cancelled() {
            cancelled = true;
            break;
        }
        evaluated += 1;
        ctx.progress(evaluated * models.len(), total, format!("combo {evaluated}/{planned}: {key}"))
            .await?;
    }
    cancelled |= ctx.is_cancelled();

    let converged = source.converged();
    if converged {
        info!(run_id = %ctx.run_id(), evaluated, "search converged before exhausting the budget");
    }
    let outcome = ParamTuneOutcome {
        strategy: request.strategy.name().to_string(),
        planned,
        evaluated,
        best: best.best.clone(),
        converged,
        cancelled,
        planned_adjustments,
    };
    Ok((RunOutcome::ParamTuning(outcome), best.pointer()))
}

#[cfg(test)]
mod tests {
    use super::{BestTracker, ComboResult, ParamTuningRequest, SearchStrategy};
    use crate::{
        error::EngineError,
        params::RequestParams,
        search::{ParamSpec, SearchSpace},
        suite::{Suite, TestCase},
    };

    fn suite() -> Suite {
        Suite::new("s").with_case(TestCase::new("c", "p").expecting("t"))
    }

    #[test]
    fn validation_rejects_before_running() {
        let space = SearchSpace::new(vec![ParamSpec::float("temperature", 0.0, 1.0, 0.5)]);
        let request = ParamTuningRequest::new("s", vec![], space.clone(), SearchStrategy::Grid);
        assert!(matches!(request.validate(&suite(), 100), Err(EngineError::NoModels)));

        let request = ParamTuningRequest::new("s", vec!["m".into()], space.clone(), SearchStrategy::Grid);
        assert!(matches!(request.validate(&Suite::new("empty"), 100), Err(EngineError::NoTestCases(_))));
        assert!(matches!(
            request.validate(&suite(), 2),
            Err(EngineError::SearchSpaceTooLarge { size: 3, limit: 2 })
        ));

        let request = ParamTuningRequest::new(
            "s",
            vec!["m".into()],
            space,
            SearchStrategy::Bayesian { n_trials: 0, seed: 1, settings: None },
        );
        assert!(matches!(request.validate(&suite(), 100), Err(EngineError::InvalidParameter { .. })));

        let twice = suite().with_case(TestCase::new("c", "again").expecting("t"));
        let request = ParamTuningRequest::new("s", vec!["m".into()], SearchSpace::new(vec![]), SearchStrategy::Grid);
        assert!(matches!(
            request.validate(&twice, 100),
            Err(EngineError::DuplicateId { what: "test case", .. })
        ));
    }

    #[test]
    fn ties_keep_first_combo() {
        let models = vec!["m".to_string()];
        let first = ComboResult::from_results(0, RequestParams::new().with("temperature", 0.5), &models, vec![]);
        let second = ComboResult::from_results(1, RequestParams::new().with("temperature", 1.0), &models, vec![]);

        let mut best = BestTracker::default();
        assert!(best.offer(&first, &models));
        assert!(!best.offer(&second, &models));
        assert_eq!(best.best.unwrap().index, 0);
    }
}
