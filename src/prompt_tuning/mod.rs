//! System-prompt search driven by a meta-model.
//!
//! Quick mode scores one generated population. Evolutionary mode keeps the top
//! `selection_ratio` of each generation as parents for the next one. The best variant is
//! tracked across all generations.

pub mod library;
pub mod meta;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use library::{InMemoryPromptLibrary, PromptLibrary, SavedPrompt};
pub use meta::{GeneratedVariant, LlmMetaModel, MetaModel, ParentPrompt, VariantRequest};

use crate::{
    error::EngineError,
    eval::{check_targets, EvalRunner, InvocationSetup, PreparedSuite},
    jobs::{BestPointer, JobContext, RunItem, RunOutcome},
    params::RequestParams,
    suite::Suite,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TuningMode {
    Quick,
    Evolutionary { generations: usize, selection_ratio: f64 },
}

impl TuningMode {
    pub fn generations(&self) -> usize {
        match self {
            TuningMode::Quick => 1,
            TuningMode::Evolutionary { generations, .. } => *generations,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TuningMode::Quick => "quick",
            TuningMode::Evolutionary { .. } => "evolutionary",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTuningRequest {
    pub suite_id: String,
    pub models: Vec<String>,
    pub base_prompt: String,
    #[serde(default)]
    pub params: RequestParams,
    pub population_size: usize,
    pub mode: TuningMode,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Library name for the winning prompt; defaults to one derived from the suite.
    #[serde(default)]
    pub save_as: Option<String>,
}

impl PromptTuningRequest {
    pub fn new(suite_id: impl Into<String>, models: Vec<String>, base_prompt: impl Into<String>, population_size: usize, mode: TuningMode) -> Self {
        Self {
            suite_id: suite_id.into(),
            models,
            base_prompt: base_prompt.into(),
            params: RequestParams::new(),
            population_size,
            mode,
            instructions: None,
            save_as: None,
        }
    }

    pub fn validate(&self, suite: &Suite) -> Result<(), EngineError> {
        check_targets(suite, &self.models)?;
        if self.base_prompt.trim().is_empty() {
            return Err(EngineError::InvalidPromptSettings("base prompt is empty".into()));
        }
        if self.population_size == 0 {
            return Err(EngineError::InvalidPromptSettings("population size must be at least 1".into()));
        }
        if let TuningMode::Evolutionary { generations, selection_ratio } = &self.mode {
            if *generations == 0 {
                return Err(EngineError::InvalidPromptSettings("generations must be at least 1".into()));
            }
            if !(*selection_ratio > 0.0 && *selection_ratio <= 1.0) {
                return Err(EngineError::InvalidPromptSettings(format!(
                    "selection ratio {selection_ratio} must be in (0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// One scored prompt. Generations count from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVariant {
    pub text: String,
    pub generation: usize,
    pub index: usize,
    #[serde(default)]
    pub origin_style: Option<String>,
    /// Mean overall score across every (case, model) pair.
    pub score: f64,
    pub per_model: BTreeMap<String, f64>,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTuneOutcome {
    pub mode: String,
    pub generations_run: usize,
    pub best: Option<PromptVariant>,
    /// Mean variant score per generation.
    pub generation_means: Vec<f64>,
    #[serde(default)]
    pub cancelled: bool,
    /// Why evolution ended before the configured number of generations, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_early: Option<String>,
    #[serde(default)]
    pub saved: bool,
}

/// Shared services for a prompt tuning job.
pub(crate) struct PromptTuningDeps {
    pub runner: Arc<EvalRunner>,
    pub meta: Arc<dyn MetaModel>,
    pub library: Arc<dyn PromptLibrary>,
}

struct Candidate {
    text: String,
    style: Option<String>,
}

/// Trims or pads a generated population to exactly `n`. Padding reuses parents (best first)
/// or, for the first generation, the base prompt.
fn fill_population(generated: Vec<GeneratedVariant>, n: usize, parents: &[PromptVariant], base_prompt: &str) -> Vec<Candidate> {
    let mut population: Vec<Candidate> = generated
        .into_iter()
        .take(n)
        .map(|v| Candidate {
            text: v.text,
            style: v.style,
        })
        .collect();

    let mut carry = 0usize;
    while population.len() < n {
        let candidate = if parents.is_empty() {
            Candidate {
                text: base_prompt.to_string(),
                style: Some("base".into()),
            }
        } else {
            let parent = &parents[carry % parents.len()];
            carry += 1;
            Candidate {
                text: parent.text.clone(),
                style: Some(format!("carried:{}.{}", parent.generation, parent.index)),
            }
        };
        population.push(candidate);
    }
    population
}

/// Top `ratio` of a generation by score; at least one. Ties keep generation order.
fn select_parents(generation: &[PromptVariant], ratio: f64) -> Vec<PromptVariant> {
    let keep = ((generation.len() as f64 * ratio).ceil() as usize).clamp(1, generation.len().max(1));
    let mut ranked: Vec<PromptVariant> = generation.to_vec();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(keep);
    ranked
}

pub(crate) async fn run_prompt_tuning_job(
    deps: PromptTuningDeps,
    suite: Arc<PreparedSuite>,
    request: PromptTuningRequest,
    ctx: JobContext,
) -> Result<(RunOutcome, Option<BestPointer>), EngineError> {
    let generations = request.mode.generations();
    let n = request.population_size;
    let models = request.models.clone();
    let total = generations * n * models.len();
    ctx.init(
        total,
        format!("{} prompt tuning: {} generations x {} variants", request.mode.name(), generations, n),
    )
    .await?;

    let mut best: Option<PromptVariant> = None;
    let mut parents: Vec<PromptVariant> = Vec::new();
    let mut generation_means = Vec::new();
    let mut scored: HashMap<String, (f64, BTreeMap<String, f64>, usize)> = HashMap::new();
    let mut cancelled = false;
    let mut stopped_early = None;
    let mut completed = 0usize;

    'generations: for generation in 1..=generations {
        if ctx.is_cancelled() {
            cancelled = true;
            break;
        }

        let variant_request = VariantRequest {
            base_prompt: request.base_prompt.clone(),
            parents: parents
                .iter()
                .map(|p| ParentPrompt {
                    text: p.text.clone(),
                    score: p.score,
                })
                .collect(),
            n,
            instructions: request.instructions.clone(),
            generation,
        };
        let generated = match deps.meta.generate_variants(&variant_request).await {
            Ok(generated) => generated,
            Err(err) if generation == 1 => return Err(EngineError::MetaModel(err)),
            Err(err) => {
                warn!(run_id = %ctx.run_id(), generation, error = %err, "meta-model failed; keeping results so far");
                stopped_early = Some(format!("generation {generation}: {err}"));
                break;
            }
        };
        if generated.len() != n {
            debug!(run_id = %ctx.run_id(), generation, got = generated.len(), wanted = n, "resizing population");
        }
        let population = fill_population(generated, n, &parents, &request.base_prompt);

        let mut current: Vec<PromptVariant> = Vec::with_capacity(n);
        for (index, candidate) in population.into_iter().enumerate() {
            if ctx.is_cancelled() {
                cancelled = true;
                break 'generations;
            }

            let cached = scored.get(&candidate.text).cloned();
            let (score, per_model, errors) = match cached {
                Some(known) => known,
                None => {
                    let setup = InvocationSetup::new(candidate.text.clone(), request.params.clone());
                    let results = deps.runner.run_suite(&suite, &models, &setup).await;
                    if ctx.is_cancelled() {
                        cancelled = true;
                        break 'generations;
                    }
                    let evaluated = summarize(&results, &models);
                    scored.insert(candidate.text.clone(), evaluated.clone());
                    evaluated
                }
            };

            let variant = PromptVariant {
                text: candidate.text,
                generation,
                index,
                origin_style: candidate.style,
                score,
                per_model,
                errors,
            };
            debug!(run_id = %ctx.run_id(), generation, index, score, "variant scored");

            if best.as_ref().map_or(true, |b| variant.score > b.score) {
                best = Some(variant.clone());
                ctx.set_best(pointer_for(&variant)).await?;
            }
            ctx.item(RunItem::Variant(variant.clone())).await?;
            current.push(variant);

            completed += models.len();
            ctx.progress(completed, total, format!("generation {generation}/{generations}, variant {}/{n}", index + 1))
                .await?;
        }

        let mean = current.iter().map(|v| v.score).sum::<f64>() / current.len().max(1) as f64;
        generation_means.push(mean);
        info!(run_id = %ctx.run_id(), generation, mean, "generation finished");

        if let TuningMode::Evolutionary { selection_ratio, .. } = &request.mode {
            parents = select_parents(&current, *selection_ratio);
        }
    }

    let mut saved = false;
    if let (Some(winner), false) = (&best, cancelled) {
        let record = SavedPrompt {
            id: Uuid::new_v4(),
            name: request
                .save_as
                .clone()
                .unwrap_or_else(|| format!("{}-tuned", request.suite_id)),
            text: winner.text.clone(),
            score: winner.score,
            generation: winner.generation,
            index: winner.index,
            style: winner.origin_style.clone(),
            run_id: ctx.run_id(),
            suite_id: request.suite_id.clone(),
            models: models.clone(),
            saved_at: Utc::now(),
        };
        match deps.library.save(record).await {
            Ok(()) => saved = true,
            Err(err) => warn!(run_id = %ctx.run_id(), error = %err, "failed to save best prompt"),
        }
    }

    let pointer = best.as_ref().map(pointer_for);
    let outcome = PromptTuneOutcome {
        mode: request.mode.name().to_string(),
        generations_run: generation_means.len(),
        best,
        generation_means,
        cancelled,
        stopped_early,
        saved,
    };
    Ok((RunOutcome::PromptTuning(outcome), pointer))
}

fn summarize(results: &[crate::scoring::EvalResult], models: &[String]) -> (f64, BTreeMap<String, f64>, usize) {
    let mean_of = |scores: Vec<f64>| {
        if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    };
    let score = mean_of(results.iter().map(|r| r.overall_score).collect());
    let per_model = models
        .iter()
        .map(|model| {
            let scores = results
                .iter()
                .filter(|r| &r.model == model)
                .map(|r| r.overall_score)
                .collect();
            (model.clone(), mean_of(scores))
        })
        .collect();
    let errors = results.iter().filter(|r| r.error.is_some()).count();
    (score, per_model, errors)
}

fn pointer_for(variant: &PromptVariant) -> BestPointer {
    BestPointer {
        key: format!("variant:{}:{}", variant.generation, variant.index),
        label: format!(
            "generation {} variant {}{}",
            variant.generation,
            variant.index,
            variant
                .origin_style
                .as_deref()
                .map(|s| format!(" ({s})"))
                .unwrap_or_default()
        ),
        score: variant.score,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{fill_population, select_parents, GeneratedVariant, PromptTuningRequest, PromptVariant, TuningMode};
    use crate::{
        error::EngineError,
        suite::{Suite, TestCase},
    };

    fn variant(generation: usize, index: usize, score: f64) -> PromptVariant {
        PromptVariant {
            text: format!("prompt {generation}.{index}"),
            generation,
            index,
            origin_style: None,
            score,
            per_model: BTreeMap::new(),
            errors: 0,
        }
    }

    #[test]
    fn selection_keeps_top_fraction_with_stable_ties() {
        let generation = vec![variant(1, 0, 0.5), variant(1, 1, 0.9), variant(1, 2, 0.5), variant(1, 3, 0.1)];
        let parents = select_parents(&generation, 0.5);
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0].index, 1);
        assert_eq!(parents[1].index, 0);

        assert_eq!(select_parents(&generation, 0.01).len(), 1);
    }

    #[test]
    fn population_is_padded_with_parents() {
        let parents = vec![variant(1, 1, 0.9)];
        let generated = vec![GeneratedVariant { text: "new".into(), style: None }];
        let population = fill_population(generated, 3, &parents, "base");
        assert_eq!(population.len(), 3);
        assert_eq!(population[1].text, "prompt 1.1");
        assert_eq!(population[2].style.as_deref(), Some("carried:1.1"));

        let too_many = (0..5)
            .map(|i| GeneratedVariant { text: format!("v{i}"), style: None })
            .collect();
        assert_eq!(fill_population(too_many, 2, &[], "base").len(), 2);
    }

    #[test]
    fn rejects_bad_settings() {
        let suite = Suite::new("s").with_case(TestCase::new("c", "p"));
        let mode = TuningMode::Evolutionary { generations: 2, selection_ratio: 0.0 };
        let request = PromptTuningRequest::new("s", vec!["m".into()], "Use tools.", 2, mode);
        assert!(matches!(request.validate(&suite), Err(EngineError::InvalidPromptSettings(_))));

        let request = PromptTuningRequest::new("s", vec!["m".into()], "Use tools.", 0, TuningMode::Quick);
        assert!(request.validate(&suite).is_err());

        let request = PromptTuningRequest::new("s", vec!["m".into(), "m".into()], "Use tools.", 2, TuningMode::Quick);
        assert!(matches!(request.validate(&suite), Err(EngineError::DuplicateId { what: "model", .. })));
    }
}
