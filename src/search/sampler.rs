use std::collections::HashSet;

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{int_slot, round_to, ParamKind, ParamSpec, SearchSpace};
use crate::params::{Combo, ParamValue};

const SAMPLE_ATTEMPTS_PER_COMBO: usize = 50;

/// Draws one value for `spec` uniformly from its declared range.
fn sample_value(spec: &ParamSpec, rng: &mut StdRng) -> ParamValue {
    match &spec.kind {
        ParamKind::Float { min, max, .. } => {
            let raw = if max > min { rng.gen_range(*min..=*max) } else { *min };
            ParamValue::Float(round_to(raw, spec.decimals()))
        }
        ParamKind::Int { min, step, .. } => {
            let slot = rng.gen_range(0..spec.cardinality());
            ParamValue::Int(int_slot(*min, *step, slot))
        }
        ParamKind::Enum { values } => values
            .choose(rng)
            .cloned()
            .unwrap_or(ParamValue::Text(String::new())),
    }
}

fn sample_combo(space: &SearchSpace, rng: &mut StdRng) -> Combo {
    let mut combo = Combo::new();
    for spec in space.enabled() {
        combo.insert(spec.name.clone(), sample_value(spec, rng));
    }
    combo
}

/// Independent uniform draws, without replacement by combo identity.
pub struct RandomSampler {
    space: SearchSpace,
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Up to `n` distinct combos. Fewer come back only when a discrete space runs out.
    pub fn sample(&mut self, n: usize) -> Vec<Combo> {
        let limit = if self.space.is_discrete() {
            n.min(self.space.grid_size().min(usize::MAX as u64) as usize)
        } else {
            n
        };

        let mut seen = HashSet::new();
        let mut combos = Vec::with_capacity(limit);
        let mut attempts = 0usize;
        let max_attempts = limit.saturating_mul(SAMPLE_ATTEMPTS_PER_COMBO).max(SAMPLE_ATTEMPTS_PER_COMBO);

        while combos.len() < limit && attempts < max_attempts {
            attempts += 1;
            let combo = sample_combo(&self.space, &mut self.rng);
            if seen.insert(combo.key()) {
                combos.push(combo);
            }
        }
        combos
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BayesianSettings {
    /// Random trials before the surrogate takes over.
    pub n_startup_trials: usize,
    /// Fraction of observations treated as "good" by the estimator.
    pub gamma: f64,
    /// Candidates drawn from the good density per proposal.
    pub n_candidates: usize,
    /// Trials without improvement before the search is declared converged; 0 disables.
    pub patience: usize,
    pub min_improvement: f64,
}

impl Default for BayesianSettings {
    fn default() -> Self {
        Self {
            n_startup_trials: 5,
            gamma: 0.25,
            n_candidates: 24,
            patience: 5,
            min_improvement: 1e-9,
        }
    }
}

#[derive(Debug, Clone)]
struct Observation {
    combo: Combo,
    score: f64,
}

/// Sequential model-based sampler using a tree-structured Parzen estimator.
///
/// Callers alternate [`propose`](Self::propose) and [`observe`](Self::observe); a proposal is
/// only made once the previous one has been observed.
pub struct BayesianSampler {
    space: SearchSpace,
    settings: BayesianSettings,
    n_trials: usize,
    rng: StdRng,
    observations: Vec<Observation>,
    tried: HashSet<String>,
    pending: Option<String>,
    best: Option<f64>,
    since_improvement: usize,
}

impl BayesianSampler {
    pub fn new(space: SearchSpace, n_trials: usize, seed: u64, settings: BayesianSettings) -> Self {
        Self {
            space,
            settings,
            n_trials,
            rng: StdRng::seed_from_u64(seed),
            observations: Vec::new(),
            tried: HashSet::new(),
            pending: None,
            best: None,
            since_improvement: 0,
        }
    }

    pub fn n_trials(&self) -> usize {
        self.n_trials
    }

    pub fn trials(&self) -> usize {
        self.observations.len()
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best
    }

    pub fn is_converged(&self) -> bool {
        self.settings.patience > 0 && self.since_improvement >= self.settings.patience
    }

    /// Next combo to evaluate, or `None` once the budget is spent, the search converged,
    /// or a discrete space has no untried combos left.
    pub fn propose(&mut self) -> Option<Combo> {
        if self.pending.is_some() || self.observations.len() >= self.n_trials || self.is_converged() {
            return None;
        }

        let combo = if self.observations.len() < self.settings.n_startup_trials.max(1) {
            self.random_untried()
        } else {
            self.surrogate_pick().or_else(|| self.random_untried())
        }?;

        let key = combo.key();
        self.tried.insert(key.clone());
        self.pending = Some(key);
        Some(combo)
    }

    pub fn observe(&mut self, combo: &Combo, score: f64) {
        if self.pending.as_deref() == Some(combo.key().as_str()) {
            self.pending = None;
        }
        self.tried.insert(combo.key());

        let improved = match self.best {
            None => true,
            Some(best) => score > best + self.settings.min_improvement,
        };
        if improved {
            self.best = Some(score);
            self.since_improvement = 0;
        } else {
            self.since_improvement += 1;
        }

        self.observations.push(Observation {
            combo: combo.clone(),
            score,
        });
    }

    fn random_untried(&mut self) -> Option<Combo> {
        if self.space.is_discrete() && self.tried.len() as u64 >= self.space.grid_size() {
            return None;
        }
        for _ in 0..SAMPLE_ATTEMPTS_PER_COMBO {
            let combo = sample_combo(&self.space, &mut self.rng);
            if !self.tried.contains(&combo.key()) {
                return Some(combo);
            }
        }
        None
    }

    fn surrogate_pick(&mut self) -> Option<Combo> {
        let mut ranked: Vec<&Observation> = self.observations.iter().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        let n_good = ((self.settings.gamma * ranked.len() as f64).ceil() as usize).clamp(1, ranked.len());
        let (good, bad) = ranked.split_at(n_good);
        let good: Vec<Observation> = good.iter().map(|o| (*o).clone()).collect();
        let bad: Vec<Observation> = bad.iter().map(|o| (*o).clone()).collect();

        let specs: Vec<ParamSpec> = self.space.enabled().cloned().collect();
        let mut best: Option<(f64, Combo)> = None;

        for _ in 0..self.settings.n_candidates.max(1) {
            let mut candidate = Combo::new();
            for spec in &specs {
                let value = self.sample_near(spec, &good);
                candidate.insert(spec.name.clone(), value);
            }
            if self.tried.contains(&candidate.key()) {
                continue;
            }

            let score: f64 = specs
                .iter()
                .map(|spec| {
                    let Some(value) = candidate.get(&spec.name) else {
                        return 0.0;
                    };
                    density(spec, value, &good).ln() - density(spec, value, &bad).ln()
                })
                .sum();

            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, candidate));
            }
        }

        best.map(|(_, combo)| combo)
    }

    fn sample_near(&mut self, spec: &ParamSpec, good: &[Observation]) -> ParamValue {
        let anchor = good
            .choose(&mut self.rng)
            .and_then(|o| o.combo.get(&spec.name))
            .cloned();
        let Some(anchor) = anchor else {
            return sample_value(spec, &mut self.rng);
        };

        match &spec.kind {
            ParamKind::Float { min, max, .. } => {
                let center = anchor.as_f64().unwrap_or(*min);
                let bw = bandwidth(*min, *max);
                let raw = (center + gaussian(&mut self.rng) * bw).clamp(*min, *max);
                ParamValue::Float(round_to(raw, spec.decimals()))
            }
            ParamKind::Int { min, max, step } => {
                let center = anchor.as_f64().unwrap_or(*min as f64);
                let bw = bandwidth(*min as f64, *max as f64).max(*step as f64);
                let raw = (center + gaussian(&mut self.rng) * bw).clamp(*min as f64, *max as f64);
                let slot = ((raw - *min as f64) / *step as f64).round().max(0.0) as u64;
                ParamValue::Int(int_slot(*min, *step, slot).min(*max))
            }
            ParamKind::Enum { .. } => {
                // mostly exploit the good categories, sometimes explore
                if self.rng.gen_bool(0.8) {
                    anchor
                } else {
                    sample_value(spec, &mut self.rng)
                }
            }
        }
    }
}

fn bandwidth(min: f64, max: f64) -> f64 {
    ((max - min) * 0.2).max(1e-6)
}

/// Standard normal draw via Box-Muller.
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Parzen density of `value` under `observations`, mixed with a uniform prior so it is never zero.
fn density(spec: &ParamSpec, value: &ParamValue, observations: &[Observation]) -> f64 {
    let points: Vec<&ParamValue> = observations
        .iter()
        .filter_map(|o| o.combo.get(&spec.name))
        .collect();
    let n = points.len() as f64;

    match &spec.kind {
        ParamKind::Enum { values } => {
            let k = values.len().max(1) as f64;
            let count = points.iter().filter(|p| **p == value).count() as f64;
            (count + 1.0) / (n + k)
        }
        ParamKind::Float { min, max, .. } => numeric_density(value, &points, *min, *max),
        ParamKind::Int { min, max, .. } => numeric_density(value, &points, *min as f64, *max as f64),
    }
}

fn numeric_density(value: &ParamValue, points: &[&ParamValue], min: f64, max: f64) -> f64 {
    let x = value.as_f64().unwrap_or(min);
    let range = max - min;
    let prior = if range > 0.0 { 1.0 / range } else { 1.0 };
    let bw = bandwidth(min, max);
    let norm = 1.0 / (bw * (2.0 * std::f64::consts::PI).sqrt());
    let kernel_sum: f64 = points
        .iter()
        .filter_map(|p| p.as_f64())
        .map(|p| {
            let z = (x - p) / bw;
            norm * (-0.5 * z * z).exp()
        })
        .sum();
    (kernel_sum + prior) / (points.len() as f64 + 1.0)
}

#[cfg(test)]
mod tests {
    use super::{BayesianSampler, BayesianSettings, RandomSampler};
    use crate::search::{ParamSpec, SearchSpace};

    fn space() -> SearchSpace {
        SearchSpace::new(vec![
            ParamSpec::float("temperature", 0.0, 1.0, 0.01),
            ParamSpec::choice("tool_choice", ["auto", "required"]),
        ])
    }

    #[test]
    fn random_samples_are_unique_and_in_range() {
        let mut sampler = RandomSampler::new(space(), 7);
        let combos = sampler.sample(20);
        assert_eq!(combos.len(), 20);

        let mut keys: Vec<String> = combos.iter().map(|c| c.key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 20);

        for combo in &combos {
            let t = combo.get("temperature").and_then(|v| v.as_f64()).unwrap();
            assert!((0.0..=1.0).contains(&t));
        }
    }

    #[test]
    fn random_sampling_stops_when_discrete_space_is_exhausted() {
        let space = SearchSpace::new(vec![ParamSpec::choice("tool_choice", ["auto", "required"])]);
        let combos = RandomSampler::new(space, 1).sample(10);
        assert_eq!(combos.len(), 2);
    }

    #[test]
    fn same_seed_same_sequence() {
        let a = RandomSampler::new(space(), 42).sample(5);
        let b = RandomSampler::new(space(), 42).sample(5);
        assert_eq!(a, b);
    }

    #[test]
    fn early_stop_triggers_after_patience_without_improvement() {
        let settings = BayesianSettings {
            patience: 3,
            ..BayesianSettings::default()
        };
        let mut sampler = BayesianSampler::new(space(), 30, 11, settings);

        let mut trial = 0usize;
        while let Some(combo) = sampler.propose() {
            // improves for the first five trials, then plateaus
            let score = trial.min(4) as f64 * 0.1;
            sampler.observe(&combo, score);
            trial += 1;
        }

        assert!(sampler.is_converged());
        assert_eq!(sampler.trials(), 8);
        assert!(sampler.trials() < sampler.n_trials());
    }

    #[test]
    fn strictly_improving_objective_uses_whole_budget() {
        let mut sampler = BayesianSampler::new(space(), 12, 3, BayesianSettings::default());
        let mut trial = 0usize;
        while let Some(combo) = sampler.propose() {
            sampler.observe(&combo, trial as f64);
            trial += 1;
        }
        assert_eq!(sampler.trials(), 12);
        assert!(!sampler.is_converged());
    }

    #[test]
    fn proposals_are_reproducible_for_a_seed() {
        let run = |seed| {
            let mut sampler = BayesianSampler::new(space(), 10, seed, BayesianSettings::default());
            let mut keys = Vec::new();
            while let Some(combo) = sampler.propose() {
                let t = combo.get("temperature").and_then(|v| v.as_f64()).unwrap_or(0.0);
                sampler.observe(&combo, 1.0 - (t - 0.3).abs());
                keys.push(combo.key());
            }
            keys
        };
        assert_eq!(run(5), run(5));
    }

    #[test]
    fn no_new_proposal_until_previous_is_observed() {
        let mut sampler = BayesianSampler::new(space(), 10, 1, BayesianSettings::default());
        let first = sampler.propose();
        assert!(first.is_some());
        assert!(sampler.propose().is_none());
    }
}
