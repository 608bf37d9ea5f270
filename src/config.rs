use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    capabilities::{CapabilityRule, CapabilityTable},
    error::EngineError,
    scoring::ScoreWeights,
    search::BayesianSettings,
};

/// Engine-wide settings. Every field has a default, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Turn limit for multi-turn cases that do not set `max_rounds`.
    pub default_max_rounds: usize,
    pub invocation_timeout_secs: u64,
    /// Models evaluated in parallel for one case.
    pub model_concurrency: usize,
    pub max_grid_combos: u64,
    pub score_weights: ScoreWeights,
    pub bayesian: BayesianSettings,
    /// Buffered live events per subscriber before it has to catch up from the log.
    pub event_capacity: usize,
    /// Rules layered over the built-in capability table.
    pub capabilities: Vec<CapabilityRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_rounds: 5,
            invocation_timeout_secs: 60,
            model_concurrency: 4,
            max_grid_combos: 10_000,
            score_weights: ScoreWeights::default(),
            bayesian: BayesianSettings::default(),
            event_capacity: 256,
            capabilities: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, EngineError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Loads YAML, or JSON for `.json` files.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            Ok(serde_json::from_str(&raw)?)
        } else {
            Self::from_yaml_str(&raw)
        }
    }

    /// Applies `TOOLWERK_*` environment variables. Unparseable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = parsed(&lookup, "TOOLWERK_MAX_ROUNDS") {
            self.default_max_rounds = v;
        }
        if let Some(v) = parsed(&lookup, "TOOLWERK_TIMEOUT_SECS") {
            self.invocation_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "TOOLWERK_MODEL_CONCURRENCY") {
            self.model_concurrency = v;
        }
        if let Some(v) = parsed(&lookup, "TOOLWERK_MAX_GRID_COMBOS") {
            self.max_grid_combos = v;
        }
        if let Some(v) = parsed(&lookup, "TOOLWERK_EFFICIENCY_WEIGHT") {
            self.score_weights.efficiency = v;
        }
        if let Some(v) = parsed(&lookup, "TOOLWERK_BAYES_PATIENCE") {
            self.bayesian.patience = v;
        }
        if let Some(v) = parsed(&lookup, "TOOLWERK_EVENT_CAPACITY") {
            self.event_capacity = v;
        }
        self
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs.max(1))
    }

    /// Built-in capability table with this config's rules applied on top.
    pub fn capability_table(&self) -> CapabilityTable {
        let mut table = CapabilityTable::builtin();
        table.extend(self.capabilities.iter().cloned());
        table
    }
}
