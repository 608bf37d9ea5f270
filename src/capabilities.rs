//! Per-provider parameter support.
//!
//! Providers differ in which request parameters they accept and in what range. Instead of
//! discovering that at call time, the engine consults a [`CapabilityTable`] keyed by
//! `(provider, parameter)` before generating combos and before every invocation. Anything
//! the table changes is reported as an [`Adjustment`] next to the results; it never fails a run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    params::{ParamValue, RequestParams},
    search::{ParamKind, SearchSpace},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamTransform {
    Rename { to: String },
    Clamp { min: f64, max: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "support", rename_all = "snake_case")]
pub enum ParamSupport {
    Supported,
    Unsupported,
    Transform(ParamTransform),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    Drop { param: String },
    Clamp { param: String, original: f64, adjusted: f64 },
    Rename { from: String, to: String },
}

/// One entry of the table as it appears in engine config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRule {
    pub provider: String,
    pub param: String,
    #[serde(flatten)]
    pub support: ParamSupport,
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    rules: HashMap<(String, String), ParamSupport>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Known quirks of the common providers.
    pub fn builtin() -> Self {
        Self::new()
            .with_rule("anthropic", "temperature", ParamSupport::Transform(ParamTransform::Clamp { min: 0.0, max: 1.0 }))
            .with_rule("anthropic", "frequency_penalty", ParamSupport::Unsupported)
            .with_rule("anthropic", "presence_penalty", ParamSupport::Unsupported)
            .with_rule("anthropic", "seed", ParamSupport::Unsupported)
            .with_rule("google", "frequency_penalty", ParamSupport::Unsupported)
            .with_rule("google", "presence_penalty", ParamSupport::Unsupported)
            .with_rule(
                "google",
                "max_tokens",
                ParamSupport::Transform(ParamTransform::Rename { to: "max_output_tokens".into() }),
            )
            .with_rule("openai", "temperature", ParamSupport::Transform(ParamTransform::Clamp { min: 0.0, max: 2.0 }))
            .with_rule("openai", "top_k", ParamSupport::Unsupported)
            .with_rule("mistral", "seed", ParamSupport::Transform(ParamTransform::Rename { to: "random_seed".into() }))
    }

    pub fn with_rule(mut self, provider: &str, param: &str, support: ParamSupport) -> Self {
        self.insert(provider, param, support);
        self
    }

    pub fn insert(&mut self, provider: &str, param: &str, support: ParamSupport) {
        self.rules
            .insert((provider.to_ascii_lowercase(), param.to_string()), support);
    }

    pub fn extend<I>(&mut self, rules: I)
    where
        I: IntoIterator<Item = CapabilityRule>,
    {
        for rule in rules {
            self.insert(&rule.provider, &rule.param, rule.support);
        }
    }

    pub fn support(&self, provider: &str, param: &str) -> &ParamSupport {
        self.rules
            .get(&(provider.to_ascii_lowercase(), param.to_string()))
            .unwrap_or(&ParamSupport::Supported)
    }

    /// Provider key for a model id: the prefix before `/` (`anthropic/claude-3-5-sonnet`),
    /// otherwise `fallback` (usually the name of the provider serving the call).
    pub fn provider_for<'a>(model: &'a str, fallback: &'a str) -> &'a str {
        match model.split_once('/') {
            Some((prefix, _)) if !prefix.is_empty() => prefix,
            _ => fallback,
        }
    }

    /// Rewrites concrete params for `provider`, reporting every change.
    pub fn adapt(&self, provider: &str, params: &RequestParams) -> (RequestParams, Vec<Adjustment>) {
        let mut adapted = RequestParams::new();
        let mut adjustments = Vec::new();

        for (name, value) in params.iter() {
            match self.support(provider, name) {
                ParamSupport::Supported => adapted.insert(name.clone(), value.clone()),
                ParamSupport::Unsupported => adjustments.push(Adjustment::Drop { param: name.clone() }),
                ParamSupport::Transform(ParamTransform::Rename { to }) => {
                    adjustments.push(Adjustment::Rename {
                        from: name.clone(),
                        to: to.clone(),
                    });
                    adapted.insert(to.clone(), value.clone());
                }
                ParamSupport::Transform(ParamTransform::Clamp { min, max }) => {
                    match value.as_f64() {
                        Some(original) if original < *min || original > *max => {
                            let adjusted = original.clamp(*min, *max);
                            adjustments.push(Adjustment::Clamp {
                                param: name.clone(),
                                original,
                                adjusted,
                            });
                            adapted.insert(name.clone(), clamped_like(value, adjusted));
                        }
                        _ => adapted.insert(name.clone(), value.clone()),
                    }
                }
            }
        }

        (adapted, adjustments)
    }

    /// Range-level view of what [`adapt`](Self::adapt) will do for a whole search space,
    /// computed before any combo is generated.
    pub fn plan(&self, provider: &str, space: &SearchSpace) -> Vec<Adjustment> {
        let mut adjustments = Vec::new();
        for spec in space.enabled() {
            match self.support(provider, &spec.name) {
                ParamSupport::Supported => {}
                ParamSupport::Unsupported => adjustments.push(Adjustment::Drop {
                    param: spec.name.clone(),
                }),
                ParamSupport::Transform(ParamTransform::Rename { to }) => {
                    adjustments.push(Adjustment::Rename {
                        from: spec.name.clone(),
                        to: to.clone(),
                    })
                }
                ParamSupport::Transform(ParamTransform::Clamp { min, max }) => {
                    let (lo, hi) = match &spec.kind {
                        ParamKind::Float { min: lo, max: hi, .. } => (*lo, *hi),
                        ParamKind::Int { min: lo, max: hi, .. } => (*lo as f64, *hi as f64),
                        ParamKind::Enum { values } => {
                            let numbers: Vec<f64> = values.iter().filter_map(ParamValue::as_f64).collect();
                            if numbers.is_empty() {
                                continue;
                            }
                            (
                                numbers.iter().cloned().fold(f64::INFINITY, f64::min),
                                numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                            )
                        }
                    };
                    if lo < *min {
                        adjustments.push(Adjustment::Clamp {
                            param: spec.name.clone(),
                            original: lo,
                            adjusted: *min,
                        });
                    }
                    if hi > *max {
                        adjustments.push(Adjustment::Clamp {
                            param: spec.name.clone(),
                            original: hi,
                            adjusted: *max,
                        });
                    }
                }
            }
        }
        adjustments
    }
}

fn clamped_like(original: &ParamValue, adjusted: f64) -> ParamValue {
    match original {
        ParamValue::Int(_) => ParamValue::Int(adjusted.round() as i64),
        _ => ParamValue::Float(adjusted),
    }
}

/// Appends adjustments not already present.
pub fn merge_adjustments(into: &mut Vec<Adjustment>, more: impl IntoIterator<Item = Adjustment>) {
    for adjustment in more {
        if !into.contains(&adjustment) {
            into.push(adjustment);
        }
    }
}
