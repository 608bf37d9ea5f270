//! Search-space construction for parameter tuning.
//!
//! A [`SearchSpace`] is the declared list of tunable parameters. It validates itself, reports
//! its combinatorial size up front, and either enumerates the full grid in a deterministic
//! order or hands out values to the samplers in [`sampler`].

use std::{collections::HashSet, fmt};

use serde::{
    de::{MapAccess, SeqAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};

use crate::{
    error::EngineError,
    params::{Combo, ParamValue},
};

pub mod sampler;

pub use sampler::{BayesianSampler, BayesianSettings, RandomSampler};

const ROUNDING_TOLERANCE: f64 = 1e-9;
const MAX_DECIMALS: i32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    Float { min: f64, max: f64, step: f64 },
    Int { min: i64, max: i64, #[serde(default = "default_int_step")] step: i64 },
    Enum { values: Vec<ParamValue> },
}

fn default_int_step() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: ParamKind,
}

fn default_enabled() -> bool {
    true
}

impl ParamSpec {
    pub fn float(name: impl Into<String>, min: f64, max: f64, step: f64) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            kind: ParamKind::Float { min, max, step },
        }
    }

    pub fn int(name: impl Into<String>, min: i64, max: i64, step: i64) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            kind: ParamKind::Int { min, max, step },
        }
    }

    pub fn choice<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParamValue>,
    {
        Self {
            name: name.into(),
            enabled: true,
            kind: ParamKind::Enum {
                values: values.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn invalid(&self, reason: impl Into<String>) -> EngineError {
        EngineError::InvalidParameter {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        match &self.kind {
            ParamKind::Float { min, max, step } => {
                if !min.is_finite() || !max.is_finite() || !step.is_finite() {
                    return Err(self.invalid("bounds and step must be finite"));
                }
                if min > max {
                    return Err(self.invalid(format!("min {min} is greater than max {max}")));
                }
                if *step <= 0.0 {
                    return Err(self.invalid("step must be positive"));
                }
            }
            ParamKind::Int { min, max, step } => {
                if min > max {
                    return Err(self.invalid(format!("min {min} is greater than max {max}")));
                }
                if *step <= 0 {
                    return Err(self.invalid("step must be positive"));
                }
            }
            ParamKind::Enum { values } => {
                if values.is_empty() {
                    return Err(self.invalid("enum parameter needs at least one value"));
                }
            }
        }
        if self.checked_cardinality().is_none() {
            return Err(self.invalid("range has too many grid values for its step"));
        }
        Ok(())
    }

    /// Number of distinct grid values, or `None` when it does not fit in a `u64`.
    pub fn checked_cardinality(&self) -> Option<u64> {
        match &self.kind {
            ParamKind::Float { min, max, step } => {
                let steps = ((max - min) / step + ROUNDING_TOLERANCE).floor();
                if !steps.is_finite() || steps < 0.0 || steps >= u64::MAX as f64 {
                    return None;
                }
                (steps as u64).checked_add(1)
            }
            ParamKind::Int { min, max, step } => {
                let steps = (i128::from(*max) - i128::from(*min)) / i128::from(*step);
                u64::try_from(steps).ok()?.checked_add(1)
            }
            ParamKind::Enum { values } => Some(values.len() as u64),
        }
    }

    /// Number of distinct grid values, saturating at `u64::MAX`.
    pub fn cardinality(&self) -> u64 {
        self.checked_cardinality().unwrap_or(u64::MAX)
    }

    /// Grid values from `min` to `max` inclusive, rounded to the precision of the bounds and step.
    pub fn grid_values(&self) -> Vec<ParamValue> {
        match &self.kind {
            ParamKind::Float { min, step, .. } => {
                let decimals = self.decimals();
                (0..self.cardinality())
                    .map(|i| ParamValue::Float(round_to(min + i as f64 * step, decimals)))
                    .collect()
            }
            ParamKind::Int { min, step, .. } => (0..self.cardinality())
                .map(|i| ParamValue::Int(int_slot(*min, *step, i)))
                .collect(),
            ParamKind::Enum { values } => values.clone(),
        }
    }

    /// Decimal places needed to express the bounds and step exactly.
    pub(crate) fn decimals(&self) -> i32 {
        match &self.kind {
            ParamKind::Float { min, max, step } => decimals_of(*step).max(decimals_of(*min)).max(decimals_of(*max)),
            _ => 0,
        }
    }
}

/// `min + slot * step`, for a slot below the parameter's cardinality.
pub(crate) fn int_slot(min: i64, step: i64, slot: u64) -> i64 {
    let value = i128::from(min) + i128::from(slot) * i128::from(step);
    value.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

pub(crate) fn decimals_of(value: f64) -> i32 {
    (0..MAX_DECIMALS)
        .find(|d| {
            let scaled = value * 10f64.powi(*d);
            (scaled - scaled.round()).abs() < ROUNDING_TOLERANCE * 10f64.powi(*d).max(1.0)
        })
        .unwrap_or(MAX_DECIMALS)
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Declared tunable parameters, in declaration order.
///
/// Deserializes from either a list of specs or a map of `name -> spec`; both keep document order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SearchSpace {
    params: Vec<ParamSpec>,
}

impl SearchSpace {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| p.enabled)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for spec in &self.params {
            if !seen.insert(spec.name.as_str()) {
                return Err(spec.invalid("declared more than once"));
            }
            if spec.enabled {
                spec.validate()?;
            }
        }
        if self.enabled().next().is_none() {
            return Err(EngineError::NoEnabledParameters);
        }
        Ok(())
    }

    /// Product of every enabled parameter's cardinality, saturating at `u64::MAX`.
    pub fn grid_size(&self) -> u64 {
        self.enabled()
            .map(ParamSpec::cardinality)
            .fold(1u64, |acc, n| acc.saturating_mul(n))
    }

    /// Full cartesian product. The first declared parameter varies slowest, so identical
    /// input always yields the identical combo order.
    pub fn grid(&self) -> Vec<Combo> {
        let mut combos = vec![Combo::new()];
        for spec in self.enabled() {
            let values = spec.grid_values();
            combos = combos
                .into_iter()
                .flat_map(|combo| {
                    values
                        .iter()
                        .map(move |value| combo.clone().with(spec.name.clone(), value.clone()))
                })
                .collect();
        }
        combos
    }

    /// True when every enabled parameter has finitely many distinct values under sampling.
    pub(crate) fn is_discrete(&self) -> bool {
        self.enabled().all(|p| !matches!(p.kind, ParamKind::Float { .. }))
    }
}

impl<'de> Deserialize<'de> for SearchSpace {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct SpecBody {
            #[serde(default = "default_enabled")]
            enabled: bool,
            #[serde(flatten)]
            kind: ParamKind,
        }

        struct SpaceVisitor;

        impl<'de> Visitor<'de> for SpaceVisitor {
            type Value = SearchSpace;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a list of parameter specs or a map of name to spec")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut params = Vec::new();
                while let Some(spec) = seq.next_element::<ParamSpec>()? {
                    params.push(spec);
                }
                Ok(SearchSpace { params })
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut params = Vec::new();
                while let Some((name, body)) = map.next_entry::<String, SpecBody>()? {
                    params.push(ParamSpec {
                        name,
                        enabled: body.enabled,
                        kind: body.kind,
                    });
                }
                Ok(SearchSpace { params })
            }
        }

        deserializer.deserialize_any(SpaceVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::{ParamSpec, SearchSpace};
    use crate::{error::EngineError, params::ParamValue};

    #[test]
    fn single_float_parameter_yields_two_combos() {
        let space = SearchSpace::new(vec![ParamSpec::float("temperature", 0.5, 1.0, 0.5)]);
        assert_eq!(space.grid_size(), 2);

        let first = space.grid();
        let second = space.grid();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(first[0].get("temperature"), Some(&ParamValue::Float(0.5)));
        assert_eq!(first[1].get("temperature"), Some(&ParamValue::Float(1.0)));
    }

    #[test]
    fn float_steps_do_not_drift() {
        let spec = ParamSpec::float("top_p", 0.1, 0.3, 0.1);
        let values = spec.grid_values();
        assert_eq!(values.len(), 3);
        assert!(matches!(values[2], ParamValue::Float(v) if v == 0.3));
    }

    #[test]
    fn grid_order_is_lexicographic_by_declaration() {
        let space = SearchSpace::new(vec![
            ParamSpec::float("temperature", 0.0, 1.0, 1.0),
            ParamSpec::choice("tool_choice", ["auto", "required"]),
            ParamSpec::int("max_tokens", 64, 128, 64).disabled(),
        ]);
        let keys: Vec<String> = space.grid().iter().map(|c| c.key()).collect();
        assert_eq!(
            keys,
            vec![
                "temperature=0.0,tool_choice=auto",
                "temperature=0.0,tool_choice=required",
                "temperature=1.0,tool_choice=auto",
                "temperature=1.0,tool_choice=required",
            ]
        );
        assert_eq!(space.grid_size(), 4);
    }

    #[test]
    fn rejects_invalid_ranges_and_empty_spaces() {
        let space = SearchSpace::new(vec![ParamSpec::float("temperature", 1.0, 0.5, 0.1)]);
        assert!(matches!(space.validate(), Err(EngineError::InvalidParameter { .. })));

        let space = SearchSpace::new(vec![ParamSpec::float("temperature", 0.0, 1.0, 0.1).disabled()]);
        assert!(matches!(space.validate(), Err(EngineError::NoEnabledParameters)));

        let space = SearchSpace::new(vec![ParamSpec::choice::<_, &str>("tool_choice", [])]);
        assert!(space.validate().is_err());
    }

    #[test]
    fn ranges_too_wide_to_count_are_rejected() {
        let seed = ParamSpec::int("seed", i64::MIN, i64::MAX, 1);
        assert_eq!(seed.checked_cardinality(), None);
        assert_eq!(seed.cardinality(), u64::MAX);
        assert!(matches!(seed.validate(), Err(EngineError::InvalidParameter { .. })));

        let temperature = ParamSpec::float("temperature", 0.0, 2.0, 1e-300);
        assert_eq!(temperature.checked_cardinality(), None);
        assert!(temperature.validate().is_err());

        let wide = ParamSpec::int("seed", 0, i64::MAX, 1);
        assert_eq!(wide.checked_cardinality(), Some(i64::MAX as u64 + 1));
        assert!(wide.validate().is_ok());
    }

    #[test]
    fn deserializes_map_form_in_document_order() {
        let space: SearchSpace = serde_yaml::from_str(
            r#"
temperature: { type: float, min: 0.0, max: 1.0, step: 0.5 }
tool_choice: { type: enum, values: [auto, required] }
seed: { type: int, min: 1, max: 3, enabled: false }
"#,
        )
        .unwrap();
        let names: Vec<&str> = space.params().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["temperature", "tool_choice", "seed"]);
        assert_eq!(space.grid_size(), 6);
    }
}
