//! Scoring of one model's tool-call behaviour against one test case.
//!
//! Pure and synchronous: the runner collects the calls a model made (across every turn of a
//! multi-turn case) and hands them here together with the case.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    capabilities::Adjustment,
    suite::{ChainOrder, ExpectedTool, ScoringMode, TestCase},
};

const NUMBER_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub tool_selection: f64,
    pub param_accuracy: f64,
    /// Opt-in penalty for multi-turn chains longer than `optimal_hops`; 0 keeps hop count
    /// as metadata only.
    pub efficiency: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            tool_selection: 0.5,
            param_accuracy: 0.5,
            efficiency: 0.0,
        }
    }
}

impl ScoreWeights {
    fn normalized(self) -> Self {
        let sum = self.tool_selection + self.param_accuracy;
        if sum <= 0.0 {
            return Self {
                efficiency: self.efficiency.clamp(0.0, 1.0),
                ..Self::default()
            };
        }
        Self {
            tool_selection: self.tool_selection / sum,
            param_accuracy: self.param_accuracy / sum,
            efficiency: self.efficiency.clamp(0.0, 1.0),
        }
    }
}

/// One tool call observed while running a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub round: usize,
    pub name: String,
    pub arguments: Value,
    #[serde(default = "default_true")]
    pub schema_valid: bool,
}

fn default_true() -> bool {
    true
}

impl CallRecord {
    pub fn new(round: usize, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            round,
            name: name.into(),
            arguments,
            schema_valid: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopTrace {
    pub hop: usize,
    pub round: usize,
    pub tool: String,
    pub arguments: Value,
    /// Index of the chain step this call satisfied, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_step: Option<usize>,
    pub schema_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopEfficiency {
    pub optimal_hops: usize,
    pub actual_hops: usize,
    pub ratio: f64,
    pub inefficient: bool,
}

/// Verdict for one (test case, model, config) triple. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub case_id: String,
    pub model: String,
    /// Identity key of the request parameters used, when produced by a tuning run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    pub expected_tool: ExpectedTool,
    pub should_call_tool: bool,
    pub actual_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<HopTrace>,
    pub tool_selection_score: f64,
    pub param_accuracy_score: f64,
    pub overall_score: f64,
    pub hop_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficiency: Option<HopEfficiency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub param_mismatches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adjustments: Vec<Adjustment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub latency_ms: u64,
}

impl EvalResult {
    /// Identity of this result within a run.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.config.as_deref().unwrap_or("-"),
            self.model,
            self.case_id
        )
    }

    pub fn called_tool(&self) -> bool {
        !self.chain.is_empty()
    }

    pub fn is_abstention(&self) -> bool {
        !self.should_call_tool
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn with_adjustments(mut self, adjustments: Vec<Adjustment>) -> Self {
        self.adjustments = adjustments;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    weights: ScoreWeights,
    default_max_rounds: usize,
}

impl ScoringEngine {
    pub fn new(weights: ScoreWeights, default_max_rounds: usize) -> Self {
        Self {
            weights: weights.normalized(),
            default_max_rounds: default_max_rounds.max(1),
        }
    }

    pub fn max_rounds_for(&self, case: &TestCase) -> usize {
        if case.multi_turn {
            case.max_rounds.unwrap_or(self.default_max_rounds).max(1)
        } else {
            1
        }
    }

    pub fn score(&self, case: &TestCase, model: &str, calls: &[CallRecord]) -> EvalResult {
        let mut result = self.blank(case, model, calls);

        if !case.should_call_tool {
            let score = if calls.is_empty() { 1.0 } else { 0.0 };
            result.tool_selection_score = score;
            result.param_accuracy_score = score;
            result.overall_score = score;
            return result;
        }

        if case.multi_turn {
            self.score_chain(case, calls, &mut result);
        } else {
            self.score_single(case, calls, &mut result);
        }
        result
    }

    /// Zero-score result for a case whose invocation failed. Calls observed before the
    /// failure stay in the trace.
    pub fn failed(&self, case: &TestCase, model: &str, calls: &[CallRecord], error: impl Into<String>) -> EvalResult {
        let mut result = self.blank(case, model, calls);
        result.error = Some(error.into());
        result
    }

    fn blank(&self, case: &TestCase, model: &str, calls: &[CallRecord]) -> EvalResult {
        let cap = if case.multi_turn { self.max_rounds_for(case) } else { usize::MAX };
        EvalResult {
            case_id: case.id.clone(),
            model: model.to_string(),
            config: None,
            expected_tool: case.expected_tool.clone(),
            should_call_tool: case.should_call_tool,
            actual_tool: calls.first().map(|c| c.name.clone()),
            chain: calls
                .iter()
                .enumerate()
                .map(|(hop, call)| HopTrace {
                    hop,
                    round: call.round,
                    tool: call.name.clone(),
                    arguments: call.arguments.clone(),
                    matched_step: None,
                    schema_valid: call.schema_valid,
                })
                .collect(),
            tool_selection_score: 0.0,
            param_accuracy_score: 0.0,
            overall_score: 0.0,
            hop_count: calls.len().min(cap),
            efficiency: None,
            param_mismatches: Vec::new(),
            adjustments: Vec::new(),
            error: None,
            latency_ms: 0,
        }
    }

    fn score_single(&self, case: &TestCase, calls: &[CallRecord], result: &mut EvalResult) {
        let Some(actual) = calls.first() else {
            return;
        };

        let selected = if case.expected_tool.is_none() {
            true
        } else {
            case.expected_tool.matches(&actual.name)
        };
        if let Some(hop) = result.chain.first_mut() {
            hop.matched_step = selected.then_some(0);
        }
        result.tool_selection_score = if selected { 1.0 } else { 0.0 };

        // arguments of the wrong tool say nothing about parameter accuracy
        let (accuracy, mismatches) = if selected {
            param_accuracy(case.expected_params.as_ref(), &actual.arguments, case.scoring_mode)
        } else {
            (0.0, Vec::new())
        };
        result.param_accuracy_score = accuracy;
        result.param_mismatches = mismatches;

        result.overall_score = if case.has_expected_params() {
            self.weights.tool_selection * result.tool_selection_score
                + self.weights.param_accuracy * result.param_accuracy_score
        } else {
            result.tool_selection_score
        };
    }

    fn score_chain(&self, case: &TestCase, calls: &[CallRecord], result: &mut EvalResult) {
        let mut steps: Vec<ExpectedTool> = case
            .prerequisite_tools
            .iter()
            .map(|name| ExpectedTool::One(name.clone()))
            .collect();
        let has_target = !case.expected_tool.is_none();
        if has_target {
            steps.push(case.expected_tool.clone());
        }

        let satisfied = if steps.is_empty() {
            !calls.is_empty()
        } else {
            match case.chain_order {
                ChainOrder::Ordered => match_ordered(&steps, calls, &mut result.chain),
                ChainOrder::Any => match_any(&steps, calls, &mut result.chain),
            }
        };
        result.tool_selection_score = if satisfied { 1.0 } else { 0.0 };

        // the decisive call is the last call of the target tool
        let decisive = if has_target {
            calls.iter().rev().find(|c| case.expected_tool.matches(&c.name))
        } else {
            calls.last()
        };
        let (accuracy, mismatches) = match decisive {
            Some(call) => param_accuracy(case.expected_params.as_ref(), &call.arguments, case.scoring_mode),
            None => (0.0, Vec::new()),
        };
        result.param_accuracy_score = accuracy;
        result.param_mismatches = mismatches;

        let mut overall = if case.has_expected_params() {
            result.tool_selection_score * result.param_accuracy_score
        } else {
            result.tool_selection_score
        };

        if let Some(optimal) = case.optimal_hops.filter(|o| *o > 0) {
            if result.hop_count > 0 {
                let ratio = (optimal as f64 / result.hop_count as f64).min(1.0);
                result.efficiency = Some(HopEfficiency {
                    optimal_hops: optimal,
                    actual_hops: result.hop_count,
                    ratio,
                    inefficient: result.hop_count > optimal,
                });
                if self.weights.efficiency > 0.0 {
                    overall *= (1.0 - self.weights.efficiency) + self.weights.efficiency * ratio;
                }
            }
        }
        result.overall_score = overall;
    }
}

fn match_ordered(steps: &[ExpectedTool], calls: &[CallRecord], chain: &mut [HopTrace]) -> bool {
    let mut cursor = 0usize;
    for (step_index, step) in steps.iter().enumerate() {
        let mut found = false;
        while cursor < calls.len() {
            let index = cursor;
            cursor += 1;
            if step.matches(&calls[index].name) {
                if let Some(hop) = chain.get_mut(index) {
                    hop.matched_step = Some(step_index);
                }
                found = true;
                break;
            }
        }
        if !found {
            return false;
        }
    }
    true
}

fn match_any(steps: &[ExpectedTool], calls: &[CallRecord], chain: &mut [HopTrace]) -> bool {
    let mut all = true;
    for (step_index, step) in steps.iter().enumerate() {
        match calls.iter().position(|c| step.matches(&c.name)) {
            Some(index) => {
                if let Some(hop) = chain.get_mut(index) {
                    hop.matched_step.get_or_insert(step_index);
                }
            }
            None => all = false,
        }
    }
    all
}

/// Fraction of expected keys whose actual value matches, plus a description of each mismatch.
/// No expected params means full marks.
pub fn param_accuracy(
    expected: Option<&Map<String, Value>>,
    actual: &Value,
    mode: ScoringMode,
) -> (f64, Vec<String>) {
    let Some(expected) = expected.filter(|e| !e.is_empty()) else {
        return (1.0, Vec::new());
    };
    let empty = Map::new();
    let actual = actual.as_object().unwrap_or(&empty);

    let mut correct = 0usize;
    let mut mismatches = Vec::new();
    for (key, expected_value) in expected {
        let matched = match (actual.get(key), mode) {
            (None, _) => false,
            (Some(actual_value), ScoringMode::Exact) => values_equal(expected_value, actual_value),
            (Some(actual_value), ScoringMode::Subset) => value_matches_subset(expected_value, actual_value),
        };
        if matched {
            correct += 1;
        } else {
            match actual.get(key) {
                Some(actual_value) => mismatches.push(format!("{key}: expected {expected_value}, got {actual_value}")),
                None => mismatches.push(format!("{key}: missing")),
            }
        }
    }

    (correct as f64 / expected.len() as f64, mismatches)
}

/// Deep equality where `1` and `1.0` are the same number.
pub fn values_equal(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() <= NUMBER_TOLERANCE,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|bv| values_equal(v, bv)))
        }
        _ => expected == actual,
    }
}

/// Lenient comparison for partially deterministic arguments: `null` accepts any value,
/// objects match when the expected keys match, arrays when every expected element appears,
/// strings ignore case and surrounding whitespace.
pub fn value_matches_subset(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Null, _) => true,
        (Value::Object(expected), Value::Object(actual)) => expected
            .iter()
            .all(|(k, v)| actual.get(k).is_some_and(|av| value_matches_subset(v, av))),
        (Value::Array(expected), Value::Array(actual)) => expected
            .iter()
            .all(|e| actual.iter().any(|a| value_matches_subset(e, a))),
        (Value::String(a), Value::String(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        _ => values_equal(expected, actual),
    }
}
