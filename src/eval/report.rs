use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::scoring::EvalResult;

/// Aggregate figures over a set of [`EvalResult`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalStats {
    pub total: usize,
    /// Share of tool-expecting cases where the right tool (or chain) was selected.
    pub tool_selection_rate: f64,
    pub mean_param_accuracy: f64,
    pub mean_overall: f64,
    pub abstention_cases: usize,
    /// Share of abstention cases where a tool was called anyway.
    pub irrelevant_call_rate: f64,
    pub errors: usize,
    pub inefficient_chains: usize,
    pub schema_violations: usize,
}

impl EvalStats {
    pub fn from_results<'a, I>(results: I) -> Self
    where
        I: IntoIterator<Item = &'a EvalResult>,
    {
        let mut stats = Self::default();
        let mut selection_cases = 0usize;
        let mut selected = 0.0;
        let mut param_sum = 0.0;
        let mut overall_sum = 0.0;
        let mut irrelevant_calls = 0usize;

        for result in results {
            stats.total += 1;
            overall_sum += result.overall_score;
            if result.error.is_some() {
                stats.errors += 1;
            }
            if result.efficiency.as_ref().is_some_and(|e| e.inefficient) {
                stats.inefficient_chains += 1;
            }
            stats.schema_violations += result.chain.iter().filter(|h| !h.schema_valid).count();

            if result.is_abstention() {
                stats.abstention_cases += 1;
                if result.called_tool() {
                    irrelevant_calls += 1;
                }
            } else {
                selection_cases += 1;
                selected += result.tool_selection_score;
                param_sum += result.param_accuracy_score;
            }
        }

        if stats.total > 0 {
            stats.mean_overall = overall_sum / stats.total as f64;
        }
        if selection_cases > 0 {
            stats.tool_selection_rate = selected / selection_cases as f64;
            stats.mean_param_accuracy = param_sum / selection_cases as f64;
        }
        if stats.abstention_cases > 0 {
            stats.irrelevant_call_rate = irrelevant_calls as f64 / stats.abstention_cases as f64;
        }
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    #[serde(flatten)]
    pub overall: EvalStats,
    pub per_model: BTreeMap<String, EvalStats>,
    /// Cases that failed with an error, as `model/case_id: error`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl EvalSummary {
    pub fn from_results(results: &[EvalResult]) -> Self {
        let mut by_model: BTreeMap<String, Vec<&EvalResult>> = BTreeMap::new();
        for result in results {
            by_model.entry(result.model.clone()).or_default().push(result);
        }

        Self {
            overall: EvalStats::from_results(results),
            per_model: by_model
                .into_iter()
                .map(|(model, results)| (model, EvalStats::from_results(results)))
                .collect(),
            failures: results
                .iter()
                .filter_map(|r| {
                    r.error
                        .as_ref()
                        .map(|e| format!("{}/{}: {}", r.model, r.case_id, e))
                })
                .collect(),
        }
    }

    pub fn print(&self) {
        println!(
            "cases: {}  selection: {:.1}%  params: {:.1}%  overall: {:.3}  irrelevant calls: {:.1}%  errors: {}",
            self.overall.total,
            self.overall.tool_selection_rate * 100.0,
            self.overall.mean_param_accuracy * 100.0,
            self.overall.mean_overall,
            self.overall.irrelevant_call_rate * 100.0,
            self.overall.errors,
        );
        for (model, stats) in &self.per_model {
            println!(
                "  {model}: selection {:.1}%  params {:.1}%  overall {:.3}  irrelevant {:.1}%  inefficient {}",
                stats.tool_selection_rate * 100.0,
                stats.mean_param_accuracy * 100.0,
                stats.mean_overall,
                stats.irrelevant_call_rate * 100.0,
                stats.inefficient_chains,
            );
        }
        for failure in &self.failures {
            println!("  failed {failure}");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::EvalSummary;
    use crate::{
        scoring::{CallRecord, ScoringEngine},
        suite::TestCase,
    };

    #[test]
    fn counts_irrelevant_calls_only_on_abstention_cases() {
        let engine = ScoringEngine::default();
        let weather = TestCase::new("paris", "weather in Paris?").expecting("get_weather");
        let joke = TestCase::abstention("joke", "tell me a joke");

        let results = vec![
            engine.score(&weather, "a", &[CallRecord::new(0, "get_weather", json!({}))]),
            engine.score(&joke, "a", &[]),
            engine.score(&weather, "b", &[]),
            engine.score(&joke, "b", &[CallRecord::new(0, "get_weather", json!({}))]),
        ];
        let summary = EvalSummary::from_results(&results);

        assert_eq!(summary.overall.total, 4);
        assert_eq!(summary.overall.tool_selection_rate, 0.5);
        assert_eq!(summary.overall.irrelevant_call_rate, 0.5);
        assert_eq!(summary.per_model["a"].irrelevant_call_rate, 0.0);
        assert_eq!(summary.per_model["a"].mean_overall, 1.0);
        assert_eq!(summary.per_model["b"].mean_overall, 0.0);
    }
}
