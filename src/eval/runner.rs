use std::{sync::Arc, time::Instant};

use futures_util::{stream::FuturesUnordered, StreamExt};
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{
    capabilities::{merge_adjustments, Adjustment},
    functions::Tool,
    invocation::{InvocationAdapter, InvocationRequest, ToolSchemas},
    params::RequestParams,
    scoring::{CallRecord, EvalResult, ScoringEngine},
    suite::{Suite, TestCase},
    types::ChatMessage,
};

/// A suite with its tool list and schemas prepared once per run.
pub struct PreparedSuite {
    pub suite: Suite,
    tools: Vec<Tool>,
    schemas: ToolSchemas,
}

impl PreparedSuite {
    pub fn new(suite: Suite) -> Self {
        let tools = suite.tools();
        let schemas = ToolSchemas::compile(&tools);
        Self { suite, tools, schemas }
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.suite.test_cases
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    fn mock_response(&self, tool: &str) -> String {
        let value = match self.suite.tool(tool) {
            Some(spec) => spec.mock_response.clone().unwrap_or_else(|| json!({ "status": "ok" })),
            None => json!({ "error": format!("unknown tool: {tool}") }),
        };
        value.to_string()
    }
}

/// How the target model is invoked: the system prompt and request parameters under test.
#[derive(Debug, Clone, Default)]
pub struct InvocationSetup {
    pub system_prompt: String,
    pub params: RequestParams,
}

impl InvocationSetup {
    pub fn new(system_prompt: impl Into<String>, params: RequestParams) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            params,
        }
    }
}

/// Runs test cases against models and scores them. One failing case never affects another.
pub struct EvalRunner {
    adapter: Arc<dyn InvocationAdapter>,
    scoring: ScoringEngine,
    model_concurrency: usize,
}

impl EvalRunner {
    pub fn new(adapter: Arc<dyn InvocationAdapter>, scoring: ScoringEngine) -> Self {
        Self {
            adapter,
            scoring,
            model_concurrency: 4,
        }
    }

    pub fn with_model_concurrency(mut self, concurrency: usize) -> Self {
        self.model_concurrency = concurrency.max(1);
        self
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.scoring
    }

    pub async fn run_case(
        &self,
        suite: &PreparedSuite,
        case: &TestCase,
        model: &str,
        setup: &InvocationSetup,
    ) -> EvalResult {
        let started = Instant::now();
        let max_rounds = self.scoring.max_rounds_for(case);
        let mut conversation = vec![ChatMessage::user(case.prompt.clone())];
        let mut calls: Vec<CallRecord> = Vec::new();
        let mut adjustments: Vec<Adjustment> = Vec::new();

        for round in 0..max_rounds {
            let request = InvocationRequest {
                model: model.to_string(),
                system_prompt: setup.system_prompt.clone(),
                params: setup.params.clone(),
                conversation: conversation.clone(),
                tools: suite.tools.clone(),
            };

            let invocation = match self.adapter.invoke(request).await {
                Ok(invocation) => invocation,
                Err(err) => {
                    warn!(model, case_id = %case.id, round, error = %err, "invocation failed");
                    return self
                        .scoring
                        .failed(case, model, &calls, err.to_string())
                        .with_adjustments(adjustments)
                        .with_latency_ms(elapsed_ms(started));
                }
            };
            merge_adjustments(&mut adjustments, invocation.adjustments.iter().cloned());

            if invocation.tool_calls().is_empty() {
                break;
            }

            for call in invocation.tool_calls() {
                let arguments = call.function.arguments.clone();
                let schema_valid = suite.schemas.is_valid(&call.function.name, &arguments);
                if !schema_valid {
                    debug!(model, case_id = %case.id, tool = %call.function.name, "arguments do not match tool schema");
                }
                calls.push(CallRecord {
                    round,
                    name: call.function.name.clone(),
                    arguments,
                    schema_valid,
                });
            }

            if !case.multi_turn {
                break;
            }

            conversation.push(ChatMessage::assistant_tool_calls(invocation.tool_calls().to_vec()));
            for (i, call) in invocation.tool_calls().iter().enumerate() {
                let id = call.id.clone().unwrap_or_else(|| format!("call_{round}_{i}"));
                conversation.push(ChatMessage::tool(id, suite.mock_response(&call.function.name)));
            }
        }

        let result = self
            .scoring
            .score(case, model, &calls)
            .with_adjustments(adjustments)
            .with_latency_ms(elapsed_ms(started));
        debug!(
            model,
            case_id = %case.id,
            overall = result.overall_score,
            hops = result.hop_count,
            "case scored"
        );
        result
    }

    /// One case against every model, concurrently up to the configured limit. Results come
    /// back in the order of `models`.
    pub async fn run_case_across(
        &self,
        suite: &PreparedSuite,
        case: &TestCase,
        models: &[String],
        setup: &InvocationSetup,
    ) -> Vec<EvalResult> {
        let limit = Semaphore::new(self.model_concurrency);
        let mut futures = FuturesUnordered::new();
        for (index, model) in models.iter().enumerate() {
            let limit = &limit;
            futures.push(async move {
                let _permit = limit.acquire().await;
                (index, self.run_case(suite, case, model, setup).await)
            });
        }

        let mut results = Vec::with_capacity(models.len());
        while let Some(result) = futures.next().await {
            results.push(result);
        }
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Every case against every model; case-major order.
    pub async fn run_suite(&self, suite: &PreparedSuite, models: &[String], setup: &InvocationSetup) -> Vec<EvalResult> {
        let mut results = Vec::with_capacity(suite.cases().len() * models.len());
        for case in suite.cases() {
            results.extend(self.run_case_across(suite, case, models, setup).await);
        }
        results
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{EvalRunner, InvocationSetup, PreparedSuite};
    use crate::{
        invocation::ProviderAdapter,
        providers::scripted::{user_prompt_of, ScriptedProvider},
        scoring::{ScoreWeights, ScoringEngine},
        suite::{Suite, TestCase, ToolSpec},
        types::MessageRole,
        LLMError,
    };

    fn runner(provider: ScriptedProvider) -> EvalRunner {
        EvalRunner::new(
            Arc::new(ProviderAdapter::new(Arc::new(provider))),
            ScoringEngine::new(ScoreWeights::default(), 5),
        )
    }

    #[tokio::test]
    async fn multi_turn_feeds_mock_results_back() {
        let suite = Suite::new("mail")
            .with_tool(ToolSpec::new("lookup_contact"))
            .with_tool(ToolSpec::new("send_email"))
            .with_case(
                TestCase::new("mail-ana", "email Ana")
                    .expecting("send_email")
                    .with_params(json!({ "to": "ana@example.com" }))
                    .multi_turn(3, vec!["lookup_contact".into()]),
            );
        let provider = ScriptedProvider::with_responder(|req| {
            let tool_results = req.messages.iter().filter(|m| m.role == MessageRole::Tool).count();
            Ok(match tool_results {
                0 => ScriptedProvider::tool_call("lookup_contact", json!({ "name": "Ana" })),
                1 => ScriptedProvider::tool_call("send_email", json!({ "to": "ana@example.com" })),
                _ => ScriptedProvider::text("done"),
            })
        });

        let suite = PreparedSuite::new(suite);
        let result = runner(provider)
            .run_case(&suite, &suite.cases()[0], "gpt-4o", &InvocationSetup::default())
            .await;

        assert_eq!(result.overall_score, 1.0);
        assert_eq!(result.hop_count, 2);
        assert_eq!(result.chain[1].round, 1);
    }

    #[tokio::test]
    async fn parallel_calls_in_one_turn_leave_room_for_the_next() {
        let suite = Suite::new("chain")
            .with_tool(ToolSpec::new("a"))
            .with_tool(ToolSpec::new("b"))
            .with_tool(ToolSpec::new("c"))
            .with_case(
                TestCase::new("abc", "do it")
                    .expecting("c")
                    .multi_turn(2, vec!["a".into(), "b".into()]),
            );
        let provider = ScriptedProvider::with_responder(|req| {
            if req.messages.iter().any(|m| m.role == MessageRole::Tool) {
                Ok(ScriptedProvider::tool_call("c", json!({})))
            } else {
                Ok(ScriptedProvider::tool_calls(vec![("a", json!({})), ("b", json!({}))]))
            }
        });

        let suite = PreparedSuite::new(suite);
        let result = runner(provider)
            .run_case(&suite, &suite.cases()[0], "m", &InvocationSetup::default())
            .await;

        assert_eq!(result.overall_score, 1.0);
        let rounds: Vec<usize> = result.chain.iter().map(|hop| hop.round).collect();
        assert_eq!(rounds, vec![0, 0, 1]);
        assert_eq!(result.hop_count, 2);
    }

    #[tokio::test]
    async fn provider_errors_are_isolated_per_case() {
        let suite = Suite::new("s")
            .with_tool(ToolSpec::new("get_weather"))
            .with_case(TestCase::new("fails", "boom").expecting("get_weather"))
            .with_case(TestCase::new("works", "weather?").expecting("get_weather"));
        let provider = ScriptedProvider::with_responder(|req| {
            if user_prompt_of(req) == "boom" {
                Err(LLMError::InvalidResponse("malformed tool call"))
            } else {
                Ok(ScriptedProvider::tool_call("get_weather", json!({})))
            }
        });

        let suite = PreparedSuite::new(suite);
        let results = runner(provider)
            .run_suite(&suite, &["m".to_string()], &InvocationSetup::default())
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].overall_score, 0.0);
        assert!(results[0].error.is_some());
        assert_eq!(results[1].overall_score, 1.0);
    }

    #[tokio::test]
    async fn results_follow_model_order() {
        let suite = Suite::new("s")
            .with_tool(ToolSpec::new("get_weather"))
            .with_case(TestCase::new("c", "weather?").expecting("get_weather"));
        let provider = ScriptedProvider::with_responder(|req| {
            if req.model == "good" {
                Ok(ScriptedProvider::tool_call("get_weather", json!({})))
            } else {
                Ok(ScriptedProvider::text("no idea"))
            }
        });

        let suite = PreparedSuite::new(suite);
        let models = vec!["bad".to_string(), "good".to_string()];
        let results = runner(provider)
            .run_case_across(&suite, &suite.cases()[0], &models, &InvocationSetup::default())
            .await;

        assert_eq!(results[0].model, "bad");
        assert_eq!(results[0].overall_score, 0.0);
        assert_eq!(results[1].overall_score, 1.0);
    }
}
