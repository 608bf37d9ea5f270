use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use toolwerk::{
    prompt_tuning::{GeneratedVariant, VariantRequest},
    providers::scripted::{system_prompt_of, user_prompt_of, ScriptedProvider},
    BayesianSettings,
    CompletionRequest,
    CompletionResponse,
    Engine,
    EngineError,
    EvalRequest,
    EventEnvelope,
    InMemoryPromptLibrary,
    InMemorySuiteStore,
    JobEvent,
    LLMError,
    LLMProvider,
    MetaModel,
    ParamSpec,
    ParamTuningRequest,
    PromptLibrary,
    PromptTuningRequest,
    RunItem,
    RunOutcome,
    RunStatus,
    RunView,
    SearchSpace,
    SearchStrategy,
    Suite,
    TestCase,
    ToolSpec,
    TuningMode,
};
use uuid::Uuid;

fn weather_suite() -> Suite {
    Suite::new("weather")
        .with_tool(ToolSpec::new("get_weather").with_parameters(json!({
            "type": "object",
            "properties": { "city": { "type": "string" } },
            "required": ["city"]
        })))
        .with_case(
            TestCase::new("paris", "What's the weather in Paris?")
                .expecting("get_weather")
                .with_params(json!({ "city": "Paris" })),
        )
        .with_case(TestCase::abstention("joke", "Tell me a joke"))
}

/// Calls the weather tool for weather questions and answers everything else in text.
fn weather_responder(request: &CompletionRequest) -> Result<CompletionResponse, LLMError> {
    if user_prompt_of(request).contains("weather") {
        Ok(ScriptedProvider::tool_call("get_weather", json!({ "city": "Paris" })))
    } else {
        Ok(ScriptedProvider::text("Why did the function return? It had closure."))
    }
}

async fn engine_for(suite: Suite, provider: Arc<dyn LLMProvider>) -> Engine {
    let suites = InMemorySuiteStore::new();
    suites.insert(suite).await;
    Engine::builder(provider, Arc::new(suites)).build()
}

async fn drain(engine: &Engine, run_id: Uuid) -> Vec<EventEnvelope> {
    let mut subscription = engine.subscribe(run_id, 0).await.unwrap();
    let mut events = Vec::new();
    while let Some(envelope) = subscription.next().await {
        events.push(envelope);
    }
    events
}

/// Provider that takes a while per call, so runs can be observed mid-flight.
struct SlowProvider {
    delay: Duration,
}

#[async_trait]
impl LLMProvider for SlowProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        tokio::time::sleep(self.delay).await;
        Ok(ScriptedProvider::tool_call("get_weather", json!({ "city": "Paris" })))
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

fn many_cases(n: usize) -> Suite {
    (0..n).fold(Suite::new("weather").with_tool(ToolSpec::new("get_weather")), |suite, i| {
        suite.with_case(TestCase::new(format!("case-{i}"), "What's the weather?").expecting("get_weather"))
    })
}

#[tokio::test]
async fn eval_scores_tool_use_and_abstention() {
    let engine = engine_for(weather_suite(), Arc::new(ScriptedProvider::with_responder(weather_responder))).await;
    let run_id = engine
        .start_eval("weather", EvalRequest::new("weather", vec!["gpt-4o".into()]))
        .await
        .unwrap();

    let events = drain(&engine, run_id).await;
    assert!(matches!(events.first().map(|e| &e.event), Some(JobEvent::Start { .. })));
    assert!(matches!(events.last().map(|e| &e.event), Some(JobEvent::Complete { .. })));

    let run = engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items.len(), 2);
    for item in &run.items {
        assert_eq!(item.score(), 1.0, "{}", item.key());
    }

    let Some(RunOutcome::Eval(summary)) = run.outcome else {
        panic!("expected an eval outcome");
    };
    assert_eq!(summary.overall.tool_selection_rate, 1.0);
    assert_eq!(summary.overall.irrelevant_call_rate, 0.0);
    assert_eq!(summary.overall.abstention_cases, 1);
    assert_eq!(run.best.map(|b| b.key), Some("gpt-4o".to_string()));
}

#[tokio::test]
async fn replaying_events_is_idempotent() {
    let engine = engine_for(weather_suite(), Arc::new(ScriptedProvider::with_responder(weather_responder))).await;
    let run_id = engine
        .start_eval("weather", EvalRequest::new("weather", vec!["gpt-4o".into(), "gpt-4o-mini".into()]))
        .await
        .unwrap();
    let events = drain(&engine, run_id).await;

    let mut view = RunView::new(run_id);
    for envelope in &events {
        view.apply(envelope);
    }
    assert!(view.is_finished());
    assert_eq!(view.items.len(), 4);

    for envelope in &events {
        assert!(!view.apply(envelope));
    }
    assert_eq!(view.items.len(), 4);
    assert_eq!(view.violations, 0);

    let run = engine.get_run(run_id).await.unwrap();
    let mut from_snapshot = RunView::from_run(&run);
    for envelope in &events {
        from_snapshot.apply(envelope);
    }
    assert_eq!(from_snapshot.items.len(), 4);
    assert_eq!(from_snapshot.status, RunStatus::Completed);
}

#[tokio::test]
async fn grid_ties_resolve_to_first_combo() {
    let engine = engine_for(weather_suite(), Arc::new(ScriptedProvider::with_responder(weather_responder))).await;
    let space = SearchSpace::new(vec![ParamSpec::choice("temperature", [0.2, 0.8])]);
    let request = ParamTuningRequest::new("weather", vec!["gpt-4o".into()], space, SearchStrategy::Grid);
    let run_id = engine.start_param_tuning("weather", request).await.unwrap();
    drain(&engine, run_id).await;

    let run = engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let combos: Vec<_> = run
        .items
        .iter()
        .filter_map(|item| match item {
            RunItem::Combo(combo) => Some(combo),
            _ => None,
        })
        .collect();
    assert_eq!(combos.len(), 2);
    assert_eq!(combos[0].mean_score, combos[1].mean_score);

    let Some(RunOutcome::ParamTuning(outcome)) = run.outcome else {
        panic!("expected a parameter tuning outcome");
    };
    assert_eq!(outcome.evaluated, 2);
    assert_eq!(outcome.best.map(|b| b.index), Some(0));
    assert_eq!(run.best.map(|b| b.key), Some("combo:0".to_string()));
}

#[tokio::test]
async fn bayesian_search_stops_when_scores_plateau() {
    let engine = engine_for(weather_suite(), Arc::new(ScriptedProvider::with_responder(weather_responder))).await;
    let space = SearchSpace::new(vec![ParamSpec::float("temperature", 0.0, 2.0, 0.01)]);
    let settings = BayesianSettings {
        n_startup_trials: 2,
        patience: 3,
        ..BayesianSettings::default()
    };
    let strategy = SearchStrategy::Bayesian {
        n_trials: 30,
        seed: 7,
        settings: Some(settings),
    };
    let request = ParamTuningRequest::new("weather", vec!["gpt-4o".into()], space, strategy);
    let run_id = engine.start_param_tuning("weather", request).await.unwrap();
    drain(&engine, run_id).await;

    let run = engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let Some(RunOutcome::ParamTuning(outcome)) = run.outcome else {
        panic!("expected a parameter tuning outcome");
    };
    assert!(outcome.converged);
    assert_eq!(outcome.evaluated, 4);
    assert_eq!(outcome.planned, 30);
}

/// Writes a strong and a weak prompt first, then only weak ones.
struct ScriptedMeta;

#[async_trait]
impl MetaModel for ScriptedMeta {
    async fn generate_variants(&self, request: &VariantRequest) -> Result<Vec<GeneratedVariant>, LLMError> {
        let texts: &[&str] = if request.generation == 1 {
            &["Use the weather tool for forecasts.", "Chat freely."]
        } else {
            &["Chat freely, never use tools."]
        };
        Ok(texts
            .iter()
            .map(|text| GeneratedVariant {
                text: text.to_string(),
                style: Some("scripted".into()),
            })
            .collect())
    }
}

#[tokio::test]
async fn evolution_keeps_best_variant_across_generations() {
    let suite = Suite::new("weather")
        .with_tool(ToolSpec::new("get_weather"))
        .with_case(TestCase::new("paris", "What's the weather in Paris?").expecting("get_weather"));
    let provider = ScriptedProvider::with_responder(|request| {
        if system_prompt_of(request).contains("weather tool") {
            Ok(ScriptedProvider::tool_call("get_weather", json!({ "city": "Paris" })))
        } else {
            Ok(ScriptedProvider::text("Sunny, probably."))
        }
    });
    let library = InMemoryPromptLibrary::new();
    let suites = InMemorySuiteStore::new();
    suites.insert(suite).await;
    let engine = Engine::builder(Arc::new(provider), Arc::new(suites))
        .with_meta_model(Arc::new(ScriptedMeta))
        .with_prompt_library(Arc::new(library.clone()))
        .build();

    let mode = TuningMode::Evolutionary {
        generations: 2,
        selection_ratio: 0.5,
    };
    let request = PromptTuningRequest::new("weather", vec!["gpt-4o".into()], "Be helpful.", 2, mode);
    let run_id = engine.start_prompt_tuning("weather", request).await.unwrap();
    drain(&engine, run_id).await;

    let run = engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let second_generation = run
        .items
        .iter()
        .filter(|item| matches!(item, RunItem::Variant(v) if v.generation == 2))
        .count();
    assert_eq!(second_generation, 2);

    let Some(RunOutcome::PromptTuning(outcome)) = run.outcome else {
        panic!("expected a prompt tuning outcome");
    };
    let best = outcome.best.unwrap();
    assert_eq!(best.generation, 1);
    assert_eq!(best.index, 0);
    assert_eq!(best.score, 1.0);
    assert_eq!(outcome.generations_run, 2);
    assert!(outcome.saved);

    let saved = library.list().await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].text, "Use the weather tool for forecasts.");
}

#[tokio::test]
async fn cancel_stops_the_run_and_frees_the_subject() {
    let engine = engine_for(many_cases(6), Arc::new(SlowProvider { delay: Duration::from_millis(30) })).await;
    let request = EvalRequest::new("weather", vec!["gpt-4o".into()]);
    let run_id = engine.start_eval("weather", request.clone()).await.unwrap();

    let busy = engine.start_eval("weather", request.clone()).await;
    assert!(matches!(busy, Err(EngineError::SubjectBusy { .. })));

    let mut subscription = engine.subscribe(run_id, 0).await.unwrap();
    let mut events = Vec::new();
    let mut cancelled = false;
    while let Some(envelope) = subscription.next().await {
        if matches!(envelope.event, JobEvent::ItemResult { .. }) && !cancelled {
            engine.cancel(run_id).await.unwrap();
            cancelled = true;
        }
        events.push(envelope);
    }
    assert!(matches!(events.last().map(|e| &e.event), Some(JobEvent::Cancelled)));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let run = engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.items.len() < 6);

    let log = engine.jobs().hub().replay(run_id).await;
    let cancelled_at = log
        .iter()
        .position(|e| matches!(e.event, JobEvent::Cancelled))
        .unwrap();
    assert_eq!(cancelled_at, log.len() - 1);
    assert!(engine.cancel(run_id).await.is_err());

    let next = engine.start_eval("weather", request).await.unwrap();
    assert_ne!(next, run_id);
}

#[tokio::test]
async fn resume_continues_without_gaps() {
    let engine = engine_for(many_cases(5), Arc::new(SlowProvider { delay: Duration::from_millis(20) })).await;
    let run_id = engine
        .start_eval("weather", EvalRequest::new("weather", vec!["gpt-4o".into()]))
        .await
        .unwrap();

    let mut first = engine.subscribe(run_id, 0).await.unwrap();
    let mut seen_items = 0;
    while let Some(envelope) = first.next().await {
        if matches!(envelope.event, JobEvent::ItemResult { .. }) {
            seen_items += 1;
            if seen_items == 2 {
                break;
            }
        }
    }
    drop(first);

    let (mut view, mut subscription) = engine.resume(run_id).await.unwrap();
    let mut expected = view.last_seq + 1;
    while let Some(envelope) = subscription.next().await {
        assert_eq!(envelope.seq, expected);
        expected += 1;
        view.apply(&envelope);
    }

    assert_eq!(view.status, RunStatus::Completed);
    assert_eq!(view.items.len(), 5);
    assert_eq!(view.violations, 0);
    let run = engine.get_run(run_id).await.unwrap();
    let stored: Vec<String> = run.items.iter().map(RunItem::key).collect();
    let rebuilt: Vec<String> = view.items.iter().map(RunItem::key).collect();
    assert_eq!(stored, rebuilt);
}

/// Follows a run to its end, cancelling it as soon as the first item lands.
async fn cancel_after_first_item(engine: &Engine, run_id: Uuid) -> Vec<EventEnvelope> {
    let mut subscription = engine.subscribe(run_id, 0).await.unwrap();
    let mut events = Vec::new();
    let mut cancelled = false;
    while let Some(envelope) = subscription.next().await {
        if matches!(envelope.event, JobEvent::ItemResult { .. }) && !cancelled {
            engine.cancel(run_id).await.unwrap();
            cancelled = true;
        }
        events.push(envelope);
    }
    events
}

#[tokio::test]
async fn cancel_mid_grid_keeps_partial_results() {
    let engine = engine_for(many_cases(3), Arc::new(SlowProvider { delay: Duration::from_millis(20) })).await;
    let space = SearchSpace::new(vec![ParamSpec::choice("temperature", [0.0, 0.2, 0.4, 0.6, 0.8, 1.0])]);
    let request = ParamTuningRequest::new("weather", vec!["gpt-4o".into()], space, SearchStrategy::Grid);
    let run_id = engine.start_param_tuning("weather", request).await.unwrap();

    let events = cancel_after_first_item(&engine, run_id).await;
    assert!(matches!(events.last().map(|e| &e.event), Some(JobEvent::Cancelled)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let run = engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(!run.items.is_empty());
    assert!(run.items.len() < 6);

    let Some(RunOutcome::ParamTuning(outcome)) = run.outcome else {
        panic!("expected a partial parameter tuning outcome");
    };
    assert!(outcome.cancelled);
    assert_eq!(outcome.planned, 6);
    assert_eq!(outcome.evaluated, run.items.len());

    let log = engine.jobs().hub().replay(run_id).await;
    assert!(matches!(log.last().map(|e| &e.event), Some(JobEvent::Cancelled)));
}

/// Writes `n` fresh prompts per generation, none of them repeated.
struct FreshMeta;

#[async_trait]
impl MetaModel for FreshMeta {
    async fn generate_variants(&self, request: &VariantRequest) -> Result<Vec<GeneratedVariant>, LLMError> {
        Ok((0..request.n)
            .map(|i| GeneratedVariant {
                text: format!("Generation {} prompt {i}.", request.generation),
                style: None,
            })
            .collect())
    }
}

#[tokio::test]
async fn cancel_mid_generation_skips_saving() {
    let library = InMemoryPromptLibrary::new();
    let suites = InMemorySuiteStore::new();
    suites.insert(many_cases(2)).await;
    let engine = Engine::builder(Arc::new(SlowProvider { delay: Duration::from_millis(20) }), Arc::new(suites))
        .with_meta_model(Arc::new(FreshMeta))
        .with_prompt_library(Arc::new(library.clone()))
        .build();

    let mode = TuningMode::Evolutionary {
        generations: 3,
        selection_ratio: 0.5,
    };
    let request = PromptTuningRequest::new("weather", vec!["gpt-4o".into()], "Be helpful.", 4, mode);
    let run_id = engine.start_prompt_tuning("weather", request).await.unwrap();

    let events = cancel_after_first_item(&engine, run_id).await;
    assert!(matches!(events.last().map(|e| &e.event), Some(JobEvent::Cancelled)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let run = engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.items.len() < 12);

    let Some(RunOutcome::PromptTuning(outcome)) = run.outcome else {
        panic!("expected a partial prompt tuning outcome");
    };
    assert!(outcome.cancelled);
    assert!(!outcome.saved);
    assert!(library.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn quick_mode_scores_a_single_population() {
    let suite = Suite::new("weather")
        .with_tool(ToolSpec::new("get_weather"))
        .with_case(TestCase::new("paris", "What's the weather in Paris?").expecting("get_weather"));
    let provider = ScriptedProvider::with_responder(|request| {
        if system_prompt_of(request).contains("weather tool") {
            Ok(ScriptedProvider::tool_call("get_weather", json!({ "city": "Paris" })))
        } else {
            Ok(ScriptedProvider::text("Sunny, probably."))
        }
    });
    let suites = InMemorySuiteStore::new();
    suites.insert(suite).await;
    let engine = Engine::builder(Arc::new(provider), Arc::new(suites))
        .with_meta_model(Arc::new(ScriptedMeta))
        .build();

    let request = PromptTuningRequest::new("weather", vec!["gpt-4o".into()], "Be helpful.", 2, TuningMode::Quick);
    let run_id = engine.start_prompt_tuning("weather", request).await.unwrap();
    drain(&engine, run_id).await;

    let run = engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items.len(), 2);
    assert!(run
        .items
        .iter()
        .all(|item| matches!(item, RunItem::Variant(v) if v.generation == 1)));

    let Some(RunOutcome::PromptTuning(outcome)) = run.outcome else {
        panic!("expected a prompt tuning outcome");
    };
    assert_eq!(outcome.mode, "quick");
    assert_eq!(outcome.generations_run, 1);
    assert_eq!(outcome.generation_means, vec![0.5]);
    let best = outcome.best.unwrap();
    assert_eq!(best.index, 0);
    assert_eq!(best.score, 1.0);
    assert_eq!(run.best.map(|b| b.key), Some("variant:1:0".to_string()));
}

#[tokio::test]
async fn random_search_evaluates_the_requested_samples() {
    let engine = engine_for(weather_suite(), Arc::new(ScriptedProvider::with_responder(weather_responder))).await;
    let space = SearchSpace::new(vec![ParamSpec::float("temperature", 0.0, 1.0, 0.05)]);
    let strategy = SearchStrategy::Random { n_samples: 5, seed: 11 };
    let request = ParamTuningRequest::new("weather", vec!["gpt-4o".into()], space, strategy);
    let run_id = engine.start_param_tuning("weather", request).await.unwrap();
    drain(&engine, run_id).await;

    let run = engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let keys: std::collections::HashSet<String> = run
        .items
        .iter()
        .filter_map(|item| match item {
            RunItem::Combo(combo) => Some(combo.combo.key()),
            _ => None,
        })
        .collect();
    assert_eq!(keys.len(), 5);

    let Some(RunOutcome::ParamTuning(outcome)) = run.outcome else {
        panic!("expected a parameter tuning outcome");
    };
    assert_eq!(outcome.strategy, "random");
    assert_eq!(outcome.planned, 5);
    assert_eq!(outcome.evaluated, 5);
    assert!(!outcome.converged);
}

#[tokio::test]
async fn duplicate_case_ids_are_rejected_up_front() {
    let suite = many_cases(2).with_case(TestCase::new("case-0", "Weather again?").expecting("get_weather"));
    let engine = engine_for(suite, Arc::new(ScriptedProvider::with_responder(weather_responder))).await;

    let err = engine
        .start_eval("weather", EvalRequest::new("weather", vec!["gpt-4o".into()]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateId { what: "test case", .. }));
    assert!(engine.list_runs().await.unwrap().is_empty());
}
