use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    error::EngineError,
    eval::{run_eval_job, EvalRequest, EvalRunner, PreparedSuite},
    invocation::ProviderAdapter,
    jobs::{InMemoryRunStore, JobManager, ProgressHub, Run, RunKind, RunStore, RunView, Subscription},
    param_tuning::{run_param_tuning_job, CapabilityPlan, ParamTuningRequest},
    prompt_tuning::{
        run_prompt_tuning_job, InMemoryPromptLibrary, LlmMetaModel, MetaModel, PromptLibrary, PromptTuningDeps,
        PromptTuningRequest,
    },
    providers::LLMProvider,
    scoring::ScoringEngine,
    suite::SuiteSource,
};

const DEFAULT_META_MODEL: &str = "gpt-4o-mini";

/// Entry point for starting and observing runs.
pub struct Engine {
    suites: Arc<dyn SuiteSource>,
    runner: Arc<EvalRunner>,
    capabilities: CapabilityPlan,
    meta: Arc<dyn MetaModel>,
    library: Arc<dyn PromptLibrary>,
    jobs: JobManager,
    config: EngineConfig,
}

pub struct EngineBuilder {
    provider: Arc<dyn LLMProvider>,
    suites: Arc<dyn SuiteSource>,
    config: EngineConfig,
    meta: Option<Arc<dyn MetaModel>>,
    library: Option<Arc<dyn PromptLibrary>>,
    store: Option<Arc<dyn RunStore>>,
}

impl EngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_meta_model(mut self, meta: Arc<dyn MetaModel>) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_prompt_library(mut self, library: Arc<dyn PromptLibrary>) -> Self {
        self.library = Some(library);
        self
    }

    pub fn with_run_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let table = config.capability_table();
        let adapter = ProviderAdapter::new(self.provider.clone())
            .with_capabilities(table.clone())
            .with_timeout(config.invocation_timeout());
        let scoring = ScoringEngine::new(config.score_weights, config.default_max_rounds);
        let runner = EvalRunner::new(Arc::new(adapter), scoring).with_model_concurrency(config.model_concurrency);

        let meta = self
            .meta
            .unwrap_or_else(|| Arc::new(LlmMetaModel::new(self.provider.clone(), DEFAULT_META_MODEL)));
        let library = self
            .library
            .unwrap_or_else(|| Arc::new(InMemoryPromptLibrary::new()));
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryRunStore::new()));
        let hub = Arc::new(ProgressHub::new(config.event_capacity));

        Engine {
            suites: self.suites,
            runner: Arc::new(runner),
            capabilities: CapabilityPlan {
                table,
                fallback_provider: self.provider.name().to_string(),
            },
            meta,
            library,
            jobs: JobManager::new(store, hub),
            config,
        }
    }
}

impl Engine {
    pub fn builder(provider: Arc<dyn LLMProvider>, suites: Arc<dyn SuiteSource>) -> EngineBuilder {
        EngineBuilder {
            provider,
            suites,
            config: EngineConfig::default(),
            meta: None,
            library: None,
            store: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn prompt_library(&self) -> &Arc<dyn PromptLibrary> {
        &self.library
    }

    async fn load_suite(&self, suite_id: &str) -> Result<Arc<PreparedSuite>, EngineError> {
        let suite = self
            .suites
            .get_suite(suite_id)
            .await?
            .ok_or_else(|| EngineError::SuiteNotFound(suite_id.to_string()))?;
        Ok(Arc::new(PreparedSuite::new(suite)))
    }

    fn snapshot<T: Serialize>(request: &T) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::to_value(request)?)
    }

    /// Validates the request and starts an evaluation run for `subject`.
    pub async fn start_eval(&self, subject: &str, request: EvalRequest) -> Result<Uuid, EngineError> {
        let suite = self.load_suite(&request.suite_id).await?;
        request.validate(&suite.suite)?;
        let config = Self::snapshot(&request)?;
        let runner = self.runner.clone();

        let run_id = self
            .jobs
            .submit(RunKind::Eval, subject, config, move |ctx| run_eval_job(runner, suite, request, ctx))
            .await?;
        info!(%run_id, subject, "eval submitted");
        Ok(run_id)
    }

    pub async fn start_param_tuning(&self, subject: &str, request: ParamTuningRequest) -> Result<Uuid, EngineError> {
        let suite = self.load_suite(&request.suite_id).await?;
        request.validate(&suite.suite, self.config.max_grid_combos)?;
        let config = Self::snapshot(&request)?;
        let runner = self.runner.clone();
        let capabilities = self.capabilities.clone();
        let bayesian = self.config.bayesian.clone();

        let run_id = self
            .jobs
            .submit(RunKind::ParamTuning, subject, config, move |ctx| {
                run_param_tuning_job(runner, suite, request, capabilities, bayesian, ctx)
            })
            .await?;
        info!(%run_id, subject, "parameter tuning submitted");
        Ok(run_id)
    }

    pub async fn start_prompt_tuning(&self, subject: &str, request: PromptTuningRequest) -> Result<Uuid, EngineError> {
        let suite = self.load_suite(&request.suite_id).await?;
        request.validate(&suite.suite)?;
        let config = Self::snapshot(&request)?;
        let deps = PromptTuningDeps {
            runner: self.runner.clone(),
            meta: self.meta.clone(),
            library: self.library.clone(),
        };

        let run_id = self
            .jobs
            .submit(RunKind::PromptTuning, subject, config, move |ctx| {
                run_prompt_tuning_job(deps, suite, request, ctx)
            })
            .await?;
        info!(%run_id, subject, "prompt tuning submitted");
        Ok(run_id)
    }

    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.jobs.cancel(run_id).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, EngineError> {
        self.jobs
            .store()
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    pub async fn list_runs(&self) -> Result<Vec<Run>, EngineError> {
        self.jobs.store().list_runs().await
    }

    /// Deletes a run record and its event log. An active run is cancelled first.
    pub async fn delete_run(&self, run_id: Uuid) -> Result<bool, EngineError> {
        if let Some(run) = self.jobs.store().get_run(run_id).await? {
            if !run.status.is_terminal() {
                self.jobs.cancel(run_id).await?;
            }
        }
        let deleted = self.jobs.store().delete_run(run_id).await?;
        self.jobs.hub().forget(run_id).await;
        Ok(deleted)
    }

    /// Events of `run_id` with a sequence number above `after_seq`, followed by the live tail.
    pub async fn subscribe(&self, run_id: Uuid, after_seq: u64) -> Result<Subscription, EngineError> {
        self.get_run(run_id).await?;
        Ok(self.jobs.hub().subscribe(run_id, after_seq).await)
    }

    /// Snapshot of the stored run plus a subscription that continues exactly where it ends.
    pub async fn resume(&self, run_id: Uuid) -> Result<(RunView, Subscription), EngineError> {
        let run = self.get_run(run_id).await?;
        let subscription = self.jobs.hub().subscribe(run_id, run.last_seq).await;
        Ok((RunView::from_run(&run), subscription))
    }

    /// Marks runs orphaned by a previous process as interrupted.
    pub async fn recover_interrupted(&self) -> Result<Vec<Uuid>, EngineError> {
        self.jobs.recover_interrupted().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::Engine;
    use crate::{
        error::EngineError,
        eval::EvalRequest,
        providers::scripted::ScriptedProvider,
        suite::{InMemorySuiteStore, Suite, TestCase, ToolSpec},
    };

    async fn engine_with(suite: Suite) -> Engine {
        let suites = InMemorySuiteStore::new();
        suites.insert(suite).await;
        let provider = ScriptedProvider::with_responder(|_| {
            Ok(ScriptedProvider::tool_call("get_weather", json!({"city": "Paris"})))
        });
        Engine::builder(Arc::new(provider), Arc::new(suites)).build()
    }

    #[tokio::test]
    async fn unknown_suite_is_rejected_before_a_run_exists() {
        let engine = engine_with(Suite::new("weather")).await;
        let err = engine
            .start_eval("weather", EvalRequest::new("missing", vec!["gpt-4o".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SuiteNotFound(id) if id == "missing"));
        assert!(engine.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_suite_is_rejected() {
        let engine = engine_with(Suite::new("weather")).await;
        let err = engine
            .start_eval("weather", EvalRequest::new("weather", vec!["gpt-4o".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoTestCases(_)));
    }

    #[tokio::test]
    async fn eval_run_completes_and_can_be_deleted() {
        let suite = Suite::new("weather")
            .with_tool(ToolSpec::new("get_weather"))
            .with_case(TestCase::new("paris", "Weather in Paris?").expecting("get_weather"));
        let engine = engine_with(suite).await;
        let run_id = engine
            .start_eval("weather", EvalRequest::new("weather", vec!["gpt-4o".into()]))
            .await
            .unwrap();

        let mut subscription = engine.subscribe(run_id, 0).await.unwrap();
        while subscription.next().await.is_some() {}

        let run = engine.get_run(run_id).await.unwrap();
        assert!(run.status.is_terminal());
        assert_eq!(run.items.len(), 1);

        assert!(engine.delete_run(run_id).await.unwrap());
        assert!(matches!(engine.get_run(run_id).await, Err(EngineError::RunNotFound(_))));
    }
}
