pub mod error;
pub mod providers;
pub mod types;
pub mod functions;
pub mod params;
pub mod capabilities;
pub mod suite;
pub mod invocation;
pub mod scoring;
pub mod search;
pub mod eval;
pub mod jobs;
pub mod param_tuning;
pub mod prompt_tuning;
pub mod config;
pub mod engine;

pub use error::{EngineError, LLMError};
pub use providers::LLMProvider;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use functions::{FunctionCall, FunctionDefinition, Tool, ToolCall, ToolChoice};
pub use params::{Combo, ParamValue, RequestParams};
pub use capabilities::{Adjustment, CapabilityRule, CapabilityTable, ParamSupport, ParamTransform};
pub use suite::{
    load_suite,
    ChainOrder,
    ExpectedTool,
    InMemorySuiteStore,
    ScoringMode,
    Suite,
    SuiteSource,
    TestCase,
    ToolSpec,
};
pub use invocation::{Invocation, InvocationAdapter, InvocationRequest, ProviderAdapter};
pub use scoring::{CallRecord, EvalResult, HopTrace, ScoreWeights, ScoringEngine};
pub use search::{BayesianSampler, BayesianSettings, ParamKind, ParamSpec, RandomSampler, SearchSpace};
pub use eval::{EvalRequest, EvalRunner, EvalStats, EvalSummary, InvocationSetup, PreparedSuite};
pub use jobs::{
    BestPointer,
    EventEnvelope,
    InMemoryRunStore,
    JobEvent,
    Run,
    RunItem,
    RunKind,
    RunOutcome,
    RunStatus,
    RunStore,
    RunView,
    Subscription,
};
pub use param_tuning::{ComboResult, ParamTuneOutcome, ParamTuningRequest, SearchStrategy};
pub use prompt_tuning::{
    InMemoryPromptLibrary,
    LlmMetaModel,
    MetaModel,
    PromptLibrary,
    PromptTuneOutcome,
    PromptTuningRequest,
    PromptVariant,
    SavedPrompt,
    TuningMode,
};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
