use thiserror::Error;
use uuid::Uuid;

use crate::jobs::RunStatus;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("provider call timed out after {0}s")]
    Timeout(u64),

    #[error("meta-model output could not be parsed: {0}")]
    UnparseableVariants(String),
}

/// Failures surfaced synchronously to the submitting caller, plus run-fatal errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("suite not found: {0}")]
    SuiteNotFound(String),

    #[error("suite '{0}' has no test cases")]
    NoTestCases(String),

    #[error("no target models selected")]
    NoModels,

    #[error("duplicate {what} '{id}'")]
    DuplicateId { what: &'static str, id: String },

    #[error("no tunable parameters are enabled")]
    NoEnabledParameters,

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("search space is empty")]
    EmptySearchSpace,

    #[error("search space has {size} combos, limit is {limit}")]
    SearchSpaceTooLarge { size: u64, limit: u64 },

    #[error("invalid prompt tuning settings: {0}")]
    InvalidPromptSettings(String),

    #[error("subject '{subject}' already has an active run ({run_id})")]
    SubjectBusy { subject: String, run_id: Uuid },

    #[error("unknown run: {0}")]
    RunNotFound(Uuid),

    #[error("run {run_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("meta-model failed: {0}")]
    MetaModel(#[source] LLMError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
