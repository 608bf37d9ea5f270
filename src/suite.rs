use std::{collections::HashMap, fs, path::Path, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::{
    error::EngineError,
    functions::{FunctionDefinition, Tool},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    /// Result fed back to the model when it calls this tool in a multi-turn case.
    #[serde(default)]
    pub mock_response: Option<Value>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: None,
            mock_response: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn to_tool(&self) -> Tool {
        let mut def = FunctionDefinition::new(self.name.clone());
        if let Some(desc) = self.description.clone() {
            def = def.with_description(desc);
        }
        if let Some(params) = self.parameters.clone() {
            def = def.with_parameters(params);
        }
        def.to_tool()
    }
}

/// Which tool(s) a case expects: a single name, alternatives, or none at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpectedTool {
    #[default]
    None,
    One(String),
    AnyOf(Vec<String>),
}

impl ExpectedTool {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            ExpectedTool::None => false,
            ExpectedTool::One(expected) => expected == name,
            ExpectedTool::AnyOf(options) => options.iter().any(|o| o == name),
        }
    }

    pub fn is_none(&self) -> bool {
        match self {
            ExpectedTool::None => true,
            ExpectedTool::One(_) => false,
            ExpectedTool::AnyOf(options) => options.is_empty(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            ExpectedTool::None => "(none)".to_string(),
            ExpectedTool::One(name) => name.clone(),
            ExpectedTool::AnyOf(options) => options.join("|"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    #[default]
    Exact,
    Subset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainOrder {
    #[default]
    Ordered,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub expected_tool: ExpectedTool,
    #[serde(default)]
    pub expected_params: Option<Map<String, Value>>,
    #[serde(default)]
    pub scoring_mode: ScoringMode,
    #[serde(default = "default_true")]
    pub should_call_tool: bool,
    #[serde(default)]
    pub multi_turn: bool,
    #[serde(default)]
    pub max_rounds: Option<usize>,
    #[serde(default)]
    pub optimal_hops: Option<usize>,
    #[serde(default)]
    pub prerequisite_tools: Vec<String>,
    #[serde(default)]
    pub chain_order: ChainOrder,
}

fn default_true() -> bool {
    true
}

impl TestCase {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            expected_tool: ExpectedTool::None,
            expected_params: None,
            scoring_mode: ScoringMode::Exact,
            should_call_tool: true,
            multi_turn: false,
            max_rounds: None,
            optimal_hops: None,
            prerequisite_tools: Vec::new(),
            chain_order: ChainOrder::Ordered,
        }
    }

    /// A case whose correct behaviour is calling no tool.
    pub fn abstention(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            should_call_tool: false,
            ..Self::new(id, prompt)
        }
    }

    pub fn expecting(mut self, tool: impl Into<String>) -> Self {
        self.expected_tool = ExpectedTool::One(tool.into());
        self
    }

    pub fn expecting_any<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_tool = ExpectedTool::AnyOf(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.expected_params = match params {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self
    }

    pub fn with_mode(mut self, mode: ScoringMode) -> Self {
        self.scoring_mode = mode;
        self
    }

    pub fn multi_turn(mut self, max_rounds: usize, prerequisites: Vec<String>) -> Self {
        self.multi_turn = true;
        self.max_rounds = Some(max_rounds);
        self.prerequisite_tools = prerequisites;
        self
    }

    pub fn with_optimal_hops(mut self, hops: usize) -> Self {
        self.optimal_hops = Some(hops);
        self
    }

    pub fn has_expected_params(&self) -> bool {
        self.expected_params.as_ref().is_some_and(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suite {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

impl Suite {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            tools: Vec::new(),
            test_cases: Vec::new(),
        }
    }

    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_case(mut self, case: TestCase) -> Self {
        self.test_cases.push(case);
        self
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.tools.iter().map(ToolSpec::to_tool).collect()
    }

    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, EngineError> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

pub fn load_suite(path: impl AsRef<Path>) -> Result<Suite, EngineError> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let suite = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        serde_yaml::from_slice(&bytes)?
    };
    Ok(suite)
}

/// Read-only suite access from the engine's point of view.
#[async_trait]
pub trait SuiteSource: Send + Sync {
    async fn get_suite(&self, id: &str) -> Result<Option<Suite>, EngineError>;
}

#[derive(Debug, Default)]
pub struct InMemorySuiteStore {
    suites: Arc<RwLock<HashMap<String, Suite>>>,
}

impl InMemorySuiteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, suite: Suite) {
        let mut suites = self.suites.write().await;
        suites.insert(suite.id.clone(), suite);
    }
}

#[async_trait]
impl SuiteSource for InMemorySuiteStore {
    async fn get_suite(&self, id: &str) -> Result<Option<Suite>, EngineError> {
        let suites = self.suites.read().await;
        Ok(suites.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::{ExpectedTool, ScoringMode, Suite};

    const SUITE: &str = r#"
id: weather
tools:
  - name: get_weather
    description: Current weather for a city
    parameters:
      type: object
      properties:
        city: { type: string }
      required: [city]
test_cases:
  - id: paris
    prompt: weather in Paris?
    expected_tool: get_weather
    expected_params: { city: Paris }
  - id: either
    prompt: forecast or weather?
    expected_tool: [get_weather, get_forecast]
    scoring_mode: subset
  - id: joke
    prompt: tell me a joke
    should_call_tool: false
"#;

    #[test]
    fn parses_yaml_suite() {
        let suite = Suite::from_yaml_str(SUITE).unwrap();
        assert_eq!(suite.tools.len(), 1);
        assert_eq!(suite.test_cases[0].expected_tool, ExpectedTool::One("get_weather".into()));
        assert!(suite.test_cases[1].expected_tool.matches("get_forecast"));
        assert_eq!(suite.test_cases[1].scoring_mode, ScoringMode::Subset);
        assert!(!suite.test_cases[2].should_call_tool);
        assert!(suite.test_cases[2].expected_tool.is_none());
    }
}
