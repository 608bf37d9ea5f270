use serde::{Deserialize, Serialize, Serializer};
use serde::ser::SerializeStruct;
use serde_json::{json, Value};

/// A function schema as sent to providers. `parameters` is a JSON-Schema object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: empty_object_schema(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = normalize_parameters(parameters);
        self
    }

    pub fn to_tool(&self) -> Tool {
        Tool::from(self.clone())
    }
}

pub fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

// Suites written by hand often omit the top-level "type"; providers reject that.
fn normalize_parameters(mut value: Value) -> Value {
    let Value::Object(map) = &mut value else {
        return empty_object_schema();
    };
    map.entry("type").or_insert_with(|| Value::String("object".into()));
    map.entry("properties").or_insert_with(|| json!({}));
    value
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: ToolType,
    pub function: FunctionDefinition,
}

impl From<FunctionDefinition> for Tool {
    fn from(function: FunctionDefinition) -> Self {
        Self {
            kind: ToolType::Function,
            function,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Function,
}

#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
    pub raw_arguments: Option<String>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            raw_arguments: None,
        }
    }

    pub fn with_raw_arguments(mut self, raw: impl Into<String>) -> Self {
        self.raw_arguments = Some(raw.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: Option<String>,
    pub kind: ToolCallType,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(function: FunctionCall) -> Self {
        Self {
            id: None,
            kind: ToolCallType::Function,
            function,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ToolCallType {
    Function,
}

impl Serialize for ToolCall {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("ToolCall", 3)?;
        if let Some(id) = &self.id {
            state.serialize_field("id", id)?;
        }
        state.serialize_field("type", &self.kind)?;
        state.serialize_field("function", &SerializableFunctionCall(&self.function))?;
        state.end()
    }
}

impl Serialize for ToolCallType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            ToolCallType::Function => serializer.serialize_str("function"),
        }
    }
}

impl<'de> Deserialize<'de> for ToolCall {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawFunctionCall {
            name: String,
            #[serde(default)]
            arguments: Value,
        }

        #[derive(Deserialize)]
        struct RawToolCall {
            id: Option<String>,
            #[serde(rename = "type")]
            kind: String,
            function: RawFunctionCall,
        }

        let raw = RawToolCall::deserialize(deserializer)?;
        let kind = match raw.kind.as_str() {
            "function" => ToolCallType::Function,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unsupported tool call type '{other}'"
                )))
            }
        };

        // Some OpenAI-compatible gateways send arguments as an object instead of a string.
        let (arguments, raw_arguments) = match raw.function.arguments {
            Value::String(text) if text.trim().is_empty() => (json!({}), Some(text)),
            Value::String(text) => {
                let parsed = serde_json::from_str(&text).map_err(|error| {
                    serde::de::Error::custom(format!("failed to parse function arguments: {error}"))
                })?;
                (parsed, Some(text))
            }
            Value::Null => (json!({}), None),
            other => (other, None),
        };

        Ok(Self {
            id: raw.id,
            kind,
            function: FunctionCall {
                name: raw.function.name,
                arguments,
                raw_arguments,
            },
        })
    }
}

impl<'de> Deserialize<'de> for ToolCallType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "function" => Ok(ToolCallType::Function),
            other => Err(serde::de::Error::custom(format!(
                "unsupported tool call type '{other}'"
            ))),
        }
    }
}

struct SerializableFunctionCall<'a>(&'a FunctionCall);

impl<'a> Serialize for SerializableFunctionCall<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("function", 2)?;
        state.serialize_field("name", &self.0.name)?;
        let raw = if let Some(raw) = &self.0.raw_arguments {
            raw.clone()
        } else {
            serde_json::to_string(&self.0.arguments)
                .map_err(|error| serde::ser::Error::custom(error.to_string()))?
        };
        state.serialize_field("arguments", &raw)?;
        state.end()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Simple(ToolChoiceSimple),
    Function {
        #[serde(rename = "type")]
        kind: ToolChoiceKind,
        function: ToolChoiceFunction,
    },
}

impl ToolChoice {
    pub fn auto() -> Self {
        Self::Simple(ToolChoiceSimple::Auto)
    }

    pub fn none() -> Self {
        Self::Simple(ToolChoiceSimple::None)
    }

    pub fn required() -> Self {
        Self::Simple(ToolChoiceSimple::Required)
    }

    pub fn function(name: impl Into<String>) -> Self {
        Self::Function {
            kind: ToolChoiceKind::Function,
            function: ToolChoiceFunction { name: name.into() },
        }
    }

    /// Parses the tunable `tool_choice` value: `auto`, `none`, `required`, or a tool name.
    pub fn from_param(value: &str) -> Self {
        match value.trim() {
            "auto" => Self::auto(),
            "none" => Self::none(),
            "required" | "any" => Self::required(),
            name => Self::function(name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceSimple {
    None,
    Auto,
    Required,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceKind {
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}
