use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    capabilities::{Adjustment, CapabilityTable},
    functions::{Tool, ToolCall, ToolChoice},
    params::RequestParams,
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest},
    LLMError,
};

/// Everything needed for one model turn.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub model: String,
    pub system_prompt: String,
    pub params: RequestParams,
    /// Conversation after the system prompt: the user prompt and any earlier turns.
    pub conversation: Vec<ChatMessage>,
    pub tools: Vec<Tool>,
}

/// The model's decision for one turn.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Assistant message as returned, with call ids filled in.
    pub message: ChatMessage,
    pub adjustments: Vec<Adjustment>,
}

impl Invocation {
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.message.tool_calls
    }

    pub fn content(&self) -> Option<&str> {
        self.message.text()
    }
}

#[async_trait]
pub trait InvocationAdapter: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<Invocation, LLMError>;
}

/// Adapter over an [`LLMProvider`] that applies the capability table and a hard timeout.
pub struct ProviderAdapter {
    provider: Arc<dyn LLMProvider>,
    capabilities: CapabilityTable,
    timeout: Duration,
}

impl ProviderAdapter {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            capabilities: CapabilityTable::builtin(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityTable) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Capability key used for `model`.
    pub fn provider_key<'a>(&'a self, model: &'a str) -> &'a str {
        CapabilityTable::provider_for(model, self.provider.name())
    }
}

#[async_trait]
impl InvocationAdapter for ProviderAdapter {
    async fn invoke(&self, request: InvocationRequest) -> Result<Invocation, LLMError> {
        let provider_key = self.provider_key(&request.model).to_string();
        let (params, adjustments) = self.capabilities.adapt(&provider_key, &request.params);
        for adjustment in &adjustments {
            debug!(model = %request.model, provider = %provider_key, ?adjustment, "adjusted request parameter");
        }

        let mut messages = Vec::with_capacity(request.conversation.len() + 1);
        if !request.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(request.system_prompt.clone()));
        }
        messages.extend(request.conversation);

        let has_tools = !request.tools.is_empty();
        let mut completion = CompletionRequest::new(request.model.clone(), messages).with_tools(request.tools);
        if has_tools {
            completion = completion.with_tool_choice(ToolChoice::auto());
        }
        // explicit tool_choice in the params wins over the default
        let completion = completion.with_params(&params);

        let response = match tokio::time::timeout(self.timeout, self.provider.complete(completion)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(model = %request.model, timeout_secs = self.timeout.as_secs(), "invocation timed out");
                return Err(LLMError::Timeout(self.timeout.as_secs()));
            }
        };

        let mut message = response.message;
        for (i, call) in message.tool_calls.iter_mut().enumerate() {
            if call.id.is_none() {
                call.id = Some(format!("call_{i}"));
            }
        }

        Ok(Invocation { message, adjustments })
    }
}

/// Compiled JSON schemas of a suite's tools, for checking call arguments.
pub struct ToolSchemas {
    validators: HashMap<String, Option<JSONSchema>>,
}

impl ToolSchemas {
    pub fn compile(tools: &[Tool]) -> Self {
        let mut validators = HashMap::new();
        for tool in tools {
            let compiled = match JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(&tool.function.parameters)
            {
                Ok(schema) => Some(schema),
                Err(err) => {
                    warn!(tool = %tool.function.name, error = %err, "tool schema does not compile; arguments will not be checked");
                    None
                }
            };
            validators.insert(tool.function.name.clone(), compiled);
        }
        Self { validators }
    }

    /// False for unknown tools and for arguments that violate the tool's schema.
    pub fn is_valid(&self, tool: &str, arguments: &Value) -> bool {
        match self.validators.get(tool) {
            None => false,
            Some(None) => true,
            Some(Some(schema)) => schema.is_valid(arguments),
        }
    }
}
