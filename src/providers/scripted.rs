use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    functions::{FunctionCall, ToolCall},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

type Responder = dyn Fn(&CompletionRequest) -> Result<CompletionResponse, LLMError> + Send + Sync;

/// Deterministic provider for tests and dry runs.
///
/// Either replays a fixed queue of responses or delegates to a responder closure that can
/// inspect the request (model, system prompt, temperature, conversation so far).
pub struct ScriptedProvider {
    name: &'static str,
    queue: Mutex<VecDeque<Result<CompletionResponse, LLMError>>>,
    responder: Option<Box<Responder>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            name: "scripted",
            queue: Mutex::new(VecDeque::new()),
            responder: None,
        }
    }

    pub fn from_responses<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = CompletionResponse>,
    {
        let provider = Self::new();
        if let Ok(mut queue) = provider.queue.lock() {
            queue.extend(responses.into_iter().map(Ok));
        }
        provider
    }

    pub fn with_responder(
        responder: impl Fn(&CompletionRequest) -> Result<CompletionResponse, LLMError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    /// Reports a different provider key so capability rules for that provider apply.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn push_error(&self, error: LLMError) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Err(error));
        }
    }

    /// Response containing a single tool call.
    pub fn tool_call(name: &str, arguments: Value) -> CompletionResponse {
        Self::tool_calls(vec![(name, arguments)])
    }

    pub fn tool_calls(calls: Vec<(&str, Value)>) -> CompletionResponse {
        let calls = calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, arguments))| {
                ToolCall::new(FunctionCall::new(name, arguments)).with_id(format!("scripted_call_{i}"))
            })
            .collect();
        CompletionResponse {
            message: ChatMessage::assistant_tool_calls(calls),
            usage: None,
        }
    }

    /// Plain text response without tool calls.
    pub fn text(content: &str) -> CompletionResponse {
        CompletionResponse {
            message: ChatMessage::assistant(content),
            usage: None,
        }
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Some(responder) = &self.responder {
            return responder(&request);
        }

        let next = self
            .queue
            .lock()
            .map_err(|_| LLMError::Provider("scripted queue poisoned".to_string()))?
            .pop_front();
        next.unwrap_or_else(|| Err(LLMError::Provider("no more scripted responses".to_string())))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Text of the system message in a request, if any.
pub fn system_prompt_of(request: &CompletionRequest) -> &str {
    request
        .messages
        .iter()
        .find(|m| m.role == crate::types::MessageRole::System)
        .and_then(|m| m.text())
        .unwrap_or_default()
}

/// Text of the first user message in a request, if any.
pub fn user_prompt_of(request: &CompletionRequest) -> &str {
    request
        .messages
        .iter()
        .find(|m| m.role == crate::types::MessageRole::User)
        .and_then(|m| m.text())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ScriptedProvider;
    use crate::{
        providers::LLMProvider,
        types::{ChatMessage, CompletionRequest},
    };

    #[tokio::test]
    async fn replays_queue_then_errors() {
        let provider = ScriptedProvider::from_responses(vec![ScriptedProvider::tool_call(
            "get_weather",
            json!({ "city": "Paris" }),
        )]);
        let request = CompletionRequest::new("m", vec![ChatMessage::user("weather?")]);

        let first = provider.complete(request.clone()).await.unwrap();
        assert_eq!(first.message.tool_calls[0].function.name, "get_weather");
        assert!(provider.complete(request).await.is_err());
    }
}
