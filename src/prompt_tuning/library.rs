use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPrompt {
    pub id: Uuid,
    pub name: String,
    pub text: String,
    pub score: f64,
    pub generation: usize,
    pub index: usize,
    #[serde(default)]
    pub style: Option<String>,
    pub run_id: Uuid,
    pub suite_id: String,
    pub models: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

/// Destination for winning prompts.
#[async_trait]
pub trait PromptLibrary: Send + Sync {
    async fn save(&self, prompt: SavedPrompt) -> Result<(), EngineError>;

    async fn list(&self) -> Result<Vec<SavedPrompt>, EngineError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryPromptLibrary {
    prompts: Arc<RwLock<Vec<SavedPrompt>>>,
}

impl InMemoryPromptLibrary {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PromptLibrary for InMemoryPromptLibrary {
    async fn save(&self, prompt: SavedPrompt) -> Result<(), EngineError> {
        self.prompts.write().await.push(prompt);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SavedPrompt>, EngineError> {
        Ok(self.prompts.read().await.clone())
    }
}
