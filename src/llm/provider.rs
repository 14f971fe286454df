use async_trait::async_trait;

use crate::types::{AppResult, LLMProvider, LLMRequest, LLMResponse};

#[async_trait]
pub trait LLMAdapter: Send + Sync {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse>;
}

/// Configuration for an LLM provider
pub struct LLMProviderConfig {
    pub provider: LLMProvider,
    pub api_key: String,
}

pub struct LLM {
    adapter: Box<dyn LLMAdapter>,
    provider: LLMProvider,
}

impl LLM {
    pub fn new(config: LLMProviderConfig) -> Self {
        let adapter: Box<dyn LLMAdapter> = Box::new(
            crate::llm::openai::OpenAIAdapter::new_with_api_base(
                &config.api_key,
                config.provider.api_base(),
            ),
        );
        Self {
            adapter,
            provider: config.provider,
        }
    }

    pub fn with_adapter(provider: LLMProvider, adapter: Box<dyn LLMAdapter>) -> Self {
        Self { adapter, provider }
    }

    pub fn provider(&self) -> LLMProvider {
        self.provider
    }

    pub async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        self.adapter.create_chat_completion(request).await
    }
}
