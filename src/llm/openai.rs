// OpenAI-compatible chat completions adapter
// Serves OpenAI, OpenRouter and Groq by pointing the client at their API base.

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ResponseFormat,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::provider::LLMAdapter;
use crate::types::{AppError, AppResult, LLMMessage, LLMRequest, LLMResponse, TokenUsage};

pub struct OpenAIAdapter {
    client: Client<OpenAIConfig>,
}

impl OpenAIAdapter {
    pub fn new(api_key: &str) -> Self {
        Self::new_with_api_base(api_key, crate::types::LLMProvider::OpenAI.api_base())
    }

    pub fn new_with_api_base(api_key: &str, api_base: &str) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base.trim_end_matches('/'));
        Self {
            client: Client::with_config(config),
        }
    }
}

fn llm_error(e: OpenAIError) -> AppError {
    AppError::LLMApi(e.to_string())
}

fn to_request_message(message: &LLMMessage) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let content = message.content.clone();
    Ok(match message.role.as_str() {
        "system" => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        "assistant" => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        _ => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()?
            .into(),
    })
}

#[async_trait]
impl LLMAdapter for OpenAIAdapter {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        let messages = request
            .messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, _>>()
            .map_err(llm_error)?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(request.model.as_str()).messages(messages);
        if let Some(max_tokens) = request.max_tokens {
            args.max_tokens(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            args.temperature(temperature);
        }
        if request.json_response {
            args.response_format(ResponseFormat::JsonObject);
        }

        let response = self
            .client
            .chat()
            .create(args.build().map_err(llm_error)?)
            .await
            .map_err(llm_error)?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::LLMApi("response contained no choices".into()))?;
        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();
        let finish_reason = choice
            .finish_reason
            .and_then(|r| serde_json::to_value(r).ok())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "stop".to_string());

        Ok(LLMResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;

    fn request() -> LLMRequest {
        LLMRequest {
            model: "gpt-4o".into(),
            messages: vec![LLMMessage::system("be brief"), LLMMessage::user("hi")],
            max_tokens: Some(64),
            temperature: None,
            json_response: true,
        }
    }

    #[tokio::test]
    async fn test_chat_completion_parses_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "gpt-4o",
                "max_tokens": 64,
                "response_format": {"type": "json_object"}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"chatcmpl-1","object":"chat.completion","created":1700000000,"model":"gpt-4o",
                    "choices":[{"index":0,"message":{"role":"assistant","content":"{\"bmi\":null}"},"finish_reason":"length"}],
                    "usage":{"prompt_tokens":10,"completion_tokens":4,"total_tokens":14}}"#,
            )
            .create_async()
            .await;

        let adapter = OpenAIAdapter::new_with_api_base("sk-test", &server.url());
        let response = adapter.create_chat_completion(&request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, "{\"bmi\":null}");
        assert_eq!(response.finish_reason, "length");
        assert_eq!(response.usage.total_tokens, 14);
    }

    #[tokio::test]
    async fn test_chat_completion_surfaces_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"message":"unknown model","type":"invalid_request_error"}}"#)
            .create_async()
            .await;

        let adapter = OpenAIAdapter::new_with_api_base("sk-test", &server.url());
        let err = adapter.create_chat_completion(&request()).await.unwrap_err();
        match err {
            AppError::LLMApi(message) => assert!(message.contains("unknown model")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
