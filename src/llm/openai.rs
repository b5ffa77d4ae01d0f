//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek、OpenAI、Ollama 的 /v1 代理均可。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::{ApiError, OpenAIError};
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{GenerationRequest, LlmClient, LlmError};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，generate 时拼 system + user 消息并取首条 content
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    fn to_openai_messages(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.clone())
                    .build()?,
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.prompt.clone())
                .build()?,
        ));
        Ok(messages)
    }
}

/// 服务端错误与限流可重试；其余 API 错误说明请求本身被拒绝
pub(crate) fn api_error_is_transient(api: &ApiError) -> bool {
    [api.r#type.as_deref(), api.code.as_deref()]
        .into_iter()
        .flatten()
        .any(|tag| tag.contains("server_error") || tag.contains("rate_limit") || tag == "overloaded")
}

fn map_openai_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::ApiError(api) if api_error_is_transient(&api) => {
            LlmError::Transport(format!("api error: {}", api.message))
        }
        OpenAIError::ApiError(api) => LlmError::Rejected(api.message),
        OpenAIError::InvalidArgument(message) => LlmError::Rejected(message),
        other => LlmError::Transport(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let messages = self.to_openai_messages(request).map_err(map_openai_error)?;
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(request.temperature)
            .max_completion_tokens(request.max_tokens)
            .build()
            .map_err(map_openai_error)?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(map_openai_error)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let Some(choice) = response.choices.first() else {
            return Err(LlmError::Transport("response contained no choices".to_string()));
        };
        if let Some(refusal) = &choice.message.refusal {
            return Err(LlmError::Refusal(refusal.clone()));
        }

        Ok(choice.message.content.clone().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::llm::{generate_with_timeout, GenerationParams};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GenerationRequest {
        let params = GenerationParams::new(0.0, 32, Duration::from_secs(5)).unwrap();
        GenerationRequest::new("hello", &params)
    }

    #[tokio::test]
    async fn test_bad_request_is_rejected_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "message": "context length exceeded",
                    "type": "invalid_request_error",
                    "param": null,
                    "code": null
                }
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(Some(server.uri().as_str()), "gpt-test", Some("sk-test"));
        let err = generate_with_timeout(&client, &request()).await.unwrap_err();

        assert_eq!(err, LlmError::Rejected("context length exceeded".to_string()));
        assert_eq!(err.kind(), ErrorKind::LogicalFailure);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1700000000,
                "model": "gpt-test",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "1. Do it"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(Some(server.uri().as_str()), "gpt-test", Some("sk-test"));
        let text = client.generate(&request()).await.unwrap();
        assert_eq!(text, "1. Do it");
        assert_eq!(client.token_usage(), (7, 3, 10));
    }

    #[test]
    fn test_api_error_classification() {
        let api = |kind: &str| ApiError {
            message: "m".to_string(),
            r#type: Some(kind.to_string()),
            param: None,
            code: None,
        };
        assert!(api_error_is_transient(&api("server_error")));
        assert!(api_error_is_transient(&api("rate_limit_exceeded")));
        assert!(!api_error_is_transient(&api("invalid_request_error")));
        assert!(!api_error_is_transient(&api("authentication_error")));
    }
}
