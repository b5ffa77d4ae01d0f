//! 嵌入协作方：文本 -> 固定维度向量
//!
//! 提供 OpenAI 兼容 /embeddings（async-openai）与 Ollama /api/embeddings（reqwest）两种后端。
//! 内核不在这里重试：失败原样上报给 MemoryStore，由调用方决定是否重试。

use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EmbeddingSection;
use crate::core::{require_timeout, ConfigError, ErrorKind};
use crate::llm::openai::api_error_is_transient;

/// 嵌入失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding transport error: {0}")]
    Transport(String),

    #[error("malformed embedding response: {0}")]
    Malformed(String),

    /// 服务端拒绝了请求本身
    #[error("embedding request rejected: {0}")]
    Rejected(String),
}

impl EmbeddingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmbeddingError::Timeout(_) | EmbeddingError::Transport(_) => {
                ErrorKind::TransientCollaborator
            }
            EmbeddingError::Malformed(_) => ErrorKind::DataIntegrity,
            EmbeddingError::Rejected(_) => ErrorKind::LogicalFailure,
        }
    }
}

/// 嵌入提供方
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAiEmbedder {
    /// 与 LLM 共用 OPENAI_API_KEY / base_url
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, timeout: Duration) -> Self {
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
            timeout,
        }
    }

    async fn request(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(map_openai_error)?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(map_openai_error)?;
        response
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| EmbeddingError::Malformed("no embedding in response".to_string()))
    }
}

fn map_openai_error(err: OpenAIError) -> EmbeddingError {
    match err {
        OpenAIError::ApiError(api) if api_error_is_transient(&api) => {
            EmbeddingError::Transport(format!("api error: {}", api.message))
        }
        OpenAIError::ApiError(api) => EmbeddingError::Rejected(api.message),
        OpenAIError::InvalidArgument(message) => EmbeddingError::Rejected(message),
        other => EmbeddingError::Transport(other.to_string()),
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        match tokio::time::timeout(self.timeout, self.request(text)).await {
            Ok(result) => result,
            Err(_) => Err(EmbeddingError::Timeout(self.timeout)),
        }
    }
}

#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Ollama 本地嵌入：POST {base_url}/api/embeddings
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&OllamaEmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbeddingError::Timeout(self.timeout)
                } else {
                    EmbeddingError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(EmbeddingError::Transport(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(EmbeddingError::Rejected(format!("HTTP {}", status.as_u16())));
        }

        let body: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Malformed(e.to_string()))?;
        if body.embedding.is_empty() {
            return Err(EmbeddingError::Malformed("empty embedding".to_string()));
        }
        Ok(body.embedding)
    }
}

/// 从 [embedding] 配置段创建嵌入提供方
pub fn create_embedder_from_config(
    section: &EmbeddingSection,
) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
    let timeout = require_timeout(
        "embedding.timeout_secs",
        Duration::from_secs(section.timeout_secs),
    )?;
    match section.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(
            section.base_url.as_deref(),
            &section.model,
            None,
            timeout,
        ))),
        "ollama" => {
            let base_url = section
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string());
            Ok(Arc::new(OllamaEmbedder::new(base_url, &section.model, timeout)))
        }
        other => Err(ConfigError::invalid(
            "embedding.provider",
            format!("unknown provider `{other}` (expected openai or ollama)"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_ollama_embedder_parses_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_partial_json(json!({"model": "mxbai-embed-large"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.1, 0.2, 0.3]})),
            )
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(server.uri(), "mxbai-embed-large", Duration::from_secs(2));
        let vector = embedder.embed("hello").await.unwrap();
        assert_eq!(vector.len(), 3);
    }

    #[tokio::test]
    async fn test_ollama_embedder_maps_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(server.uri(), "m", Duration::from_secs(2));
        let err = embedder.embed("hello").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientCollaborator);
    }

    #[tokio::test]
    async fn test_ollama_embedder_client_error_is_final() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(server.uri(), "missing-model", Duration::from_secs(2));
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Rejected(_)));
        assert_eq!(err.kind(), ErrorKind::LogicalFailure);
    }

    #[tokio::test]
    async fn test_openai_embedder_rejection_is_not_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {
                    "message": "invalid api key",
                    "type": "authentication_error",
                    "param": null,
                    "code": "invalid_api_key"
                }
            })))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::new(
            Some(server.uri().as_str()),
            "text-embedding-3-small",
            Some("sk-bad"),
            Duration::from_secs(5),
        );
        let err = embedder.embed("hello").await.unwrap_err();
        assert_eq!(err, EmbeddingError::Rejected("invalid api key".to_string()));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let section = EmbeddingSection {
            provider: "word2vec".to_string(),
            ..Default::default()
        };
        assert!(create_embedder_from_config(&section).is_err());
    }

    #[test]
    fn test_zero_timeout_is_config_error() {
        let section = EmbeddingSection {
            timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            create_embedder_from_config(&section),
            Err(ConfigError::ZeroTimeout(_))
        ));
    }
}
