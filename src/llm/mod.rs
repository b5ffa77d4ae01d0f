//! LLM 层：生成与嵌入两类外部协作方的契约与实现（OpenAI 兼容 / Ollama / Mock）

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{
    create_embedder_from_config, EmbeddingError, EmbeddingProvider, OllamaEmbedder, OpenAiEmbedder,
};
pub use mock::{HashingEmbedder, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{generate_with_timeout, GenerationParams, GenerationRequest, LlmClient, LlmError};
