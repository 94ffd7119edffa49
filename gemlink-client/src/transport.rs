use crate::error::Result;
use crate::types::{Message, ModelInfo, SafetySetting, Usage};
use futures_util::Stream;
use std::pin::Pin;

/// One fully-shaped generation request, ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub safety_settings: Vec<SafetySetting>,
}

/// Parsed non-streaming provider response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: Option<String>,
    /// Raw response body, passed through to the caller untouched.
    pub raw: serde_json::Value,
}

/// One element of a streaming session, in provider-emission order.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Done {
        usage: Usage,
        finish_reason: Option<String>,
    },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Seam between the request shapers and the provider wire. Implementations
/// classify failures into the retryable/terminal taxonomy in `error.rs`;
/// the retry engine relies on that classification.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn generate(&self, req: &GenerateRequest) -> Result<ProviderResponse>;

    /// Dropping the returned stream must abandon the in-flight request.
    async fn generate_stream(&self, req: &GenerateRequest) -> Result<ChunkStream>;

    async fn get_model(&self, model: &str) -> Result<ModelInfo>;
}
