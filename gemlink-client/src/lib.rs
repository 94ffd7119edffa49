//! Resilient client for the Gemini generative-text API.
//!
//! Pure HTTP client: single-shot generation, streamed generation, and
//! multi-turn chat, with transient-failure retry and timeout enforcement.

mod client;
mod config;
mod error;
mod gemini;
mod retry;
mod transport;
mod types;

pub use client::{GeminiClient, GenerationStream};
pub use config::{DEFAULT_MODEL, GeminiConfig};
pub use error::{GeminiError, Result};
pub use gemini::HttpTransport;
pub use retry::RetryPolicy;
pub use transport::{ChunkStream, GenerateRequest, ProviderResponse, StreamChunk, Transport};
pub use types::{
    GenerateOptions, GenerationResult, HarmBlockThreshold, HarmCategory, Message, ModelInfo, Role,
    SafetySetting, Usage,
};
