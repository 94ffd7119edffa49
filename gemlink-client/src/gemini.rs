//! Gemini REST transport: `generateContent`, `streamGenerateContent`
//! (SSE), and model introspection.

use crate::error::{GeminiError, Result};
use crate::transport::{ChunkStream, GenerateRequest, ProviderResponse, StreamChunk, Transport};
use crate::types::{ModelInfo, Role, SafetySetting, Usage};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl HttpTransport {
    pub fn new(http: reqwest::Client, api_key: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn generate_url(&self, model: &str, stream: bool) -> String {
        if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url, model
            )
        } else {
            format!("{}/models/{}:generateContent", self.base_url, model)
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %req.model))]
    async fn generate(&self, req: &GenerateRequest) -> Result<ProviderResponse> {
        let body = GeminiRequest::from(req);

        let response = self
            .http
            .post(self.generate_url(&req.model, false))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let raw: serde_json::Value = serde_json::from_str(&body)?;
        let parsed: GeminiResponse = serde_json::from_value(raw.clone())?;
        parsed.into_provider_response(raw)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(model = %req.model))]
    async fn generate_stream(&self, req: &GenerateRequest) -> Result<ChunkStream> {
        let body = GeminiRequest::from(req);

        let response = self
            .http
            .post(self.generate_url(&req.model, true))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        // Dropping this stream drops the reqwest response, which aborts the
        // in-flight request.
        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let state = GeminiStreamState::default();

        let stream =
            futures_util::stream::unfold((sse, state), |(mut sse, mut state)| async move {
                loop {
                    if state.finished {
                        return None;
                    }

                    let Some(next) = sse.as_mut().next().await else {
                        state.finished = true;
                        let usage = state.usage.take().unwrap_or_default();
                        let finish_reason = state.finish_reason.take();
                        return Some((
                            Ok(StreamChunk::Done {
                                usage,
                                finish_reason,
                            }),
                            (sse, state),
                        ));
                    };

                    let data = match next {
                        Ok(data) => data,
                        Err(e) => {
                            state.finished = true;
                            return Some((Err(e), (sse, state)));
                        }
                    };

                    let chunk: GeminiResponse = match serde_json::from_str(&data) {
                        Ok(v) => v,
                        Err(e) => {
                            state.finished = true;
                            return Some((
                                Err(GeminiError::StreamParse(format!(
                                    "gemini chunk json error={e} data={data}"
                                ))),
                                (sse, state),
                            ));
                        }
                    };

                    if let Some(u) = chunk.usage_metadata.as_ref() {
                        state.usage = Some(u.into());
                    }
                    if let Some(candidate) = chunk.candidates.first() {
                        if let Some(reason) = candidate.finish_reason.clone() {
                            state.finish_reason = Some(reason);
                        }
                    }

                    let text = chunk.concatenated_text();
                    if !text.is_empty() {
                        return Some((Ok(StreamChunk::Text(text)), (sse, state)));
                    }
                }
            });

        Ok(Box::pin(stream))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(model = %model))]
    async fn get_model(&self, model: &str) -> Result<ModelInfo> {
        let response = self
            .http
            .get(format!("{}/models/{}", self.base_url, model))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let parsed: GeminiModel = serde_json::from_str(&body)?;
        Ok(parsed.into())
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> GeminiError {
    let detail = format!("status={status} body={body}");
    match status.as_u16() {
        401 | 403 => GeminiError::Auth(detail),
        429 => GeminiError::RateLimit(detail),
        400..=499 => GeminiError::InvalidRequest(detail),
        _ => GeminiError::Transient(detail),
    }
}

#[derive(Debug, Default)]
struct GeminiStreamState {
    usage: Option<Usage>,
    finish_reason: Option<String>,
    finished: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

impl From<&GenerateRequest> for GeminiRequest {
    fn from(req: &GenerateRequest) -> Self {
        let contents = req
            .messages
            .iter()
            .map(|m| GeminiContent {
                // The wire calls the assistant role "model".
                role: match m.role {
                    Role::User => "user".to_string(),
                    Role::Assistant => "model".to_string(),
                },
                parts: vec![GeminiPart {
                    text: m.content.clone(),
                }],
            })
            .collect();

        Self {
            contents,
            generation_config: GenerationConfig {
                temperature: req.temperature,
                max_output_tokens: req.max_output_tokens,
            },
            safety_settings: req.safety_settings.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl From<&GeminiUsageMetadata> for Usage {
    fn from(u: &GeminiUsageMetadata) -> Self {
        Self {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }
    }
}

impl GeminiResponse {
    fn concatenated_text(&self) -> String {
        let mut out = String::new();
        if let Some(candidate) = self.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    out.push_str(&part.text);
                }
            }
        }
        out
    }

    fn into_provider_response(self, raw: serde_json::Value) -> Result<ProviderResponse> {
        let text = self.concatenated_text();
        let finish_reason = self
            .candidates
            .first()
            .and_then(|c| c.finish_reason.clone());
        let usage = self
            .usage_metadata
            .as_ref()
            .map(Usage::from)
            .unwrap_or_default();

        Ok(ProviderResponse {
            text,
            usage,
            finish_reason,
            raw,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModel {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_token_limit: Option<u32>,
    #[serde(default)]
    output_token_limit: Option<u32>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    top_k: Option<u32>,
}

impl From<GeminiModel> for ModelInfo {
    fn from(m: GeminiModel) -> Self {
        Self {
            name: m.name,
            display_name: m.display_name,
            description: m.description,
            input_token_limit: m.input_token_limit,
            output_token_limit: m.output_token_limit,
            supported_generation_methods: m.supported_generation_methods,
            temperature: m.temperature,
            top_p: m.top_p,
            top_k: m.top_k,
        }
    }
}

/// Decode an SSE byte stream into the payload of each `data:` event.
/// Gemini streams carry data-only events, no event names.
fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                // Events end at a blank line; servers may frame with LF or
                // CRLF, so take whichever delimiter comes first.
                let lf = buffer.find("\n\n").map(|i| (i, 2));
                let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));
                let delimiter = match (lf, crlf) {
                    (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
                    (a, b) => a.or(b),
                };
                if let Some((idx, len)) = delimiter {
                    let raw = buffer[..idx].to_string();
                    buffer = buffer[idx + len..].to_string();

                    let mut data_lines = Vec::new();
                    for line in raw.lines() {
                        if let Some(rest) = line.trim_end().strip_prefix("data:") {
                            data_lines.push(rest.trim_start().to_string());
                        }
                    }
                    if data_lines.is_empty() {
                        continue;
                    }
                    return Some((Ok(data_lines.join("\n")), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(GeminiError::from(e)), (stream, buffer)));
                    }
                    None => return None,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use futures_util::stream;

    fn request() -> GenerateRequest {
        GenerateRequest {
            model: "gemini-1.5-flash".to_string(),
            messages: vec![
                Message::user("Hi"),
                Message::assistant("Hello!"),
                Message::user("How are you?"),
            ],
            temperature: 0.7,
            max_output_tokens: 256,
            safety_settings: SafetySetting::default_set(),
        }
    }

    #[test]
    fn request_serializes_roles_and_order() {
        let body = serde_json::to_value(GeminiRequest::from(&request())).unwrap();
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(contents[2]["parts"][0]["text"], "How are you?");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn request_serializes_default_safety_settings() {
        let body = serde_json::to_value(GeminiRequest::from(&request())).unwrap();
        let settings = body["safetySettings"].as_array().unwrap();
        assert_eq!(settings.len(), 4);
        assert_eq!(settings[0]["category"], "HARM_CATEGORY_HARASSMENT");
        for setting in settings {
            assert_eq!(setting["threshold"], "BLOCK_MEDIUM_AND_ABOVE");
        }
    }

    #[test]
    fn empty_safety_settings_are_omitted_from_the_body() {
        let mut req = request();
        req.safety_settings.clear();
        let body = serde_json::to_value(GeminiRequest::from(&req)).unwrap();
        assert!(body.get("safetySettings").is_none());
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        use reqwest::StatusCode;
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            GeminiError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, ""),
            GeminiError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            GeminiError::RateLimit(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            GeminiError::InvalidRequest(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, ""),
            GeminiError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            GeminiError::Transient(_)
        ));
    }

    #[test]
    fn response_without_usage_defaults_to_zero() {
        let raw: serde_json::Value = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "ok"}]},
                "finishReason": "STOP"
            }]
        });
        let parsed: GeminiResponse = serde_json::from_value(raw.clone()).unwrap();
        let resp = parsed.into_provider_response(raw).unwrap();
        assert_eq!(resp.text, "ok");
        assert_eq!(resp.usage, Usage::default());
        assert_eq!(resp.finish_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn response_parses_usage_metadata() {
        let raw: serde_json::Value = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "a"}, {"text": "b"}]}
            }],
            "usageMetadata": {
                "promptTokenCount": 3,
                "candidatesTokenCount": 5,
                "totalTokenCount": 8
            }
        });
        let parsed: GeminiResponse = serde_json::from_value(raw.clone()).unwrap();
        let resp = parsed.into_provider_response(raw).unwrap();
        assert_eq!(resp.text, "ab");
        assert_eq!(resp.usage.prompt_tokens, 3);
        assert_eq!(resp.usage.completion_tokens, 5);
        assert_eq!(resp.usage.total_tokens, 8);
    }

    #[tokio::test]
    async fn sse_decoder_splits_data_events() {
        let frames: Vec<std::result::Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"a\":1}\n\ndata: {\"b\"")),
            Ok(Bytes::from_static(b":2}\n\n")),
        ];
        let decoded: Vec<_> = decode_sse(stream::iter(frames)).collect().await;
        let payloads: Vec<String> = decoded.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(payloads, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[tokio::test]
    async fn sse_decoder_handles_crlf_framing() {
        let frames: Vec<std::result::Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"data: one\r\n\r\nda")),
            Ok(Bytes::from_static(b"ta: two\r\n\r\n")),
        ];
        let decoded: Vec<_> = decode_sse(stream::iter(frames)).collect().await;
        let payloads: Vec<String> = decoded.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(payloads, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn sse_decoder_skips_comment_only_events() {
        let frames: Vec<std::result::Result<Bytes, reqwest::Error>> =
            vec![Ok(Bytes::from_static(b": keepalive\n\ndata: x\n\n"))];
        let decoded: Vec<_> = decode_sse(stream::iter(frames)).collect().await;
        let payloads: Vec<String> = decoded.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(payloads, vec!["x"]);
    }
}
