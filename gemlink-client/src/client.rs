use crate::config::GeminiConfig;
use crate::error::{GeminiError, Result};
use crate::gemini::HttpTransport;
use crate::retry::RetryPolicy;
use crate::transport::{ChunkStream, GenerateRequest, ProviderResponse, StreamChunk, Transport};
use crate::types::{GenerateOptions, GenerationResult, Message, ModelInfo, Usage};
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Stateless client for the Gemini generative-text API. Every call builds
/// its request from the arguments plus the immutable configuration; nothing
/// is retained between calls, so one client can serve many concurrent
/// logical calls.
#[derive(Clone)]
pub struct GeminiClient {
    config: Arc<GeminiConfig>,
    transport: Arc<dyn Transport>,
}

impl GeminiClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(config: GeminiConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        let transport = Arc::new(HttpTransport::new(http, &config.api_key));
        Self::with_transport(config, transport)
    }

    /// Build a client over a custom transport; used with stub transports in
    /// tests and for alternative wire implementations.
    pub fn with_transport(config: GeminiConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            transport,
        })
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    /// Single-shot generation from one prompt.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn generate(
        &self,
        prompt: &str,
        opts: GenerateOptions,
    ) -> Result<GenerationResult> {
        if prompt.trim().is_empty() {
            return Err(GeminiError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        let req = self.shape_request(vec![Message::user(prompt)], &opts);
        self.run_generate(req, opts.cancel.as_ref()).await
    }

    /// One chat turn over the caller-owned history. Roles and ordering are
    /// forwarded exactly as supplied; the returned text is the new
    /// assistant turn, which the caller appends for the next call.
    #[tracing::instrument(level = "info", skip_all, fields(turns = messages.len()))]
    pub async fn chat(
        &self,
        messages: &[Message],
        opts: GenerateOptions,
    ) -> Result<GenerationResult> {
        if messages.is_empty() {
            return Err(GeminiError::InvalidRequest(
                "conversation must contain at least one message".to_string(),
            ));
        }
        let req = self.shape_request(messages.to_vec(), &opts);
        self.run_generate(req, opts.cancel.as_ref()).await
    }

    /// Streaming generation. The call is retried like `generate` until the
    /// first chunk has been yielded; after that, a failure terminates the
    /// stream with an error instead of restarting it, since a restart would
    /// duplicate output the caller has already observed. Dropping the
    /// stream abandons the in-flight request.
    #[tracing::instrument(level = "info", skip_all)]
    pub fn generate_stream(
        &self,
        prompt: &str,
        opts: GenerateOptions,
    ) -> Result<GenerationStream> {
        if prompt.trim().is_empty() {
            return Err(GeminiError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        let req = self.shape_request(vec![Message::user(prompt)], &opts);
        let inner = retry_stream(StreamState {
            transport: self.transport.clone(),
            req,
            policy: self.config.retry.clone(),
            cancel: opts.cancel,
            inner: None,
            attempt: 0,
            delivered: false,
            finished: false,
        });
        Ok(GenerationStream {
            inner: Box::pin(inner),
            usage: None,
            finish_reason: None,
        })
    }

    /// Cheap connectivity check. Reduces any outcome to a boolean; terminal
    /// errors (bad credential, bad model) yield `false` rather than
    /// propagating.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn validate_connection(&self) -> bool {
        let req = GenerateRequest {
            model: self.config.model.clone(),
            messages: vec![Message::user("ping")],
            temperature: 0.0,
            max_output_tokens: 1,
            safety_settings: self.config.safety_settings.clone(),
        };
        match self.run_generate(req, None).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "connection validation failed");
                false
            }
        }
    }

    /// Model metadata for the configured model. Unlike
    /// `validate_connection` this propagates classified errors, since the
    /// caller explicitly asked for the data.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn get_model_info(&self) -> Result<ModelInfo> {
        let transport = self.transport.clone();
        let model = self.config.model.clone();
        self.config
            .retry
            .run(None, || {
                let transport = transport.clone();
                let model = model.clone();
                async move { transport.get_model(&model).await }
            })
            .await
    }

    fn shape_request(&self, messages: Vec<Message>, opts: &GenerateOptions) -> GenerateRequest {
        GenerateRequest {
            model: self.config.model.clone(),
            messages,
            temperature: opts.temperature.unwrap_or(self.config.temperature),
            max_output_tokens: opts
                .max_output_tokens
                .unwrap_or(self.config.max_output_tokens),
            safety_settings: self.config.safety_settings.clone(),
        }
    }

    async fn run_generate(
        &self,
        req: GenerateRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<GenerationResult> {
        let transport = self.transport.clone();
        let resp = self
            .config
            .retry
            .run(cancel, || {
                let transport = transport.clone();
                let req = req.clone();
                async move { transport.generate(&req).await }
            })
            .await?;
        Ok(into_generation_result(resp))
    }
}

fn into_generation_result(resp: ProviderResponse) -> GenerationResult {
    let mut metadata = resp.raw;
    if let Some(obj) = metadata.as_object_mut() {
        obj.insert(
            "timestamp".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );
    }
    GenerationResult {
        text: resp.text,
        usage: resp.usage,
        finish_reason: resp.finish_reason,
        metadata,
    }
}

/// Ordered, finite, non-restartable sequence of text chunks for one
/// streaming session. Usage and finish reason become available once the
/// provider signals completion.
pub struct GenerationStream {
    inner: Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl GenerationStream {
    /// Provider token accounting; `None` until the stream has completed.
    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }
}

impl Stream for GenerationStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(StreamChunk::Text(text)))) => Poll::Ready(Some(Ok(text))),
            Poll::Ready(Some(Ok(StreamChunk::Done {
                usage,
                finish_reason,
            }))) => {
                this.usage = Some(usage);
                this.finish_reason = finish_reason;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct StreamState {
    transport: Arc<dyn Transport>,
    req: GenerateRequest,
    policy: RetryPolicy,
    cancel: Option<CancellationToken>,
    inner: Option<ChunkStream>,
    /// Establishment count for this logical call.
    attempt: u32,
    /// Set once the caller has observed a text chunk; from then on failures
    /// terminate instead of retrying.
    delivered: bool,
    finished: bool,
}

enum NextOutcome {
    Item(Option<Result<StreamChunk>>),
    Cancelled,
}

impl StreamState {
    /// Returns the item to emit when the failure is not retried; `None`
    /// means the backoff completed and the call should be re-attempted.
    async fn handle_failure(&mut self, e: GeminiError) -> Option<Result<StreamChunk>> {
        if self.delivered || !e.is_retryable() {
            self.finished = true;
            return Some(Err(e));
        }
        if self.attempt > self.policy.attempts {
            self.finished = true;
            return Some(Err(GeminiError::RetryExhausted {
                attempts: self.attempt,
                source: Box::new(e),
            }));
        }
        tracing::warn!(attempt = self.attempt, error = %e, "stream attempt failed before first chunk");
        let delay = self.policy.delay_for(self.attempt - 1);
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.finished = true;
                    return Some(Err(GeminiError::Cancelled));
                }
                _ = sleep(delay) => {}
            },
            None => sleep(delay).await,
        }
        None
    }
}

fn retry_stream(state: StreamState) -> impl Stream<Item = Result<StreamChunk>> + Send {
    futures_util::stream::unfold(state, |mut s| async move {
        loop {
            if s.finished {
                return None;
            }
            let cancel = s.cancel.clone();

            if s.inner.is_none() {
                s.attempt += 1;
                let established = match &cancel {
                    Some(token) => tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(GeminiError::Cancelled),
                        r = s.transport.generate_stream(&s.req) => r,
                    },
                    None => s.transport.generate_stream(&s.req).await,
                };
                match established {
                    Ok(inner) => s.inner = Some(inner),
                    Err(GeminiError::Cancelled) => {
                        s.finished = true;
                        return Some((Err(GeminiError::Cancelled), s));
                    }
                    Err(e) => {
                        if let Some(item) = s.handle_failure(e).await {
                            return Some((item, s));
                        }
                        continue;
                    }
                }
            }

            let Some(mut inner) = s.inner.take() else {
                continue;
            };
            let outcome = match &cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => NextOutcome::Cancelled,
                    n = inner.next() => NextOutcome::Item(n),
                },
                None => NextOutcome::Item(inner.next().await),
            };

            match outcome {
                NextOutcome::Cancelled => {
                    s.finished = true;
                    return Some((Err(GeminiError::Cancelled), s));
                }
                NextOutcome::Item(Some(Ok(StreamChunk::Text(text)))) => {
                    s.delivered = true;
                    s.inner = Some(inner);
                    return Some((Ok(StreamChunk::Text(text)), s));
                }
                NextOutcome::Item(Some(Ok(done @ StreamChunk::Done { .. }))) => {
                    s.finished = true;
                    return Some((Ok(done), s));
                }
                NextOutcome::Item(Some(Err(e))) => {
                    if let Some(item) = s.handle_failure(e).await {
                        return Some((item, s));
                    }
                }
                NextOutcome::Item(None) => {
                    // Transport ended without a Done marker; treat as done.
                    s.finished = true;
                    return None;
                }
            }
        }
    })
}
