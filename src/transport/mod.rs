//! HTTP transport for the generation and speech backends.
//!
//! Every operation applies a per-attempt timeout and retries transient
//! failures with exponential backoff (see [`retry::RetryPolicy`]). Streamed
//! generation hands each decoded chunk to the caller as soon as it arrives.
//!
//! The rest of the crate depends on the [`GenerationBackend`] and
//! [`SpeechSynthesisClient`] traits, both implemented by [`HttpTransport`].

pub mod retry;
pub mod sse;
pub mod types;

use crate::config::BackendConfig;
use crate::error::{ApiError, Result};
use crate::observability::SPAN_TRANSPORT_REQUEST;
use async_trait::async_trait;
use futures_util::StreamExt;
use retry::RetryPolicy;
use sse::ChunkFraming;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};
use types::{
    AudioClip, GenerateChunk, GenerateRequest, ModelInfo, ModelsResponse, SpeechProgress,
    TtsRequest,
};

pub const GENERATE_PATH: &str = "generate/";
pub const MODELS_PATH: &str = "models/";
pub const TTS_PATH: &str = "tts/";

/// Callback receiving each generation chunk in arrival order.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&GenerateChunk) + Send);

/// Callback receiving speech download progress.
pub type ProgressSink<'a> = &'a (dyn Fn(SpeechProgress) + Send + Sync);

/// Source of generated text.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Run one generation request, calling `on_chunk` for every chunk up to
    /// and including the terminal one, which is also returned.
    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
        on_chunk: ChunkSink<'_>,
    ) -> Result<GenerateChunk>;

    /// Whether the backend is reachable.
    async fn health_check(&self) -> bool {
        true
    }

    /// Models the backend can serve.
    async fn list_models(&self, _cancel: &CancellationToken) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}

/// Source of synthesized speech.
#[async_trait]
pub trait SpeechSynthesisClient: Send + Sync {
    async fn synthesize(&self, request: &TtsRequest) -> Result<AudioClip>;
}

/// reqwest-backed client for the interview backend.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    health_timeout: Duration,
    retry: RetryPolicy,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns [`ApiError::Config`] when the HTTP client cannot be built.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ApiError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            timeout: Duration::from_millis(config.timeout_ms),
            health_timeout: Duration::from_millis(config.health_timeout_ms),
            retry: RetryPolicy::from_backend(config),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Generate text, streaming chunks to `on_chunk`.
    ///
    /// A streamed attempt that fails after delivering at least one chunk is
    /// not retried.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the last attempt.
    pub async fn generate_with(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
        on_chunk: ChunkSink<'_>,
    ) -> Result<GenerateChunk> {
        let url = self.endpoint(GENERATE_PATH);
        let span = info_span!(SPAN_TRANSPORT_REQUEST, endpoint = GENERATE_PATH, model = %request.model);
        let delivered = AtomicBool::new(false);
        let sink = Mutex::new(on_chunk);
        let (url, delivered, sink) = (&url, &delivered, &sink);
        self.retry
            .run_while(
                cancel,
                GENERATE_PATH,
                |err| {
                    if delivered.load(Ordering::SeqCst) {
                        warn!(error = %err, "generation failed after output was delivered");
                        return false;
                    }
                    err.is_retryable()
                },
                move |_| self.generate_attempt(url, request, delivered, sink),
            )
            .instrument(span)
            .await
    }

    async fn generate_attempt(
        &self,
        url: &str,
        request: &GenerateRequest,
        delivered: &AtomicBool,
        sink: &Mutex<ChunkSink<'_>>,
    ) -> Result<GenerateChunk> {
        let response = self.send(self.client.post(url).json(request)).await?;

        if !request.stream {
            let chunk: GenerateChunk = self.read_json(response).await?;
            let chunk = into_healthy(chunk)?;
            deliver(delivered, sink, &chunk);
            return Ok(chunk);
        }

        let content_type = header_str(&response, reqwest::header::CONTENT_TYPE);
        let mut framing = ChunkFraming::for_content_type(content_type.as_deref());
        let mut body = response.bytes_stream();
        loop {
            let read = tokio::time::timeout(self.timeout, body.next())
                .await
                .map_err(|_| ApiError::timeout(self.timeout))?;
            let (payloads, ended) = match read {
                Some(Ok(bytes)) => (framing.push(&bytes), false),
                Some(Err(e)) => return Err(ApiError::from_reqwest(&e)),
                None => (framing.flush().into_iter().collect(), true),
            };
            for payload in payloads {
                let chunk = match serde_json::from_str::<GenerateChunk>(&payload) {
                    Ok(chunk) => into_healthy(chunk)?,
                    Err(e) => {
                        warn!(error = %e, "skipping undecodable stream payload");
                        continue;
                    }
                };
                debug!(bytes = chunk.response.len(), done = chunk.done, "chunk received");
                deliver(delivered, sink, &chunk);
                if chunk.done {
                    return Ok(chunk);
                }
            }
            if ended {
                return Err(ApiError::invalid_response(
                    "stream ended before the final chunk",
                ));
            }
        }
    }

    /// List the models the backend can serve.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the last attempt.
    pub async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<ModelInfo>> {
        let url = self.endpoint(MODELS_PATH);
        let span = info_span!(SPAN_TRANSPORT_REQUEST, endpoint = MODELS_PATH);
        self.retry
            .run(cancel, MODELS_PATH, move |_| {
                let url = url.clone();
                async move {
                    let response = self.send(self.client.get(&url)).await?;
                    let models: ModelsResponse = self.read_json(response).await?;
                    Ok(models.models)
                }
            })
            .instrument(span)
            .await
    }

    /// Probe the model listing once within the health timeout.
    pub async fn health_check(&self) -> bool {
        let url = self.endpoint(MODELS_PATH);
        match tokio::time::timeout(self.health_timeout, self.client.get(&url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => true,
            Ok(Ok(response)) => {
                debug!(status = response.status().as_u16(), "health check failed");
                false
            }
            Ok(Err(e)) => {
                debug!(error = %e, "health check unreachable");
                false
            }
            Err(_) => {
                debug!(
                    timeout_ms = self.health_timeout.as_millis() as u64,
                    "health check timed out"
                );
                false
            }
        }
    }

    /// Synthesize speech, optionally reporting download progress.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the last attempt.
    pub async fn synthesize_speech(
        &self,
        request: &TtsRequest,
        cancel: &CancellationToken,
        on_progress: Option<ProgressSink<'_>>,
    ) -> Result<AudioClip> {
        if request.text.trim().is_empty() {
            return Err(ApiError::InvalidRequest(
                "speech text must not be empty".to_owned(),
            ));
        }
        let url = self.endpoint(TTS_PATH);
        let span = info_span!(SPAN_TRANSPORT_REQUEST, endpoint = TTS_PATH, chars = request.text.chars().count());
        self.retry
            .run(cancel, TTS_PATH, move |_| {
                let url = url.clone();
                async move { self.speech_attempt(&url, request, on_progress).await }
            })
            .instrument(span)
            .await
    }

    async fn speech_attempt(
        &self,
        url: &str,
        request: &TtsRequest,
        on_progress: Option<ProgressSink<'_>>,
    ) -> Result<AudioClip> {
        let response = self.send(self.client.post(url).json(request)).await?;
        let content_type = header_str(&response, reqwest::header::CONTENT_TYPE);
        let total = response.content_length();
        let mut data = Vec::with_capacity(total.unwrap_or(0).min(16 * 1024 * 1024) as usize);
        let mut body = response.bytes_stream();
        loop {
            let read = tokio::time::timeout(self.timeout, body.next())
                .await
                .map_err(|_| ApiError::timeout(self.timeout))?;
            match read {
                Some(Ok(bytes)) => {
                    data.extend_from_slice(&bytes);
                    if let Some(report) = on_progress {
                        report(SpeechProgress {
                            loaded: data.len() as u64,
                            total,
                        });
                    }
                }
                Some(Err(e)) => return Err(ApiError::from_reqwest(&e)),
                None => break,
            }
        }
        if data.is_empty() {
            return Err(ApiError::invalid_response("speech backend returned no audio"));
        }
        Ok(AudioClip::new(data, content_type))
    }

    /// Send with the per-attempt timeout and map non-success statuses.
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let started = Instant::now();
        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| ApiError::timeout(started.elapsed()))?
            .map_err(|e| ApiError::from_reqwest(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = tokio::time::timeout(self.timeout, response.text())
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
        Err(ApiError::from_status(status.as_u16(), &body))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let bytes = tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| ApiError::timeout(self.timeout))?
            .map_err(|e| ApiError::from_reqwest(&e))?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::invalid_response(e.to_string()))
    }
}

/// Hand `chunk` to the caller. From here on the attempt is not retried.
fn deliver(delivered: &AtomicBool, sink: &Mutex<ChunkSink<'_>>, chunk: &GenerateChunk) {
    delivered.store(true, Ordering::SeqCst);
    let mut on_chunk = sink.lock().unwrap_or_else(|e| e.into_inner());
    (*on_chunk)(chunk);
}

fn into_healthy(chunk: GenerateChunk) -> Result<GenerateChunk> {
    match chunk.error {
        Some(error) => Err(ApiError::stream(error)),
        None => Ok(chunk),
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[async_trait]
impl GenerationBackend for HttpTransport {
    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
        on_chunk: ChunkSink<'_>,
    ) -> Result<GenerateChunk> {
        self.generate_with(request, cancel, on_chunk).await
    }

    async fn health_check(&self) -> bool {
        HttpTransport::health_check(self).await
    }

    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<ModelInfo>> {
        HttpTransport::list_models(self, cancel).await
    }
}

#[async_trait]
impl SpeechSynthesisClient for HttpTransport {
    async fn synthesize(&self, request: &TtsRequest) -> Result<AudioClip> {
        self.synthesize_speech(request, &CancellationToken::new(), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(base: &str) -> HttpTransport {
        let config = BackendConfig {
            base_url: base.to_owned(),
            ..BackendConfig::default()
        };
        HttpTransport::new(&config).unwrap_or_else(|e| panic!("build failed: {e}"))
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let t = transport("http://localhost:8000/api/");
        assert_eq!(t.endpoint(GENERATE_PATH), "http://localhost:8000/api/generate/");
        assert_eq!(t.endpoint("/models/"), "http://localhost:8000/api/models/");
    }

    #[test]
    fn retry_policy_follows_config() {
        let t = transport("http://localhost:8000/api");
        assert_eq!(t.retry_policy().max_attempts, 3);
        assert_eq!(t.retry_policy().base_delay, Duration::from_millis(1000));
    }

    #[test]
    fn error_chunk_is_stream_failure() {
        let chunk = GenerateChunk {
            error: Some("out of memory".into()),
            ..GenerateChunk::default()
        };
        let err = into_healthy(chunk).err();
        assert_eq!(err.map(|e| e.code()), Some("STREAM_FAILED"));
    }

    #[tokio::test]
    async fn blank_speech_text_is_rejected_without_request() {
        let t = transport("http://127.0.0.1:9");
        let request = TtsRequest {
            text: "   ".into(),
            lang: "en".into(),
            tld: "com".into(),
            slow: false,
        };
        let err = t
            .synthesize_speech(&request, &CancellationToken::new(), None)
            .await
            .err();
        assert_eq!(err.map(|e| e.code()), Some("INVALID_REQUEST"));
    }
}
