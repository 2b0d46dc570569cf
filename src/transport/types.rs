//! Wire types for the generation and speech backends.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Body of `POST /generate/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    pub options: GenerateOptions,
}

/// Sampling options forwarded to the model runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub num_predict: u32,
}

/// One generation chunk. A non-streaming response is a single chunk with
/// `done` set and the full text in `response`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateChunk {
    pub model: String,
    pub created_at: Option<String>,
    /// Text fragment carried by this chunk.
    pub response: String,
    /// Set on the terminal chunk.
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u32>,
    /// Backend-reported failure; never set on a healthy chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerateChunk {
    /// A mid-stream fragment.
    pub fn fragment(text: impl Into<String>) -> Self {
        Self {
            response: text.into(),
            ..Self::default()
        }
    }

    /// The terminal fragment.
    pub fn last(text: impl Into<String>) -> Self {
        Self {
            response: text.into(),
            done: true,
            ..Self::default()
        }
    }
}

/// Body of `POST /tts/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    pub lang: String,
    pub tld: String,
    pub slow: bool,
}

/// Entry of `GET /models/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelsResponse {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

/// Download progress of a speech payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechProgress {
    pub loaded: u64,
    /// From `Content-Length`, when the backend sends it.
    pub total: Option<u64>,
}

impl SpeechProgress {
    /// Percentage loaded, or `None` without a known total.
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.loaded as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }
}

/// Synthesized audio exactly as the backend returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub data: Bytes,
    pub content_type: Option<String>,
}

impl AudioClip {
    pub fn new(data: impl Into<Bytes>, content_type: Option<String>) -> Self {
        Self {
            data: data.into(),
            content_type,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// File extension matching the content type, `mp3` by default.
    pub fn extension(&self) -> &'static str {
        match self.content_type.as_deref() {
            Some(ct) if ct.contains("wav") => "wav",
            Some(ct) if ct.contains("ogg") => "ogg",
            Some(ct) if ct.contains("webm") => "webm",
            _ => "mp3",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_decodes_with_missing_fields() {
        let chunk: GenerateChunk =
            serde_json::from_str(r#"{"model":"m","response":"Hi","done":false}"#)
                .unwrap_or_else(|e| panic!("decode failed: {e}"));
        assert_eq!(chunk.response, "Hi");
        assert!(!chunk.done);
        assert!(chunk.error.is_none());
    }

    #[test]
    fn chunk_decodes_error_payload() {
        let chunk: GenerateChunk = serde_json::from_str(r#"{"error":"model crashed"}"#)
            .unwrap_or_else(|e| panic!("decode failed: {e}"));
        assert_eq!(chunk.error.as_deref(), Some("model crashed"));
    }

    #[test]
    fn request_serializes_options() {
        let req = GenerateRequest {
            model: "test-model".into(),
            prompt: "p".into(),
            stream: true,
            options: GenerateOptions {
                temperature: 0.5,
                num_predict: 300,
            },
        };
        let value = serde_json::to_value(&req).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(value["options"]["num_predict"], 300);
        assert_eq!(value["stream"], true);
    }

    #[test]
    fn progress_percent() {
        let known = SpeechProgress {
            loaded: 50,
            total: Some(200),
        };
        assert_eq!(known.percent(), Some(25.0));
        let unknown = SpeechProgress {
            loaded: 50,
            total: None,
        };
        assert!(unknown.percent().is_none());
    }

    #[test]
    fn clip_extension_follows_content_type() {
        assert_eq!(AudioClip::new(vec![1u8], None).extension(), "mp3");
        assert_eq!(
            AudioClip::new(vec![1u8], Some("audio/wav".into())).extension(),
            "wav"
        );
    }
}
