//! Vocalis: streaming chat and voice core for AI-led interviews.
//!
//! A candidate's turn flows through:
//! Conversation store → prompt → streaming generation → assistant message → speech
//!
//! # Architecture
//!
//! - **Transport**: HTTP client for the generation and speech backends, with
//!   per-attempt timeouts, exponential backoff, and SSE/NDJSON stream framing
//! - **Conversation**: ordered message history and the transcript view
//! - **Generation**: one streamed turn at a time, with progress events
//! - **Speech**: per-message synthesis cache and exclusive audio playback
//! - **Orchestrator**: the single surface a UI drives

pub mod config;
pub mod conversation;
pub mod error;
pub mod generation;
pub mod observability;
pub mod orchestrator;
pub mod speech;
pub mod transport;

pub use config::{AppConfig, SessionConfig, SessionConfigUpdate, SpeechSettings};
pub use conversation::{Message, MessageId, Role, Speaker, TranscriptEntry};
pub use error::{ApiError, Result};
pub use generation::{TurnEvent, TurnId, TurnState};
pub use orchestrator::{ChatEvent, ChatOrchestrator, ChatSnapshot, StreamingTurn};
pub use speech::{PlaybackStatus, SpeechEvent};
pub use transport::{GenerationBackend, HttpTransport, SpeechSynthesisClient};
