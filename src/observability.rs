//! Span names shared by the tracing instrumentation.
//!
//! ```text
//! vocalis.generation.turn
//!   └─> vocalis.transport.request
//! vocalis.speech.synthesize
//!   └─> vocalis.transport.request
//! ```

/// One HTTP operation including its retries.
pub const SPAN_TRANSPORT_REQUEST: &str = "vocalis.transport.request";

/// One generation turn.
pub const SPAN_GENERATION_TURN: &str = "vocalis.generation.turn";

/// Speech synthesis for one message.
pub const SPAN_SPEECH_SYNTHESIZE: &str = "vocalis.speech.synthesize";
