//! Conversation messages and their identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique message identifier, `msg_{millis}_{seq}`.
///
/// Ids generated by one thread sort lexically in creation order: the
/// millisecond part never goes backwards and the sequence always grows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Allocate a fresh id.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_millis();
        let millis = LAST_MILLIS.fetch_max(now, Ordering::SeqCst).max(now);
        let seq = SEQUENCE.fetch_add(1, Ordering::SeqCst);
        Self(format!("msg_{millis:013}_{seq:06}"))
    }

    /// Wrap an existing id, e.g. one imported from a transcript.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Generation statistics attached to assistant messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub model_name: Option<String>,
    /// Wall-clock generation time, rounded to whole seconds.
    pub duration_seconds: Option<u64>,
    /// Rough size of the content, see [`estimate_tokens`]. Display only.
    pub estimated_tokens: Option<u32>,
}

/// One finalized conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// Token count heuristic: characters divided by four, rounded up.
///
/// Not a tokenizer; only suitable for display.
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
}
