//! Transcript view of a conversation, as shown beside the interview.

use super::message::{Message, MessageId, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who spoke a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    Candidate,
    #[serde(rename = "AI Interviewer")]
    AiInterviewer,
}

impl Speaker {
    pub fn label(self) -> &'static str {
        match self {
            Self::Candidate => "Candidate",
            Self::AiInterviewer => "AI Interviewer",
        }
    }

    pub(crate) fn role(self) -> Role {
        match self {
            Self::Candidate => Role::User,
            Self::AiInterviewer => Role::Assistant,
        }
    }
}

/// One transcript line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}

impl TranscriptEntry {
    /// Project a message; system messages have no transcript line.
    pub fn from_message(message: &Message) -> Option<Self> {
        let speaker = match message.role {
            Role::User => Speaker::Candidate,
            Role::Assistant => Speaker::AiInterviewer,
            Role::System => return None,
        };
        Some(Self {
            id: message.id.to_string(),
            speaker,
            text: message.content.clone(),
            timestamp: message.created_at,
            duration_seconds: message.metadata.as_ref().and_then(|m| m.duration_seconds),
        })
    }

    /// Rebuild a message, keeping the entry's id and timestamp.
    pub(crate) fn to_message(&self) -> Message {
        let metadata = self
            .duration_seconds
            .map(|secs| super::message::MessageMetadata {
                model_name: None,
                duration_seconds: Some(secs),
                estimated_tokens: None,
            });
        Message {
            id: MessageId::from_raw(self.id.clone()),
            role: self.speaker.role(),
            content: self.text.clone(),
            created_at: self.timestamp,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_have_no_entry() {
        let message = Message::new(Role::System, "joined");
        assert!(TranscriptEntry::from_message(&message).is_none());
    }

    #[test]
    fn speaker_serializes_display_label() {
        let json = serde_json::to_string(&Speaker::AiInterviewer).unwrap_or_default();
        assert_eq!(json, "\"AI Interviewer\"");
        assert_eq!(Speaker::Candidate.label(), "Candidate");
    }

    #[test]
    fn entry_round_trips_id_and_role() {
        let message = Message::new(Role::User, "Hello");
        let entry = TranscriptEntry::from_message(&message)
            .unwrap_or_else(|| panic!("user message should project"));
        let back = entry.to_message();
        assert_eq!(back.id, message.id);
        assert_eq!(back.role, Role::User);
        assert_eq!(back.content, "Hello");
    }
}
