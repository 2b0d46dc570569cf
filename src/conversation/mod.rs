//! Ordered conversation history and prompt construction.
//!
//! The store is plain state: appending, reading, clearing, and rendering the
//! prompt for the next assistant turn. It performs no I/O.

pub mod message;
pub mod transcript;

pub use message::{Message, MessageId, MessageMetadata, Role, estimate_tokens};
pub use transcript::{Speaker, TranscriptEntry};

use crate::config::SessionConfig;
use std::sync::{Arc, RwLock};

/// Store shared between the orchestrator and the generation session.
pub type SharedConversation = Arc<RwLock<ConversationStore>>;

/// Insertion-ordered message history.
#[derive(Debug, Default)]
pub struct ConversationStore {
    messages: Vec<Message>,
    epoch: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedConversation {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn append_system(&mut self, text: impl Into<String>) -> Message {
        self.push(Message::new(Role::System, text))
    }

    pub fn append_user(&mut self, text: impl Into<String>) -> Message {
        self.push(Message::new(Role::User, text))
    }

    /// Append a finalized assistant turn.
    pub(crate) fn append_assistant(
        &mut self,
        content: impl Into<String>,
        metadata: MessageMetadata,
    ) -> Message {
        self.push(Message::new(Role::Assistant, content).with_metadata(metadata))
    }

    fn push(&mut self, message: Message) -> Message {
        self.messages.push(message.clone());
        message
    }

    /// Render the prompt for the next assistant turn.
    ///
    /// System messages are not rendered; the configured system prompt leads.
    ///
    /// ```
    /// use vocalis::config::SessionConfig;
    /// use vocalis::conversation::ConversationStore;
    ///
    /// let mut store = ConversationStore::new();
    /// store.append_user("Hello");
    /// let config = SessionConfig { system_prompt: "Be brief.".into(), ..SessionConfig::default() };
    /// assert_eq!(
    ///     store.build_prompt(&config),
    ///     "Be brief.\n\nConversation so far:\nCandidate: Hello\n\nInterviewer:"
    /// );
    /// ```
    pub fn build_prompt(&self, config: &SessionConfig) -> String {
        let turns = self
            .messages
            .iter()
            .filter_map(|m| match m.role {
                Role::User => Some(format!("Candidate: {}", m.content)),
                Role::Assistant => Some(format!("Interviewer: {}", m.content)),
                Role::System => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        format!(
            "{}\n\nConversation so far:\n{turns}\n\nInterviewer:",
            config.system_prompt
        )
    }

    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Bumped whenever the history is discarded wholesale.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.epoch += 1;
    }

    /// Transcript lines for every user and assistant message.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.messages
            .iter()
            .filter_map(TranscriptEntry::from_message)
            .collect()
    }

    /// Replace the history with a system message holding `system_prompt`
    /// followed by `entries`.
    pub fn replace_from_transcript(&mut self, entries: &[TranscriptEntry], system_prompt: &str) {
        self.messages.clear();
        self.messages
            .push(Message::new(Role::System, system_prompt));
        self.messages
            .extend(entries.iter().map(TranscriptEntry::to_message));
        self.epoch += 1;
    }
}
