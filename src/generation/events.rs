//! Turn identifiers, states, and lifecycle events.

use crate::conversation::Message;
use crate::error::ApiError;
use serde::{Deserialize, Serialize};

/// Identifier of one generation turn. Distinct from the id of the message
/// the turn eventually produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(uuid::Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "turn_{}", self.0)
    }
}

/// Turn lifecycle: `Idle → Starting → Streaming → Completed`, or
/// `Starting | Streaming → Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    Starting,
    Streaming,
    Completed,
    Failed,
}

impl TurnState {
    /// A turn is in flight.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Streaming)
    }
}

/// Lifecycle notifications of a generation turn, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Started {
        turn_id: TurnId,
    },
    /// One non-empty fragment, with everything received so far.
    Progress {
        turn_id: TurnId,
        fragment: String,
        content: String,
    },
    Completed {
        turn_id: TurnId,
        message: Message,
    },
    Failed {
        turn_id: TurnId,
        error: ApiError,
    },
}

impl TurnEvent {
    pub fn turn_id(&self) -> TurnId {
        match self {
            Self::Started { turn_id }
            | Self::Progress { turn_id, .. }
            | Self::Completed { turn_id, .. }
            | Self::Failed { turn_id, .. } => *turn_id,
        }
    }
}

/// Receives turn events synchronously, on the task driving the turn.
pub trait TurnObserver: Send + Sync {
    fn on_event(&self, event: &TurnEvent);
}

impl<F> TurnObserver for F
where
    F: Fn(&TurnEvent) + Send + Sync,
{
    fn on_event(&self, event: &TurnEvent) {
        self(event);
    }
}

/// Observer that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TurnObserver for NoopObserver {
    fn on_event(&self, _event: &TurnEvent) {}
}
