use std::time::Duration;

/// Who authored a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
}

/// One entry in a session's conversation history.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    /// Duration of the spoken utterance this turn was transcribed from,
    /// if it came from audio.
    pub utterance: Option<Duration>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>, utterance: Option<Duration>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            utterance,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            utterance: None,
        }
    }
}

/// Append-only conversation history scoped to one session.
///
/// Turns are never reordered or deleted while the session lives; the log is
/// handed to the dialogue model as-is on every reply.
#[derive(Debug, Default)]
pub struct ConversationLog {
    turns: Vec<ConversationTurn>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
