//! Client-facing WebSocket protocol.
//!
//! The duplex channel carries binary frames (audio both ways) and JSON text
//! messages discriminated by `type`. Both directions are closed enums so a
//! protocol change shows up as a compile error at every match site.

use verba_core::Role;

/// Close code for a connection whose token resolved to no student profile.
pub const CLOSE_MISSING_CREDENTIALS: u16 = 4401;
/// Graceful pause: normal closure plus a reason the client recognizes, so it
/// can reconnect with the lesson correlation id.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_REASON_PAUSED: &str = "lesson paused";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LessonEvent {
    Start,
    Pause,
    End,
}

/// Structured messages the client sends.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Initial capture parameters. Must arrive before audio is interpreted.
    #[serde(rename = "config")]
    Config {
        sample_rate: u32,
        channels: u16,
        /// Container/codec of the binary frames, e.g. "webm" or "ogg".
        codec: String,
    },

    /// Lesson lifecycle signals.
    #[serde(rename = "system_event")]
    SystemEvent { event: LessonEvent },
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemLevel {
    Info,
    Warning,
    Error,
}

/// Structured messages the server sends.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "transcript")]
    Transcript {
        role: Role,
        text: String,
        #[serde(rename = "final", skip_serializing_if = "Option::is_none")]
        is_final: Option<bool>,
    },

    #[serde(rename = "system")]
    System {
        level: SystemLevel,
        message: String,
    },

    /// Session correlation id, issued once at start; the client presents it
    /// when reconnecting after a pause.
    #[serde(rename = "lesson_info")]
    LessonInfo { lesson_id: String },
}

impl ServerMessage {
    pub fn transcript(role: Role, text: impl Into<String>, is_final: bool) -> Self {
        ServerMessage::Transcript {
            role,
            text: text.into(),
            is_final: Some(is_final),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        ServerMessage::System {
            level: SystemLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        ServerMessage::System {
            level: SystemLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::System {
            level: SystemLevel::Error,
            message: message.into(),
        }
    }
}

/// Everything the outbound socket pump can be asked to deliver.
#[derive(Debug)]
pub enum Outbound {
    /// Playable audio, sent as a binary frame.
    Audio(Vec<u8>),
    Message(ServerMessage),
    /// Close the connection with the given code and reason, then stop.
    Close { code: u16, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_round_trips() {
        let raw = r#"{"type":"config","sample_rate":48000,"channels":1,"codec":"webm"}"#;
        match serde_json::from_str::<ClientMessage>(raw).unwrap() {
            ClientMessage::Config {
                sample_rate,
                channels,
                codec,
            } => {
                assert_eq!(sample_rate, 48000);
                assert_eq!(channels, 1);
                assert_eq!(codec, "webm");
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn system_event_uses_lowercase_names() {
        let raw = r#"{"type":"system_event","event":"pause"}"#;
        match serde_json::from_str::<ClientMessage>(raw).unwrap() {
            ClientMessage::SystemEvent { event } => assert_eq!(event, LessonEvent::Pause),
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn transcript_serializes_final_flag_under_wire_name() {
        let msg = ServerMessage::transcript(Role::Assistant, "Привет!", true);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transcript");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["final"], true);
    }

    #[test]
    fn system_levels_serialize_lowercase() {
        let json = serde_json::to_value(ServerMessage::warning("switching pipelines")).unwrap();
        assert_eq!(json["level"], "warning");
        assert_eq!(json["message"], "switching pipelines");
    }
}
