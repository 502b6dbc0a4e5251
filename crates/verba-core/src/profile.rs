/// The voice engine a student has selected in their settings.
///
/// Only the hosted realtime engine is eligible for the low-latency bridge;
/// every other engine name forces the legacy pipeline.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VoiceEngine {
    /// Direct speech-to-speech relay to the hosted realtime API.
    HostedRealtime,
    /// Any locally-orchestrated synthesis engine, by name.
    Synthesis(String),
}

impl VoiceEngine {
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "hosted-realtime" => VoiceEngine::HostedRealtime,
            other => VoiceEngine::Synthesis(other.to_string()),
        }
    }

    pub fn is_realtime(&self) -> bool {
        matches!(self, VoiceEngine::HostedRealtime)
    }
}

/// Student settings consumed read-only at session start.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StudentProfile {
    pub student_id: String,
    pub voice_engine: VoiceEngine,
    /// Voice identifier passed to whichever engine speaks.
    pub voice: String,
    /// ISO 639-1 code of the student's native language.
    pub native_language: String,
    /// ISO 639-1 code of the language being learned.
    pub target_language: String,
}

impl StudentProfile {
    /// Instruction preamble for the dialogue model, before any rule
    /// injections are appended.
    pub fn base_instructions(&self) -> String {
        format!(
            "You are a friendly spoken language tutor. The student is a native {} \
             speaker learning {}. Keep replies short and conversational: they are \
             spoken aloud. Correct mistakes gently, then continue the conversation.",
            self.native_language, self.target_language,
        )
    }
}
