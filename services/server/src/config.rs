//! Server configuration, loaded from the environment at startup.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Tuning for the energy-based utterance segmenter. Kept in configuration so
/// deployments can adapt to microphone and room conditions without code
/// changes.
#[derive(Debug, Clone)]
pub struct VadSettings {
    /// Normalized RMS energy above which a chunk counts as speech (0.0-1.0).
    pub energy_threshold: f32,
    /// Silence that finalizes an utterance.
    pub silence: Duration,
    /// Finalized utterances shorter than this never reach transcription.
    pub min_utterance: Duration,
}

/// Dev-mode seed for the profile store. Production deployments resolve
/// profiles from the external credential store instead.
#[derive(Debug, Clone)]
pub struct StudentSettings {
    pub token: String,
    pub student_id: String,
    pub voice_engine: String,
    pub voice: String,
    pub native_language: String,
    pub target_language: String,
}

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: String,
    pub realtime_model: String,
    pub chat_model: String,
    pub stt_model: String,
    pub tts_model: String,
    pub log_level: Level,
    pub vad: VadSettings,
    pub student: StudentSettings,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> Result<T, ConfigError> {
    let raw = var_or(name, default);
    raw.parse::<T>()
        .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw))
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// *   `BIND_ADDRESS`: Address and port to bind (default "0.0.0.0:3000").
    /// *   `OPENAI_API_KEY`: Required; used by the realtime bridge and the
    ///     legacy STT/chat/TTS providers.
    /// *   `REALTIME_MODEL`, `CHAT_MODEL`, `STT_MODEL`, `TTS_MODEL`,
    ///     `TTS_VOICE`-adjacent settings: optional, sensible defaults.
    /// *   `RUST_LOG`: Logging level, defaults to "INFO".
    /// *   `VAD_ENERGY_THRESHOLD`, `VAD_SILENCE_MS`, `VAD_MIN_UTTERANCE_MS`:
    ///     segmenter tuning.
    /// *   `STUDENT_*`: dev-mode profile seed.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let bind_address = parse_var::<SocketAddr>("BIND_ADDRESS", "0.0.0.0:3000")?;

        let openai_api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let energy_threshold = parse_var::<f32>("VAD_ENERGY_THRESHOLD", "0.015")?;
        if !(0.0..=1.0).contains(&energy_threshold) {
            return Err(ConfigError::InvalidValue(
                "VAD_ENERGY_THRESHOLD".to_string(),
                format!("{energy_threshold} is outside 0.0..=1.0"),
            ));
        }
        let vad = VadSettings {
            energy_threshold,
            silence: Duration::from_millis(parse_var::<u64>("VAD_SILENCE_MS", "700")?),
            min_utterance: Duration::from_millis(parse_var::<u64>("VAD_MIN_UTTERANCE_MS", "300")?),
        };

        let student = StudentSettings {
            token: var_or("STUDENT_TOKEN", "dev-token"),
            student_id: var_or("STUDENT_ID", "dev-student"),
            voice_engine: var_or("STUDENT_VOICE_ENGINE", "hosted-realtime"),
            voice: var_or("STUDENT_VOICE", "alloy"),
            native_language: var_or("STUDENT_NATIVE_LANGUAGE", "en"),
            target_language: var_or("STUDENT_TARGET_LANGUAGE", "ru"),
        };

        Ok(Self {
            bind_address,
            openai_api_key,
            realtime_model: var_or("REALTIME_MODEL", "gpt-4o-realtime-preview-2024-10-01"),
            chat_model: var_or("CHAT_MODEL", "gpt-4o-mini"),
            stt_model: var_or("STT_MODEL", "whisper-1"),
            tts_model: var_or("TTS_MODEL", "tts-1"),
            log_level,
            vad,
            student,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_falls_back_to_default() {
        let silence: u64 = parse_var("VAD_SILENCE_MS_UNSET_FOR_TEST", "700").unwrap();
        assert_eq!(silence, 700);
    }

    #[test]
    fn unparsable_default_reports_the_variable_name() {
        let err = parse_var::<u64>("VAD_SILENCE_MS_UNSET_FOR_TEST", "not-a-number").unwrap_err();
        assert!(err.to_string().contains("VAD_SILENCE_MS_UNSET_FOR_TEST"));
    }
}
