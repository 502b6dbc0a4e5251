//! Seams to the speech-to-text, dialogue-generation, and speech-synthesis
//! services. The orchestrator depends on the traits; the OpenAI-backed
//! implementations below are the production wiring.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

use verba_core::{ConversationTurn, Role};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe one WAV-wrapped utterance.
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DialogueModel: Send + Sync {
    /// Stream the reply to the current conversation token by token into
    /// `tokens`; resolves when the provider finishes the reply.
    async fn stream_reply(
        &self,
        instructions: &str,
        history: &[ConversationTurn],
        tokens: mpsc::Sender<String>,
    ) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpeechSynthesis: Send + Sync {
    /// Stream synthesized pcm16 chunks for one sentence into `audio`.
    async fn synthesize(&self, text: &str, voice: &str, audio: mpsc::Sender<Bytes>) -> Result<()>;
}

/// OpenAI-backed implementation of all three seams, sharing one HTTP client.
pub struct OpenAiSpeech {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    stt_model: String,
    chat_model: String,
    tts_model: String,
}

impl OpenAiSpeech {
    pub fn new(
        api_key: String,
        stt_model: String,
        chat_model: String,
        tts_model: String,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com".to_string(),
            api_key,
            stt_model,
            chat_model,
            tts_model,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl SpeechToText for OpenAiSpeech {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .context("building multipart audio part")?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.stt_model.clone())
            .part("file", part);

        let resp = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json::<TranscriptionResponse>()
            .await?;

        Ok(resp.text)
    }
}

/// One parsed server-sent-event line from the chat completions stream.
#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data: ") else {
        return SseLine::Skip;
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(v) => match v["choices"][0]["delta"]["content"].as_str() {
            Some(token) if !token.is_empty() => SseLine::Token(token.to_string()),
            _ => SseLine::Skip,
        },
        Err(e) => {
            tracing::debug!("undecodable stream line: {}", e);
            SseLine::Skip
        }
    }
}

#[async_trait]
impl DialogueModel for OpenAiSpeech {
    async fn stream_reply(
        &self,
        instructions: &str,
        history: &[ConversationTurn],
        tokens: mpsc::Sender<String>,
    ) -> Result<()> {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": instructions,
        })];
        for turn in history {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(serde_json::json!({ "role": role, "content": turn.text }));
        }

        let body = serde_json::json!({
            "model": self.chat_model,
            "messages": messages,
            "stream": true,
        });

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("reading chat completion stream")?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                match parse_sse_line(&line) {
                    SseLine::Token(token) => {
                        if tokens.send(token).await.is_err() {
                            // Consumer gone, e.g. the session ended mid-reply.
                            return Ok(());
                        }
                    }
                    SseLine::Done => return Ok(()),
                    SseLine::Skip => {}
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechSynthesis for OpenAiSpeech {
    async fn synthesize(&self, text: &str, voice: &str, audio: mpsc::Sender<Bytes>) -> Result<()> {
        let body = serde_json::json!({
            "model": self.tts_model,
            "input": text,
            "voice": voice,
            "response_format": "pcm",
        });

        let resp = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("reading synthesis stream")?;
            if chunk.is_empty() {
                continue;
            }
            if audio.send(chunk).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::post;

    #[test]
    fn sse_data_lines_yield_tokens() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(line), SseLine::Token("Hel".to_string()));
    }

    #[test]
    fn sse_done_marker_ends_the_stream() {
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
    }

    #[test]
    fn non_data_and_empty_delta_lines_are_skipped() {
        assert_eq!(parse_sse_line(""), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        // Role-only delta, no content yet.
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(line), SseLine::Skip);
    }

    #[test]
    fn malformed_json_is_skipped_not_fatal() {
        assert_eq!(parse_sse_line("data: {truncated"), SseLine::Skip);
    }

    async fn serve_stub(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn speech_against(addr: std::net::SocketAddr) -> OpenAiSpeech {
        OpenAiSpeech::new(
            "test-key".to_string(),
            "whisper-1".to_string(),
            "gpt-4o-mini".to_string(),
            "tts-1".to_string(),
        )
        .with_base_url(&format!("http://{addr}"))
    }

    #[tokio::test]
    async fn transcribe_reads_the_text_from_the_provider() {
        let app = Router::new().route(
            "/v1/audio/transcriptions",
            post(|| async { axum::Json(serde_json::json!({"text": "привет, как дела"})) }),
        );
        let addr = serve_stub(app).await;

        let text = speech_against(addr).transcribe(vec![0u8; 320]).await.unwrap();
        assert_eq!(text, "привет, как дела");
    }

    #[tokio::test]
    async fn stream_reply_yields_tokens_until_done() {
        const BODY: &str = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Доб\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"рый день.\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let app = Router::new().route("/v1/chat/completions", post(|| async { BODY }));
        let addr = serve_stub(app).await;

        let (tokens_tx, mut tokens_rx) = mpsc::channel(8);
        let history = vec![ConversationTurn::user("здравствуйте", None)];
        speech_against(addr)
            .stream_reply("be brief", &history, tokens_tx)
            .await
            .unwrap();

        let mut reply = String::new();
        while let Some(token) = tokens_rx.recv().await {
            reply.push_str(&token);
        }
        assert_eq!(reply, "Добрый день.");
    }

    #[tokio::test]
    async fn synthesize_streams_the_response_bytes() {
        let app = Router::new().route("/v1/audio/speech", post(|| async { vec![1u8, 2, 3, 4] }));
        let addr = serve_stub(app).await;

        let (audio_tx, mut audio_rx) = mpsc::channel(8);
        speech_against(addr)
            .synthesize("Привет", "alloy", audio_tx)
            .await
            .unwrap();

        let mut pcm = Vec::new();
        while let Some(chunk) = audio_rx.recv().await {
            pcm.extend_from_slice(&chunk);
        }
        assert_eq!(pcm, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn provider_error_status_is_surfaced() {
        use axum::http::StatusCode;

        let app = Router::new().route(
            "/v1/audio/transcriptions",
            post(|| async { StatusCode::UNAUTHORIZED }),
        );
        let addr = serve_stub(app).await;

        assert!(speech_against(addr).transcribe(vec![0u8; 320]).await.is_err());
    }
}
