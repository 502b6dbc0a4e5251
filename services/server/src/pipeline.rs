//! The legacy dialogue turn pipeline: utterance → transcript → streamed
//! reply → sentence-chunked synthesis.
//!
//! Reply tokens accumulate in a pending-sentence buffer that flushes at each
//! sentence boundary, so synthesis (and client playback) starts before the
//! full reply has been generated. The repeated regex scan is the price for
//! materially lower perceived latency.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;

use verba_core::{ConversationLog, ConversationTurn, LatencyRecorder, OperationKind, Role};

use crate::protocol::{Outbound, ServerMessage};
use crate::speech::{DialogueModel, SpeechSynthesis, SpeechToText};
use crate::transcode::{LEGACY_STT_SAMPLE_RATE, TTS_PCM_SAMPLE_RATE, wav_wrap};
use crate::vad::Utterance;

/// A sentence ends at terminal punctuation (optionally followed by a closing
/// quote or bracket) and whitespace.
static SENTENCE_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[.!?…]["'»)]*\s"#).expect("sentence boundary pattern"));

/// Accumulates streamed tokens and flushes whole sentences.
#[derive(Default)]
pub struct SentenceChunker {
    pending: String,
}

impl SentenceChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one token; returns every sentence completed by it, in order.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.pending.push_str(token);
        let mut flushed = Vec::new();
        loop {
            let end = match SENTENCE_BOUNDARY.find(&self.pending) {
                Some(m) => m.end(),
                None => break,
            };
            let sentence: String = self.pending.drain(..end).collect();
            let sentence = sentence.trim().to_string();
            if !sentence.is_empty() {
                flushed.push(sentence);
            }
        }
        flushed
    }

    /// End-of-stream: whatever remains is the final flush.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.pending.trim().to_string();
        self.pending.clear();
        if rest.is_empty() { None } else { Some(rest) }
    }
}

/// Per-session state for the legacy path.
pub struct DialogueTurnPipeline {
    stt: Arc<dyn SpeechToText>,
    dialogue: Arc<dyn DialogueModel>,
    synthesis: Arc<dyn SpeechSynthesis>,
    latency: Arc<LatencyRecorder>,
    outbound: mpsc::Sender<Outbound>,
    history: ConversationLog,
    /// Persistent instruction preamble; rule injections append to it.
    instructions: String,
    voice: String,
}

impl DialogueTurnPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        dialogue: Arc<dyn DialogueModel>,
        synthesis: Arc<dyn SpeechSynthesis>,
        latency: Arc<LatencyRecorder>,
        outbound: mpsc::Sender<Outbound>,
        instructions: String,
        voice: String,
    ) -> Self {
        Self {
            stt,
            dialogue,
            synthesis,
            latency,
            outbound,
            history: ConversationLog::new(),
            instructions,
            voice,
        }
    }

    /// Rule injections become part of the persistent preamble on this path.
    pub fn apply_injection(&mut self, injection: &str) {
        self.instructions.push_str("\n\n");
        self.instructions.push_str(injection);
    }

    /// Transcribe one utterance. Empty or whitespace-only transcripts are
    /// dropped silently; non-empty ones are appended to the history and
    /// echoed to the client immediately.
    pub async fn transcribe(&mut self, utterance: &Utterance) -> Result<Option<String>> {
        let wav = wav_wrap(&utterance.pcm, LEGACY_STT_SAMPLE_RATE)?;
        let started = Instant::now();
        let transcript = self.stt.transcribe(wav).await?;
        self.latency.record(OperationKind::Stt, started.elapsed());

        let transcript = transcript.trim().to_string();
        if transcript.is_empty() {
            tracing::debug!("dropping empty transcript");
            return Ok(None);
        }

        self.history
            .push(ConversationTurn::user(&transcript, Some(utterance.duration)));
        self.send(Outbound::Message(ServerMessage::transcript(
            Role::User,
            &transcript,
            true,
        )))
        .await?;
        Ok(Some(transcript))
    }

    /// Generate and speak the reply to the current history. Each flushed
    /// sentence is emitted as an assistant transcript and synthesized; audio
    /// chunks go out in synthesis order, sentences in flush order.
    pub async fn respond(&mut self) -> Result<()> {
        let (token_tx, mut token_rx) = mpsc::channel::<String>(64);
        let dialogue = self.dialogue.clone();
        let instructions = self.instructions.clone();
        let history = self.history.turns().to_vec();
        let generator = tokio::spawn(async move {
            dialogue
                .stream_reply(&instructions, &history, token_tx)
                .await
        });

        let mut chunker = SentenceChunker::new();
        let mut reply = String::new();
        while let Some(token) = token_rx.recv().await {
            reply.push_str(&token);
            for sentence in chunker.push(&token) {
                self.speak_sentence(&sentence).await?;
            }
        }
        if let Some(rest) = chunker.finish() {
            self.speak_sentence(&rest).await?;
        }

        generator
            .await
            .context("dialogue generator panicked")?
            .context("dialogue generation failed")?;

        let reply = reply.trim().to_string();
        if !reply.is_empty() {
            self.history.push(ConversationTurn::assistant(&reply));
            self.send(Outbound::Message(ServerMessage::transcript(
                Role::Assistant,
                &reply,
                true,
            )))
            .await?;
        }
        Ok(())
    }

    async fn speak_sentence(&mut self, sentence: &str) -> Result<()> {
        self.send(Outbound::Message(ServerMessage::transcript(
            Role::Assistant,
            sentence,
            false,
        )))
        .await?;

        let (audio_tx, mut audio_rx) = mpsc::channel::<bytes::Bytes>(32);
        let synthesis = self.synthesis.clone();
        let voice = self.voice.clone();
        let text = sentence.to_string();
        let synth = tokio::spawn(async move { synthesis.synthesize(&text, &voice, audio_tx).await });

        let requested = Instant::now();
        let mut first_chunk = true;
        while let Some(chunk) = audio_rx.recv().await {
            if first_chunk {
                // Time-to-first-byte for this synthesis call.
                self.latency.record(OperationKind::Tts, requested.elapsed());
                first_chunk = false;
            }
            let wav = wav_wrap(&chunk, TTS_PCM_SAMPLE_RATE)?;
            self.send(Outbound::Audio(wav)).await?;
        }

        synth
            .await
            .context("synthesis task panicked")?
            .context("speech synthesis failed")?;
        Ok(())
    }

    async fn send(&self, out: Outbound) -> Result<()> {
        self.outbound
            .send(out)
            .await
            .map_err(|_| anyhow!("client outbound channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::{MockDialogueModel, MockSpeechSynthesis, MockSpeechToText};
    use std::time::Duration;

    #[test]
    fn chunker_flushes_at_terminal_punctuation_followed_by_whitespace() {
        let mut chunker = SentenceChunker::new();
        assert!(chunker.push("Hello the").is_empty());
        assert_eq!(chunker.push("re. How are"), vec!["Hello there.".to_string()]);
        assert!(chunker.push(" you").is_empty());
        assert_eq!(chunker.finish(), Some("How are you".to_string()));
    }

    #[test]
    fn chunker_handles_multiple_sentences_in_one_token() {
        let mut chunker = SentenceChunker::new();
        let flushed = chunker.push("Да! Конечно. Начнём ");
        assert_eq!(flushed, vec!["Да!".to_string(), "Конечно.".to_string()]);
        assert_eq!(chunker.finish(), Some("Начнём".to_string()));
    }

    #[test]
    fn chunker_keeps_closing_quotes_with_the_sentence() {
        let mut chunker = SentenceChunker::new();
        let flushed = chunker.push("Скажи «привет». Потом ");
        assert_eq!(flushed, vec!["Скажи «привет».".to_string()]);
    }

    #[test]
    fn chunker_finish_is_none_for_whitespace_remainder() {
        let mut chunker = SentenceChunker::new();
        chunker.push("Done.  ");
        assert_eq!(chunker.finish(), None);
    }

    fn utterance() -> Utterance {
        Utterance {
            pcm: vec![0u8; 3200],
            duration: Duration::from_millis(100),
            started_at: Instant::now(),
        }
    }

    fn pipeline_with(
        stt: MockSpeechToText,
        dialogue: MockDialogueModel,
        synthesis: MockSpeechSynthesis,
    ) -> (DialogueTurnPipeline, mpsc::Receiver<Outbound>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let pipeline = DialogueTurnPipeline::new(
            Arc::new(stt),
            Arc::new(dialogue),
            Arc::new(synthesis),
            Arc::new(LatencyRecorder::default()),
            outbound_tx,
            "be a tutor".to_string(),
            "alloy".to_string(),
        );
        (pipeline, outbound_rx)
    }

    #[tokio::test]
    async fn whitespace_transcripts_are_dropped_before_generation() {
        let mut stt = MockSpeechToText::new();
        stt.expect_transcribe().times(1).returning(|_| Ok("   ".to_string()));
        let mut dialogue = MockDialogueModel::new();
        dialogue.expect_stream_reply().times(0);
        let synthesis = MockSpeechSynthesis::new();

        let (mut pipeline, mut outbound_rx) = pipeline_with(stt, dialogue, synthesis);
        let transcript = pipeline.transcribe(&utterance()).await.unwrap();
        assert!(transcript.is_none());
        assert!(outbound_rx.try_recv().is_err(), "nothing goes to the client");
    }

    #[tokio::test]
    async fn respond_streams_sentences_in_order_with_audio_between() {
        let stt = MockSpeechToText::new();

        let mut dialogue = MockDialogueModel::new();
        dialogue
            .expect_stream_reply()
            .times(1)
            .returning(|_, _, tokens| {
                for token in ["Hello ", "there. ", "How are ", "you?"] {
                    tokens.try_send(token.to_string()).expect("token channel");
                }
                Ok(())
            });

        let mut synthesis = MockSpeechSynthesis::new();
        synthesis
            .expect_synthesize()
            .times(2)
            .returning(|_, _, audio| {
                audio.try_send(bytes::Bytes::from_static(&[0u8; 640])).expect("audio channel");
                Ok(())
            });

        let (mut pipeline, mut outbound_rx) = pipeline_with(stt, dialogue, synthesis);
        pipeline.respond().await.unwrap();
        drop(pipeline);

        let mut sentences = Vec::new();
        let mut audio_frames = 0usize;
        while let Some(out) = outbound_rx.recv().await {
            match out {
                Outbound::Message(ServerMessage::Transcript { text, is_final, .. }) => {
                    sentences.push((text, is_final));
                }
                Outbound::Audio(wav) => {
                    audio_frames += 1;
                    // Each frame is a playable container.
                    assert!(wav.starts_with(b"RIFF"));
                }
                other => panic!("unexpected outbound: {other:?}"),
            }
        }

        assert_eq!(
            sentences,
            vec![
                ("Hello there.".to_string(), Some(false)),
                ("How are you?".to_string(), Some(false)),
                ("Hello there. How are you?".to_string(), Some(true)),
            ]
        );
        assert_eq!(audio_frames, 2, "one synthesized frame per sentence");
    }

    #[tokio::test]
    async fn injection_lands_in_the_instruction_preamble() {
        let stt = MockSpeechToText::new();
        let mut dialogue = MockDialogueModel::new();
        dialogue
            .expect_stream_reply()
            .withf(|instructions, _, _| instructions.contains("[IMPORTANT — NEW RULE]"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let synthesis = MockSpeechSynthesis::new();

        let (mut pipeline, _outbound_rx) = pipeline_with(stt, dialogue, synthesis);
        pipeline.apply_injection("[IMPORTANT — NEW RULE] speak only Russian");
        pipeline.respond().await.unwrap();
    }
}
