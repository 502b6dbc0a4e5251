//! Relay between the client connection and the hosted realtime voice API.
//!
//! The bridge owns the provider connection for the session's lifetime: one
//! session-configuration event up front, a greeting trigger, then concurrent
//! relays for inbound audio (through the transcoder, in fixed frames),
//! provider events back to the client, and rule injections into the live
//! conversation. Every failure is classified by whether audio has already
//! reached the client, which is what the fallback controller keys on.

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use verba_core::Role;
use verba_realtime::audio::{REALTIME_PCM16_SAMPLE_RATE, decode_pcm16, encode_pcm16};
use verba_realtime::types::audio::{
    ServerVadTurnDetection, TranscriptionModel, TurnDetection, Voice,
};
use verba_realtime::types::{Item, MessageItem, MessageRole, ServerEvent, Session};

use crate::error::BridgeFailure;
use crate::fallback::FallbackController;
use crate::protocol::{Outbound, ServerMessage};
use crate::transcode::{Transcoder, wav_wrap};

/// 100ms of pcm16 mono at the realtime rate.
const BRIDGE_FRAME_BYTES: usize = (REALTIME_PCM16_SAMPLE_RATE as usize / 10) * 2;

const GREETING_PROMPT: &str = "Greet the student warmly in the lesson's target \
    language and invite them to start speaking.";

pub struct BridgeConfig {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    /// Instruction preamble, including any standing-rules injection.
    pub instructions: String,
    /// Container format of the client's binary audio frames.
    pub input_format: String,
}

fn classify(audio_started: bool, err: anyhow::Error) -> BridgeFailure {
    if audio_started {
        BridgeFailure::AfterAudio(err)
    } else {
        BridgeFailure::BeforeAudio(err)
    }
}

/// Run the bridge until the client disconnects, the session ends, or the
/// provider fails. `Ok(())` is a normal end; errors carry the before/after
/// audio distinction for the fallback controller.
pub async fn run_bridge(
    config: BridgeConfig,
    controller: Arc<Mutex<FallbackController>>,
    audio_in: &mut mpsc::Receiver<Bytes>,
    injections: &mut mpsc::Receiver<String>,
    user_transcripts: mpsc::Sender<String>,
    outbound: mpsc::Sender<Outbound>,
) -> Result<(), BridgeFailure> {
    let realtime_config = verba_realtime::Config::builder()
        .with_api_key(&config.api_key)
        .with_model(&config.model)
        .build();
    let mut client = verba_realtime::connect_with_config(1024, realtime_config)
        .await
        .map_err(BridgeFailure::BeforeAudio)?;
    let mut events = client.server_events().map_err(BridgeFailure::BeforeAudio)?;

    let voice = config
        .voice
        .parse::<Voice>()
        .unwrap_or(Voice::Alloy);
    let session = Session::new()
        .with_modalities_enable_audio()
        .with_instructions(&config.instructions)
        .with_voice(voice)
        .with_input_audio_format(verba_realtime::types::AudioFormat::Pcm16)
        .with_output_audio_format(verba_realtime::types::AudioFormat::Pcm16)
        .with_input_audio_transcription_enable(TranscriptionModel::Whisper)
        .with_turn_detection_enable(TurnDetection::ServerVad(
            ServerVadTurnDetection::default().with_silence_duration_ms(700),
        ))
        .build();
    client
        .update_session(session)
        .await
        .map_err(BridgeFailure::BeforeAudio)?;

    let mut transcoder = Transcoder::spawn(&config.input_format, REALTIME_PCM16_SAMPLE_RATE)
        .map_err(BridgeFailure::BeforeAudio)?;
    let mut writer = transcoder.take_writer().map_err(BridgeFailure::BeforeAudio)?;
    let mut reader = transcoder.take_reader().map_err(BridgeFailure::BeforeAudio)?;

    // Sent exactly once, at session start.
    client
        .create_response_with_instructions(GREETING_PROMPT)
        .await
        .map_err(BridgeFailure::BeforeAudio)?;

    let mut audio_started = false;

    loop {
        tokio::select! {
            frame = audio_in.recv() => match frame {
                Some(bytes) => {
                    if let Err(e) = writer.write(&bytes).await {
                        return Err(classify(audio_started, e));
                    }
                }
                None => {
                    tracing::info!("client audio stream ended, closing bridge");
                    return Ok(());
                }
            },

            pcm = reader.read(BRIDGE_FRAME_BYTES) => match pcm {
                Ok(pcm) if pcm.is_empty() => {
                    return Err(classify(
                        audio_started,
                        anyhow!("audio transcoder ended unexpectedly"),
                    ));
                }
                Ok(pcm) => {
                    if let Err(e) = client.append_input_audio_buffer(encode_pcm16(&pcm)).await {
                        return Err(classify(audio_started, e));
                    }
                }
                Err(e) => return Err(classify(audio_started, e)),
            },

            injection = injections.recv() => if let Some(text) = injection {
                let item = Item::Message(
                    MessageItem::builder()
                        .with_role(MessageRole::System)
                        .with_input_text(&text)
                        .build(),
                );
                if let Err(e) = client.create_conversation_item(item).await {
                    return Err(classify(audio_started, e));
                }
                if let Err(e) = client.create_response().await {
                    return Err(classify(audio_started, e));
                }
            },

            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(classify(
                            audio_started,
                            anyhow!("provider event stream closed"),
                        ));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("dropped {} provider events", n);
                        continue;
                    }
                };
                match event {
                    ServerEvent::Close { reason } => {
                        return Err(classify(
                            audio_started,
                            anyhow!("provider closed connection: {:?}", reason),
                        ));
                    }
                    ServerEvent::Error(ev) => {
                        // Provider-internal errors are logged, not surfaced;
                        // a fatal one is followed by a close.
                        tracing::warn!(
                            kind = ?ev.error().kind(),
                            "provider error event: {}",
                            ev.error().message()
                        );
                    }
                    ServerEvent::SessionCreated(ev) => {
                        tracing::info!(session = ?ev.session().id(), "realtime session created");
                    }
                    ServerEvent::SessionUpdated(ev) => {
                        tracing::info!(session = ?ev.session().id(), "realtime session configured");
                    }
                    ServerEvent::InputAudioBufferSpeechStarted(ev) => {
                        tracing::debug!(at_ms = ?ev.audio_start_ms(), "user speech started");
                    }
                    ServerEvent::InputAudioBufferSpeechStopped(ev) => {
                        tracing::debug!(at_ms = ?ev.audio_end_ms(), "user speech stopped");
                    }
                    ServerEvent::ConversationItemInputAudioTranscriptionCompleted(ev) => {
                        let transcript = ev.transcript().trim().to_string();
                        if transcript.is_empty() {
                            continue;
                        }
                        let message = ServerMessage::transcript(Role::User, &transcript, true);
                        if outbound.send(Outbound::Message(message)).await.is_err() {
                            return Ok(());
                        }
                        // Feed the rule engine; the gateway sends any
                        // resulting injection back through `injections`.
                        let _ = user_transcripts.send(transcript).await;
                    }
                    ServerEvent::ResponseCreated(ev) => {
                        tracing::debug!(response = ?ev.response().id(), "response started");
                    }
                    ServerEvent::ResponseAudioDelta(ev) => {
                        let pcm = decode_pcm16(ev.delta());
                        if pcm.is_empty() {
                            continue;
                        }
                        let wav = match wav_wrap(&pcm, REALTIME_PCM16_SAMPLE_RATE) {
                            Ok(wav) => wav,
                            Err(e) => return Err(classify(audio_started, e)),
                        };
                        if outbound.send(Outbound::Audio(wav)).await.is_err() {
                            return Ok(());
                        }
                        if !audio_started {
                            audio_started = true;
                            if let Ok(mut controller) = controller.lock() {
                                if let Err(e) = controller.realtime_serving() {
                                    tracing::error!("state machine refused realtime_serving: {}", e);
                                }
                            }
                        }
                    }
                    ServerEvent::ResponseAudioTranscriptDelta(ev) => {
                        let message =
                            ServerMessage::transcript(Role::Assistant, ev.delta(), false);
                        if outbound.send(Outbound::Message(message)).await.is_err() {
                            return Ok(());
                        }
                    }
                    ServerEvent::ResponseAudioTranscriptDone(ev) => {
                        let message =
                            ServerMessage::transcript(Role::Assistant, ev.transcript(), true);
                        if outbound.send(Outbound::Message(message)).await.is_err() {
                            return Ok(());
                        }
                    }
                    ServerEvent::ResponseDone(ev) => {
                        tracing::debug!(response = ?ev.response().id(), "response done");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_classified_by_audio_progress() {
        assert!(matches!(
            classify(false, anyhow!("connect refused")),
            BridgeFailure::BeforeAudio(_)
        ));
        assert!(matches!(
            classify(true, anyhow!("relay broke")),
            BridgeFailure::AfterAudio(_)
        ));
    }

    #[test]
    fn bridge_frames_are_100ms_of_pcm16() {
        assert_eq!(BRIDGE_FRAME_BYTES, 4800);
    }
}
