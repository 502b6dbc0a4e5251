//! The session gateway: one WebSocket connection, one tutoring session.
//!
//! The gateway resolves the connection token to a student profile (failing
//! closed before any audio flows), picks the pipeline mode from the student's
//! voice engine, and drives the fallback controller. Per session it runs a
//! client-receive loop, an outbound pump, and whichever of the realtime
//! bridge or the legacy dialogue pipeline is active; disconnects cancel all
//! of them and release the transcoder subprocess on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use verba_core::{
    LatencyRecorder, MemoryProfileStore, MemoryRuleStore, OperationKind, ProfileStore, RuleEngine,
    RuleStore, StudentProfile, VoiceEngine,
};

use crate::bridge::{BridgeConfig, run_bridge};
use crate::config::Config;
use crate::error::{BridgeFailure, SessionError};
use crate::fallback::{FallbackController, PipelineMode, PipelineState};
use crate::pipeline::DialogueTurnPipeline;
use crate::protocol::{
    CLOSE_MISSING_CREDENTIALS, CLOSE_NORMAL, CLOSE_REASON_PAUSED, ClientMessage, LessonEvent,
    Outbound, ServerMessage,
};
use crate::speech::{DialogueModel, OpenAiSpeech, SpeechSynthesis, SpeechToText};
use crate::transcode::{LEGACY_STT_SAMPLE_RATE, Transcoder};
use crate::vad::{Utterance, UtteranceSegmenter};

/// 100ms of pcm16 mono at the legacy transcription rate, per segmenter chunk.
const LEGACY_CHUNK_BYTES: usize = (LEGACY_STT_SAMPLE_RATE as usize / 10) * 2;

const FALLBACK_WARNING: &str =
    "Realtime voice is unavailable right now; continuing with the standard voice pipeline.";

/// Everything a session borrows from the process: configuration, stores,
/// provider clients, and the shared latency window.
pub struct SessionDeps {
    pub config: Arc<Config>,
    pub profiles: Arc<dyn ProfileStore>,
    pub rules: Arc<dyn RuleStore>,
    pub stt: Arc<dyn SpeechToText>,
    pub dialogue: Arc<dyn DialogueModel>,
    pub synthesis: Arc<dyn SpeechSynthesis>,
    pub latency: Arc<LatencyRecorder>,
}

impl SessionDeps {
    /// Production wiring: one shared OpenAI client behind all three speech
    /// seams, plus the dev-seeded in-memory stores.
    pub fn from_config(config: Config) -> Arc<Self> {
        let speech = Arc::new(OpenAiSpeech::new(
            config.openai_api_key.clone(),
            config.stt_model.clone(),
            config.chat_model.clone(),
            config.tts_model.clone(),
        ));
        let student = &config.student;
        let profiles = MemoryProfileStore::new().with_profile(
            &student.token,
            StudentProfile {
                student_id: student.student_id.clone(),
                voice_engine: VoiceEngine::from_name(&student.voice_engine),
                voice: student.voice.clone(),
                native_language: student.native_language.clone(),
                target_language: student.target_language.clone(),
            },
        );
        Arc::new(Self {
            config: Arc::new(config),
            profiles: Arc::new(profiles),
            rules: Arc::new(MemoryRuleStore::new()),
            stt: speech.clone(),
            dialogue: speech.clone(),
            synthesis: speech,
            latency: Arc::new(LatencyRecorder::default()),
        })
    }
}

pub fn router(deps: Arc<SessionDeps>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(cors)
        .with_state(deps)
}

async fn healthz(State(deps): State<Arc<SessionDeps>>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "latency_ms": {
            "stt_mean": deps.latency.mean_millis(OperationKind::Stt),
            "tts_mean": deps.latency.mean_millis(OperationKind::Tts),
        },
    }))
}

async fn ws_handler(
    State(deps): State<Arc<SessionDeps>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, deps, token))
}

async fn handle_socket(socket: WebSocket, deps: Arc<SessionDeps>, token: String) {
    let profile = match resolve_profile(&deps, &token).await {
        Ok(profile) => profile,
        Err(e) => {
            tracing::warn!("rejecting connection: {e}");
            reject_unauthenticated(socket).await;
            return;
        }
    };
    if let Err(e) = run_session(socket, deps, profile).await {
        tracing::error!("session ended with error: {e}");
    }
}

/// Resolve the connection token before any audio flows. An unknown token is
/// a credentials failure; a store fault also fails closed.
async fn resolve_profile(
    deps: &SessionDeps,
    token: &str,
) -> Result<StudentProfile, SessionError> {
    match deps.profiles.profile_for_token(token).await {
        Ok(Some(profile)) => Ok(profile),
        Ok(None) => Err(SessionError::MissingCredentials),
        Err(e) => Err(SessionError::Internal(e)),
    }
}

/// Fail closed: a structured system error, then a distinguished close code,
/// before any audio is exchanged.
async fn reject_unauthenticated(mut socket: WebSocket) {
    let message = ServerMessage::error("missing or unknown credentials");
    if let Ok(text) = serde_json::to_string(&message) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_MISSING_CREDENTIALS,
            reason: "missing credentials".into(),
        })))
        .await;
}

/// One live session per connection.
struct Session {
    lesson_id: String,
    mode: PipelineMode,
    opened_at: Instant,
}

impl Session {
    fn open(profile: &StudentProfile) -> Self {
        Self {
            lesson_id: uuid::Uuid::new_v4().to_string(),
            mode: if profile.voice_engine.is_realtime() {
                PipelineMode::Realtime
            } else {
                PipelineMode::Legacy
            },
            opened_at: Instant::now(),
        }
    }
}

/// Capture parameters the client declares before sending audio.
struct CaptureConfig {
    codec: String,
}

fn lock_controller(
    controller: &Mutex<FallbackController>,
) -> Result<MutexGuard<'_, FallbackController>> {
    controller
        .lock()
        .map_err(|_| anyhow!("fallback controller lock poisoned"))
}

fn transcode_err(e: anyhow::Error) -> SessionError {
    SessionError::Transcode(format!("{e:#}"))
}

async fn run_session(
    mut socket: WebSocket,
    deps: Arc<SessionDeps>,
    profile: StudentProfile,
) -> Result<(), SessionError> {
    let session = Session::open(&profile);
    tracing::info!(
        lesson = %session.lesson_id,
        student = %profile.student_id,
        mode = ?session.mode,
        "session opened"
    );

    let capture = match await_capture_config(&mut socket).await? {
        Some(capture) => capture,
        None => {
            tracing::info!("client left before configuring capture");
            return Ok(());
        }
    };

    let engine = RuleEngine::load(
        deps.rules.clone(),
        &profile.student_id,
        &profile.target_language,
    )
    .await?;

    let controller = Arc::new(Mutex::new(FallbackController::new()));
    let started = lock_controller(&controller)?.start(session.mode)?;

    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(64);
    let pump = tokio::spawn(pump_outbound(outbound_rx, sink));

    outbound_tx
        .send(Outbound::Message(ServerMessage::LessonInfo {
            lesson_id: session.lesson_id.clone(),
        }))
        .await
        .map_err(|_| anyhow!("client disconnected before lesson info"))?;
    outbound_tx
        .send(Outbound::Message(ServerMessage::info("lesson started")))
        .await
        .map_err(|_| anyhow!("client disconnected at lesson start"))?;

    let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(256);
    let recv_task = tokio::spawn(receive_client(stream, audio_tx, outbound_tx.clone()));

    let result = match started {
        PipelineState::TryingRealtime => {
            run_realtime_with_fallback(
                &deps, &profile, &capture, engine, &controller, audio_rx, &outbound_tx,
            )
            .await
        }
        PipelineState::LegacyActive => {
            run_legacy(LegacyRun {
                deps: deps.clone(),
                profile: profile.clone(),
                codec: capture.codec.clone(),
                engine,
                audio_rx,
                outbound: outbound_tx.clone(),
            })
            .await
        }
        state => Err(SessionError::Internal(anyhow!(
            "unexpected pipeline state after start: {state:?}"
        ))),
    };

    // Cleanup runs on every exit path: cancel the receive loop, close the
    // state machine, and let the pump drain before the socket drops.
    if let Ok(mut controller) = controller.lock() {
        controller.close();
    }
    recv_task.abort();
    drop(outbound_tx);
    let _ = pump.await;

    tracing::info!(
        lesson = %session.lesson_id,
        elapsed = ?session.opened_at.elapsed(),
        "session closed"
    );
    result
}

/// The first structured message must be the capture config; audio frames
/// arriving earlier have no declared codec and are dropped. `None` means the
/// client left before configuring.
async fn await_capture_config(socket: &mut WebSocket) -> Result<Option<CaptureConfig>> {
    while let Some(message) = socket.recv().await {
        match message.context("reading capture config")? {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Config {
                    sample_rate,
                    channels,
                    codec,
                }) => {
                    tracing::info!(sample_rate, channels, %codec, "capture configured");
                    return Ok(Some(CaptureConfig { codec }));
                }
                Ok(ClientMessage::SystemEvent {
                    event: LessonEvent::Pause | LessonEvent::End,
                }) => return Ok(None),
                Ok(_) => {}
                Err(e) => tracing::warn!("undecodable client message before config: {e}"),
            },
            Message::Binary(_) => tracing::warn!("audio frame before capture config, dropping"),
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

/// Client-receive loop: binary frames go to the active pipeline, lifecycle
/// events end the session. Dropping `audio_tx` on exit is what tells the
/// pipeline the inbound stream is over.
async fn receive_client(
    mut stream: SplitStream<WebSocket>,
    audio_tx: mpsc::Sender<Bytes>,
    outbound: mpsc::Sender<Outbound>,
) {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::info!("client connection error: {e}");
                break;
            }
        };
        match message {
            Message::Binary(frame) => {
                if audio_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::SystemEvent { event }) => match event {
                    LessonEvent::Start => tracing::debug!("lesson start signal"),
                    LessonEvent::Pause => {
                        let _ = outbound
                            .send(Outbound::Close {
                                code: CLOSE_NORMAL,
                                reason: CLOSE_REASON_PAUSED.to_string(),
                            })
                            .await;
                        break;
                    }
                    LessonEvent::End => {
                        let _ = outbound
                            .send(Outbound::Close {
                                code: CLOSE_NORMAL,
                                reason: "lesson ended".to_string(),
                            })
                            .await;
                        break;
                    }
                },
                Ok(ClientMessage::Config { .. }) => {
                    tracing::warn!("duplicate capture config ignored")
                }
                Err(e) => tracing::warn!("undecodable client message: {e}"),
            },
            Message::Close(_) => {
                tracing::info!("client closed the connection");
                break;
            }
            _ => {}
        }
    }
}

/// Outbound pump: the single writer to the socket. Serializes structured
/// messages, forwards audio as binary frames, and stops after a close.
async fn pump_outbound(
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut sink: SplitSink<WebSocket, Message>,
) {
    let mut sequence = 0u64;
    while let Some(out) = outbound_rx.recv().await {
        sequence += 1;
        let sent = match out {
            Outbound::Audio(wav) => sink.send(Message::Binary(wav.into())).await,
            Outbound::Message(message) => match serde_json::to_string(&message) {
                Ok(text) => sink.send(Message::Text(text.into())).await,
                Err(e) => {
                    tracing::error!("unserializable server message: {e}");
                    continue;
                }
            },
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        };
        if sent.is_err() {
            tracing::info!("client sink closed");
            break;
        }
    }
    tracing::debug!(frames = sequence, "outbound pump finished");
}

/// Try the realtime bridge; on a failure before any audio was delivered,
/// demote once and continue the same session on the legacy pipeline.
async fn run_realtime_with_fallback(
    deps: &Arc<SessionDeps>,
    profile: &StudentProfile,
    capture: &CaptureConfig,
    engine: RuleEngine,
    controller: &Arc<Mutex<FallbackController>>,
    mut audio_rx: mpsc::Receiver<Bytes>,
    outbound: &mpsc::Sender<Outbound>,
) -> Result<(), SessionError> {
    // Standing rules go into the session instructions, before the first
    // reply; the engine itself moves into the relay task below.
    let initial_injection = engine.initial_injection();

    let (transcript_tx, mut transcript_rx) = mpsc::channel::<String>(16);
    let (injection_tx, mut injection_rx) = mpsc::channel::<String>(4);
    let rule_task = tokio::spawn(async move {
        let mut engine = engine;
        while let Some(transcript) = transcript_rx.recv().await {
            match engine.process_user_turn(&transcript).await {
                Ok(Some(injection)) => {
                    if injection_tx.send(injection).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("rule processing failed: {e:#}"),
            }
        }
        engine
    });

    let mut instructions = profile.base_instructions();
    if let Some(initial) = &initial_injection {
        instructions.push_str("\n\n");
        instructions.push_str(initial);
    }
    let bridge_config = BridgeConfig {
        api_key: deps.config.openai_api_key.clone(),
        model: deps.config.realtime_model.clone(),
        voice: profile.voice.clone(),
        instructions,
        input_format: capture.codec.clone(),
    };

    let outcome = run_bridge(
        bridge_config,
        controller.clone(),
        &mut audio_rx,
        &mut injection_rx,
        transcript_tx,
        outbound.clone(),
    )
    .await;

    // The bridge dropped its transcript sender, so the relay task is done
    // and hands the engine back for the legacy path.
    let engine = rule_task.await.context("rule relay task panicked")?;

    match outcome {
        Ok(()) => Ok(()),
        Err(BridgeFailure::BeforeAudio(e)) => {
            tracing::warn!("realtime channel failed before audio, falling back: {e:#}");
            demote(controller, outbound).await?;
            run_legacy(LegacyRun {
                deps: deps.clone(),
                profile: profile.clone(),
                codec: capture.codec.clone(),
                engine,
                audio_rx,
                outbound: outbound.clone(),
            })
            .await
        }
        Err(failure @ BridgeFailure::AfterAudio(_)) => {
            tracing::error!("realtime channel failed mid-stream, ending session: {failure:#}");
            let _ = outbound
                .send(Outbound::Message(ServerMessage::error(
                    "The voice channel failed; please reconnect.",
                )))
                .await;
            let _ = outbound
                .send(Outbound::Close {
                    code: 1011,
                    reason: "realtime channel failed".to_string(),
                })
                .await;
            Err(failure.into())
        }
    }
}

/// Single-shot demotion: flips the state machine and tells the client once.
async fn demote(
    controller: &Mutex<FallbackController>,
    outbound: &mpsc::Sender<Outbound>,
) -> Result<(), SessionError> {
    lock_controller(controller)?.fall_back()?;
    outbound
        .send(Outbound::Message(ServerMessage::warning(FALLBACK_WARNING)))
        .await
        .map_err(|_| anyhow!("client disconnected during fallback"))?;
    Ok(())
}

struct LegacyRun {
    deps: Arc<SessionDeps>,
    profile: StudentProfile,
    codec: String,
    engine: RuleEngine,
    audio_rx: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Outbound>,
}

/// The legacy path: transcoder-fed VAD segmentation, one dialogue turn per
/// utterance. Runs until the inbound audio stream ends.
async fn run_legacy(run: LegacyRun) -> Result<(), SessionError> {
    let LegacyRun {
        deps,
        profile,
        codec,
        mut engine,
        mut audio_rx,
        outbound,
    } = run;

    let mut transcoder =
        Transcoder::spawn(&codec, LEGACY_STT_SAMPLE_RATE).map_err(transcode_err)?;
    let mut writer = transcoder.take_writer().map_err(transcode_err)?;
    let mut reader = transcoder.take_reader().map_err(transcode_err)?;

    // Feed loop: client frames into ffmpeg in arrival order. Closing the
    // writer when the client stream ends is what drains the PCM tail.
    let feed = tokio::spawn(async move {
        while let Some(frame) = audio_rx.recv().await {
            if let Err(e) = writer.write(&frame).await {
                tracing::debug!("transcoder write stopped: {e:#}");
                return;
            }
        }
        if let Err(e) = writer.close().await {
            tracing::debug!("transcoder close: {e:#}");
        }
    });

    let mut instructions = profile.base_instructions();
    instructions.push_str(
        "\n\nOpen the lesson by greeting the student in the target language \
         and inviting them to speak.",
    );
    let mut pipeline = DialogueTurnPipeline::new(
        deps.stt.clone(),
        deps.dialogue.clone(),
        deps.synthesis.clone(),
        deps.latency.clone(),
        outbound,
        instructions,
        profile.voice.clone(),
    );
    if let Some(initial) = engine.initial_injection() {
        pipeline.apply_injection(&initial);
    }

    // Spoken greeting before the first utterance.
    if let Err(e) = pipeline.respond().await {
        tracing::warn!("greeting skipped: {e:#}");
    }

    let mut segmenter = UtteranceSegmenter::new(deps.config.vad.clone(), LEGACY_STT_SAMPLE_RATE);
    loop {
        let pcm = reader.read(LEGACY_CHUNK_BYTES).await.map_err(transcode_err)?;
        if pcm.is_empty() {
            if let Some(utterance) = segmenter.flush() {
                take_turn(&mut pipeline, &mut engine, &utterance).await;
            }
            break;
        }
        if let Some(utterance) = segmenter.push(&pcm) {
            take_turn(&mut pipeline, &mut engine, &utterance).await;
        }
    }

    let _ = feed.await;
    transcoder.shutdown().await;
    Ok(())
}

/// One utterance through the turn pipeline. Provider errors are logged and
/// the turn is skipped; the session stays up.
async fn take_turn(
    pipeline: &mut DialogueTurnPipeline,
    engine: &mut RuleEngine,
    utterance: &Utterance,
) {
    let transcript = match pipeline.transcribe(utterance).await {
        Ok(Some(transcript)) => transcript,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("transcription failed, skipping turn: {e:#}");
            return;
        }
    };
    match engine.process_user_turn(&transcript).await {
        Ok(Some(injection)) => pipeline.apply_injection(&injection),
        Ok(None) => {}
        Err(e) => tracing::warn!("rule processing failed: {e:#}"),
    }
    if let Err(e) = pipeline.respond().await {
        tracing::warn!("reply failed, skipping turn: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StudentSettings, VadSettings};
    use crate::speech::{MockDialogueModel, MockSpeechSynthesis, MockSpeechToText};
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            openai_api_key: "test-key".to_string(),
            realtime_model: "gpt-4o-realtime-preview-2024-10-01".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            log_level: tracing::Level::INFO,
            vad: VadSettings {
                energy_threshold: 0.015,
                silence: Duration::from_millis(700),
                min_utterance: Duration::from_millis(300),
            },
            student: StudentSettings {
                token: "dev-token".to_string(),
                student_id: "dev-student".to_string(),
                voice_engine: "hosted-realtime".to_string(),
                voice: "alloy".to_string(),
                native_language: "en".to_string(),
                target_language: "ru".to_string(),
            },
        }
    }

    fn test_deps(profiles: MemoryProfileStore) -> Arc<SessionDeps> {
        Arc::new(SessionDeps {
            config: Arc::new(test_config()),
            profiles: Arc::new(profiles),
            rules: Arc::new(MemoryRuleStore::new()),
            stt: Arc::new(MockSpeechToText::new()),
            dialogue: Arc::new(MockDialogueModel::new()),
            synthesis: Arc::new(MockSpeechSynthesis::new()),
            latency: Arc::new(LatencyRecorder::default()),
        })
    }

    async fn serve(deps: Arc<SessionDeps>) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(deps)).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn unknown_token_gets_error_event_and_close_4401() {
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let addr = serve(test_deps(MemoryProfileStore::new())).await;
        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=unknown"))
                .await
                .unwrap();

        let first = ws.next().await.unwrap().unwrap();
        match first {
            WsMessage::Text(text) => {
                let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(json["type"], "system");
                assert_eq!(json["level"], "error");
            }
            other => panic!("expected system error, got {other:?}"),
        }

        let second = ws.next().await.unwrap().unwrap();
        match second {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), CLOSE_MISSING_CREDENTIALS);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_token_is_rejected_the_same_way() {
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let addr = serve(test_deps(MemoryProfileStore::new())).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        // Skip the error event, assert on the close code.
        let mut close_code = None;
        while let Some(Ok(message)) = ws.next().await {
            if let WsMessage::Close(Some(frame)) = message {
                close_code = Some(u16::from(frame.code));
                break;
            }
        }
        assert_eq!(close_code, Some(CLOSE_MISSING_CREDENTIALS));
    }

    #[tokio::test]
    async fn unknown_token_resolves_to_missing_credentials() {
        let deps = test_deps(MemoryProfileStore::new());
        let err = resolve_profile(&deps, "nope").await.unwrap_err();
        assert!(matches!(err, SessionError::MissingCredentials));
    }

    #[tokio::test]
    async fn demote_warns_the_client_exactly_once() {
        let controller = Mutex::new(FallbackController::new());
        lock_controller(&controller)
            .unwrap()
            .start(PipelineMode::Realtime)
            .unwrap();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(4);

        demote(&controller, &outbound_tx).await.unwrap();
        match outbound_rx.try_recv().unwrap() {
            Outbound::Message(ServerMessage::System { level, .. }) => {
                assert_eq!(level, crate::protocol::SystemLevel::Warning);
            }
            other => panic!("expected warning, got {other:?}"),
        }

        // The state machine refuses a second demotion, so no second warning.
        assert!(demote(&controller, &outbound_tx).await.is_err());
        assert!(outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn session_mode_follows_the_voice_engine() {
        let realtime = StudentProfile {
            student_id: "s1".into(),
            voice_engine: VoiceEngine::HostedRealtime,
            voice: "alloy".into(),
            native_language: "en".into(),
            target_language: "ru".into(),
        };
        assert_eq!(Session::open(&realtime).mode, PipelineMode::Realtime);

        let legacy = StudentProfile {
            voice_engine: VoiceEngine::from_name("neural-tts"),
            ..realtime
        };
        assert_eq!(Session::open(&legacy).mode, PipelineMode::Legacy);
    }
}
