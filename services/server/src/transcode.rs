//! Audio format conversion.
//!
//! Inbound client audio (a compressed container such as WebM/Opus) is piped
//! through one ffmpeg subprocess per session and comes out as little-endian
//! 16-bit mono PCM at the active pipeline's target rate. Outbound PCM is
//! wrapped into a WAV container the browser can play directly.

use std::io::Cursor;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Target rate for the legacy pipeline's transcription input.
pub const LEGACY_STT_SAMPLE_RATE: u32 = 16_000;
/// Rate of the pcm16 audio the synthesis provider streams back.
pub const TTS_PCM_SAMPLE_RATE: u32 = 24_000;

fn ffmpeg_args(input_format: &str, sample_rate: u32) -> Vec<String> {
    vec![
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        input_format.into(),
        "-i".into(),
        "pipe:0".into(),
        "-f".into(),
        "s16le".into(),
        "-ar".into(),
        sample_rate.to_string(),
        "-ac".into(),
        "1".into(),
        "pipe:1".into(),
    ]
}

/// One conversion subprocess per session.
///
/// `kill_on_drop` guarantees the process is reaped on every exit path:
/// normal close, per-turn errors, disconnects, and task cancellation alike.
pub struct Transcoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl Transcoder {
    pub fn spawn(input_format: &str, sample_rate: u32) -> Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args(ffmpeg_args(input_format, sample_rate))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn ffmpeg (is it installed?)")?;

        let stdin = child.stdin.take().context("ffmpeg stdin unavailable")?;
        let stdout = child.stdout.take().context("ffmpeg stdout unavailable")?;
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
        })
    }

    /// Split off the write side so a producer task can own it. Dropping the
    /// writer closes ffmpeg's stdin, which flushes and ends the PCM stream.
    pub fn take_writer(&mut self) -> Result<TranscoderWriter> {
        self.stdin
            .take()
            .map(|stdin| TranscoderWriter { stdin })
            .context("transcoder writer already taken")
    }

    pub fn take_reader(&mut self) -> Result<TranscoderReader> {
        self.stdout
            .take()
            .map(|stdout| TranscoderReader { stdout })
            .context("transcoder reader already taken")
    }

    /// Explicit shutdown for the paths that want to log it; the Drop-based
    /// kill covers every other path.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!("ffmpeg already gone on shutdown: {}", e);
        }
        let _ = self.child.wait().await;
    }
}

pub struct TranscoderWriter {
    stdin: ChildStdin,
}

impl TranscoderWriter {
    /// Feed one inbound compressed-audio chunk.
    pub async fn write(&mut self, frame: &[u8]) -> Result<()> {
        self.stdin
            .write_all(frame)
            .await
            .context("writing to ffmpeg stdin")?;
        Ok(())
    }

    /// Close the write side so remaining output can drain.
    pub async fn close(mut self) -> Result<()> {
        self.stdin
            .shutdown()
            .await
            .context("closing ffmpeg stdin")?;
        Ok(())
    }
}

pub struct TranscoderReader {
    stdout: ChildStdout,
}

impl TranscoderReader {
    /// Read up to `n` bytes of converted PCM. An empty result means
    /// end-of-stream.
    pub async fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let read = self
            .stdout
            .read(&mut buf)
            .await
            .context("reading from ffmpeg stdout")?;
        buf.truncate(read);
        Ok(buf)
    }
}

/// Wrap raw little-endian pcm16 mono samples into a playable WAV blob.
pub fn wav_wrap(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer =
        hound::WavWriter::new(&mut cursor, spec).context("creating wav writer")?;
    for sample in pcm.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
            .context("writing wav sample")?;
    }
    writer.finalize().context("finalizing wav")?;
    Ok(cursor.into_inner())
}

/// Read a WAV blob back into its spec and raw pcm16 payload.
pub fn wav_unwrap(bytes: &[u8]) -> Result<(hound::WavSpec, Vec<u8>)> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).context("reading wav header")?;
    let spec = reader.spec();
    let mut pcm = Vec::with_capacity(bytes.len());
    for sample in reader.samples::<i16>() {
        pcm.extend_from_slice(&sample.context("reading wav sample")?.to_le_bytes());
    }
    Ok((spec, pcm))
}
