use base64::Engine;

use crate::types::audio::Base64EncodedAudioBytes;

/// Sample rate the realtime API expects for pcm16 audio, in Hz.
pub const REALTIME_PCM16_SAMPLE_RATE: u32 = 24_000;

/// Encode raw little-endian pcm16 bytes for an `input_audio_buffer.append`.
pub fn encode_pcm16(pcm: &[u8]) -> Base64EncodedAudioBytes {
    base64::engine::general_purpose::STANDARD.encode(pcm)
}

/// Decode an audio delta back into raw little-endian pcm16 bytes.
/// A malformed fragment decodes to empty rather than poisoning the stream.
pub fn decode_pcm16(fragment: &str) -> Vec<u8> {
    match base64::engine::general_purpose::STANDARD.decode(fragment) {
        Ok(pcm) => pcm,
        Err(e) => {
            tracing::error!("failed to decode base64 audio fragment: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_round_trips_through_base64() {
        let pcm: Vec<u8> = vec![0x00, 0x01, 0xff, 0x7f, 0x00, 0x80];
        let encoded = encode_pcm16(&pcm);
        assert_eq!(decode_pcm16(&encoded), pcm);
    }

    #[test]
    fn malformed_fragment_decodes_to_empty() {
        assert!(decode_pcm16("not base64!!!").is_empty());
    }
}
