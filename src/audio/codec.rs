use crate::error::LiveError;
use base64::Engine as _;

/// Scale between signed 16-bit PCM and normalized `f32` samples.
const PCM16_SCALE: f32 = i16::MAX as f32 + 1.0;

pub fn decode_bytes(text: &str) -> Result<Vec<u8>, LiveError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(text)?)
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Interprets `bytes` as interleaved little-endian i16 samples and returns one
/// normalized sample vector per channel.
pub fn pcm16_to_float(bytes: &[u8], channel_count: u16) -> Result<Vec<Vec<f32>>, LiveError> {
    if channel_count == 0 {
        return Err(LiveError::Decode("channel count must be at least 1".into()));
    }
    if bytes.len() % 2 != 0 {
        return Err(LiveError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }

    let channels = channel_count as usize;
    let frame_count = bytes.len() / 2 / channels;
    let mut out = vec![Vec::with_capacity(frame_count); channels];
    for (i, pair) in bytes.chunks_exact(2).take(frame_count * channels).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        out[i % channels].push(sample as f32 / PCM16_SCALE);
    }
    Ok(out)
}

/// Mono only. Values are truncated toward zero and saturate at the i16 range.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * PCM16_SCALE) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Reads the `rate=` parameter of a mime type such as `audio/pcm;rate=24000`.
pub fn sample_rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_round_trip_including_empty() {
        for bytes in [vec![], vec![0u8], vec![1, 2, 3], (0..=255).collect::<Vec<u8>>()] {
            assert_eq!(decode_bytes(&encode_bytes(&bytes)).unwrap(), bytes);
        }
    }

    #[test]
    fn test_decode_bytes_rejects_malformed_text() {
        assert!(matches!(decode_bytes("not base64!"), Err(LiveError::Decode(_))));
    }

    #[test]
    fn test_pcm_round_trip_within_quantization_error() {
        let samples: Vec<f32> = (0..2000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.999)
            .chain([-1.0, 0.0, 0.5, -0.5])
            .collect();
        let decoded = pcm16_to_float(&float_to_pcm16(&samples), 1).unwrap();
        assert_eq!(decoded.len(), 1);
        for (original, restored) in samples.iter().zip(&decoded[0]) {
            assert!(
                (original - restored).abs() <= 1.0 / 32768.0,
                "{} vs {}",
                original,
                restored
            );
        }
    }

    #[test]
    fn test_full_scale_saturates_instead_of_wrapping() {
        let bytes = float_to_pcm16(&[1.0, -1.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MIN);
    }

    #[test]
    fn test_pcm16_deinterleaves_channels() {
        let mut bytes = Vec::new();
        for s in [16384i16, -16384, 8192, -8192] {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let channels = pcm16_to_float(&bytes, 2).unwrap();
        assert_eq!(channels[0], vec![0.5, 0.25]);
        assert_eq!(channels[1], vec![-0.5, -0.25]);
    }

    #[test]
    fn test_pcm16_rejects_odd_length_and_zero_channels() {
        assert!(matches!(pcm16_to_float(&[0, 1, 2], 1), Err(LiveError::Decode(_))));
        assert!(matches!(pcm16_to_float(&[0, 1], 0), Err(LiveError::Decode(_))));
    }

    #[test]
    fn test_sample_rate_from_mime() {
        assert_eq!(sample_rate_from_mime("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(sample_rate_from_mime("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(sample_rate_from_mime("audio/pcm"), None);
    }
}
