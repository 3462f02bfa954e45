//! PCM sample utilities: byte/sample conversion, downmix, linear resampling,
//! RMS energy, and silence generation.
//!
//! All helpers operate on 16-bit signed little-endian PCM, the only encoding
//! the engine moves between the channel transport and the backend.

use bytes::Bytes;

/// Decode little-endian PCM16 bytes into samples. A trailing odd byte is
/// discarded.
pub fn pcm16_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode samples as little-endian PCM16 bytes.
pub fn samples_to_pcm16_bytes(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(out)
}

/// Downmix interleaved multi-channel samples to mono by averaging.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 || samples.is_empty() {
        return samples.to_vec();
    }
    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampler. No-op when the rates match.
pub fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = src_idx - idx0 as f64;
        let s0 = input.get(idx0).copied().unwrap_or(0) as f64;
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0 as i16) as f64;
        output.push((s0 + frac * (s1 - s0)) as i16);
    }
    output
}

/// Root-mean-square energy of a sample slice, normalized to 0.0..1.0.
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sum = 0.0f64;
    for &sample in samples {
        let v = sample as f64 / 32768.0;
        sum += v * v;
    }
    (sum / samples.len() as f64).sqrt() as f32
}

/// A silent PCM16 frame of the given duration at the given rate.
pub fn silence_frame(duration_ms: u64, sample_rate: u32) -> Bytes {
    let samples = (sample_rate as u64 * duration_ms / 1000) as usize;
    Bytes::from(vec![0u8; samples * 2])
}
