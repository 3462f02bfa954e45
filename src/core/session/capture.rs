//! Per-speaker capture task.
//!
//! One task per subscribed speaker: decodes the transport's PCM chunks,
//! downmixes and resamples them to the backend rate, gates sub-threshold
//! audio with an RMS energy check, and pushes the result into the session's
//! shared frame queue. Voiced audio arriving while the assistant is speaking
//! raises a barge-in signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{CaptureConfig, EndpointingStrategy};
use crate::core::audio::pcm::{
    downmix_to_mono, pcm16_bytes_to_samples, resample_linear, rms_energy, samples_to_pcm16_bytes,
    silence_frame,
};
use crate::core::audio::{AudioEncoding, AudioFrameStream, VoiceInputFrame, now_ms};
use crate::transport::{SpeakerAudioStream, SpeakerId};

/// Parameters of one capture subscription.
#[derive(Clone)]
pub(crate) struct CaptureSpec {
    pub speaker: SpeakerId,
    pub capture: CaptureConfig,
    pub endpointing: EndpointingStrategy,
    /// Floor for the trailing-silence frame appended when a client-vad
    /// subscription closes (ms).
    pub trailing_silence_floor_ms: u64,
}

impl CaptureSpec {
    /// Duration of the trailing-silence frame that closes a client-vad turn.
    fn trailing_silence_ms(&self) -> u64 {
        self.capture
            .silence_duration_ms
            .max(self.trailing_silence_floor_ms)
    }
}

/// Drive one speaker subscription until the feed closes, the stream ends,
/// or the session is cancelled.
pub(crate) async fn run_capture(
    spec: CaptureSpec,
    mut feed: SpeakerAudioStream,
    frames: Arc<AudioFrameStream>,
    assistant_speaking: Arc<AtomicBool>,
    barge_in: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let mut voiced = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = feed.chunks.recv() => match chunk {
                Some(raw) => {
                    let samples = pcm16_bytes_to_samples(&raw);
                    let mono = downmix_to_mono(&samples, feed.channels);
                    if mono.is_empty() {
                        continue;
                    }
                    let energy = rms_energy(&mono);

                    if energy >= spec.capture.vad_threshold {
                        voiced = true;
                        if assistant_speaking.load(Ordering::Relaxed) {
                            let _ = barge_in.try_send(());
                        }
                    } else if spec.endpointing != EndpointingStrategy::ServerVad {
                        // Below the energy gate. Server VAD does its own
                        // detection and needs the full stream, including
                        // silence.
                        continue;
                    }

                    let resampled =
                        resample_linear(&mono, feed.sample_rate, spec.capture.sample_rate);
                    let frame = VoiceInputFrame {
                        channels: 1,
                        sample_rate: spec.capture.sample_rate,
                        encoding: AudioEncoding::Pcm16,
                        data: samples_to_pcm16_bytes(&resampled),
                        speaker_id: Some(spec.speaker.clone()),
                        timestamp_ms: now_ms(),
                        is_speech_end: false,
                    };
                    if !frames.push(frame).await {
                        break;
                    }
                }
                None => {
                    // Subscription closed by the transport.
                    if voiced && spec.endpointing == EndpointingStrategy::ClientVad {
                        finish_client_vad_turn(&spec, &frames).await;
                    }
                    break;
                }
            }
        }
    }
    debug!(speaker = %spec.speaker, "capture ended");
}

/// A client-vad subscription closed after silence: give the backend a clean
/// cutoff frame, then the end-of-speech marker that commits the turn.
async fn finish_client_vad_turn(spec: &CaptureSpec, frames: &AudioFrameStream) {
    let silence = VoiceInputFrame {
        channels: 1,
        sample_rate: spec.capture.sample_rate,
        encoding: AudioEncoding::Pcm16,
        data: silence_frame(spec.trailing_silence_ms(), spec.capture.sample_rate),
        speaker_id: Some(spec.speaker.clone()),
        timestamp_ms: now_ms(),
        is_speech_end: false,
    };
    if frames.push(silence).await {
        let _ = frames
            .push(VoiceInputFrame::speech_end_marker(
                spec.capture.sample_rate,
                Some(spec.speaker.clone()),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn spec(endpointing: EndpointingStrategy) -> CaptureSpec {
        CaptureSpec {
            speaker: SpeakerId::new("u1"),
            capture: CaptureConfig {
                silence_duration_ms: 300,
                ..Default::default()
            },
            endpointing,
            trailing_silence_floor_ms: 200,
        }
    }

    fn feed(rate: u32, channels: u16) -> (mpsc::Sender<Bytes>, SpeakerAudioStream) {
        let (tx, rx) = mpsc::channel(16);
        (
            tx,
            SpeakerAudioStream {
                chunks: rx,
                sample_rate: rate,
                channels,
            },
        )
    }

    fn loud_chunk(samples: usize) -> Bytes {
        let wave: Vec<i16> = (0..samples)
            .map(|i| if i % 2 == 0 { 8_000 } else { -8_000 })
            .collect();
        samples_to_pcm16_bytes(&wave)
    }

    fn silent_chunk(samples: usize) -> Bytes {
        Bytes::from(vec![0u8; samples * 2])
    }

    #[tokio::test]
    async fn voiced_audio_is_resampled_and_forwarded() {
        let (tx, feed) = feed(48_000, 1);
        let frames = Arc::new(AudioFrameStream::default());
        let task = tokio::spawn(run_capture(
            spec(EndpointingStrategy::ServerVad),
            feed,
            frames.clone(),
            Arc::new(AtomicBool::new(false)),
            mpsc::channel(1).0,
            CancellationToken::new(),
        ));

        tx.send(loud_chunk(480)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let frame = frames.next().await.expect("frame");
        assert_eq!(frame.sample_rate, 24_000);
        // 480 samples at 48kHz downsample to 240 at 24kHz.
        assert_eq!(frame.data.len(), 480);
        assert_eq!(frame.speaker_id.as_ref().unwrap().as_str(), "u1");
        frames.end();
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn sub_threshold_audio_is_gated() {
        let (tx, feed) = feed(24_000, 1);
        let frames = Arc::new(AudioFrameStream::default());
        let task = tokio::spawn(run_capture(
            spec(EndpointingStrategy::Manual),
            feed,
            frames.clone(),
            Arc::new(AtomicBool::new(false)),
            mpsc::channel(1).0,
            CancellationToken::new(),
        ));

        tx.send(silent_chunk(240)).await.unwrap();
        tx.send(loud_chunk(240)).await.unwrap();
        tx.send(silent_chunk(240)).await.unwrap();
        drop(tx);
        task.await.unwrap();
        frames.end();

        let mut forwarded = 0;
        while frames.next().await.is_some() {
            forwarded += 1;
        }
        // Only the voiced chunk passed the energy gate.
        assert_eq!(forwarded, 1);
    }

    #[tokio::test]
    async fn client_vad_close_appends_silence_and_marker() {
        let (tx, feed) = feed(24_000, 1);
        let frames = Arc::new(AudioFrameStream::default());
        let task = tokio::spawn(run_capture(
            spec(EndpointingStrategy::ClientVad),
            feed,
            frames.clone(),
            Arc::new(AtomicBool::new(false)),
            mpsc::channel(1).0,
            CancellationToken::new(),
        ));

        tx.send(loud_chunk(240)).await.unwrap();
        drop(tx);
        task.await.unwrap();
        frames.end();

        let speech = frames.next().await.expect("speech frame");
        assert!(!speech.is_speech_end);

        let silence = frames.next().await.expect("trailing silence");
        // 300ms at 24kHz mono PCM16.
        assert_eq!(silence.data.len(), 14_400);
        assert!(silence.data.iter().all(|&b| b == 0));

        let marker = frames.next().await.expect("marker");
        assert!(marker.is_control());
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn server_vad_forwards_silence_ungated() {
        let (tx, feed) = feed(24_000, 1);
        let frames = Arc::new(AudioFrameStream::default());
        let task = tokio::spawn(run_capture(
            spec(EndpointingStrategy::ServerVad),
            feed,
            frames.clone(),
            Arc::new(AtomicBool::new(false)),
            mpsc::channel(1).0,
            CancellationToken::new(),
        ));

        // The backend's VAD needs the silence; nothing is dropped locally.
        tx.send(silent_chunk(240)).await.unwrap();
        tx.send(loud_chunk(240)).await.unwrap();
        drop(tx);
        task.await.unwrap();
        frames.end();

        let mut forwarded = 0;
        while frames.next().await.is_some() {
            forwarded += 1;
        }
        assert_eq!(forwarded, 2);
    }

    #[tokio::test]
    async fn server_vad_close_emits_no_marker() {
        let (tx, feed) = feed(24_000, 1);
        let frames = Arc::new(AudioFrameStream::default());
        let task = tokio::spawn(run_capture(
            spec(EndpointingStrategy::ServerVad),
            feed,
            frames.clone(),
            Arc::new(AtomicBool::new(false)),
            mpsc::channel(1).0,
            CancellationToken::new(),
        ));

        tx.send(loud_chunk(240)).await.unwrap();
        drop(tx);
        task.await.unwrap();
        frames.end();

        assert!(frames.next().await.is_some());
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn voiced_audio_during_assistant_speech_signals_barge_in() {
        let (tx, feed) = feed(24_000, 1);
        let frames = Arc::new(AudioFrameStream::default());
        let (barge_tx, mut barge_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_capture(
            spec(EndpointingStrategy::ServerVad),
            feed,
            frames.clone(),
            Arc::new(AtomicBool::new(true)),
            barge_tx,
            CancellationToken::new(),
        ));

        tx.send(loud_chunk(240)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(barge_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stereo_feed_is_downmixed() {
        let (tx, feed) = feed(24_000, 2);
        let frames = Arc::new(AudioFrameStream::default());
        let task = tokio::spawn(run_capture(
            spec(EndpointingStrategy::ServerVad),
            feed,
            frames.clone(),
            Arc::new(AtomicBool::new(false)),
            mpsc::channel(1).0,
            CancellationToken::new(),
        ));

        // 240 interleaved stereo pairs with matching signs per pair, so the
        // downmix keeps its energy.
        let wave: Vec<i16> = (0..480)
            .map(|i| if (i / 2) % 2 == 0 { 8_000 } else { -8_000 })
            .collect();
        tx.send(samples_to_pcm16_bytes(&wave)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let frame = frames.next().await.expect("frame");
        assert_eq!(frame.channels, 1);
        assert_eq!(frame.data.len(), 480);
    }
}
