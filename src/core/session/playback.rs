//! Channel playback pipeline.
//!
//! Rebuilds the transport's playback resource lazily: torn-down sinks are
//! reopened on the next delta, idle sinks are restarted in place when the
//! transport supports it. The terminal delta of each assistant turn writes a
//! short silence pad so the tail of the utterance is not clipped, then
//! clears the assistant-speaking flag that drives barge-in detection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::core::audio::VoicePlaybackDelta;
use crate::core::audio::pcm::{
    pcm16_bytes_to_samples, resample_linear, samples_to_pcm16_bytes, silence_frame,
};
use crate::errors::{VoiceError, VoiceResult};
use crate::transport::{GuildConnection, PlaybackSink};

pub(crate) struct PlaybackPipeline {
    connection: Arc<dyn GuildConnection>,
    sink: Option<Box<dyn PlaybackSink>>,
    /// Sample rate the channel resource is opened with (Hz).
    target_rate: u32,
    /// Silence written after the terminal delta (ms).
    settle_pad_ms: u64,
    assistant_speaking: Arc<AtomicBool>,
}

impl PlaybackPipeline {
    pub(crate) fn new(
        connection: Arc<dyn GuildConnection>,
        target_rate: u32,
        settle_pad_ms: u64,
        assistant_speaking: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection,
            sink: None,
            target_rate,
            settle_pad_ms,
            assistant_speaking,
        }
    }

    /// Write one playback delta. Terminal deltas settle the turn and never
    /// fail; chunk deltas propagate transport errors.
    pub(crate) async fn write(&mut self, delta: &VoicePlaybackDelta) -> VoiceResult<()> {
        if delta.is_final {
            self.settle().await;
            return Ok(());
        }

        let pcm = self.convert(&delta.data, delta.sample_rate);
        let sink = self.ensure_sink().await?;
        sink.write(pcm).await?;
        self.assistant_speaking.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Halt playback immediately (barge-in). The sink stays for reuse.
    pub(crate) fn interrupt(&mut self) {
        if let Some(sink) = self.sink.as_ref() {
            sink.stop();
        }
        self.assistant_speaking.store(false, Ordering::Relaxed);
    }

    /// Tear the pipeline down. Infallible.
    pub(crate) fn shutdown(&mut self) {
        self.interrupt();
        self.sink = None;
    }

    async fn settle(&mut self) {
        if let Some(sink) = self.sink.as_ref()
            && !sink.is_torn_down()
        {
            let pad = silence_frame(self.settle_pad_ms, self.target_rate);
            if let Err(err) = sink.write(pad).await {
                warn!(%err, "settle pad write failed");
            }
        }
        self.assistant_speaking.store(false, Ordering::Relaxed);
    }

    fn convert(&self, data: &Bytes, source_rate: u32) -> Bytes {
        if source_rate == self.target_rate {
            return data.clone();
        }
        let samples = pcm16_bytes_to_samples(data);
        samples_to_pcm16_bytes(&resample_linear(&samples, source_rate, self.target_rate))
    }

    async fn ensure_sink(&mut self) -> VoiceResult<&mut Box<dyn PlaybackSink>> {
        let rebuild = match self.sink.as_ref() {
            None => true,
            Some(sink) => {
                if sink.is_torn_down() {
                    debug!("playback resource torn down, rebuilding");
                    true
                } else if sink.is_idle() {
                    // Prefer restarting in place; rebuild when that fails.
                    !sink.restart()
                } else {
                    false
                }
            }
        };
        if rebuild {
            let sink = self.connection.open_playback(self.target_rate).await?;
            self.sink = Some(sink);
        }
        self.sink
            .as_mut()
            .ok_or_else(|| VoiceError::Transport("playback resource unavailable".to_string()))
    }
}
