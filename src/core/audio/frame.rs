//! Audio frame and transcript data types shared across the engine.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::transport::SpeakerId;

/// Milliseconds since the Unix epoch; used to stamp frames and deltas.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// PCM encoding of a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// 16-bit signed little-endian PCM.
    #[default]
    Pcm16,
}

/// One captured audio frame on its way to the backend.
///
/// A zero-length payload with `is_speech_end` set is a control marker that
/// closes a manual-endpointing turn; it carries no audio.
#[derive(Debug, Clone)]
pub struct VoiceInputFrame {
    pub channels: u16,
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
    pub data: Bytes,
    pub speaker_id: Option<SpeakerId>,
    pub timestamp_ms: u64,
    pub is_speech_end: bool,
}

impl VoiceInputFrame {
    /// A speech-end control marker for the given speaker.
    pub fn speech_end_marker(sample_rate: u32, speaker_id: Option<SpeakerId>) -> Self {
        Self {
            channels: 1,
            sample_rate,
            encoding: AudioEncoding::Pcm16,
            data: Bytes::new(),
            speaker_id,
            timestamp_ms: now_ms(),
            is_speech_end: true,
        }
    }

    /// True for control markers that carry no audio.
    pub fn is_control(&self) -> bool {
        self.is_speech_end && self.data.is_empty()
    }
}

/// One chunk of assistant audio on its way to channel playback.
///
/// Exactly one terminal delta (`is_final`, possibly with empty `data`) is
/// produced per assistant turn so the playback pipeline can pad and settle.
#[derive(Debug, Clone)]
pub struct VoicePlaybackDelta {
    pub data: Bytes,
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub is_final: bool,
    pub timestamp_ms: u64,
}

impl VoicePlaybackDelta {
    /// A chunk of assistant audio.
    pub fn chunk(data: Bytes, sample_rate: u32) -> Self {
        Self {
            data,
            encoding: AudioEncoding::Pcm16,
            sample_rate,
            is_final: false,
            timestamp_ms: now_ms(),
        }
    }

    /// The terminal delta for a turn.
    pub fn terminal(sample_rate: u32) -> Self {
        Self {
            data: Bytes::new(),
            encoding: AudioEncoding::Pcm16,
            sample_rate,
            is_final: true,
            timestamp_ms: now_ms(),
        }
    }
}

/// Start/end timing of a transcript segment, in milliseconds of session audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentPosition {
    pub start: u64,
    pub end: u64,
}

/// One transcript segment.
///
/// Partial segments (`is_final == false`) are transient UI hints; only final
/// segments are retained and posted to text channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceTranscriptSegment {
    pub text: String,
    pub is_final: bool,
    pub position: SegmentPosition,
    pub speaker_id: Option<SpeakerId>,
}
