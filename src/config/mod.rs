//! Voice runtime configuration.
//!
//! Configuration is resolved in two layers: a process-wide base config and
//! persisted per-guild patches. Resolution always produces an immutable
//! [`VoiceRuntimeConfig`] snapshot; running sessions receive a replacement
//! snapshot on config change, never an in-place mutation.
//!
//! Patches ([`VoiceConfigPatch`]) are partial overlays: top-level scalars
//! overwrite only when present, nested sections merge field by field, and
//! patch composition is associative so `apply(apply(base, p1), p2)` equals
//! `apply(base, merge(p1, p2))`.

use serde::{Deserialize, Serialize};

use crate::transport::ChannelId;

// =============================================================================
// Endpointing
// =============================================================================

/// How the end of a spoken utterance is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointingStrategy {
    /// The backend performs turn detection; capture subscriptions stay open
    /// until explicitly ended.
    ServerVad,
    /// The caller signals end-of-speech explicitly; a zero-length control
    /// marker closes the turn.
    Manual,
    /// Capture subscriptions auto-close after a configured silence duration;
    /// a trailing-silence frame gives the backend a clean cutoff.
    #[default]
    #[serde(other)]
    ClientVad,
}

// =============================================================================
// Config sections
// =============================================================================

/// Capture-side audio parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Channel count frames are normalized to before transmission.
    pub channels: u16,
    /// Target sample rate the backend receives (Hz).
    pub sample_rate: u32,
    /// Silence duration that closes a client-vad capture (ms).
    pub silence_duration_ms: u64,
    /// RMS energy floor below which a frame is discarded (0.0..1.0).
    pub vad_threshold: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            sample_rate: 24_000,
            silence_duration_ms: 700,
            vad_threshold: 0.01,
        }
    }
}

/// Playback-side audio parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Sample rate of the channel playback resource (Hz).
    pub sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
        }
    }
}

/// Transcript emission settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TranscriptConfig {
    /// Whether final transcript segments are posted to a text channel.
    pub enabled: bool,
    /// Explicit target channel; when absent the manager falls back through
    /// the voice channel itself and the guild default channel.
    pub target_channel_id: Option<ChannelId>,
}

/// Immutable voice configuration snapshot for one guild.
///
/// Replaced wholesale on update. Invariant: both sample rates are non-zero
/// (checked by [`VoiceRuntimeConfig::validate`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceRuntimeConfig {
    /// Master switch; a disabled guild never starts sessions.
    pub enabled: bool,
    /// Endpointing strategy for capture subscriptions.
    pub endpointing: EndpointingStrategy,
    /// Backend model override; the engine default applies when absent.
    pub model: Option<String>,
    /// Playback parameters.
    pub playback: PlaybackConfig,
    /// Voice preset requested from the backend.
    pub playback_voice: Option<String>,
    /// Transcript emission settings.
    pub transcript: TranscriptConfig,
    /// Capture parameters.
    pub capture: CaptureConfig,
    /// Maximum simultaneous voice sessions per guild.
    pub max_concurrent_channels: usize,
}

impl Default for VoiceRuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpointing: EndpointingStrategy::default(),
            model: None,
            playback: PlaybackConfig::default(),
            playback_voice: None,
            transcript: TranscriptConfig {
                enabled: true,
                target_channel_id: None,
            },
            capture: CaptureConfig::default(),
            max_concurrent_channels: 1,
        }
    }
}

impl VoiceRuntimeConfig {
    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.capture.sample_rate == 0 {
            return Err("capture.sample_rate must be > 0".to_string());
        }
        if self.playback.sample_rate == 0 {
            return Err("playback.sample_rate must be > 0".to_string());
        }
        if self.capture.channels == 0 {
            return Err("capture.channels must be > 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Patches
// =============================================================================

/// Partial overlay over [`CaptureConfig`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CapturePatch {
    pub channels: Option<u16>,
    pub sample_rate: Option<u32>,
    pub silence_duration_ms: Option<u64>,
    pub vad_threshold: Option<f32>,
}

impl CapturePatch {
    fn merge(self, other: Self) -> Self {
        Self {
            channels: other.channels.or(self.channels),
            sample_rate: other.sample_rate.or(self.sample_rate),
            silence_duration_ms: other.silence_duration_ms.or(self.silence_duration_ms),
            vad_threshold: other.vad_threshold.or(self.vad_threshold),
        }
    }

    fn apply(&self, base: &CaptureConfig) -> CaptureConfig {
        CaptureConfig {
            channels: self.channels.unwrap_or(base.channels),
            sample_rate: self.sample_rate.unwrap_or(base.sample_rate),
            silence_duration_ms: self.silence_duration_ms.unwrap_or(base.silence_duration_ms),
            vad_threshold: self.vad_threshold.unwrap_or(base.vad_threshold),
        }
    }
}

/// Partial overlay over [`PlaybackConfig`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaybackPatch {
    pub sample_rate: Option<u32>,
}

impl PlaybackPatch {
    fn merge(self, other: Self) -> Self {
        Self {
            sample_rate: other.sample_rate.or(self.sample_rate),
        }
    }

    fn apply(&self, base: &PlaybackConfig) -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: self.sample_rate.unwrap_or(base.sample_rate),
        }
    }
}

/// Partial overlay over [`TranscriptConfig`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TranscriptPatch {
    pub enabled: Option<bool>,
    pub target_channel_id: Option<ChannelId>,
}

impl TranscriptPatch {
    fn merge(self, other: Self) -> Self {
        Self {
            enabled: other.enabled.or(self.enabled),
            target_channel_id: other.target_channel_id.or(self.target_channel_id),
        }
    }

    fn apply(&self, base: &TranscriptConfig) -> TranscriptConfig {
        TranscriptConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            target_channel_id: self
                .target_channel_id
                .clone()
                .or_else(|| base.target_channel_id.clone()),
        }
    }
}

/// Partial overlay over [`VoiceRuntimeConfig`].
///
/// Two patches compose associatively via [`VoiceConfigPatch::merge`]; the
/// right-hand patch wins wherever both set the same field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VoiceConfigPatch {
    pub enabled: Option<bool>,
    pub endpointing: Option<EndpointingStrategy>,
    pub model: Option<String>,
    pub playback: Option<PlaybackPatch>,
    pub playback_voice: Option<String>,
    pub transcript: Option<TranscriptPatch>,
    pub capture: Option<CapturePatch>,
    pub max_concurrent_channels: Option<usize>,
}

impl VoiceConfigPatch {
    /// Compose two patches; `other` is right-biased.
    pub fn merge(self, other: Self) -> Self {
        Self {
            enabled: other.enabled.or(self.enabled),
            endpointing: other.endpointing.or(self.endpointing),
            model: other.model.or(self.model),
            playback: merge_opt(self.playback, other.playback, PlaybackPatch::merge),
            playback_voice: other.playback_voice.or(self.playback_voice),
            transcript: merge_opt(self.transcript, other.transcript, TranscriptPatch::merge),
            capture: merge_opt(self.capture, other.capture, CapturePatch::merge),
            max_concurrent_channels: other.max_concurrent_channels.or(self.max_concurrent_channels),
        }
    }

    /// Overlay this patch onto a base snapshot, producing a new snapshot.
    pub fn apply(&self, base: &VoiceRuntimeConfig) -> VoiceRuntimeConfig {
        VoiceRuntimeConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            endpointing: self.endpointing.unwrap_or(base.endpointing),
            model: self.model.clone().or_else(|| base.model.clone()),
            playback: self
                .playback
                .as_ref()
                .map(|p| p.apply(&base.playback))
                .unwrap_or_else(|| base.playback.clone()),
            playback_voice: self
                .playback_voice
                .clone()
                .or_else(|| base.playback_voice.clone()),
            transcript: self
                .transcript
                .as_ref()
                .map(|p| p.apply(&base.transcript))
                .unwrap_or_else(|| base.transcript.clone()),
            capture: self
                .capture
                .as_ref()
                .map(|p| p.apply(&base.capture))
                .unwrap_or_else(|| base.capture.clone()),
            max_concurrent_channels: self
                .max_concurrent_channels
                .unwrap_or(base.max_concurrent_channels),
        }
    }

    /// True when the patch sets nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn merge_opt<T>(left: Option<T>, right: Option<T>, merge: impl FnOnce(T, T) -> T) -> Option<T> {
    match (left, right) {
        (Some(l), Some(r)) => Some(merge(l, r)),
        (l, r) => r.or(l),
    }
}

// =============================================================================
// Tuning
// =============================================================================

/// Business constants that are configuration-surface candidates rather than
/// hard invariants. Defaults match production behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceTuning {
    /// Floor for the trailing-silence frame appended by client-vad captures (ms).
    pub trailing_silence_floor_ms: u64,
    /// Silence pad written after a final playback delta to avoid truncation (ms).
    pub playback_settle_pad_ms: u64,
    /// Maximum reconnect attempts after an unexpected connection drop.
    pub reconnect_max_attempts: u32,
    /// Initial reconnect backoff delay (ms).
    pub reconnect_initial_delay_ms: u64,
    /// Reconnect backoff cap (ms).
    pub reconnect_max_delay_ms: u64,
    /// Local retry attempts for a failed audio append before the frame is dropped.
    pub append_retry_attempts: u32,
    /// Delay between local append retries (ms).
    pub append_retry_delay_ms: u64,
    /// Usage-limit chat notices are deduplicated within this window (s).
    pub usage_notice_window_secs: u64,
}

impl Default for VoiceTuning {
    fn default() -> Self {
        Self {
            trailing_silence_floor_ms: 200,
            playback_settle_pad_ms: 120,
            reconnect_max_attempts: 5,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 5_000,
            append_retry_attempts: 3,
            append_retry_delay_ms: 50,
            usage_notice_window_secs: 3_600,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
