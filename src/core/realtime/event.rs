//! Demultiplexed protocol events.
//!
//! The wire layer collapses the backend's event zoo into this small enum;
//! everything above the protocol session consumes these and never sees raw
//! wire frames.

use serde_json::Value;

use crate::core::audio::VoicePlaybackDelta;
use crate::tools::TokenUsage;

/// Who produced a transcript segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    User,
    Assistant,
}

/// A fully assembled tool call, emitted exactly once per call id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// Why the protocol session closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the owning session.
    Requested,
    /// Reconnect attempts ran out.
    ReconnectExhausted { attempts: u32 },
    /// Unrecoverable local failure.
    Fatal(String),
}

/// Events flowing out of a protocol session.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// Connection (re-)established; `reconnect` is false for the first one.
    Connected { reconnect: bool },

    /// Backend VAD detected the start of user speech.
    SpeechStarted { audio_start_ms: u64 },

    /// Backend VAD detected the end of user speech.
    SpeechStopped { audio_end_ms: u64 },

    /// A user or assistant transcript segment.
    Transcript {
        text: String,
        role: TranscriptRole,
        is_final: bool,
    },

    /// Assistant audio for playback. Exactly one terminal delta is emitted
    /// per assistant turn.
    Playback(VoicePlaybackDelta),

    /// An assistant turn began; carries the response id used for targeted
    /// cancellation on barge-in.
    ResponseStarted { response_id: Option<String> },

    /// An assistant turn finished.
    ResponseCompleted { response_id: Option<String> },

    /// A complete tool call ready for execution.
    ToolCall(ToolCallRequest),

    /// Normalized, deduplicated token usage for one response.
    Usage {
        response_id: Option<String>,
        usage: TokenUsage,
    },

    /// Error reported by the backend; the connection stays up.
    BackendError {
        code: Option<String>,
        message: String,
    },

    /// Terminal event; nothing follows.
    Closed { reason: CloseReason },
}
