pub mod audio;
pub mod realtime;
pub mod session;

// Re-export commonly used types for convenience
pub use audio::{
    AudioEncoding, AudioFrameStream, SegmentPosition, VoiceInputFrame, VoicePlaybackDelta,
    VoiceTranscriptSegment,
};
pub use realtime::{
    BackendConfig, CloseReason, ConnectionState, ProtocolError, ProtocolEvent, ProtocolResult,
    RealtimeProtocolSession, RetryPolicy, ToolCallRequest, TranscriptRole,
};
pub use session::{SessionEvent, SessionState, StopReason, VoiceSession, VoiceSessionStatus};
