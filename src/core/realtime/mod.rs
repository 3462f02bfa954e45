//! Realtime speech backend protocol.
//!
//! One [`RealtimeProtocolSession`] wraps one WebSocket connection to the
//! backend, with bounded automatic reconnection. Wire frames are decoded
//! into tagged [`messages::ServerEvent`]s and demultiplexed into the small
//! [`ProtocolEvent`] enum everything above this module consumes.
//!
//! # Audio Format
//!
//! PCM 16-bit signed little-endian at 24kHz mono in both directions,
//! base64-encoded on the wire.

mod base;
pub mod messages;

mod event;
mod session;
mod tool_calls;
mod usage;

pub use base::{
    BACKEND_SAMPLE_RATE, BackendConfig, ConnectionState, DEFAULT_REALTIME_MODEL,
    DEFAULT_REALTIME_URL, ProtocolError, ProtocolResult, RetryPolicy,
};
pub use event::{CloseReason, ProtocolEvent, ToolCallRequest, TranscriptRole};
pub use session::RealtimeProtocolSession;
pub use tool_calls::{RAW_ARGUMENTS_KEY, ToolCallArena};
pub use usage::UsageLedger;
