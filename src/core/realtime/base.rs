//! Base types for the realtime speech backend: errors, connection state,
//! retry policy, and backend configuration.
//!
//! All audio crossing this boundary is PCM 16-bit signed little-endian at
//! 24kHz mono.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{EndpointingStrategy, VoiceRuntimeConfig, VoiceTuning};
use crate::tools::ToolDescriptor;

/// Default realtime WebSocket endpoint.
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Model used when the guild config does not name one.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

/// Default input transcription model.
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Sample rate of audio exchanged with the backend (Hz).
pub const BACKEND_SAMPLE_RATE: u32 = 24_000;

// =============================================================================
// Error Types
// =============================================================================

/// Errors from the realtime protocol layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Connection to the backend failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Missing or rejected credentials
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Wire encode/decode error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error event reported by the backend
    #[error("backend error: {message}")]
    Backend {
        code: Option<String>,
        message: String,
    },

    /// No live connection
    #[error("not connected")]
    NotConnected,

    /// The transmit queue stayed full through every retry
    #[error("transmit queue full")]
    Backpressure,
}

impl ProtocolError {
    /// Whether a bounded retry is worth attempting for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionFailed(_)
                | ProtocolError::WebSocket(_)
                | ProtocolError::Backpressure
        )
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// =============================================================================
// Retry Policy
// =============================================================================

/// Reconnection behavior as plain data: doubling backoff from
/// `initial_delay_ms` capped at `max_delay_ms`, at most `max_attempts`
/// attempts (0 means unlimited).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_tuning(tuning: &VoiceTuning) -> Self {
        Self {
            max_attempts: tuning.reconnect_max_attempts,
            initial_delay_ms: tuning.reconnect_initial_delay_ms,
            max_delay_ms: tuning.reconnect_max_delay_ms,
        }
    }

    /// Delay before the given attempt (1-based), doubling and capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of a protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Backend Configuration
// =============================================================================

/// Everything needed to open one protocol session.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// WebSocket endpoint, without the model query parameter.
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
    /// Input transcription model, e.g. "whisper-1".
    pub transcription_model: Option<String>,
    /// Tools advertised during session negotiation.
    pub tools: Vec<ToolDescriptor>,
    pub endpointing: EndpointingStrategy,
    /// Trailing silence before end of turn (ms), for server-side VAD.
    pub silence_duration_ms: u64,
    /// Server VAD activation threshold.
    pub vad_threshold: f32,
    pub retry: RetryPolicy,
}

impl BackendConfig {
    /// Derive a backend config from the resolved runtime configuration.
    pub fn from_runtime(
        config: &VoiceRuntimeConfig,
        tuning: &VoiceTuning,
        api_key: String,
    ) -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_REALTIME_MODEL.to_string()),
            voice: config.playback_voice.clone(),
            instructions: None,
            temperature: None,
            transcription_model: Some(DEFAULT_TRANSCRIPTION_MODEL.to_string()),
            tools: Vec::new(),
            endpointing: config.endpointing,
            silence_duration_ms: config.capture.silence_duration_ms,
            vad_threshold: config.capture.vad_threshold,
            retry: RetryPolicy::from_tuning(tuning),
        }
    }

    /// Full WebSocket URL including the model parameter.
    pub fn ws_url(&self) -> String {
        format!("{}?model={}", self.url, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(20), Duration::from_millis(5_000));
    }

    #[test]
    fn retry_stops_at_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(100));
    }

    #[test]
    fn zero_max_attempts_means_unlimited() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(policy.should_retry(u32::MAX));
    }

    #[test]
    fn ws_url_carries_model() {
        let config = BackendConfig::from_runtime(
            &VoiceRuntimeConfig::default(),
            &VoiceTuning::default(),
            "sk-test".into(),
        );
        assert!(config.ws_url().starts_with(DEFAULT_REALTIME_URL));
        assert!(config.ws_url().contains("?model="));
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}
