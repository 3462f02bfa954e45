//! Error taxonomy for the voice engine.
//!
//! Four families matter operationally: missing optional capabilities (probe
//! before committing to voice), usage-limit breaches (block or warn),
//! transient network failures (bounded retries with backoff), and fatal
//! session errors (propagated after best-effort rollback). Teardown paths
//! never surface errors; every cleanup step is caught and logged.

use thiserror::Error;

use crate::core::realtime::ProtocolError;

/// Result alias for voice operations.
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Whether a usage-limit breach stops the session or merely posts a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitMode {
    /// The session must stop.
    Block,
    /// The session continues; a notice is posted.
    Warn,
}

/// Errors raised by the voice engine and its collaborators.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// An optional runtime dependency needed for voice is absent.
    #[error("missing capability: {what} ({install_hint})")]
    MissingCapability {
        what: String,
        /// Actionable installation hint surfaced to operators.
        install_hint: String,
    },

    /// A metered resource would exceed a configured cap.
    #[error("usage limit reached for {model} in window {window}: {message}")]
    UsageLimit {
        model: String,
        window: String,
        /// User-facing message posted to the chat channel.
        message: String,
        mode: LimitMode,
    },

    /// A retryable network failure (connection reset, timeout, 5xx-class).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Protocol-layer failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Storage collaborator failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transport collaborator failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Anything else during session start; callers tear down partial state
    /// before re-raising.
    #[error("session error: {0}")]
    Session(String),
}

impl VoiceError {
    /// Classify an HTTP-style status as retryable.
    pub fn is_retryable_status(status: u16) -> bool {
        matches!(status, 408 | 409 | 424 | 429) || (500..600).contains(&status)
    }

    /// Whether a bounded retry is worth attempting for this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            VoiceError::Transient(_) => true,
            VoiceError::Protocol(p) => p.is_retryable(),
            _ => false,
        }
    }
}
