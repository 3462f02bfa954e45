//! Tool execution contract bridging backend tool calls to the host agent.
//!
//! The backend requests a tool by name with JSON arguments; the engine hands
//! the request to the host's [`ToolExecutor`] and later relays the textual
//! outcome back over the protocol session. Usage accounting crosses a
//! similar seam via [`UsageMeter`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::VoiceResult;
use crate::transport::SessionKey;

/// A tool exposed to the backend during session negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the tool's arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// One assembled tool call ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Backend call id, echoed back with the result.
    pub call_id: String,
    pub name: String,
    /// Parsed arguments. When the backend produced unparseable argument
    /// text, the raw string is preserved under `_raw_arguments` instead of
    /// being dropped.
    pub arguments: Value,
    /// Session the call belongs to.
    pub session: SessionKey,
}

/// Result of executing one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Textual result relayed verbatim to the backend.
    pub output: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// Host-side tool runner.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools to advertise when a session starts.
    fn available_tools(&self) -> Vec<ToolDescriptor>;

    /// Execute one call. Implementations report failures through
    /// [`ToolOutcome::error`] rather than `Err`; an `Err` here means the
    /// executor itself is broken and the session relays a generic failure.
    async fn execute(&self, invocation: ToolInvocation) -> VoiceResult<ToolOutcome>;
}

/// Token usage for one assistant response, after alias normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Host-side usage accounting and limit enforcement.
#[async_trait]
pub trait UsageMeter: Send + Sync {
    /// Record usage for one response against a guild and model.
    async fn record(&self, session: &SessionKey, model: &str, usage: TokenUsage);

    /// Check whether the guild may start or continue using the given model.
    /// Returns `Err(VoiceError::UsageLimit { .. })` when a limit applies.
    async fn check_limit(&self, session: &SessionKey, model: &str) -> VoiceResult<()>;
}
