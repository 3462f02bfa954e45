//! Streaming tool-call assembly.
//!
//! Tool call metadata and argument text arrive in fragments across several
//! wire events, and the completion signal can arrive twice (once on
//! `function_call_arguments.done` and again inside `response.done`). The
//! arena buffers fragments per call id and guarantees each call is emitted
//! at most once, with its arguments parsed as JSON.

use std::collections::{HashMap, HashSet};

use serde_json::{Value, json};
use tracing::warn;

use super::event::ToolCallRequest;

/// Key under which unparseable argument text is preserved.
pub const RAW_ARGUMENTS_KEY: &str = "_raw_arguments";

#[derive(Default)]
struct PendingCall {
    name: Option<String>,
    arguments: String,
}

/// Per-connection buffer of partially received tool calls.
#[derive(Default)]
pub struct ToolCallArena {
    pending: HashMap<String, PendingCall>,
    emitted: HashSet<String>,
}

impl ToolCallArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the tool name for a call id. Names arrive on
    /// `response.output_item.added`, usually before any argument fragments.
    pub fn note_name(&mut self, call_id: &str, name: &str) {
        if self.emitted.contains(call_id) {
            return;
        }
        self.pending
            .entry(call_id.to_string())
            .or_default()
            .name
            .get_or_insert_with(|| name.to_string());
    }

    /// Append an argument text fragment.
    pub fn push_chunk(&mut self, call_id: &str, delta: &str) {
        if self.emitted.contains(call_id) {
            return;
        }
        self.pending
            .entry(call_id.to_string())
            .or_default()
            .arguments
            .push_str(delta);
    }

    /// Finish a call. The first completion for a call id emits the request
    /// and releases the buffer; any repeat returns `None`.
    ///
    /// `final_arguments`, when present, supersedes the buffered fragments.
    pub fn complete(
        &mut self,
        call_id: &str,
        name: Option<&str>,
        final_arguments: Option<&str>,
    ) -> Option<ToolCallRequest> {
        if !self.emitted.insert(call_id.to_string()) {
            return None;
        }
        let pending = self.pending.remove(call_id).unwrap_or_default();
        let name = name
            .map(str::to_string)
            .or(pending.name)?;
        let text = final_arguments.unwrap_or(&pending.arguments);
        Some(ToolCallRequest {
            call_id: call_id.to_string(),
            name,
            arguments: parse_arguments(call_id, text),
        })
    }

    /// Drop all in-flight buffers. Called when the connection is replaced;
    /// the backend will not finish calls started on the old connection.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of calls currently buffering.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

/// Parse argument text, preserving malformed input instead of dropping it.
fn parse_arguments(call_id: &str, text: &str) -> Value {
    if text.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value) if value.is_object() => value,
        Ok(value) => json!({ RAW_ARGUMENTS_KEY: value.to_string() }),
        Err(err) => {
            warn!(call_id, %err, "tool call arguments are not valid JSON");
            json!({ RAW_ARGUMENTS_KEY: text })
        }
    }
}
