//! Realtime backend WebSocket wire events.
//!
//! All events are JSON objects tagged by a `type` field and travel over a
//! single WebSocket. Decoding is strict per variant but tolerant overall:
//! an unrecognized `type` decodes to [`ServerEvent::Unknown`] instead of
//! failing the connection.
//!
//! Client events (sent to the backend):
//! - session.update
//! - input_audio_buffer.append / commit / clear
//! - conversation.item.create
//! - response.create / response.cancel
//!
//! Server events (received from the backend):
//! - session.created / session.updated
//! - input_audio_buffer.speech_started / speech_stopped / committed
//! - conversation.item.input_audio_transcription.completed / failed
//! - response.created / response.done
//! - response.audio.delta / response.audio.done
//! - response.audio_transcript.delta / response.audio_transcript.done
//! - response.text.delta / response.text.done
//! - response.content_part.done
//! - response.output_item.added / response.output_item.done
//! - response.function_call_arguments.delta / done
//! - response.required_action (batch listing of pending tool calls)
//! - error

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolDescriptor;

// =============================================================================
// Session configuration
// =============================================================================

/// `session.update` payload. Absent fields leave the backend value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionSetting>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Input transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSetting {
    pub model: String,
}

/// Backend turn detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    #[serde(rename = "server_vad")]
    ServerVad {
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        create_response: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        interrupt_response: Option<bool>,
    },
    #[serde(rename = "none")]
    None {},
}

/// Tool definition as the backend expects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl From<&ToolDescriptor> for WireTool {
    fn from(tool: &ToolDescriptor) -> Self {
        Self {
            tool_type: "function".to_string(),
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        }
    }
}

// =============================================================================
// Conversation items
// =============================================================================

/// A conversation item sent by the client (text messages and tool outputs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ConversationItem {
    /// A user text message.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(vec![ContentPart {
                part_type: "input_text".to_string(),
                text: Some(text.into()),
                transcript: None,
            }]),
            call_id: None,
            output: None,
        }
    }

    /// The textual result of a tool call.
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            item_type: "function_call_output".to_string(),
            role: None,
            content: None,
            call_id: Some(call_id.into()),
            output: Some(output.into()),
        }
    }
}

/// One content part of a conversation item. Server-side parts of audio
/// content carry the transcript instead of text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

/// `response.create` overrides; the session defaults apply when empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// =============================================================================
// Client events
// =============================================================================

/// Events sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    AudioCommit {},

    #[serde(rename = "input_audio_buffer.clear")]
    AudioClear {},

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseSpec>,
    },

    #[serde(rename = "response.cancel")]
    ResponseCancel {
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
}

impl ClientEvent {
    /// Base64-encode a PCM chunk into an append event.
    pub fn audio_append(pcm: &[u8]) -> Self {
        ClientEvent::AudioAppend {
            audio: BASE64_STANDARD.encode(pcm),
        }
    }
}

// =============================================================================
// Server events
// =============================================================================

/// Session info echoed by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
}

/// Error body carried by `error` events and transcription failures.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// `response.created` stub.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseStub {
    #[serde(default)]
    pub id: Option<String>,
}

/// Completed-response summary carried by `response.done`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseSummary {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

/// One output item inside a response (message or function call).
#[derive(Debug, Clone, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type", default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Batch action request: the backend lists every tool call it is waiting on
/// in one envelope instead of streaming them.
#[derive(Debug, Clone, Deserialize)]
pub struct RequiredActionBody {
    #[serde(rename = "type", default)]
    pub action_type: Option<String>,
    #[serde(default)]
    pub submit_tool_outputs: Option<SubmitToolOutputs>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitToolOutputs {
    #[serde(default)]
    pub tool_calls: Vec<RequiredToolCall>,
}

/// One call listed in a required-action batch.
#[derive(Debug, Clone, Deserialize)]
pub struct RequiredToolCall {
    #[serde(default, alias = "call_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionStub>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionStub {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Raw usage block. Providers disagree on field names, so the input/output
/// counters accept both spellings and a bare total is accepted on its own.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireUsage {
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: Option<u64>,
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// Events received from the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: u64,
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: u64,
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.committed")]
    AudioCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    TranscriptionFailed {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        error: Option<ErrorBody>,
    },

    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseStub },

    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.text.delta")]
    TextDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "response.content_part.done")]
    ContentPartDone {
        #[serde(default)]
        response_id: Option<String>,
        part: ContentPart,
    },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: OutputItem },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        response_id: Option<String>,
        item: OutputItem,
    },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        call_id: String,
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: Option<String>,
    },

    #[serde(rename = "response.required_action")]
    RequiredAction {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        required_action: Option<RequiredActionBody>,
    },

    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseSummary },

    #[serde(rename = "error")]
    Error { error: ErrorBody },

    /// Any `type` this build does not know about.
    #[serde(other)]
    Unknown,
}
