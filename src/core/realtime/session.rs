//! Realtime protocol session: one WebSocket connection to the speech
//! backend, with automatic bounded reconnection.
//!
//! The session owns a background task that holds the socket. Callers talk
//! to it through a command channel and receive [`ProtocolEvent`]s through an
//! event channel; the final event on that channel is always
//! [`ProtocolEvent::Closed`].

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::base::{
    BACKEND_SAMPLE_RATE, BackendConfig, ConnectionState, ProtocolError, ProtocolResult,
};
use super::event::{CloseReason, ProtocolEvent, TranscriptRole};
use super::messages::{
    ClientEvent, ConversationItem, ServerEvent, SessionSettings, TranscriptionSetting,
    TurnDetection, WireTool,
};
use super::tool_calls::ToolCallArena;
use super::usage::{RecentIds, UsageLedger};
use crate::config::{EndpointingStrategy, VoiceTuning};
use crate::core::audio::VoicePlaybackDelta;

/// Capacity of the command and event channels.
const CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Demultiplexer
// =============================================================================

/// Finalized turn ids kept around for terminal-delta dedup; older turns
/// age out so the set stays bounded over a long session.
const FINALIZED_CAP: usize = 64;

/// Pure translation from wire events to protocol events.
///
/// Tracks the in-flight response so barge-in can target it, and guarantees
/// exactly one terminal playback delta per assistant turn whether the turn
/// ends with `response.audio.done`, `response.done`, or both.
pub(crate) struct Demux {
    tools: ToolCallArena,
    usage: UsageLedger,
    current_response: Option<String>,
    finalized: RecentIds,
    anon_finalized: bool,
}

impl Demux {
    pub(crate) fn new() -> Self {
        Self {
            tools: ToolCallArena::new(),
            usage: UsageLedger::new(),
            current_response: None,
            finalized: RecentIds::new(FINALIZED_CAP),
            anon_finalized: false,
        }
    }

    /// Reset connection-scoped state after a reconnect. Usage stays: a
    /// replayed summary for a counted response must remain suppressed.
    pub(crate) fn on_reconnect(&mut self) {
        self.tools.clear();
        self.current_response = None;
        self.anon_finalized = false;
    }

    /// First finalization for a turn wins; repeats return false.
    fn mark_final(&mut self, response_id: Option<&str>) -> bool {
        let id = response_id
            .map(str::to_string)
            .or_else(|| self.current_response.clone());
        match id {
            Some(id) => self.finalized.insert(&id),
            None => !std::mem::replace(&mut self.anon_finalized, true),
        }
    }

    pub(crate) fn handle(&mut self, event: ServerEvent) -> Vec<ProtocolEvent> {
        match event {
            ServerEvent::SessionCreated { session } => {
                debug!(session_id = ?session.id, "realtime session created");
                Vec::new()
            }
            ServerEvent::SessionUpdated { .. } | ServerEvent::AudioCommitted { .. } => Vec::new(),

            ServerEvent::SpeechStarted { audio_start_ms, .. } => {
                vec![ProtocolEvent::SpeechStarted { audio_start_ms }]
            }
            ServerEvent::SpeechStopped { audio_end_ms, .. } => {
                vec![ProtocolEvent::SpeechStopped { audio_end_ms }]
            }

            ServerEvent::TranscriptionCompleted { transcript, .. } => {
                if transcript.trim().is_empty() {
                    return Vec::new();
                }
                vec![ProtocolEvent::Transcript {
                    text: transcript,
                    role: TranscriptRole::User,
                    is_final: true,
                }]
            }
            ServerEvent::TranscriptionFailed { error, .. } => {
                let message = error.map(|e| e.message).unwrap_or_default();
                warn!(%message, "input transcription failed");
                vec![ProtocolEvent::BackendError {
                    code: Some("transcription_failed".to_string()),
                    message,
                }]
            }

            ServerEvent::ResponseCreated { response } => {
                self.current_response = response.id.clone();
                self.anon_finalized = false;
                vec![ProtocolEvent::ResponseStarted {
                    response_id: response.id,
                }]
            }

            ServerEvent::AudioDelta { delta, .. } => match BASE64_STANDARD.decode(&delta) {
                Ok(pcm) => vec![ProtocolEvent::Playback(VoicePlaybackDelta::chunk(
                    Bytes::from(pcm),
                    BACKEND_SAMPLE_RATE,
                ))],
                Err(err) => {
                    warn!(%err, "dropping undecodable audio delta");
                    Vec::new()
                }
            },
            ServerEvent::AudioDone { response_id } => {
                if self.mark_final(response_id.as_deref()) {
                    vec![ProtocolEvent::Playback(VoicePlaybackDelta::terminal(
                        BACKEND_SAMPLE_RATE,
                    ))]
                } else {
                    Vec::new()
                }
            }

            ServerEvent::AudioTranscriptDelta { delta, .. } => {
                vec![ProtocolEvent::Transcript {
                    text: delta,
                    role: TranscriptRole::Assistant,
                    is_final: false,
                }]
            }
            ServerEvent::AudioTranscriptDone { transcript, .. } => {
                vec![ProtocolEvent::Transcript {
                    text: transcript,
                    role: TranscriptRole::Assistant,
                    is_final: true,
                }]
            }
            ServerEvent::TextDelta { delta, .. } => {
                vec![ProtocolEvent::Transcript {
                    text: delta,
                    role: TranscriptRole::Assistant,
                    is_final: false,
                }]
            }
            ServerEvent::TextDone { text, .. } => {
                vec![ProtocolEvent::Transcript {
                    text,
                    role: TranscriptRole::Assistant,
                    is_final: true,
                }]
            }
            // The transcript carried here duplicates audio_transcript.done.
            ServerEvent::ContentPartDone { .. } => Vec::new(),

            ServerEvent::OutputItemAdded { item } => {
                if item.item_type.as_deref() == Some("function_call")
                    && let (Some(call_id), Some(name)) = (&item.call_id, &item.name)
                {
                    self.tools.note_name(call_id, name);
                }
                Vec::new()
            }
            ServerEvent::OutputItemDone { item, .. } => {
                if item.item_type.as_deref() == Some("function_call")
                    && let Some(call_id) = &item.call_id
                    && let Some(call) = self.tools.complete(
                        call_id,
                        item.name.as_deref(),
                        item.arguments.as_deref(),
                    )
                {
                    vec![ProtocolEvent::ToolCall(call)]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::FunctionCallArgumentsDelta { call_id, delta } => {
                self.tools.push_chunk(&call_id, &delta);
                Vec::new()
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => self
                .tools
                .complete(&call_id, name.as_deref(), arguments.as_deref())
                .map(ProtocolEvent::ToolCall)
                .into_iter()
                .collect(),

            ServerEvent::RequiredAction {
                required_action, ..
            } => {
                let calls = required_action
                    .and_then(|action| action.submit_tool_outputs)
                    .map(|outputs| outputs.tool_calls)
                    .unwrap_or_default();
                let mut out = Vec::new();
                for listed in calls {
                    let Some(call_id) = listed.id else { continue };
                    let function = listed.function.unwrap_or_default();
                    if let Some(call) = self.tools.complete(
                        &call_id,
                        function.name.as_deref(),
                        function.arguments.as_deref(),
                    ) {
                        out.push(ProtocolEvent::ToolCall(call));
                    }
                }
                out
            }

            ServerEvent::ResponseDone { response } => {
                let mut out = Vec::new();

                // Calls announced only inside the completed response.
                for item in &response.output {
                    if item.item_type.as_deref() == Some("function_call")
                        && let Some(call_id) = &item.call_id
                        && let Some(call) = self.tools.complete(
                            call_id,
                            item.name.as_deref(),
                            item.arguments.as_deref(),
                        )
                    {
                        out.push(ProtocolEvent::ToolCall(call));
                    }
                }

                if let Some(wire) = &response.usage
                    && let Some(usage) = self.usage.record(response.id.as_deref(), wire)
                {
                    out.push(ProtocolEvent::Usage {
                        response_id: response.id.clone(),
                        usage,
                    });
                }

                if self.mark_final(response.id.as_deref()) {
                    out.push(ProtocolEvent::Playback(VoicePlaybackDelta::terminal(
                        BACKEND_SAMPLE_RATE,
                    )));
                }
                out.push(ProtocolEvent::ResponseCompleted {
                    response_id: response.id.clone(),
                });
                if self.current_response == response.id {
                    self.current_response = None;
                }
                out
            }

            ServerEvent::Error { error } => {
                warn!(code = ?error.code, message = %error.message, "backend error event");
                vec![ProtocolEvent::BackendError {
                    code: error.code,
                    message: error.message,
                }]
            }

            ServerEvent::Unknown => {
                trace!("ignoring unknown server event type");
                Vec::new()
            }
        }
    }
}

// =============================================================================
// Protocol session
// =============================================================================

enum Command {
    Event(ClientEvent),
    UpdateSession(SessionSettings),
    Close,
}

/// Handle to a live protocol session.
pub struct RealtimeProtocolSession {
    commands: mpsc::Sender<Command>,
    state: Arc<RwLock<ConnectionState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    append_retry_attempts: u32,
    append_retry_delay: Duration,
}

impl RealtimeProtocolSession {
    /// Open a session. The first connection happens here; reconnects happen
    /// inside the background task per the config's retry policy.
    pub async fn connect(
        config: BackendConfig,
        tuning: &VoiceTuning,
    ) -> ProtocolResult<(Self, mpsc::Receiver<ProtocolEvent>)> {
        if config.api_key.is_empty() {
            return Err(ProtocolError::AuthenticationFailed(
                "missing api key".to_string(),
            ));
        }

        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let ws = connect_ws(&config).await?;
        *state.write() = ConnectionState::Connected;
        info!(model = %config.model, "connected to realtime backend");

        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            config,
            ws,
            command_rx,
            event_tx,
            state.clone(),
            cancel.clone(),
        ));

        Ok((
            Self {
                commands: command_tx,
                state,
                cancel,
                task: Mutex::new(Some(task)),
                append_retry_attempts: tuning.append_retry_attempts,
                append_retry_delay: Duration::from_millis(tuning.append_retry_delay_ms),
            },
            event_rx,
        ))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Append a PCM chunk to the backend's input buffer. When the transmit
    /// queue is full the append is retried a bounded number of times, then
    /// the chunk is dropped with an error rather than stalling capture.
    pub async fn append_audio(&self, pcm: &[u8]) -> ProtocolResult<()> {
        let mut command = Command::Event(ClientEvent::audio_append(pcm));
        let mut attempt = 0u32;
        loop {
            match self.commands.try_send(command) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(ProtocolError::NotConnected),
                Err(TrySendError::Full(returned)) => {
                    if attempt >= self.append_retry_attempts {
                        return Err(ProtocolError::Backpressure);
                    }
                    attempt += 1;
                    command = returned;
                    tokio::time::sleep(self.append_retry_delay).await;
                }
            }
        }
    }

    /// Commit the input buffer, closing a manual-endpointing turn.
    pub async fn commit_input(&self) -> ProtocolResult<()> {
        self.send(ClientEvent::AudioCommit {}).await
    }

    /// Discard buffered input audio.
    pub async fn clear_input(&self) -> ProtocolResult<()> {
        self.send(ClientEvent::AudioClear {}).await
    }

    /// Ask the backend to generate a response.
    pub async fn create_response(&self) -> ProtocolResult<()> {
        self.send(ClientEvent::ResponseCreate { response: None })
            .await
    }

    /// Cancel response generation, targeting a specific response when known.
    pub async fn cancel_response(&self, response_id: Option<String>) -> ProtocolResult<()> {
        self.send(ClientEvent::ResponseCancel { response_id }).await
    }

    /// Acknowledge a slow tool call so the backend is not left waiting.
    pub async fn acknowledge_tool_call(&self, call_id: &str) -> ProtocolResult<()> {
        self.send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::function_call_output(call_id, "queued"),
        })
        .await
    }

    /// Relay a tool result and request the follow-up response.
    pub async fn submit_tool_result(&self, call_id: &str, output: &str) -> ProtocolResult<()> {
        self.send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::function_call_output(call_id, output),
        })
        .await?;
        self.create_response().await
    }

    /// Inject a text message and request a spoken response to it.
    pub async fn announce(&self, text: &str) -> ProtocolResult<()> {
        self.send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        })
        .await?;
        self.create_response().await
    }

    /// Replace the session settings; also reapplied after every reconnect.
    pub async fn update_session(&self, settings: SessionSettings) -> ProtocolResult<()> {
        self.commands
            .send(Command::UpdateSession(settings))
            .await
            .map_err(|_| ProtocolError::NotConnected)
    }

    /// Close the session. Idempotent and infallible; waits for the
    /// background task to finish so the socket is gone when this returns.
    pub async fn close(&self) {
        let _ = self.commands.try_send(Command::Close);
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        *self.state.write() = ConnectionState::Disconnected;
    }

    async fn send(&self, event: ClientEvent) -> ProtocolResult<()> {
        self.commands
            .send(Command::Event(event))
            .await
            .map_err(|_| ProtocolError::NotConnected)
    }
}

impl BackendConfig {
    /// The `session.update` settings this config negotiates, sent on connect
    /// and after every reconnect.
    pub fn session_settings(&self) -> SessionSettings {
        let tools: Vec<WireTool> = self.tools.iter().map(WireTool::from).collect();
        SessionSettings {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: self
                .transcription_model
                .clone()
                .map(|model| TranscriptionSetting { model }),
            turn_detection: Some(match self.endpointing {
                EndpointingStrategy::ServerVad => TurnDetection::ServerVad {
                    threshold: Some(self.vad_threshold),
                    prefix_padding_ms: Some(300),
                    silence_duration_ms: Some(self.silence_duration_ms as u32),
                    create_response: Some(true),
                    interrupt_response: Some(true),
                },
                EndpointingStrategy::Manual | EndpointingStrategy::ClientVad => {
                    TurnDetection::None {}
                }
            }),
            tool_choice: if tools.is_empty() {
                None
            } else {
                Some("auto".to_string())
            },
            tools: if tools.is_empty() { None } else { Some(tools) },
            temperature: self.temperature,
        }
    }
}

async fn connect_ws(config: &BackendConfig) -> ProtocolResult<WsStream> {
    let mut request = config
        .ws_url()
        .into_client_request()
        .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
    let auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
        .map_err(|_| ProtocolError::AuthenticationFailed("api key is not header-safe".into()))?;
    request.headers_mut().insert(http::header::AUTHORIZATION, auth);
    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    let (ws, _response) = connect_async(request)
        .await
        .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
    Ok(ws)
}

async fn send_event(ws: &mut WsStream, event: &ClientEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(err) => {
            warn!(%err, "failed to serialize client event");
            return Ok(());
        }
    };
    ws.send(Message::Text(json.into())).await.map_err(|err| {
        warn!(%err, "websocket send failed");
    })
}

async fn shutdown(
    mut ws: WsStream,
    state: &RwLock<ConnectionState>,
    events: &mpsc::Sender<ProtocolEvent>,
) {
    let _ = ws.close(None).await;
    *state.write() = ConnectionState::Disconnected;
    let _ = events
        .send(ProtocolEvent::Closed {
            reason: CloseReason::Requested,
        })
        .await;
}

/// Rebuild the socket with bounded backoff. Returns false when the session
/// is over (attempts exhausted or close requested); a terminal event has
/// been emitted in that case.
async fn reconnect(
    config: &BackendConfig,
    ws: &mut WsStream,
    state: &RwLock<ConnectionState>,
    events: &mpsc::Sender<ProtocolEvent>,
    cancel: &CancellationToken,
) -> bool {
    *state.write() = ConnectionState::Reconnecting;
    let retry = &config.retry;
    let mut attempt = 0u32;
    loop {
        if !retry.should_retry(attempt) {
            warn!(attempts = attempt, "reconnect attempts exhausted");
            *state.write() = ConnectionState::Failed;
            let _ = events
                .send(ProtocolEvent::Closed {
                    reason: CloseReason::ReconnectExhausted { attempts: attempt },
                })
                .await;
            return false;
        }
        attempt += 1;
        let delay = retry.delay_for(attempt);
        info!(attempt, ?delay, "reconnecting to realtime backend");
        tokio::select! {
            _ = cancel.cancelled() => {
                *state.write() = ConnectionState::Disconnected;
                let _ = events
                    .send(ProtocolEvent::Closed {
                        reason: CloseReason::Requested,
                    })
                    .await;
                return false;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        match connect_ws(config).await {
            Ok(new_ws) => {
                *ws = new_ws;
                *state.write() = ConnectionState::Connected;
                info!(attempt, "reconnected to realtime backend");
                return true;
            }
            Err(err) => warn!(attempt, %err, "reconnect attempt failed"),
        }
    }
}

async fn run(
    config: BackendConfig,
    mut ws: WsStream,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ProtocolEvent>,
    state: Arc<RwLock<ConnectionState>>,
    cancel: CancellationToken,
) {
    let mut settings = config.session_settings();
    let mut demux = Demux::new();
    let mut first = true;

    'connection: loop {
        if !first {
            demux.on_reconnect();
        }
        if events
            .send(ProtocolEvent::Connected { reconnect: !first })
            .await
            .is_err()
        {
            let _ = ws.close(None).await;
            return;
        }
        first = false;

        // Configure (or restore) the session on this connection.
        if send_event(
            &mut ws,
            &ClientEvent::SessionUpdate {
                session: settings.clone(),
            },
        )
        .await
        .is_err()
        {
            if reconnect(&config, &mut ws, &state, &events, &cancel).await {
                continue 'connection;
            }
            return;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    shutdown(ws, &state, &events).await;
                    return;
                }

                command = commands.recv() => match command {
                    None | Some(Command::Close) => {
                        shutdown(ws, &state, &events).await;
                        return;
                    }
                    Some(Command::UpdateSession(new_settings)) => {
                        settings = new_settings.clone();
                        if send_event(&mut ws, &ClientEvent::SessionUpdate { session: new_settings })
                            .await
                            .is_err()
                        {
                            if reconnect(&config, &mut ws, &state, &events, &cancel).await {
                                continue 'connection;
                            }
                            return;
                        }
                    }
                    Some(Command::Event(event)) => {
                        if send_event(&mut ws, &event).await.is_err() {
                            if reconnect(&config, &mut ws, &state, &events, &cancel).await {
                                continue 'connection;
                            }
                            return;
                        }
                    }
                },

                message = ws.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                for out in demux.handle(event) {
                                    if events.send(out).await.is_err() {
                                        let _ = ws.close(None).await;
                                        return;
                                    }
                                }
                            }
                            Err(err) => warn!(%err, "undecodable server event"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("realtime connection closed by backend");
                        if reconnect(&config, &mut ws, &state, &events, &cancel).await {
                            continue 'connection;
                        }
                        return;
                    }
                    Some(Err(err)) => {
                        warn!(%err, "websocket receive failed");
                        if reconnect(&config, &mut ws, &state, &events, &cancel).await {
                            continue 'connection;
                        }
                        return;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}
