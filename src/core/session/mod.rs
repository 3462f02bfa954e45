//! One live voice session: capture fan-in, protocol session, playback, and
//! tool relay for a single guild voice channel.
//!
//! The session owns three background tasks:
//! - the outbound pump moving frames from the capture queue to the backend,
//! - the speaker loop turning platform speaking events into capture tasks,
//! - the driver consuming protocol events (playback, transcripts, tool
//!   calls, usage) and handling barge-in.
//!
//! Teardown is funneled through [`VoiceSession::stop`], which is idempotent
//! and never fails; every exit path ends there.

mod capture;
mod playback;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::capture::{CaptureSpec, run_capture};
use self::playback::PlaybackPipeline;
use crate::config::{EndpointingStrategy, VoiceRuntimeConfig, VoiceTuning};
use crate::core::audio::{
    AudioFrameStream, SegmentPosition, VoiceInputFrame, VoiceTranscriptSegment, now_ms,
};
use crate::core::realtime::{
    BackendConfig, CloseReason, ConnectionState, ProtocolError, ProtocolEvent,
    RealtimeProtocolSession, ToolCallRequest, TranscriptRole,
};
use crate::errors::{VoiceError, VoiceResult};
use crate::tools::{TokenUsage, ToolExecutor, ToolInvocation};
use crate::transport::{GuildConnection, SessionKey, SpeakerId, SpeakingEvent, SubscriptionEnd};

/// Capacity of the barge-in signal channel.
const BARGE_IN_CAPACITY: usize = 4;

/// Tracks the spoken tool announcement in flight. One slot per session:
/// each new announcement first cancels the previous one by response id.
#[derive(Default)]
struct AnnounceSlot {
    /// Set between issuing an announcement and seeing its response start.
    pending: bool,
    /// Response id of the announcement currently playing, when known.
    response_id: Option<String>,
}

// =============================================================================
// Session events
// =============================================================================

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Stopped on request.
    Requested,
    /// The backend connection was lost and could not be restored.
    ConnectionLost,
    /// A usage limit cut the session short.
    UsageLimit,
    /// Unrecoverable failure.
    Error(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "requested"),
            StopReason::ConnectionLost => write!(f, "connection lost"),
            StopReason::UsageLimit => write!(f, "usage limit"),
            StopReason::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// Updates a session pushes to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Transcript {
        segment: VoiceTranscriptSegment,
        role: TranscriptRole,
    },
    Usage {
        response_id: Option<String>,
        usage: TokenUsage,
    },
    /// Non-fatal backend error surfaced for observability.
    Warning { message: String },
    /// Terminal update, sent exactly once.
    Stopped { reason: StopReason },
}

/// Where a session is in its life. `Idle` is the state of a channel with no
/// session at all; a live handle starts at `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

/// Point-in-time session snapshot.
#[derive(Debug, Clone)]
pub struct VoiceSessionStatus {
    pub key: SessionKey,
    /// Unique id for this run of the session; a restarted channel gets a
    /// fresh one.
    pub instance_id: String,
    pub state: SessionState,
    pub connection: ConnectionState,
    pub active_speakers: usize,
    pub assistant_speaking: bool,
    pub started_at_ms: u64,
}

impl VoiceSessionStatus {
    pub fn is_stopped(&self) -> bool {
        matches!(self.state, SessionState::Stopping | SessionState::Stopped)
    }
}

// =============================================================================
// Voice session
// =============================================================================

pub struct VoiceSession {
    key: SessionKey,
    instance_id: String,
    config: RwLock<Arc<VoiceRuntimeConfig>>,
    backend: Mutex<BackendConfig>,
    tuning: VoiceTuning,
    protocol: Arc<RealtimeProtocolSession>,
    frames: Arc<AudioFrameStream>,
    connection: Arc<dyn GuildConnection>,
    captures: Arc<DashMap<SpeakerId, JoinHandle<()>>>,
    assistant_speaking: Arc<AtomicBool>,
    current_response: Arc<Mutex<Option<String>>>,
    updates: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    started_at_ms: u64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceSession {
    /// Connect to the backend and bring the session tasks up.
    pub async fn start(
        key: SessionKey,
        config: Arc<VoiceRuntimeConfig>,
        tuning: VoiceTuning,
        backend: BackendConfig,
        connection: Arc<dyn GuildConnection>,
        tools: Arc<dyn ToolExecutor>,
        updates: mpsc::Sender<SessionEvent>,
    ) -> VoiceResult<Arc<Self>> {
        let speaking_events = connection.speaking_events().await?;
        let (protocol, protocol_events) =
            RealtimeProtocolSession::connect(backend.clone(), &tuning).await?;

        let session = Arc::new(Self {
            key,
            instance_id: uuid::Uuid::new_v4().to_string(),
            config: RwLock::new(config),
            backend: Mutex::new(backend),
            tuning,
            protocol: Arc::new(protocol),
            frames: Arc::new(AudioFrameStream::default()),
            connection,
            captures: Arc::new(DashMap::new()),
            assistant_speaking: Arc::new(AtomicBool::new(false)),
            current_response: Arc::new(Mutex::new(None)),
            updates,
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Starting),
            started_at_ms: now_ms(),
            tasks: Mutex::new(Vec::new()),
        });

        let (barge_tx, barge_rx) = mpsc::channel(BARGE_IN_CAPACITY);
        session.spawn_pump();
        session.spawn_speaker_loop(speaking_events, barge_tx);
        session.spawn_driver(protocol_events, barge_rx, tools);
        *session.state.lock() = SessionState::Active;
        info!(key = %session.key, instance = %session.instance_id, "voice session started");
        Ok(session)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn config(&self) -> Arc<VoiceRuntimeConfig> {
        self.config.read().clone()
    }

    pub fn status(&self) -> VoiceSessionStatus {
        let active_speakers = self
            .captures
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count();
        VoiceSessionStatus {
            key: self.key.clone(),
            instance_id: self.instance_id.clone(),
            state: *self.state.lock(),
            connection: self.protocol.state(),
            active_speakers,
            assistant_speaking: self.assistant_speaking.load(Ordering::Relaxed),
            started_at_ms: self.started_at_ms,
        }
    }

    /// Swap in a new config snapshot and push the derived settings to the
    /// backend. Running captures keep their parameters; new subscriptions
    /// pick up the snapshot.
    pub async fn update_config(&self, config: Arc<VoiceRuntimeConfig>) -> VoiceResult<()> {
        let settings = {
            let mut backend = self.backend.lock();
            let previous = backend.clone();
            let mut next =
                BackendConfig::from_runtime(&config, &self.tuning, previous.api_key);
            next.url = previous.url;
            next.tools = previous.tools;
            next.instructions = previous.instructions;
            next.temperature = previous.temperature;
            if next.model != previous.model {
                info!(
                    key = %self.key,
                    from = %previous.model,
                    to = %next.model,
                    "model change takes effect on the next session start"
                );
            }
            *backend = next.clone();
            next.session_settings()
        };
        {
            let current = self.config.read();
            if current.capture.silence_duration_ms != config.capture.silence_duration_ms {
                info!(
                    key = %self.key,
                    silence_ms = config.capture.silence_duration_ms,
                    "silence duration change takes effect on the next capture"
                );
            }
        }
        *self.config.write() = config;
        self.protocol.update_session(settings).await?;
        Ok(())
    }

    /// Feed one externally captured frame into the transmit queue. Hosts
    /// that run their own capture path use this instead of the speaker
    /// subscriptions.
    pub async fn pump(&self, frame: VoiceInputFrame) -> VoiceResult<()> {
        if self.frames.push(frame).await {
            Ok(())
        } else {
            Err(VoiceError::Session("session stopped".to_string()))
        }
    }

    /// Close the current turn (manual endpointing).
    pub async fn signal_speech_end(&self, speaker: Option<SpeakerId>) {
        let rate = self.config.read().capture.sample_rate;
        let _ = self
            .frames
            .push(VoiceInputFrame::speech_end_marker(rate, speaker))
            .await;
    }

    /// Inject a text message and have the assistant speak a response.
    pub async fn announce(&self, text: &str) -> VoiceResult<()> {
        self.protocol.announce(text).await?;
        Ok(())
    }

    /// Stop the session. Idempotent; never fails. Emits the terminal
    /// [`SessionEvent::Stopped`] exactly once.
    pub async fn stop(&self, reason: StopReason) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Stopping | SessionState::Stopped) {
                return;
            }
            *state = SessionState::Stopping;
        }
        info!(key = %self.key, %reason, "stopping voice session");
        self.cancel.cancel();
        self.frames.end();

        let speakers: Vec<SpeakerId> = self
            .captures
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for speaker in speakers {
            self.connection.destroy_subscription(&speaker).await;
            self.captures.remove(&speaker);
        }

        self.protocol.close().await;
        // The pump, speaker loop and driver exit through the token and the
        // ended frame queue; their handles are detached here.
        self.tasks.lock().clear();

        *self.state.lock() = SessionState::Stopped;
        let _ = self.updates.send(SessionEvent::Stopped { reason }).await;
    }

    fn spawn_pump(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let frames = self.frames.clone();
        let protocol = self.protocol.clone();
        let key = self.key.clone();
        let handle = tokio::spawn(async move {
            let mut exit_reason: Option<StopReason> = None;
            while let Some(frame) = frames.next().await {
                if frame.is_control() {
                    if protocol.commit_input().await.is_err() {
                        break;
                    }
                    if protocol.create_response().await.is_err() {
                        break;
                    }
                } else if let Err(err) = protocol.append_audio(&frame.data).await {
                    match err {
                        // Retries already exhausted inside append_audio.
                        // Stop rather than spin against a stalled socket.
                        ProtocolError::Backpressure => {
                            warn!(%key, "transmit queue stayed full, dropping frame and stopping");
                            exit_reason = Some(StopReason::Error(
                                "audio transmit backpressure".to_string(),
                            ));
                            break;
                        }
                        ProtocolError::NotConnected => break,
                        err => warn!(%key, %err, "audio append failed"),
                    }
                }
            }
            if let Some(reason) = exit_reason
                && let Some(session) = weak.upgrade()
            {
                session.stop(reason).await;
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_speaker_loop(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<SpeakingEvent>,
        barge_in: mpsc::Sender<()>,
    ) {
        let weak = Arc::downgrade(self);
        let connection = self.connection.clone();
        let captures = self.captures.clone();
        let frames = self.frames.clone();
        let assistant_speaking = self.assistant_speaking.clone();
        let cancel = self.cancel.clone();
        let trailing_floor = self.tuning.trailing_silence_floor_ms;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        None => break,
                        Some(SpeakingEvent::Started { speaker }) => {
                            if connection.self_speaker().as_ref() == Some(&speaker) {
                                continue;
                            }
                            let already_live = captures
                                .get(&speaker)
                                .map(|handle| !handle.is_finished())
                                .unwrap_or(false);
                            if already_live {
                                continue;
                            }
                            let Some(session) = weak.upgrade() else { break };
                            let snapshot = session.config.read().clone();
                            let end = match snapshot.endpointing {
                                EndpointingStrategy::ClientVad => SubscriptionEnd::AfterSilence {
                                    silence_ms: snapshot.capture.silence_duration_ms,
                                },
                                _ => SubscriptionEnd::Manual,
                            };
                            match connection.subscribe_speaker(&speaker, end).await {
                                Ok(feed) => {
                                    let spec = CaptureSpec {
                                        speaker: speaker.clone(),
                                        capture: snapshot.capture.clone(),
                                        endpointing: snapshot.endpointing,
                                        trailing_silence_floor_ms: trailing_floor,
                                    };
                                    let task = tokio::spawn(run_capture(
                                        spec,
                                        feed,
                                        frames.clone(),
                                        assistant_speaking.clone(),
                                        barge_in.clone(),
                                        cancel.clone(),
                                    ));
                                    captures.insert(speaker, task);
                                }
                                Err(err) => {
                                    warn!(%speaker, %err, "speaker subscription failed");
                                }
                            }
                        }
                        Some(SpeakingEvent::Stopped { speaker }) => {
                            let finished = captures
                                .get(&speaker)
                                .map(|handle| handle.is_finished())
                                .unwrap_or(false);
                            if finished {
                                captures.remove(&speaker);
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_driver(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<ProtocolEvent>,
        mut barge_in: mpsc::Receiver<()>,
        tools: Arc<dyn ToolExecutor>,
    ) {
        let weak = Arc::downgrade(self);
        let protocol = self.protocol.clone();
        let connection = self.connection.clone();
        let current_response = self.current_response.clone();
        let updates = self.updates.clone();
        let assistant_speaking = self.assistant_speaking.clone();
        let cancel = self.cancel.clone();
        let key = self.key.clone();
        let playback_rate = self.config.read().playback.sample_rate;
        let settle_pad = self.tuning.playback_settle_pad_ms;

        let handle = tokio::spawn(async move {
            let mut playback = PlaybackPipeline::new(
                connection,
                playback_rate,
                settle_pad,
                assistant_speaking.clone(),
            );
            let announce = Arc::new(Mutex::new(AnnounceSlot::default()));
            let mut last_speech = SegmentPosition::default();
            let mut exit_reason: Option<StopReason> = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    Some(()) = barge_in.recv() => {
                        playback.interrupt();
                        let target = current_response.lock().clone();
                        let _ = protocol.cancel_response(target).await;
                    }

                    event = events.recv() => match event {
                        None => {
                            exit_reason = Some(StopReason::ConnectionLost);
                            break;
                        }
                        Some(ProtocolEvent::Connected { reconnect }) => {
                            if reconnect {
                                debug!(%key, "protocol session reconnected");
                            }
                        }
                        Some(ProtocolEvent::SpeechStarted { audio_start_ms }) => {
                            last_speech.start = audio_start_ms;
                            if assistant_speaking.load(Ordering::Relaxed) {
                                playback.interrupt();
                                let target = current_response.lock().clone();
                                let _ = protocol.cancel_response(target).await;
                            }
                        }
                        Some(ProtocolEvent::SpeechStopped { audio_end_ms }) => {
                            last_speech.end = audio_end_ms;
                        }
                        Some(ProtocolEvent::ResponseStarted { response_id }) => {
                            *current_response.lock() = response_id.clone();
                            let mut slot = announce.lock();
                            if slot.pending {
                                slot.pending = false;
                                slot.response_id = response_id;
                            }
                        }
                        Some(ProtocolEvent::ResponseCompleted { .. }) => {
                            *current_response.lock() = None;
                        }
                        Some(ProtocolEvent::Playback(delta)) => {
                            if let Err(err) = playback.write(&delta).await {
                                warn!(%key, %err, "playback write failed");
                            }
                        }
                        Some(ProtocolEvent::Transcript { text, role, is_final }) => {
                            let position = if role == TranscriptRole::User {
                                last_speech
                            } else {
                                SegmentPosition::default()
                            };
                            let segment = VoiceTranscriptSegment {
                                text,
                                is_final,
                                position,
                                speaker_id: None,
                            };
                            let _ = updates
                                .send(SessionEvent::Transcript { segment, role })
                                .await;
                        }
                        Some(ProtocolEvent::ToolCall(call)) => {
                            let tools = tools.clone();
                            let protocol = protocol.clone();
                            let key = key.clone();
                            let announce = announce.clone();
                            tokio::spawn(async move {
                                relay_tool_call(call, tools, protocol, key, announce).await;
                            });
                        }
                        Some(ProtocolEvent::Usage { response_id, usage }) => {
                            let _ = updates
                                .send(SessionEvent::Usage { response_id, usage })
                                .await;
                        }
                        Some(ProtocolEvent::BackendError { code, message }) => {
                            warn!(%key, ?code, %message, "backend reported an error");
                            let message = match code {
                                Some(code) => format!("{code}: {message}"),
                                None => message,
                            };
                            let _ = updates.send(SessionEvent::Warning { message }).await;
                        }
                        Some(ProtocolEvent::Closed { reason }) => {
                            exit_reason = Some(match reason {
                                CloseReason::Requested => StopReason::Requested,
                                CloseReason::ReconnectExhausted { .. } => {
                                    StopReason::ConnectionLost
                                }
                                CloseReason::Fatal(message) => StopReason::Error(message),
                            });
                            break;
                        }
                    }
                }
            }

            playback.shutdown();
            if let Some(reason) = exit_reason
                && let Some(session) = weak.upgrade()
            {
                session.stop(reason).await;
            }
        });
        self.tasks.lock().push(handle);
    }
}

/// Execute one tool call and relay its textual outcome to the backend.
///
/// The call is acknowledged immediately with a placeholder output so the
/// backend is not left waiting on a slow executor. A short spoken start
/// announcement goes out before execution and the result submission speaks
/// the outcome; each cancels the previous in-flight announcement first.
async fn relay_tool_call(
    call: ToolCallRequest,
    tools: Arc<dyn ToolExecutor>,
    protocol: Arc<RealtimeProtocolSession>,
    key: SessionKey,
    announce: Arc<Mutex<AnnounceSlot>>,
) {
    if let Err(err) = protocol.acknowledge_tool_call(&call.call_id).await {
        warn!(%key, tool = %call.name, %err, "tool acknowledgement failed");
    }

    let prior = {
        let mut slot = announce.lock();
        slot.pending = true;
        slot.response_id.take()
    };
    if prior.is_some() {
        let _ = protocol.cancel_response(prior).await;
    }
    if let Err(err) = protocol
        .announce(&format!("Running the {} tool.", call.name))
        .await
    {
        warn!(%key, tool = %call.name, %err, "tool start announcement failed");
    }

    let invocation = ToolInvocation {
        call_id: call.call_id.clone(),
        name: call.name.clone(),
        arguments: call.arguments,
        session: key.clone(),
    };
    let output = match tools.execute(invocation).await {
        Ok(outcome) if outcome.is_error => format!("error: {}", outcome.output),
        Ok(outcome) => outcome.output,
        Err(err) => {
            warn!(%key, tool = %call.name, %err, "tool executor failed");
            format!("error: {err}")
        }
    };

    // The response spoken for the result supersedes the start announcement.
    let prior = {
        let mut slot = announce.lock();
        slot.pending = false;
        slot.response_id.take()
    };
    if prior.is_some() {
        let _ = protocol.cancel_response(prior).await;
    }
    if let Err(err) = protocol.submit_tool_result(&call.call_id, &output).await {
        warn!(%key, tool = %call.name, %err, "failed to relay tool result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_display() {
        assert_eq!(StopReason::Requested.to_string(), "requested");
        assert_eq!(StopReason::ConnectionLost.to_string(), "connection lost");
        assert_eq!(
            StopReason::Error("boom".into()).to_string(),
            "error: boom"
        );
    }

    #[test]
    fn teardown_states_count_as_stopped() {
        let status = VoiceSessionStatus {
            key: SessionKey::new("g", "c"),
            instance_id: "i".to_string(),
            state: SessionState::Active,
            connection: ConnectionState::Connected,
            active_speakers: 0,
            assistant_speaking: false,
            started_at_ms: 0,
        };
        assert!(!status.is_stopped());

        let stopping = VoiceSessionStatus {
            state: SessionState::Stopping,
            ..status.clone()
        };
        assert!(stopping.is_stopped());

        let stopped = VoiceSessionStatus {
            state: SessionState::Stopped,
            ..status
        };
        assert!(stopped.is_stopped());
        assert_eq!(stopped.state.to_string(), "stopped");
    }
}
