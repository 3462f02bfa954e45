//! Manager-level tests driven through mock collaborators.
//!
//! The mock engine hands the manager a scripted session handle and exposes
//! the session's update sender, so tests can feed transcripts, usage, and
//! the terminal stop exactly the way a live session would.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

use voicebridge::config::{CapturePatch, VoiceConfigPatch, VoiceRuntimeConfig};
use voicebridge::core::audio::{SegmentPosition, VoiceInputFrame, VoiceTranscriptSegment, now_ms};
use voicebridge::core::realtime::{ConnectionState, TranscriptRole};
use voicebridge::core::session::{SessionEvent, SessionState, StopReason, VoiceSessionStatus};
use voicebridge::engine::{EngineFeatures, StartVoiceSessionOptions, VoiceEngine, VoiceSessionHandle};
use voicebridge::errors::{LimitMode, VoiceError, VoiceResult};
use voicebridge::events::VoiceEvent;
use voicebridge::manager::VoiceManager;
use voicebridge::storage::{KeyValueStore, MemoryStore, VOICE_NAMESPACE, last_session_key};
use voicebridge::tools::{TokenUsage, UsageMeter};
use voicebridge::transport::{
    ChannelId, ChannelTransport, GuildConnection, GuildId, PlaybackSink, SessionKey,
    SpeakerAudioStream, SpeakingEvent, SpeakerId, SubscriptionEnd,
};

// =============================================================================
// Mocks
// =============================================================================

struct MockHandle {
    key: SessionKey,
    updates: mpsc::Sender<SessionEvent>,
    stopped: AtomicBool,
}

#[async_trait]
impl VoiceSessionHandle for MockHandle {
    fn key(&self) -> &SessionKey {
        &self.key
    }

    fn status(&self) -> VoiceSessionStatus {
        let state = if self.stopped.load(Ordering::SeqCst) {
            SessionState::Stopped
        } else {
            SessionState::Active
        };
        VoiceSessionStatus {
            key: self.key.clone(),
            instance_id: "test-instance".to_string(),
            state,
            connection: ConnectionState::Connected,
            active_speakers: 0,
            assistant_speaking: false,
            started_at_ms: now_ms(),
        }
    }

    async fn pump(&self, _frame: VoiceInputFrame) -> VoiceResult<()> {
        Ok(())
    }

    async fn commit_input(&self) {}

    async fn update_config(&self, _config: Arc<VoiceRuntimeConfig>) -> VoiceResult<()> {
        Ok(())
    }

    async fn announce(&self, _text: &str) -> VoiceResult<()> {
        Ok(())
    }

    async fn stop(&self, reason: StopReason) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.updates.send(SessionEvent::Stopped { reason }).await;
    }
}

#[derive(Default)]
struct MockEngine {
    starts: AtomicUsize,
    /// Update sender of the most recently started session.
    last_updates: Mutex<Option<mpsc::Sender<SessionEvent>>>,
}

#[async_trait]
impl VoiceEngine for MockEngine {
    fn features(&self) -> EngineFeatures {
        EngineFeatures {
            voice: true,
            voice_transcription: true,
            vision: false,
        }
    }

    async fn start_voice_session(
        &self,
        options: StartVoiceSessionOptions,
    ) -> VoiceResult<Arc<dyn VoiceSessionHandle>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.last_updates.lock() = Some(options.updates.clone());
        Ok(Arc::new(MockHandle {
            key: options.key,
            updates: options.updates,
            stopped: AtomicBool::new(false),
        }))
    }
}

struct MockConnection {
    guild: GuildId,
}

#[async_trait]
impl GuildConnection for MockConnection {
    fn guild_id(&self) -> GuildId {
        self.guild.clone()
    }

    fn self_speaker(&self) -> Option<SpeakerId> {
        None
    }

    async fn speaking_events(&self) -> VoiceResult<mpsc::Receiver<SpeakingEvent>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn subscribe_speaker(
        &self,
        _speaker: &SpeakerId,
        _end: SubscriptionEnd,
    ) -> VoiceResult<SpeakerAudioStream> {
        Err(VoiceError::Transport("no audio in tests".to_string()))
    }

    async fn destroy_subscription(&self, _speaker: &SpeakerId) {}

    async fn open_playback(&self, _sample_rate: u32) -> VoiceResult<Box<dyn PlaybackSink>> {
        Err(VoiceError::Transport("no playback in tests".to_string()))
    }
}

struct MockTransport {
    has_connection: AtomicBool,
    accepts_text: bool,
    default_channel: Option<ChannelId>,
    releases: AtomicUsize,
    notices: Mutex<Vec<(ChannelId, String)>>,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            has_connection: AtomicBool::new(true),
            accepts_text: true,
            default_channel: None,
            releases: AtomicUsize::new(0),
            notices: Mutex::new(Vec::new()),
        }
    }

    fn notices(&self) -> Vec<(ChannelId, String)> {
        self.notices.lock().clone()
    }
}

#[async_trait]
impl ChannelTransport for MockTransport {
    async fn connection_for_guild(&self, guild: &GuildId) -> Option<Arc<dyn GuildConnection>> {
        if self.has_connection.load(Ordering::SeqCst) {
            Some(Arc::new(MockConnection {
                guild: guild.clone(),
            }))
        } else {
            None
        }
    }

    async fn release_connection(&self, _guild: &GuildId) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    async fn send_notice(&self, channel: &ChannelId, text: &str) -> VoiceResult<()> {
        self.notices.lock().push((channel.clone(), text.to_string()));
        Ok(())
    }

    async fn channel_accepts_text(&self, _channel: &ChannelId) -> bool {
        self.accepts_text
    }

    async fn default_text_channel(&self, _guild: &GuildId) -> Option<ChannelId> {
        self.default_channel.clone()
    }
}

/// Meter that starts passing and flips to a limit after a configured number
/// of recorded responses. `limit_from_start` makes `check_limit` fail
/// immediately instead.
struct MockMeter {
    mode: LimitMode,
    limit_from_start: bool,
    limit_after_records: usize,
    records: AtomicUsize,
}

impl MockMeter {
    fn unlimited() -> Self {
        Self {
            mode: LimitMode::Warn,
            limit_from_start: false,
            limit_after_records: usize::MAX,
            records: AtomicUsize::new(0),
        }
    }

    fn limited(mode: LimitMode) -> Self {
        Self {
            mode,
            limit_from_start: true,
            limit_after_records: 0,
            records: AtomicUsize::new(0),
        }
    }

    fn limit_after(mode: LimitMode, records: usize) -> Self {
        Self {
            mode,
            limit_from_start: false,
            limit_after_records: records,
            records: AtomicUsize::new(0),
        }
    }

    fn limit_error(&self, model: &str) -> VoiceError {
        VoiceError::UsageLimit {
            model: model.to_string(),
            window: "daily".to_string(),
            message: "daily voice budget reached".to_string(),
            mode: self.mode,
        }
    }
}

#[async_trait]
impl UsageMeter for MockMeter {
    async fn record(&self, _session: &SessionKey, _model: &str, _usage: TokenUsage) {
        self.records.fetch_add(1, Ordering::SeqCst);
    }

    async fn check_limit(&self, _session: &SessionKey, model: &str) -> VoiceResult<()> {
        let limited = self.limit_from_start
            || self.records.load(Ordering::SeqCst) > self.limit_after_records;
        if limited {
            Err(self.limit_error(model))
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    manager: Arc<VoiceManager>,
    engine: Arc<MockEngine>,
    transport: Arc<MockTransport>,
    store: Arc<MemoryStore>,
}

fn harness_with(meter: MockMeter, transport: MockTransport) -> Harness {
    let engine = Arc::new(MockEngine::default());
    let transport = Arc::new(transport);
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(VoiceManager::new(
        engine.clone(),
        transport.clone(),
        store.clone(),
        Arc::new(meter),
    ));
    Harness {
        manager,
        engine,
        transport,
        store,
    }
}

fn harness() -> Harness {
    harness_with(MockMeter::unlimited(), MockTransport::new())
}

fn key(guild: &str, channel: &str) -> SessionKey {
    SessionKey::new(guild, channel)
}

async fn recv_event(rx: &mut tokio::sync::broadcast::Receiver<VoiceEvent>) -> VoiceEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for voice event")
        .expect("event bus closed")
}

fn final_user_segment(text: &str) -> SessionEvent {
    SessionEvent::Transcript {
        segment: VoiceTranscriptSegment {
            text: text.to_string(),
            is_final: true,
            position: SegmentPosition { start: 0, end: 900 },
            speaker_id: None,
        },
        role: TranscriptRole::User,
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn second_start_for_same_channel_is_a_no_op() {
    let h = harness();
    let k = key("g1", "c1");

    assert!(h.manager.start_for_channel(k.clone(), None).await.unwrap());
    assert!(!h.manager.start_for_channel(k.clone(), None).await.unwrap());

    assert_eq!(h.engine.starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.manager.session_count(), 1);
}

#[tokio::test]
async fn guild_concurrency_limit_blocks_second_channel() {
    let h = harness();
    // Default config allows one concurrent channel per guild.
    assert!(h.manager.start_for_channel(key("g1", "c1"), None).await.unwrap());
    assert!(!h.manager.start_for_channel(key("g1", "c2"), None).await.unwrap());

    // A different guild is unaffected.
    assert!(h.manager.start_for_channel(key("g2", "c1"), None).await.unwrap());
    assert_eq!(h.manager.session_count(), 2);
}

#[tokio::test]
async fn raised_limit_allows_parallel_channels() {
    let h = harness();
    h.manager
        .set_guild_config(
            &GuildId::new("g1"),
            VoiceConfigPatch {
                max_concurrent_channels: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(h.manager.start_for_channel(key("g1", "c1"), None).await.unwrap());
    assert!(h.manager.start_for_channel(key("g1", "c2"), None).await.unwrap());
    assert!(!h.manager.start_for_channel(key("g1", "c3"), None).await.unwrap());
}

#[tokio::test]
async fn no_voice_connection_means_no_session() {
    let transport = MockTransport::new();
    transport.has_connection.store(false, Ordering::SeqCst);
    let h = harness_with(MockMeter::unlimited(), transport);

    assert!(!h.manager.start_for_channel(key("g1", "c1"), None).await.unwrap());
    assert_eq!(h.manager.session_count(), 0);
    assert_eq!(h.engine.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disabled_guild_never_starts() {
    let h = harness();
    h.manager
        .set_guild_config(
            &GuildId::new("g1"),
            VoiceConfigPatch {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!h.manager.start_for_channel(key("g1", "c1"), None).await.unwrap());
    assert_eq!(h.engine.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stop_raises_exactly_one_stop_event_and_releases_the_connection() {
    let h = harness();
    let k = key("g1", "c1");
    let mut events = h.manager.subscribe();

    assert!(h.manager.start_for_channel(k.clone(), None).await.unwrap());
    match recv_event(&mut events).await {
        VoiceEvent::SessionStarted { key } => assert_eq!(key, k),
        other => panic!("expected start event, got {other:?}"),
    }

    assert!(h.manager.stop_for_channel(&k).await);
    match recv_event(&mut events).await {
        VoiceEvent::SessionStopped { key, reason, status } => {
            assert_eq!(key, k);
            assert_eq!(reason, StopReason::Requested);
            assert_eq!(status.state, SessionState::Stopped);
        }
        other => panic!("expected stop event, got {other:?}"),
    }

    // Second stop finds nothing and raises nothing.
    assert!(!h.manager.stop_for_channel(&k).await);
    assert!(events.try_recv().is_err());
    assert_eq!(h.manager.session_count(), 0);
    assert!(h.transport.releases.load(Ordering::SeqCst) >= 1);

    // The stop left a snapshot behind for the guild.
    let snapshot = h
        .store
        .get(VOICE_NAMESPACE, &last_session_key("g1"))
        .await
        .unwrap()
        .expect("missing session snapshot");
    assert_eq!(snapshot["session_id"], "g1:c1");
    assert_eq!(snapshot["reason"], "requested");
    assert_eq!(snapshot["state"], "stopped");
}

#[tokio::test]
async fn announce_requires_a_running_session() {
    let h = harness();
    let k = key("g1", "c1");
    assert!(h.manager.announce(&k, "hello").await.is_err());

    h.manager.start_for_channel(k.clone(), None).await.unwrap();
    h.manager.announce(&k, "hello").await.unwrap();
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn guild_patches_persist_and_merge() {
    let h = harness();
    let guild = GuildId::new("g1");

    h.manager
        .set_guild_config(
            &guild,
            VoiceConfigPatch {
                model: Some("alpha".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let resolved = h
        .manager
        .set_guild_config(
            &guild,
            VoiceConfigPatch {
                capture: Some(CapturePatch {
                    silence_duration_ms: Some(300),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The second write merged with the first instead of replacing it.
    assert_eq!(resolved.model.as_deref(), Some("alpha"));
    assert_eq!(resolved.capture.silence_duration_ms, 300);

    // A fresh manager over the same store hydrates the persisted patch.
    let rebuilt = Arc::new(VoiceManager::new(
        h.engine.clone(),
        h.transport.clone(),
        h.store.clone(),
        Arc::new(MockMeter::unlimited()),
    ));
    let resolved = rebuilt.resolved_config(&guild).await.unwrap();
    assert_eq!(resolved.model.as_deref(), Some("alpha"));
    assert_eq!(resolved.capture.silence_duration_ms, 300);
}

#[tokio::test]
async fn invalid_patch_is_rejected() {
    let h = harness();
    let err = h
        .manager
        .set_guild_config(
            &GuildId::new("g1"),
            VoiceConfigPatch {
                capture: Some(CapturePatch {
                    sample_rate: Some(0),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VoiceError::InvalidConfig(_)));
}

#[tokio::test]
async fn config_changes_raise_bus_events() {
    let h = harness();
    let mut events = h.manager.subscribe();
    let guild = GuildId::new("g1");

    h.manager
        .set_guild_config(
            &guild,
            VoiceConfigPatch {
                model: Some("alpha".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    match recv_event(&mut events).await {
        VoiceEvent::ConfigChanged { guild_id } => assert_eq!(guild_id, Some(guild)),
        other => panic!("expected config event, got {other:?}"),
    }

    h.manager
        .set_base_config(VoiceConfigPatch {
            model: Some("beta".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    match recv_event(&mut events).await {
        VoiceEvent::ConfigChanged { guild_id } => assert_eq!(guild_id, None),
        other => panic!("expected config event, got {other:?}"),
    }

    // The guild patch still wins over the new base.
    let resolved = h.manager.resolved_config(&GuildId::new("g1")).await.unwrap();
    assert_eq!(resolved.model.as_deref(), Some("alpha"));
    let other = h.manager.resolved_config(&GuildId::new("g2")).await.unwrap();
    assert_eq!(other.model.as_deref(), Some("beta"));
}

// =============================================================================
// Transcripts
// =============================================================================

#[tokio::test]
async fn final_transcripts_are_posted_to_the_voice_channel() {
    let h = harness();
    let k = key("g1", "c1");
    let mut events = h.manager.subscribe();

    h.manager.start_for_channel(k.clone(), None).await.unwrap();
    let updates = h.engine.last_updates.lock().clone().unwrap();
    updates.send(final_user_segment("turn it up")).await.unwrap();

    // Wait for the relayed bus event, then the notice is guaranteed sent.
    loop {
        if let VoiceEvent::Transcript { segment, .. } = recv_event(&mut events).await {
            assert_eq!(segment.text, "turn it up");
            break;
        }
    }
    tokio::task::yield_now().await;

    let notices = h.transport.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].0, ChannelId::new("c1"));
    assert_eq!(notices[0].1, "user: turn it up");
}

#[tokio::test]
async fn transcripts_fall_back_to_the_default_text_channel() {
    let mut transport = MockTransport::new();
    transport.accepts_text = false;
    transport.default_channel = Some(ChannelId::new("general"));
    let h = harness_with(MockMeter::unlimited(), transport);
    let k = key("g1", "c1");
    let mut events = h.manager.subscribe();

    h.manager.start_for_channel(k.clone(), None).await.unwrap();
    let updates = h.engine.last_updates.lock().clone().unwrap();
    updates.send(final_user_segment("hello")).await.unwrap();

    loop {
        if let VoiceEvent::Transcript { .. } = recv_event(&mut events).await {
            break;
        }
    }
    tokio::task::yield_now().await;

    let notices = h.transport.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].0, ChannelId::new("general"));
}

#[tokio::test]
async fn partial_transcripts_reach_the_bus_but_not_the_channel() {
    let h = harness();
    let k = key("g1", "c1");
    let mut events = h.manager.subscribe();

    h.manager.start_for_channel(k.clone(), None).await.unwrap();
    let updates = h.engine.last_updates.lock().clone().unwrap();
    updates
        .send(SessionEvent::Transcript {
            segment: VoiceTranscriptSegment {
                text: "turn i".to_string(),
                is_final: false,
                position: SegmentPosition::default(),
                speaker_id: None,
            },
            role: TranscriptRole::User,
        })
        .await
        .unwrap();

    loop {
        if let VoiceEvent::Transcript { segment, .. } = recv_event(&mut events).await {
            assert!(!segment.is_final);
            break;
        }
    }
    tokio::task::yield_now().await;
    assert!(h.transport.notices().is_empty());
}

#[tokio::test]
async fn backend_warnings_reach_the_bus() {
    let h = harness();
    let k = key("g1", "c1");
    let mut events = h.manager.subscribe();

    h.manager.start_for_channel(k.clone(), None).await.unwrap();
    let updates = h.engine.last_updates.lock().clone().unwrap();
    updates
        .send(SessionEvent::Warning {
            message: "rate_limit: slow down".to_string(),
        })
        .await
        .unwrap();

    loop {
        if let VoiceEvent::Warning { key, message } = recv_event(&mut events).await {
            assert_eq!(key, k);
            assert_eq!(message, "rate_limit: slow down");
            break;
        }
    }
    // Warnings are observability only; the session keeps running.
    assert_eq!(h.manager.session_count(), 1);
}

// =============================================================================
// Usage limits
// =============================================================================

#[tokio::test]
async fn blocking_limit_prevents_start_and_posts_a_notice() {
    let h = harness_with(MockMeter::limited(LimitMode::Block), MockTransport::new());
    let err = h
        .manager
        .start_for_channel(key("g1", "c1"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoiceError::UsageLimit {
            mode: LimitMode::Block,
            ..
        }
    ));
    assert_eq!(h.manager.session_count(), 0);

    let notices = h.transport.notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].1.contains("budget"));
}

#[tokio::test]
async fn warning_limit_starts_the_session_and_deduplicates_notices() {
    let h = harness_with(MockMeter::limited(LimitMode::Warn), MockTransport::new());
    let k = key("g1", "c1");

    assert!(h.manager.start_for_channel(k.clone(), None).await.unwrap());
    assert!(h.manager.stop_for_channel(&k).await);
    // Restart within the notice window: the session starts but the notice
    // is suppressed.
    assert!(h.manager.start_for_channel(k.clone(), None).await.unwrap());

    assert_eq!(h.transport.notices().len(), 1);
}

#[tokio::test]
async fn blocking_limit_mid_session_stops_it() {
    let h = harness_with(
        MockMeter::limit_after(LimitMode::Block, 0),
        MockTransport::new(),
    );
    let k = key("g1", "c1");
    let mut events = h.manager.subscribe();

    assert!(h.manager.start_for_channel(k.clone(), None).await.unwrap());
    let updates = h.engine.last_updates.lock().clone().unwrap();
    updates
        .send(SessionEvent::Usage {
            response_id: Some("resp_1".to_string()),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 250,
            },
        })
        .await
        .unwrap();

    let mut saw_usage = false;
    loop {
        match recv_event(&mut events).await {
            VoiceEvent::UsageRecorded { usage, .. } => {
                assert_eq!(usage.total(), 350);
                saw_usage = true;
            }
            VoiceEvent::SessionStopped { reason, .. } => {
                assert_eq!(reason, StopReason::UsageLimit);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_usage);
    assert_eq!(h.manager.session_count(), 0);
    assert_eq!(h.transport.notices().len(), 1);
}
