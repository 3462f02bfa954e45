//! Engine boundary: the contract a pluggable conversational-AI backend
//! satisfies, and the realtime implementation of it.
//!
//! The manager only ever sees [`VoiceEngine`] and [`VoiceSessionHandle`];
//! the realtime protocol session and the voice session behind them are
//! implementation detail of [`RealtimeVoiceEngine`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{VoiceRuntimeConfig, VoiceTuning};
use crate::core::audio::VoiceInputFrame;
use crate::core::realtime::BackendConfig;
use crate::core::session::{VoiceSession, VoiceSessionStatus};
use crate::errors::{VoiceError, VoiceResult};
use crate::tools::ToolExecutor;
use crate::transport::{GuildConnection, SessionKey};

pub use crate::core::session::{SessionEvent, StopReason};

/// Capabilities an engine reports before the manager commits to voice.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineFeatures {
    pub voice: bool,
    pub voice_transcription: bool,
    pub vision: bool,
}

/// Everything an engine needs to bring one voice session up.
pub struct StartVoiceSessionOptions {
    pub key: SessionKey,
    /// Resolved configuration snapshot for the session's guild.
    pub config: Arc<VoiceRuntimeConfig>,
    /// Live voice connection for the guild.
    pub connection: Arc<dyn GuildConnection>,
    /// Channel the session pushes its updates through; the terminal
    /// [`SessionEvent::Stopped`] is always the last message.
    pub updates: mpsc::Sender<SessionEvent>,
}

/// Handle to one running voice session.
#[async_trait]
pub trait VoiceSessionHandle: Send + Sync {
    fn key(&self) -> &SessionKey;

    fn status(&self) -> VoiceSessionStatus;

    /// Feed one externally captured frame into the session.
    async fn pump(&self, frame: VoiceInputFrame) -> VoiceResult<()>;

    /// Close the current turn (manual endpointing).
    async fn commit_input(&self);

    /// Swap in a newly resolved configuration snapshot.
    async fn update_config(&self, config: Arc<VoiceRuntimeConfig>) -> VoiceResult<()>;

    /// Inject a text message and have the assistant speak a response.
    async fn announce(&self, text: &str) -> VoiceResult<()>;

    /// Stop the session. Idempotent.
    async fn stop(&self, reason: StopReason);
}

/// A pluggable voice backend.
#[async_trait]
pub trait VoiceEngine: Send + Sync {
    fn features(&self) -> EngineFeatures;

    async fn start_voice_session(
        &self,
        options: StartVoiceSessionOptions,
    ) -> VoiceResult<Arc<dyn VoiceSessionHandle>>;

    async fn stop_voice_session(&self, session: Arc<dyn VoiceSessionHandle>, reason: StopReason) {
        session.stop(reason).await;
    }
}

#[async_trait]
impl VoiceSessionHandle for VoiceSession {
    fn key(&self) -> &SessionKey {
        VoiceSession::key(self)
    }

    fn status(&self) -> VoiceSessionStatus {
        VoiceSession::status(self)
    }

    async fn pump(&self, frame: VoiceInputFrame) -> VoiceResult<()> {
        VoiceSession::pump(self, frame).await
    }

    async fn commit_input(&self) {
        self.signal_speech_end(None).await;
    }

    async fn update_config(&self, config: Arc<VoiceRuntimeConfig>) -> VoiceResult<()> {
        VoiceSession::update_config(self, config).await
    }

    async fn announce(&self, text: &str) -> VoiceResult<()> {
        VoiceSession::announce(self, text).await
    }

    async fn stop(&self, reason: StopReason) {
        VoiceSession::stop(self, reason).await;
    }
}

// =============================================================================
// Realtime engine
// =============================================================================

/// The realtime-backend implementation of the engine contract.
pub struct RealtimeVoiceEngine {
    api_key: String,
    tuning: VoiceTuning,
    tools: Arc<dyn ToolExecutor>,
}

impl RealtimeVoiceEngine {
    pub fn new(api_key: impl Into<String>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            api_key: api_key.into(),
            tuning: VoiceTuning::default(),
            tools,
        }
    }

    pub fn with_tuning(mut self, tuning: VoiceTuning) -> Self {
        self.tuning = tuning;
        self
    }
}

#[async_trait]
impl VoiceEngine for RealtimeVoiceEngine {
    fn features(&self) -> EngineFeatures {
        let voice = !self.api_key.is_empty();
        EngineFeatures {
            voice,
            voice_transcription: voice,
            vision: false,
        }
    }

    async fn start_voice_session(
        &self,
        options: StartVoiceSessionOptions,
    ) -> VoiceResult<Arc<dyn VoiceSessionHandle>> {
        if self.api_key.is_empty() {
            return Err(VoiceError::MissingCapability {
                what: "realtime voice backend".to_string(),
                install_hint: "configure the realtime API key".to_string(),
            });
        }
        let mut backend =
            BackendConfig::from_runtime(&options.config, &self.tuning, self.api_key.clone());
        backend.tools = self.tools.available_tools();

        let session = VoiceSession::start(
            options.key,
            options.config,
            self.tuning.clone(),
            backend,
            options.connection,
            self.tools.clone(),
            options.updates,
        )
        .await?;
        Ok(session as Arc<dyn VoiceSessionHandle>)
    }
}
