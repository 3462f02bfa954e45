//! Process-wide voice session registry and configuration authority.
//!
//! The manager owns the map of live sessions keyed by (guild, channel),
//! resolves effective configuration (base merged with persisted per-guild
//! patches, memoized until invalidated), enforces per-guild concurrency
//! limits, relays transcripts and usage to their collaborators, and fans
//! lifecycle events out over the [`VoiceEventBus`].
//!
//! The single-session-per-key invariant is enforced with an atomic map
//! reservation: the existence check and the insert happen inside one
//! `DashMap` entry operation, with no await point in between.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::{VoiceConfigPatch, VoiceRuntimeConfig, VoiceTuning};
use crate::core::audio::now_ms;
use crate::core::realtime::{DEFAULT_REALTIME_MODEL, TranscriptRole};
use crate::core::session::{SessionEvent, StopReason, VoiceSessionStatus};
use crate::engine::{StartVoiceSessionOptions, VoiceEngine, VoiceSessionHandle};
use crate::errors::{LimitMode, VoiceError, VoiceResult};
use crate::events::{VoiceEvent, VoiceEventBus};
use crate::storage::{KeyValueStore, VOICE_NAMESPACE, guild_config_key, last_session_key};
use crate::tools::UsageMeter;
use crate::transport::{ChannelId, ChannelTransport, GuildId, SessionKey};

/// Capacity of each session's update channel.
const UPDATE_CAPACITY: usize = 64;

enum SessionSlot {
    /// Reserved while the start sequence runs.
    Starting,
    Active(Arc<dyn VoiceSessionHandle>),
}

pub struct VoiceManager {
    engine: Arc<dyn VoiceEngine>,
    transport: Arc<dyn ChannelTransport>,
    store: Arc<dyn KeyValueStore>,
    meter: Arc<dyn UsageMeter>,
    tuning: VoiceTuning,
    base_config: RwLock<Arc<VoiceRuntimeConfig>>,
    sessions: DashMap<SessionKey, SessionSlot>,
    /// Resolved config per guild, invalidated by config writes.
    config_cache: DashMap<GuildId, Arc<VoiceRuntimeConfig>>,
    /// Last usage-limit notice per (guild, channel, model), in unix seconds.
    notice_log: Mutex<HashMap<(GuildId, ChannelId, String), u64>>,
    bus: VoiceEventBus,
}

impl VoiceManager {
    pub fn new(
        engine: Arc<dyn VoiceEngine>,
        transport: Arc<dyn ChannelTransport>,
        store: Arc<dyn KeyValueStore>,
        meter: Arc<dyn UsageMeter>,
    ) -> Self {
        Self {
            engine,
            transport,
            store,
            meter,
            tuning: VoiceTuning::default(),
            base_config: RwLock::new(Arc::new(VoiceRuntimeConfig::default())),
            sessions: DashMap::new(),
            config_cache: DashMap::new(),
            notice_log: Mutex::new(HashMap::new()),
            bus: VoiceEventBus::new(),
        }
    }

    pub fn with_tuning(mut self, tuning: VoiceTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_base_config(self, config: VoiceRuntimeConfig) -> Self {
        *self.base_config.write() = Arc::new(config);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.bus.subscribe()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a voice session for a channel. Returns `Ok(false)` (logged) when
    /// nothing was started: voice disabled or unsupported, a session already
    /// exists, the guild's concurrency limit is hit, or the guild has no
    /// voice connection. Start failures roll the reservation back and
    /// propagate; a blocking usage limit additionally posts a chat notice.
    pub async fn start_for_channel(
        self: &Arc<Self>,
        key: SessionKey,
        transcript_override: Option<ChannelId>,
    ) -> VoiceResult<bool> {
        if !self.engine.features().voice {
            info!(%key, "engine does not support voice, skipping");
            return Ok(false);
        }

        match self.sessions.entry(key.clone()) {
            Entry::Occupied(_) => {
                info!(%key, "voice session already active, skipping");
                return Ok(false);
            }
            Entry::Vacant(slot) => {
                slot.insert(SessionSlot::Starting);
            }
        }

        match self.start_reserved(&key, transcript_override).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.sessions.remove(&key);
                Ok(false)
            }
            Err(err) => {
                self.sessions.remove(&key);
                if let VoiceError::UsageLimit { model, message, .. } = &err {
                    self.notify_usage_limit(&key, model, message).await;
                }
                Err(err)
            }
        }
    }

    async fn start_reserved(
        self: &Arc<Self>,
        key: &SessionKey,
        transcript_override: Option<ChannelId>,
    ) -> VoiceResult<bool> {
        let config = self.resolved_config(&key.guild_id).await?;
        if !config.enabled {
            info!(%key, "voice disabled for guild, skipping");
            return Ok(false);
        }

        let active_in_guild = self
            .sessions
            .iter()
            .filter(|entry| entry.key().guild_id == key.guild_id && entry.key() != key)
            .count();
        if active_in_guild >= config.max_concurrent_channels {
            info!(
                %key,
                active = active_in_guild,
                limit = config.max_concurrent_channels,
                "guild concurrency limit reached, skipping"
            );
            return Ok(false);
        }

        let model = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_REALTIME_MODEL.to_string());
        if let Err(err) = self.meter.check_limit(key, &model).await {
            match &err {
                VoiceError::UsageLimit {
                    mode: LimitMode::Warn,
                    model,
                    message,
                    ..
                } => {
                    self.notify_usage_limit(key, model, message).await;
                }
                _ => return Err(err),
            }
        }

        let Some(connection) = self.transport.connection_for_guild(&key.guild_id).await else {
            info!(%key, "no voice connection for guild, skipping");
            return Ok(false);
        };

        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CAPACITY);
        let handle = self
            .engine
            .start_voice_session(StartVoiceSessionOptions {
                key: key.clone(),
                config: config.clone(),
                connection,
                updates: updates_tx,
            })
            .await?;

        self.sessions
            .insert(key.clone(), SessionSlot::Active(handle.clone()));
        self.spawn_update_forwarder(
            key.clone(),
            config,
            model,
            handle,
            transcript_override,
            updates_rx,
        );
        self.bus.publish(VoiceEvent::SessionStarted { key: key.clone() });
        info!(%key, "voice session started");
        Ok(true)
    }

    /// Stop a channel's session. Idempotent; `false` when nothing was
    /// running. The stop event is raised by the session's terminal update,
    /// so it fires exactly once however the session ends.
    pub async fn stop_for_channel(&self, key: &SessionKey) -> bool {
        let Some((_, slot)) = self.sessions.remove(key) else {
            debug!(%key, "no voice session to stop");
            return false;
        };
        if let SessionSlot::Active(handle) = slot {
            handle.stop(StopReason::Requested).await;
        }
        self.release_if_last(&key.guild_id).await;
        true
    }

    /// Inject a text message into a running session.
    pub async fn announce(&self, key: &SessionKey, text: &str) -> VoiceResult<()> {
        let handle = self.sessions.get(key).and_then(|entry| match entry.value() {
            SessionSlot::Active(handle) => Some(handle.clone()),
            SessionSlot::Starting => None,
        });
        match handle {
            Some(handle) => handle.announce(text).await,
            None => Err(VoiceError::Session(format!("no voice session for {key}"))),
        }
    }

    pub fn session_status(&self, key: &SessionKey) -> Option<VoiceSessionStatus> {
        self.sessions.get(key).and_then(|entry| match entry.value() {
            SessionSlot::Active(handle) => Some(handle.status()),
            SessionSlot::Starting => None,
        })
    }

    pub fn active_sessions(&self) -> Vec<SessionKey> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Effective configuration for a guild: the base snapshot overlaid with
    /// the guild's persisted patch. Memoized until a config write.
    pub async fn resolved_config(&self, guild: &GuildId) -> VoiceResult<Arc<VoiceRuntimeConfig>> {
        if let Some(cached) = self.config_cache.get(guild) {
            return Ok(cached.clone());
        }
        let base = self.base_config.read().clone();
        let resolved = match self.load_guild_patch(guild).await? {
            Some(patch) => patch.apply(&base),
            None => (*base).clone(),
        };
        resolved.validate().map_err(VoiceError::InvalidConfig)?;
        let resolved = Arc::new(resolved);
        self.config_cache.insert(guild.clone(), resolved.clone());
        Ok(resolved)
    }

    /// Merge a patch into the guild's persisted overrides, persist the
    /// result, and push the newly resolved config to the guild's live
    /// sessions.
    pub async fn set_guild_config(
        &self,
        guild: &GuildId,
        patch: VoiceConfigPatch,
    ) -> VoiceResult<Arc<VoiceRuntimeConfig>> {
        let merged = match self.load_guild_patch(guild).await? {
            Some(existing) => existing.merge(patch),
            None => patch,
        };
        let value =
            serde_json::to_value(&merged).map_err(|e| VoiceError::Storage(e.to_string()))?;
        self.store
            .set(VOICE_NAMESPACE, &guild_config_key(guild.as_str()), value)
            .await?;
        self.config_cache.remove(guild);

        let resolved = self.resolved_config(guild).await?;
        self.push_config(guild, &resolved).await;
        self.bus.publish(VoiceEvent::ConfigChanged {
            guild_id: Some(guild.clone()),
        });
        Ok(resolved)
    }

    /// Patch the process-wide base config and re-resolve every guild with a
    /// live session.
    pub async fn set_base_config(&self, patch: VoiceConfigPatch) -> VoiceResult<()> {
        let next = {
            let base = self.base_config.read().clone();
            patch.apply(&base)
        };
        next.validate().map_err(VoiceError::InvalidConfig)?;
        *self.base_config.write() = Arc::new(next);
        self.config_cache.clear();

        let guilds: HashSet<GuildId> = self
            .sessions
            .iter()
            .map(|entry| entry.key().guild_id.clone())
            .collect();
        for guild in guilds {
            match self.resolved_config(&guild).await {
                Ok(resolved) => self.push_config(&guild, &resolved).await,
                Err(err) => warn!(%guild, %err, "config resolution failed after base update"),
            }
        }
        self.bus.publish(VoiceEvent::ConfigChanged { guild_id: None });
        Ok(())
    }

    async fn load_guild_patch(&self, guild: &GuildId) -> VoiceResult<Option<VoiceConfigPatch>> {
        let key = guild_config_key(guild.as_str());
        let Some(value) = self.store.get(VOICE_NAMESPACE, &key).await? else {
            return Ok(None);
        };
        match serde_json::from_value::<VoiceConfigPatch>(value) {
            Ok(patch) => Ok(Some(patch)),
            Err(err) => {
                warn!(%guild, %err, "ignoring undecodable persisted voice config");
                Ok(None)
            }
        }
    }

    async fn push_config(&self, guild: &GuildId, config: &Arc<VoiceRuntimeConfig>) {
        let handles: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| &entry.key().guild_id == guild)
            .filter_map(|entry| match entry.value() {
                SessionSlot::Active(handle) => Some(handle.clone()),
                SessionSlot::Starting => None,
            })
            .collect();
        for handle in handles {
            if let Err(err) = handle.update_config(config.clone()).await {
                warn!(key = %handle.key(), %err, "live config push failed");
            }
        }
    }

    // =========================================================================
    // Session update relay
    // =========================================================================

    fn spawn_update_forwarder(
        self: &Arc<Self>,
        key: SessionKey,
        config: Arc<VoiceRuntimeConfig>,
        model: String,
        handle: Arc<dyn VoiceSessionHandle>,
        transcript_override: Option<ChannelId>,
        mut updates: mpsc::Receiver<SessionEvent>,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            // Resolved on the first final segment and kept for the session.
            let mut transcript_target: Option<Option<ChannelId>> = None;

            while let Some(event) = updates.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                match event {
                    SessionEvent::Transcript { segment, role } => {
                        manager.bus.publish(VoiceEvent::Transcript {
                            key: key.clone(),
                            segment: segment.clone(),
                        });
                        if !segment.is_final
                            || !config.transcript.enabled
                            || segment.text.trim().is_empty()
                        {
                            continue;
                        }
                        let target = match &transcript_target {
                            Some(target) => target.clone(),
                            None => {
                                let resolved = manager
                                    .resolve_transcript_channel(
                                        &key,
                                        &config,
                                        transcript_override.as_ref(),
                                    )
                                    .await;
                                transcript_target = Some(resolved.clone());
                                resolved
                            }
                        };
                        if let Some(channel) = target {
                            let label = match role {
                                TranscriptRole::User => "user",
                                TranscriptRole::Assistant => "assistant",
                            };
                            let text = format!("{label}: {}", segment.text);
                            if let Err(err) =
                                manager.transport.send_notice(&channel, &text).await
                            {
                                warn!(%key, %err, "transcript notice failed");
                            }
                        }
                    }

                    SessionEvent::Usage { usage, .. } => {
                        manager.meter.record(&key, &model, usage).await;
                        manager.bus.publish(VoiceEvent::UsageRecorded {
                            key: key.clone(),
                            model: model.clone(),
                            usage,
                        });
                        if let Err(err) = manager.meter.check_limit(&key, &model).await
                            && let VoiceError::UsageLimit { mode, message, .. } = &err
                        {
                            manager.notify_usage_limit(&key, &model, message).await;
                            if *mode == LimitMode::Block {
                                warn!(%key, "usage limit reached, stopping session");
                                manager.sessions.remove(&key);
                                // The terminal Stopped update still arrives
                                // below and raises the stop event.
                                handle.stop(StopReason::UsageLimit).await;
                            }
                        }
                    }

                    SessionEvent::Warning { message } => {
                        manager.bus.publish(VoiceEvent::Warning {
                            key: key.clone(),
                            message,
                        });
                    }

                    SessionEvent::Stopped { reason } => {
                        manager.sessions.remove(&key);
                        let status = handle.status();
                        manager.persist_last_session(&key, &status, &reason).await;
                        manager.release_if_last(&key.guild_id).await;
                        manager.bus.publish(VoiceEvent::SessionStopped {
                            key: key.clone(),
                            reason,
                            status,
                        });
                        break;
                    }
                }
            }
        });
    }

    /// Resolution order: explicit per-call override, the guild's configured
    /// target, the voice channel itself when it accepts text, the guild
    /// default channel, otherwise none (transcripts silently disabled).
    async fn resolve_transcript_channel(
        &self,
        key: &SessionKey,
        config: &VoiceRuntimeConfig,
        explicit: Option<&ChannelId>,
    ) -> Option<ChannelId> {
        if let Some(channel) = explicit {
            return Some(channel.clone());
        }
        if let Some(target) = &config.transcript.target_channel_id {
            return Some(target.clone());
        }
        if self.transport.channel_accepts_text(&key.channel_id).await {
            return Some(key.channel_id.clone());
        }
        self.transport.default_text_channel(&key.guild_id).await
    }

    /// Post a usage-limit notice, deduplicated per (guild, channel, model)
    /// within the configured window.
    async fn notify_usage_limit(&self, key: &SessionKey, model: &str, message: &str) {
        let now_secs = now_ms() / 1000;
        {
            let mut log = self.notice_log.lock();
            let entry = (
                key.guild_id.clone(),
                key.channel_id.clone(),
                model.to_string(),
            );
            if let Some(&last) = log.get(&entry)
                && now_secs.saturating_sub(last) < self.tuning.usage_notice_window_secs
            {
                debug!(%key, %model, "usage notice suppressed within window");
                return;
            }
            log.insert(entry, now_secs);
        }

        let target = if self.transport.channel_accepts_text(&key.channel_id).await {
            Some(key.channel_id.clone())
        } else {
            self.transport.default_text_channel(&key.guild_id).await
        };
        match target {
            Some(channel) => {
                if let Err(err) = self.transport.send_notice(&channel, message).await {
                    warn!(%key, %err, "usage notice failed");
                }
            }
            None => warn!(%key, %model, "usage limit reached, no text channel for notice"),
        }
    }

    async fn persist_last_session(
        &self,
        key: &SessionKey,
        status: &VoiceSessionStatus,
        reason: &StopReason,
    ) {
        let snapshot = serde_json::json!({
            "session_id": key.session_id(),
            "instance_id": status.instance_id,
            "reason": reason.to_string(),
            "state": status.state.to_string(),
            "connection": status.connection.to_string(),
            "started_at_ms": status.started_at_ms,
            "stopped_at_ms": now_ms(),
        });
        let store_key = last_session_key(key.guild_id.as_str());
        if let Err(err) = self.store.set(VOICE_NAMESPACE, &store_key, snapshot).await {
            warn!(%key, %err, "failed to persist session snapshot");
        }
    }

    async fn release_if_last(&self, guild: &GuildId) {
        let remaining = self
            .sessions
            .iter()
            .any(|entry| &entry.key().guild_id == guild);
        if !remaining {
            self.transport.release_connection(guild).await;
        }
    }
}
