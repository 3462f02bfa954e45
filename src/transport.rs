//! Channel/transport provider contract.
//!
//! The hosting bot framework owns the actual platform connection (gateway,
//! voice UDP, opus codec). The engine only needs the narrow surface below:
//! join/leave, per-speaker speaking events, raw PCM subscriptions with manual
//! or silence-based auto-termination, a playback sink, and text notices.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::VoiceResult;

// =============================================================================
// Identities
// =============================================================================

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

id_newtype!(
    /// Platform guild (server) identifier.
    GuildId
);
id_newtype!(
    /// Platform channel identifier.
    ChannelId
);
id_newtype!(
    /// Platform user identifier of one speaker in a voice channel.
    SpeakerId
);

/// Identity of one voice session. Exactly one live session may exist per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
}

impl SessionKey {
    pub fn new(guild_id: impl Into<GuildId>, channel_id: impl Into<ChannelId>) -> Self {
        Self {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Canonical `guild:channel` session id.
    pub fn session_id(&self) -> String {
        format!("{}:{}", self.guild_id, self.channel_id)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.guild_id, self.channel_id)
    }
}

// =============================================================================
// Capture side
// =============================================================================

/// Speaking activity raised by the platform for one speaker.
#[derive(Debug, Clone)]
pub enum SpeakingEvent {
    Started { speaker: SpeakerId },
    Stopped { speaker: SpeakerId },
}

/// How a speaker subscription terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// Stays open until explicitly destroyed.
    Manual,
    /// The transport closes the chunk stream after this much silence.
    AfterSilence { silence_ms: u64 },
}

/// One speaker's decoded audio feed. The transport closes `chunks` when the
/// subscription terminates.
pub struct SpeakerAudioStream {
    pub chunks: mpsc::Receiver<Bytes>,
    /// Sample rate of the delivered PCM16 chunks (Hz).
    pub sample_rate: u32,
    /// Interleaved channel count of the delivered chunks.
    pub channels: u16,
}

// =============================================================================
// Playback side
// =============================================================================

/// Channel playback resource supplied by the transport.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Write a PCM16 chunk at the rate the sink was opened with.
    async fn write(&self, pcm: Bytes) -> VoiceResult<()>;

    /// Halt playback immediately (barge-in).
    fn stop(&self);

    /// Whether the underlying resource has been destroyed and the pipeline
    /// must be rebuilt.
    fn is_torn_down(&self) -> bool;

    /// Whether the resource is alive but idle.
    fn is_idle(&self) -> bool;

    /// Restart an idle resource in place; `false` means a rebuild is needed.
    fn restart(&self) -> bool;
}

// =============================================================================
// Connection and transport
// =============================================================================

/// One guild's live voice connection.
#[async_trait]
pub trait GuildConnection: Send + Sync {
    fn guild_id(&self) -> GuildId;

    /// The bot's own speaker id in this channel, used to ignore
    /// self-originated audio.
    fn self_speaker(&self) -> Option<SpeakerId>;

    /// Stream of speaking start/stop events for this channel. Called once
    /// per session start.
    async fn speaking_events(&self) -> VoiceResult<mpsc::Receiver<SpeakingEvent>>;

    /// Subscribe to one speaker's raw audio.
    async fn subscribe_speaker(
        &self,
        speaker: &SpeakerId,
        end: SubscriptionEnd,
    ) -> VoiceResult<SpeakerAudioStream>;

    /// Explicitly destroy a speaker subscription. Sessions call this for
    /// every subscription they own before stopping, so descriptors never
    /// leak across session restarts.
    async fn destroy_subscription(&self, speaker: &SpeakerId);

    /// Open (or reopen) the channel playback resource at the given rate.
    async fn open_playback(&self, sample_rate: u32) -> VoiceResult<Box<dyn PlaybackSink>>;
}

/// Process-wide channel/transport provider.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Current voice connection for a guild, if one exists.
    async fn connection_for_guild(&self, guild: &GuildId) -> Option<Arc<dyn GuildConnection>>;

    /// Release the guild's voice connection after the last session stops.
    async fn release_connection(&self, guild: &GuildId);

    /// Post a text notice to a channel (usage-limit warnings, transcripts).
    async fn send_notice(&self, channel: &ChannelId, text: &str) -> VoiceResult<()>;

    /// Whether a channel can receive text messages.
    async fn channel_accepts_text(&self, channel: &ChannelId) -> bool;

    /// The guild's default/system text channel, if any.
    async fn default_text_channel(&self, guild: &GuildId) -> Option<ChannelId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_id_format() {
        let key = SessionKey::new("g1", "c2");
        assert_eq!(key.session_id(), "g1:c2");
        assert_eq!(key.to_string(), "g1:c2");
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = ChannelId::new("42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");
    }
}
