//! Engine-wide event bus.
//!
//! Session lifecycle, transcripts, and usage updates fan out to any number
//! of subscribers over a tokio broadcast channel. Publishing never blocks
//! and never fails; lagging subscribers miss events rather than stalling
//! sessions.

use tokio::sync::broadcast;
use tracing::trace;

use crate::core::audio::VoiceTranscriptSegment;
use crate::core::session::{StopReason, VoiceSessionStatus};
use crate::tools::TokenUsage;
use crate::transport::{GuildId, SessionKey};

const BUS_CAPACITY: usize = 128;

/// Everything observable about running voice sessions.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    SessionStarted {
        key: SessionKey,
    },
    SessionStopped {
        key: SessionKey,
        reason: StopReason,
        /// Final snapshot taken as the session stopped.
        status: VoiceSessionStatus,
    },
    /// Configuration changed for one guild, or globally when `guild_id` is
    /// absent.
    ConfigChanged {
        guild_id: Option<GuildId>,
    },
    Transcript {
        key: SessionKey,
        segment: VoiceTranscriptSegment,
    },
    UsageRecorded {
        key: SessionKey,
        model: String,
        usage: TokenUsage,
    },
    Warning {
        key: SessionKey,
        message: String,
    },
}

/// Cloneable publish/subscribe handle.
#[derive(Clone)]
pub struct VoiceEventBus {
    sender: broadcast::Sender<VoiceEvent>,
}

impl Default for VoiceEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. A send error only means nobody is subscribed.
    pub fn publish(&self, event: VoiceEvent) {
        if self.sender.send(event).is_err() {
            trace!("voice event dropped, no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
