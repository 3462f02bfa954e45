//! Key/value persistence contract and an in-memory implementation.
//!
//! Guild voice configuration lives under the `voice` namespace at
//! `guild:<id>:config`. The hosting framework supplies its own durable store;
//! [`MemoryStore`] backs tests and single-process deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::errors::{VoiceError, VoiceResult};

/// Namespace for all engine-owned keys.
pub const VOICE_NAMESPACE: &str = "voice";

/// Store key for a guild's persisted configuration patch.
pub fn guild_config_key(guild_id: &str) -> String {
    format!("guild:{guild_id}:config")
}

/// Store key for a guild's last-known session snapshot.
pub fn last_session_key(guild_id: &str) -> String {
    format!("guild:{guild_id}:last_session")
}

/// Namespaced JSON key/value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> VoiceResult<Option<Value>>;

    async fn set(&self, namespace: &str, key: &str, value: Value) -> VoiceResult<()>;

    async fn delete(&self, namespace: &str, key: &str) -> VoiceResult<()>;
}

/// Process-local store used by tests and store-less deployments.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<(String, String), Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> VoiceResult<Option<Value>> {
        Ok(self
            .entries
            .get(&(namespace.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> VoiceResult<()> {
        if !value.is_object() && !value.is_null() {
            return Err(VoiceError::Storage(format!(
                "refusing non-object value for {namespace}/{key}"
            )));
        }
        self.entries
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> VoiceResult<()> {
        self.entries
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}
