pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod manager;
pub mod storage;
pub mod tools;
pub mod transport;

// Re-export commonly used items for convenience
pub use config::{EndpointingStrategy, VoiceConfigPatch, VoiceRuntimeConfig, VoiceTuning};
pub use core::*;
pub use engine::{
    EngineFeatures, RealtimeVoiceEngine, SessionEvent, StartVoiceSessionOptions, VoiceEngine,
    VoiceSessionHandle,
};
pub use errors::{LimitMode, VoiceError, VoiceResult};
pub use events::{VoiceEvent, VoiceEventBus};
pub use manager::VoiceManager;
