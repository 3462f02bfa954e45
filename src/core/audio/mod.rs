//! Audio plumbing: frame types, the capture-to-transmit queue, and PCM
//! sample utilities.

mod frame;
pub mod pcm;
mod stream;

pub use frame::{
    AudioEncoding, SegmentPosition, VoiceInputFrame, VoicePlaybackDelta, VoiceTranscriptSegment,
    now_ms,
};
pub use stream::AudioFrameStream;
