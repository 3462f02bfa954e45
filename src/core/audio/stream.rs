//! Asynchronous audio frame queue bridging capture callbacks to the protocol
//! transmit loop.
//!
//! Multiple producers push concurrently; exactly one consumer iterates.
//! The queue is bounded: producers suspend while it is full, which is the
//! backpressure signal that keeps a fast capture path from overwhelming a
//! slow transmit loop. `end` is idempotent and wakes a waiting consumer with
//! a terminal result; pushes after `end` are silently dropped.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::frame::VoiceInputFrame;

/// Default queue capacity, sized for several seconds of 20ms frames.
const DEFAULT_CAPACITY: usize = 256;

struct Inner {
    queue: VecDeque<VoiceInputFrame>,
    ended: bool,
}

/// Single-consumer, multi-producer asynchronous frame queue.
pub struct AudioFrameStream {
    inner: Mutex<Inner>,
    capacity: usize,
    /// Wakes the consumer when a frame arrives or the stream ends.
    data_ready: Notify,
    /// Wakes producers when queue space frees up.
    space_ready: Notify,
}

impl Default for AudioFrameStream {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl AudioFrameStream {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                ended: false,
            }),
            capacity: capacity.max(1),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    /// Push a frame, suspending while the queue is full. Returns `false` if
    /// the stream has ended and the frame was dropped.
    pub async fn push(&self, frame: VoiceInputFrame) -> bool {
        loop {
            let space = self.space_ready.notified();
            {
                let mut inner = self.inner.lock();
                if inner.ended {
                    // Cascade the wakeup so every suspended producer exits.
                    self.space_ready.notify_one();
                    return false;
                }
                if inner.queue.len() < self.capacity {
                    inner.queue.push_back(frame);
                    self.data_ready.notify_one();
                    return true;
                }
            }
            space.await;
        }
    }

    /// Pull the next frame; `None` is the terminal result after `end`.
    pub async fn next(&self) -> Option<VoiceInputFrame> {
        loop {
            let ready = self.data_ready.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.queue.pop_front() {
                    self.space_ready.notify_one();
                    return Some(frame);
                }
                if inner.ended {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// End the stream. Idempotent; wakes a waiting consumer with the
    /// terminal result and releases any suspended producers.
    pub fn end(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.ended {
                return;
            }
            inner.ended = true;
        }
        self.data_ready.notify_one();
        self.space_ready.notify_one();
    }

    /// Rearm an ended stream for a session (re)start, discarding any frames
    /// still queued.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.ended = false;
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `end` has been called (and not reset since).
    pub fn is_ended(&self) -> bool {
        self.inner.lock().ended
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::core::audio::frame::{AudioEncoding, now_ms};

    fn frame(tag: u8) -> VoiceInputFrame {
        VoiceInputFrame {
            channels: 1,
            sample_rate: 24_000,
            encoding: AudioEncoding::Pcm16,
            data: Bytes::from(vec![tag, 0]),
            speaker_id: None,
            timestamp_ms: now_ms(),
            is_speech_end: false,
        }
    }

    #[tokio::test]
    async fn round_trip_preserves_order_and_terminates() {
        let stream = AudioFrameStream::default();
        for tag in 0..5u8 {
            assert!(stream.push(frame(tag)).await);
        }
        stream.end();

        for tag in 0..5u8 {
            let got = stream.next().await.expect("frame");
            assert_eq!(got.data[0], tag);
        }
        assert!(stream.next().await.is_none());
        // Terminal result repeats once ended.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn interleaved_producer_and_consumer() {
        let stream = Arc::new(AudioFrameStream::default());
        let producer = {
            let stream = stream.clone();
            tokio::spawn(async move {
                for tag in 0..20u8 {
                    stream.push(frame(tag)).await;
                    tokio::task::yield_now().await;
                }
                stream.end();
            })
        };

        let mut seen = Vec::new();
        while let Some(f) = stream.next().await {
            seen.push(f.data[0]);
        }
        producer.await.unwrap();
        assert_eq!(seen, (0..20u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn push_after_end_is_dropped() {
        let stream = AudioFrameStream::default();
        stream.end();
        stream.end(); // idempotent
        assert!(!stream.push(frame(1)).await);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn waiting_consumer_is_woken_by_push() {
        let stream = Arc::new(AudioFrameStream::default());
        let consumer = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.next().await })
        };
        tokio::task::yield_now().await;
        stream.push(frame(7)).await;
        let got = consumer.await.unwrap().expect("frame");
        assert_eq!(got.data[0], 7);
    }

    #[tokio::test]
    async fn reset_rearms_an_ended_stream() {
        let stream = AudioFrameStream::default();
        stream.end();
        assert!(stream.is_ended());
        stream.reset();
        assert!(!stream.is_ended());
        assert!(stream.push(frame(3)).await);
        assert_eq!(stream.next().await.unwrap().data[0], 3);
    }

    #[tokio::test]
    async fn bounded_capacity_applies_backpressure() {
        let stream = Arc::new(AudioFrameStream::with_capacity(2));
        assert!(stream.push(frame(0)).await);
        assert!(stream.push(frame(1)).await);

        let blocked = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.push(frame(2)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(stream.len(), 2);

        // Consuming one frame releases the suspended producer.
        assert_eq!(stream.next().await.unwrap().data[0], 0);
        assert!(blocked.await.unwrap());
        assert_eq!(stream.len(), 2);
    }
}
