//! Synthetic capture source
//!
//! A deterministic stand-in for a platform screen recorder. Tests drive it
//! buffer by buffer with [`SyntheticCaptureSource::push`]; the demo binary
//! lets it generate media-rate traffic with
//! [`SyntheticCaptureSource::spawn_generator`].

use super::traits::{BufferHandler, CaptureError, CaptureSource, ChannelTag, MediaTime, SampleBuffer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Traffic shape for the built-in generator
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Video frames per second
    pub video_fps: u32,
    /// Audio packets per second, per audio channel
    pub audio_packets_per_sec: u32,
    /// Clock value of the first buffer
    pub clock_base: MediaTime,
    /// Bytes per synthetic payload
    pub payload_size: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            video_fps: 30,
            // 1024-sample AAC packets at 44.1 kHz
            audio_packets_per_sec: 43,
            clock_base: MediaTime::from_micros(5_000_000),
            payload_size: 256,
        }
    }
}

/// In-process capture source with scriptable state
pub struct SyntheticCaptureSource {
    available: AtomicBool,
    capturing: AtomicBool,
    mic_enabled: AtomicBool,
    handler: Mutex<Option<BufferHandler>>,
    stop_error: Mutex<Option<CaptureError>>,
    stop_stuck: AtomicBool,
    generator: Mutex<Option<JoinHandle<()>>>,
    start_count: AtomicUsize,
    stop_count: AtomicUsize,
}

impl SyntheticCaptureSource {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            capturing: AtomicBool::new(false),
            mic_enabled: AtomicBool::new(false),
            handler: Mutex::new(None),
            stop_error: Mutex::new(None),
            stop_stuck: AtomicBool::new(false),
            generator: Mutex::new(None),
            start_count: AtomicUsize::new(0),
            stop_count: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Override the capturing flag without touching the handler
    ///
    /// Models the platform flipping its own state, e.g. the user ending the
    /// capture from a system control.
    pub fn set_capturing(&self, capturing: bool) {
        self.capturing.store(capturing, Ordering::SeqCst);
    }

    /// Make the next `stop_capture` report `error` (capture still stops)
    pub fn set_stop_error(&self, error: Option<CaptureError>) {
        *self.stop_error.lock() = error;
    }

    /// Make every `stop_capture` fail and leave capture running
    pub fn set_stop_stuck(&self, stuck: bool) {
        self.stop_stuck.store(stuck, Ordering::SeqCst);
    }

    pub fn mic_enabled(&self) -> bool {
        self.mic_enabled.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// Deliver one buffer through the registered handler
    ///
    /// Returns `false` when no capture is running.
    pub fn push(&self, buffer: SampleBuffer) -> bool {
        self.deliver(Ok(buffer))
    }

    /// Deliver an error through the registered handler
    pub fn fail(&self, error: CaptureError) -> bool {
        self.deliver(Err(error))
    }

    fn deliver(&self, event: Result<SampleBuffer, CaptureError>) -> bool {
        // Never call out while holding the lock
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }

    /// Generate buffers on all active channels until capture stops or
    /// `duration` of media has been produced
    pub fn spawn_generator(self: &Arc<Self>, config: GeneratorConfig, duration: Duration) {
        let source = Arc::clone(self);
        let task = tokio::spawn(async move {
            let tick = Duration::from_millis(5);
            let mut interval = tokio::time::interval(tick);
            let video_step = 1_000_000 / i64::from(config.video_fps.max(1));
            let audio_step = 1_000_000 / i64::from(config.audio_packets_per_sec.max(1));
            let end = duration.as_micros() as i64;

            let mut elapsed: i64 = 0;
            let mut next_video: i64 = 0;
            let mut next_audio: i64 = 0;
            let mut sequence: u64 = 0;

            while elapsed <= end {
                interval.tick().await;
                if !source.is_capturing() {
                    break;
                }

                while next_video <= elapsed {
                    let at = config.clock_base.saturating_add(MediaTime::from_micros(next_video));
                    source.push(synthetic_buffer(at, ChannelTag::Video, sequence, config.payload_size));
                    sequence += 1;
                    next_video += video_step;
                }

                while next_audio <= elapsed {
                    let at = config.clock_base.saturating_add(MediaTime::from_micros(next_audio));
                    source.push(synthetic_buffer(at, ChannelTag::AudioPrimary, sequence, config.payload_size / 4));
                    if source.mic_enabled() {
                        source.push(synthetic_buffer(at, ChannelTag::AudioSecondary, sequence, config.payload_size / 4));
                    }
                    sequence += 1;
                    next_audio += audio_step;
                }

                elapsed += tick.as_micros() as i64;
            }

            tracing::debug!("Synthetic generator finished after {} buffers", sequence);
        });

        if let Some(previous) = self.generator.lock().replace(task) {
            previous.abort();
        }
    }

    /// Wait for a running generator to finish on its own
    pub async fn join_generator(&self) {
        let task = self.generator.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Default for SyntheticCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

fn synthetic_buffer(at: MediaTime, channel: ChannelTag, sequence: u64, size: usize) -> SampleBuffer {
    let seed = sequence.to_le_bytes();
    let payload: Vec<u8> = seed.iter().copied().cycle().take(size.max(1)).collect();
    SampleBuffer::new(at, channel, payload)
}

#[async_trait]
impl CaptureSource for SyntheticCaptureSource {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn start_capture(&self, mic_enabled: bool, on_buffer: BufferHandler) -> Result<(), CaptureError> {
        if !self.is_available() {
            return Err(CaptureError::Unavailable);
        }
        if self.is_capturing() {
            return Err(CaptureError::AlreadyCapturing);
        }

        self.mic_enabled.store(mic_enabled, Ordering::SeqCst);
        *self.handler.lock() = Some(on_buffer);
        self.capturing.store(true, Ordering::SeqCst);
        self.start_count.fetch_add(1, Ordering::SeqCst);

        tracing::debug!("Synthetic capture started (mic: {})", mic_enabled);
        Ok(())
    }

    async fn stop_capture(&self) -> Result<(), CaptureError> {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        if self.stop_stuck.load(Ordering::SeqCst) {
            return Err(CaptureError::Source("capture did not stop".to_string()));
        }
        let was_capturing = self.capturing.swap(false, Ordering::SeqCst);
        self.handler.lock().take();
        if let Some(task) = self.generator.lock().take() {
            task.abort();
        }

        if let Some(error) = self.stop_error.lock().take() {
            return Err(error);
        }
        if !was_capturing {
            return Err(CaptureError::NotCapturing);
        }

        tracing::debug!("Synthetic capture stopped");
        Ok(())
    }
}
