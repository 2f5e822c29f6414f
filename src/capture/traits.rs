//! Capture trait definitions
//!
//! Platform-agnostic types for the capture source that feeds the writing
//! pipeline. The source itself is an external collaborator: it is injected
//! into the [`RecordingController`](crate::recorder::RecordingController)
//! through the [`CaptureSource`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::writer::MediaKind;

/// Presentation timestamp on the capture source's monotonic clock, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MediaTime(i64);

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self(duration.as_micros() as i64)
    }

    pub const fn as_micros(&self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Distance from `earlier` to `self`, saturating at zero.
    pub fn saturating_since(&self, earlier: MediaTime) -> MediaTime {
        MediaTime(self.0.saturating_sub(earlier.0).max(0))
    }

    pub fn saturating_add(&self, other: MediaTime) -> MediaTime {
        MediaTime(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// One of the three data tracks delivered by the capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelTag {
    /// Screen frames
    Video,
    /// Application audio
    AudioPrimary,
    /// Microphone audio
    AudioSecondary,
}

impl ChannelTag {
    /// Which channel writer persists buffers with this tag
    pub fn media_kind(&self) -> MediaKind {
        match self {
            ChannelTag::Video => MediaKind::Video,
            ChannelTag::AudioPrimary | ChannelTag::AudioSecondary => MediaKind::Audio,
        }
    }
}

impl fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelTag::Video => write!(f, "video"),
            ChannelTag::AudioPrimary => write!(f, "audio-primary"),
            ChannelTag::AudioSecondary => write!(f, "audio-secondary"),
        }
    }
}

/// Immutable unit of captured media
///
/// The payload is opaque encoded media; cloning a buffer shares the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    timestamp: MediaTime,
    channel: ChannelTag,
    payload: Arc<[u8]>,
}

impl SampleBuffer {
    pub fn new(timestamp: MediaTime, channel: ChannelTag, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            timestamp,
            channel,
            payload: payload.into(),
        }
    }

    pub fn timestamp(&self) -> MediaTime {
        self.timestamp
    }

    pub fn channel(&self) -> ChannelTag {
        self.channel
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Errors reported by a capture source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Capture source is unavailable")]
    Unavailable,

    #[error("Capture source is already capturing")]
    AlreadyCapturing,

    #[error("Capture source is not capturing")]
    NotCapturing,

    #[error("Capture source error: {0}")]
    Source(String),
}

/// Receives every sample (or a terminal error) from the capture source
pub type BufferHandler = Arc<dyn Fn(Result<SampleBuffer, CaptureError>) + Send + Sync>;

/// Capture source contract
///
/// `on_buffer` is invoked on the source's own execution context, at media
/// rate, for as long as the capture runs.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Whether the source can capture at all
    fn is_available(&self) -> bool;

    /// The source's own view of whether it is capturing right now
    fn is_capturing(&self) -> bool;

    /// Start delivering buffers to `on_buffer`
    fn start_capture(&self, mic_enabled: bool, on_buffer: BufferHandler) -> Result<(), CaptureError>;

    /// Stop delivering buffers
    async fn stop_capture(&self) -> Result<(), CaptureError>;
}

/// Application lifecycle signals the controller reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The app moved to the background
    DidEnterBackground,
    /// The platform reports that screen capture is no longer active
    CaptureInactive,
}
