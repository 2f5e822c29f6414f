//! Output format settings
//!
//! Encoding parameters attached to every writer input. The underlying writer
//! owns codec and container details; these values only describe what it is
//! asked to produce.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Media kind persisted by one channel writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Base name of the channel's backing file
    pub fn file_stem(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
}

/// Video input settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSettings {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
}

impl VideoSettings {
    /// H.264 at the capture surface size rounded down to a multiple of 16
    pub fn for_surface(width: u32, height: u32) -> Self {
        Self {
            codec: VideoCodec::H264,
            width: width / 16 * 16,
            height: height / 16 * 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioFormat {
    /// MPEG-4 AAC, high-efficiency profile
    AacHe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelLayout {
    /// MPEG 2.0 (left, right)
    Stereo,
}

/// Audio input settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSettings {
    pub format: AudioFormat,
    pub channels: u16,
    pub sample_rate: u32,
    pub layout: ChannelLayout,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            format: AudioFormat::AacHe,
            channels: 2,
            sample_rate: 44_100,
            layout: ChannelLayout::Stereo,
        }
    }
}

/// Settings for one writer input port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum InputSettings {
    Video(VideoSettings),
    Audio(AudioSettings),
}

impl InputSettings {
    pub fn media_kind(&self) -> MediaKind {
        match self {
            InputSettings::Video(_) => MediaKind::Video,
            InputSettings::Audio(_) => MediaKind::Audio,
        }
    }

    /// Nominal duration of one sample in microseconds
    pub fn nominal_sample_micros(&self) -> i64 {
        match self {
            // 30 fps capture
            InputSettings::Video(_) => 1_000_000 / 30,
            // one AAC packet is 1024 frames
            InputSettings::Audio(audio) => 1024 * 1_000_000 / i64::from(audio.sample_rate.max(1)),
        }
    }
}

/// Settings for every port of a channel writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSettings {
    pub video: VideoSettings,
    pub audio: AudioSettings,
}

impl OutputSettings {
    pub fn for_surface(width: u32, height: u32) -> Self {
        Self {
            video: VideoSettings::for_surface(width, height),
            audio: AudioSettings::default(),
        }
    }

    /// Ports a channel of `kind` exposes, in routing order
    ///
    /// Video has a single port; audio has the primary port followed by the
    /// secondary port.
    pub fn inputs_for(&self, kind: MediaKind) -> Vec<InputSettings> {
        match kind {
            MediaKind::Video => vec![InputSettings::Video(self.video)],
            MediaKind::Audio => vec![InputSettings::Audio(self.audio), InputSettings::Audio(self.audio)],
        }
    }
}
