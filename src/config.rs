//! Recorder configuration
//!
//! JSON configuration with defaults for every field, plus the file layout
//! derived from it.

use crate::export::{ExportOptions, ExporterKind, MergeOptions};
use crate::writer::{MediaKind, OutputSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Recorder settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Directory holding the backing files and the merged clip
    pub cache_dir: PathBuf,
    /// Base name of the merged clip
    pub clip_name: String,
    /// Capture surface size in pixels
    pub surface_width: u32,
    pub surface_height: u32,
    /// Delay before reacting to capture becoming inactive
    pub inactive_settle_ms: u64,
    /// Fail the merge when no audio was captured
    pub require_audio: bool,
    pub optimize_for_network_use: bool,
    pub exporter: ExporterKind,
    /// ffmpeg binary used by the MPEG-4 exporter
    pub ffmpeg_path: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            clip_name: "clip".to_string(),
            surface_width: 1920,
            surface_height: 1080,
            inactive_settle_ms: 1000,
            require_audio: false,
            optimize_for_network_use: true,
            exporter: ExporterKind::TrackFile,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("clip-recorder")
}

impl RecorderConfig {
    /// Load from `path`, falling back to defaults when the file is absent
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No recorder config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        tracing::info!("Loaded recorder config from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved recorder config to {:?}", path);
        Ok(())
    }

    pub fn output_settings(&self) -> OutputSettings {
        OutputSettings::for_surface(self.surface_width, self.surface_height)
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            require_audio: self.require_audio,
        }
    }

    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            optimize_for_network_use: self.optimize_for_network_use,
        }
    }

    pub fn inactive_settle(&self) -> Duration {
        Duration::from_millis(self.inactive_settle_ms)
    }
}

/// Deterministic locations of one recording's files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    pub video: PathBuf,
    pub audio: PathBuf,
    pub clip: PathBuf,
}

impl FileLayout {
    /// `<dir>/video.<ext>`, `<dir>/audio.<ext>` and `<dir>/<clip>.<clip_ext>`
    pub fn new(dir: &Path, clip_name: &str, backing_extension: &str, clip_extension: &str) -> Self {
        let backing = |kind: MediaKind| dir.join(format!("{}.{}", kind.file_stem(), backing_extension));
        Self {
            video: backing(MediaKind::Video),
            audio: backing(MediaKind::Audio),
            clip: dir.join(format!("{}.{}", clip_name, clip_extension)),
        }
    }

    pub fn backing_file(&self, kind: MediaKind) -> &Path {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    /// Directory holding the files
    pub fn dir(&self) -> Option<&Path> {
        self.clip.parent()
    }
}
