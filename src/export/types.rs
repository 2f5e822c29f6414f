//! Export types and configuration
//!
//! Options and errors for the merge/export step.

use crate::export::composition::CompositionError;
use crate::writer::settings::MediaKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which exporter renders the merged output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExporterKind {
    /// Multi-track track file, no external tools
    #[default]
    TrackFile,
    /// MPEG-4 through the ffmpeg CLI
    Ffmpeg,
}

/// Export configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    /// Lay the output out for progressive download (index before media)
    pub optimize_for_network_use: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            optimize_for_network_use: true,
        }
    }
}

/// Merge policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOptions {
    /// Fail the merge when the audio channel holds no tracks
    ///
    /// When unset, a recording without audio exports as video only.
    pub require_audio: bool,
}

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    #[error("Cannot create export session: {0}")]
    Session(String),

    #[error("Cannot read source media: {0}")]
    Source(String),
}

/// Errors of the merge/export step
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("No {0} tracks in the backing store")]
    EmptyTracks(MediaKind),

    #[error("Failed to insert {kind} track: {source}")]
    Insert {
        kind: MediaKind,
        #[source]
        source: CompositionError,
    },

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),
}
