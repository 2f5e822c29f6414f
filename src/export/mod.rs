//! Clip export module
//!
//! This module merges the per-channel backing files into one composition
//! and renders it to the merged clip.

pub mod composition;
pub mod exporter;
pub mod ffmpeg;
pub mod merge;
pub mod types;

pub use composition::{AssetLoader, AssetTrack, Composition, CompositionError, CompositionTrack, TimeRange};
pub use exporter::{CompositionExporter, TrackFileExporter};
pub use ffmpeg::FfmpegExporter;
pub use merge::MergeExporter;
pub use types::{ExportError, ExportOptions, ExporterKind, MergeError, MergeOptions};
