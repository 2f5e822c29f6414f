//! Clip Recorder - capture-to-clip recording pipeline.
//!
//! Buffers from a capture source are written into one backing file per
//! media channel; on stop both files are merged into a single time-aligned
//! clip.

pub mod capture;
pub mod config;
pub mod export;
pub mod recorder;
pub mod writer;

use capture::CaptureSource;
use config::{FileLayout, RecorderConfig};
use export::{CompositionExporter, ExporterKind, FfmpegExporter, MergeExporter, TrackFileExporter};
use recorder::{RecordingController, WriteCoordinator};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use writer::{TrackFileBackend, WriterFactory};

/// Install the global tracing subscriber; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clip_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Wire a recording controller for `source` from `config`
///
/// Must be called from within a tokio runtime.
pub fn build_recorder(config: &RecorderConfig, source: Arc<dyn CaptureSource>) -> RecordingController {
    let backend = Arc::new(TrackFileBackend::new());
    let exporter: Arc<dyn CompositionExporter> = match config.exporter {
        ExporterKind::TrackFile => Arc::new(TrackFileExporter::new()),
        ExporterKind::Ffmpeg => Arc::new(FfmpegExporter::new(config.ffmpeg_path.clone())),
    };

    let layout = FileLayout::new(
        &config.cache_dir,
        &config.clip_name,
        backend.file_extension(),
        exporter.file_extension(),
    );
    tracing::info!("Recording into {:?}", layout.dir());

    let merger = MergeExporter::new(
        backend.clone(),
        exporter,
        config.merge_options(),
        config.export_options(),
    );
    let coordinator = WriteCoordinator::new(layout, config.output_settings(), backend, merger);
    RecordingController::new(source, coordinator, config.inactive_settle())
}
