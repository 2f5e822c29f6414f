//! FFmpeg exporter
//!
//! Muxes a composition into an MPEG-4 container with the ffmpeg CLI.
//! Backing-store payloads are expected to be encoded elementary streams
//! (H.264 Annex B for video, ADTS AAC for audio); each composition track is
//! staged as one elementary stream file and stream-copied into the output.

use crate::export::composition::Composition;
use crate::export::exporter::{compose_samples, CompositionExporter};
use crate::export::types::{ExportError, ExportOptions};
use crate::writer::settings::MediaKind;
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Default frame rate when a track is too short to measure one
const FALLBACK_FPS: f64 = 30.0;

/// One elementary stream staged for muxing
#[derive(Debug, Clone, PartialEq)]
pub struct StagedTrack {
    pub path: PathBuf,
    pub kind: MediaKind,
    /// Measured frame rate, video only
    pub frame_rate: Option<f64>,
}

/// Exports MPEG-4 through an ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegExporter {
    binary: String,
}

impl FfmpegExporter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Write each composition track to its own elementary stream file
    fn stage(composition: &Composition, dir: &Path) -> Result<Vec<StagedTrack>, ExportError> {
        let kinds: Vec<MediaKind> = composition.non_empty_tracks().map(|t| t.kind()).collect();
        let tracks = compose_samples(composition)?;

        let mut staged = Vec::with_capacity(tracks.len());
        for (index, (samples, kind)) in tracks.iter().zip(kinds).enumerate() {
            let extension = match kind {
                MediaKind::Video => "h264",
                MediaKind::Audio => "aac",
            };
            let path = dir.join(format!("track-{index}.{extension}"));
            let mut out = BufWriter::new(File::create(&path)?);
            for sample in samples {
                out.write_all(&sample.payload)?;
            }
            out.flush()?;

            let frame_rate = match kind {
                MediaKind::Video => Some(measure_frame_rate(samples.iter().map(|s| s.at.as_micros()))),
                MediaKind::Audio => None,
            };
            staged.push(StagedTrack { path, kind, frame_rate });
        }

        Ok(staged)
    }
}

/// Average frame rate of a run of timestamps, in frames per second
fn measure_frame_rate(timestamps: impl Iterator<Item = i64>) -> f64 {
    let (count, first, last) = timestamps.fold((0u64, None, None), |(count, first, last), at| {
        (count + 1, first.or(Some(at)), Some(at))
    });
    match (first, last) {
        (Some(first), Some(last)) if count > 1 && last > first => {
            (count - 1) as f64 * 1_000_000.0 / (last - first) as f64
        }
        _ => FALLBACK_FPS,
    }
}

/// Build the ffmpeg argument list muxing `inputs` into `output`
pub fn build_mux_args(inputs: &[StagedTrack], output: &Path, options: &ExportOptions) -> Vec<String> {
    let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    for input in inputs {
        match input.kind {
            MediaKind::Video => {
                args.extend([
                    "-f".to_string(),
                    "h264".to_string(),
                    "-framerate".to_string(),
                    format!("{:.3}", input.frame_rate.unwrap_or(FALLBACK_FPS)),
                ]);
            }
            MediaKind::Audio => {
                args.extend(["-f".to_string(), "aac".to_string()]);
            }
        }
        args.extend(["-i".to_string(), input.path.to_string_lossy().to_string()]);
    }

    for index in 0..inputs.len() {
        args.extend(["-map".to_string(), format!("{index}:0")]);
    }

    args.extend(["-c".to_string(), "copy".to_string()]);

    if options.optimize_for_network_use {
        // Move the moov atom in front of the media data
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
    }

    args.extend([
        "-f".to_string(),
        "mp4".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

#[async_trait]
impl CompositionExporter for FfmpegExporter {
    fn file_extension(&self) -> &'static str {
        "mp4"
    }

    async fn export(&self, composition: &Composition, output: &Path, options: &ExportOptions) -> Result<(), ExportError> {
        if composition.non_empty_tracks().next().is_none() {
            return Err(ExportError::Session("composition has no media".to_string()));
        }

        let staging = tempfile::tempdir()?;
        let staged = {
            let composition = composition.clone();
            let dir = staging.path().to_path_buf();
            tokio::task::spawn_blocking(move || Self::stage(&composition, &dir))
                .await
                .map_err(|e| ExportError::Session(format!("staging task failed: {e}")))??
        };

        let args = build_mux_args(&staged, output, options);
        tracing::info!("Starting FFmpeg mux: {} {:?}", self.binary, args);

        let result = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| ExportError::Ffmpeg(format!("Failed to start FFmpeg: {}", e)))?;

        if !result.status.success() {
            return Err(ExportError::Ffmpeg(format!(
                "FFmpeg exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }

        tracing::info!("FFmpeg mux complete: {:?}", output);
        Ok(())
    }
}
