//! Composition exporters
//!
//! An exporter renders a [`Composition`] into a single output file. The
//! built-in [`TrackFileExporter`] writes a multi-track track file; the
//! ffmpeg exporter in [`super::ffmpeg`] produces MPEG-4.

use crate::capture::MediaTime;
use crate::export::composition::Composition;
use crate::export::types::{ExportError, ExportOptions};
use crate::writer::track_file::{self, RecordWriter, TrackDeclaration, TrackFile, TrackSummary, Trailer};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Renders a composition to one file
#[async_trait]
pub trait CompositionExporter: Send + Sync {
    /// Extension of the files this exporter produces
    fn file_extension(&self) -> &'static str;

    async fn export(&self, composition: &Composition, output: &Path, options: &ExportOptions) -> Result<(), ExportError>;
}

/// A composed sample, ready to be written
pub(crate) struct ComposedSample {
    pub track: usize,
    pub at: MediaTime,
    pub payload: Vec<u8>,
}

/// Resolve every segment of every non-empty track into re-timed samples
///
/// Output track `n` is the `n`-th non-empty composition track. Samples are
/// grouped per track, in timeline order.
pub(crate) fn compose_samples(composition: &Composition) -> Result<Vec<Vec<ComposedSample>>, ExportError> {
    let mut sources: HashMap<PathBuf, TrackFile> = HashMap::new();
    let mut tracks = Vec::new();

    for track in composition.non_empty_tracks() {
        let mut samples = Vec::new();
        for segment in track.segments() {
            if !sources.contains_key(&segment.source) {
                let file = TrackFile::read(&segment.source)
                    .map_err(|e| ExportError::Source(format!("{:?}: {}", segment.source, e)))?;
                sources.insert(segment.source.clone(), file);
            }
            let Some(file) = sources.get(&segment.source) else {
                continue;
            };

            let zero = file.time_zero();
            for sample in file.samples_for(segment.source_track_id) {
                if let Some(at) = segment.map_to_target(sample.timestamp.saturating_since(zero)) {
                    samples.push(ComposedSample {
                        track: tracks.len(),
                        at,
                        payload: sample.payload.clone(),
                    });
                }
            }
        }
        samples.sort_by_key(|s| s.at);
        tracks.push(samples);
    }

    Ok(tracks)
}

/// Writes the composition as one multi-track track file
#[derive(Debug, Clone, Default)]
pub struct TrackFileExporter;

impl TrackFileExporter {
    pub fn new() -> Self {
        Self
    }

    fn render(composition: &Composition, output: &Path, options: &ExportOptions) -> Result<(), ExportError> {
        let declarations: Vec<TrackDeclaration> = composition
            .non_empty_tracks()
            .enumerate()
            .filter_map(|(track_id, track)| {
                track.segments().first().map(|segment| TrackDeclaration {
                    track_id: track_id as u32,
                    kind: track.kind(),
                    settings: segment.settings,
                })
            })
            .collect();
        if declarations.is_empty() {
            return Err(ExportError::Session("composition has no media".to_string()));
        }

        let tracks = compose_samples(composition)?;
        let mut ordered: Vec<ComposedSample> = tracks.into_iter().flatten().collect();
        if options.optimize_for_network_use {
            // Interleave by time so a reader can play while downloading
            ordered.sort_by_key(|s| s.at);
        }

        let dir = output.parent().unwrap_or_else(|| Path::new("."));
        let staging = tempfile::NamedTempFile::new_in(dir)?;
        let mut records = RecordWriter::begin(BufWriter::new(staging.reopen()?))?;

        for declaration in &declarations {
            records.track(declaration)?;
        }
        records.anchor(MediaTime::ZERO)?;

        let mut summaries: Vec<TrackSummary> = declarations
            .iter()
            .map(|d| TrackSummary {
                track_id: d.track_id,
                ..TrackSummary::default()
            })
            .collect();

        for sample in &ordered {
            records.sample(sample.track as u32, sample.at, &sample.payload)?;
            if let Some(summary) = summaries.get_mut(sample.track) {
                summary.record(sample.at);
            }
        }

        records.trailer(&Trailer {
            file_id: Uuid::new_v4(),
            created_at: Utc::now(),
            session_start_us: Some(0),
            tracks: summaries,
        })?;
        records.flush()?;
        records.into_inner().get_ref().sync_all()?;

        staging.persist(output).map_err(|e| ExportError::Io(e.error))?;

        tracing::info!(
            "Exported {} tracks, {} samples to {:?}",
            declarations.len(),
            ordered.len(),
            output
        );
        Ok(())
    }
}

#[async_trait]
impl CompositionExporter for TrackFileExporter {
    fn file_extension(&self) -> &'static str {
        track_file::EXTENSION
    }

    async fn export(&self, composition: &Composition, output: &Path, options: &ExportOptions) -> Result<(), ExportError> {
        let composition = composition.clone();
        let output = output.to_path_buf();
        let options = options.clone();

        tokio::task::spawn_blocking(move || Self::render(&composition, &output, &options))
            .await
            .map_err(|e| ExportError::Session(format!("export task failed: {e}")))?
    }
}
