//! Merge exporter
//!
//! Loads the two per-channel backing files into one composition, both
//! starting at time zero, and exports it to the merged clip.

use crate::capture::MediaTime;
use crate::export::composition::{AssetLoader, AssetTrack, Composition, TimeRange};
use crate::export::exporter::CompositionExporter;
use crate::export::types::{ExportError, ExportOptions, MergeError, MergeOptions};
use crate::writer::settings::MediaKind;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Builds and exports the merged clip
#[derive(Clone)]
pub struct MergeExporter {
    loader: Arc<dyn AssetLoader>,
    exporter: Arc<dyn CompositionExporter>,
    merge_options: MergeOptions,
    export_options: ExportOptions,
}

impl MergeExporter {
    pub fn new(
        loader: Arc<dyn AssetLoader>,
        exporter: Arc<dyn CompositionExporter>,
        merge_options: MergeOptions,
        export_options: ExportOptions,
    ) -> Self {
        Self {
            loader,
            exporter,
            merge_options,
            export_options,
        }
    }

    /// Extension of the merged output
    pub fn file_extension(&self) -> &'static str {
        self.exporter.file_extension()
    }

    async fn load(&self, kind: MediaKind, path: &Path) -> Vec<AssetTrack> {
        let loader = Arc::clone(&self.loader);
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || loader.load_tracks(&owned, kind)).await {
            Ok(Ok(tracks)) => tracks,
            Ok(Err(e)) => {
                tracing::warn!("Cannot load {} backing file: {}", kind, e);
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("{} load task failed: {}", kind, e);
                Vec::new()
            }
        }
    }

    /// Insert every `kind` track of the backing file at `path` into
    /// `composition`, each over its full duration starting at zero
    pub async fn merge_channel(
        &self,
        composition: &mut Composition,
        kind: MediaKind,
        path: &Path,
    ) -> Result<(), MergeError> {
        let tracks = self.load(kind, path).await;
        if tracks.is_empty() {
            return Err(MergeError::EmptyTracks(kind));
        }

        for track in &tracks {
            composition
                .add_track(kind)
                .insert_time_range(TimeRange::from_zero(track.asset_duration), track, MediaTime::ZERO)
                .map_err(|source| MergeError::Insert { kind, source })?;
        }

        tracing::debug!("Merged {} {} track(s) from {:?}", tracks.len(), kind, path);
        Ok(())
    }

    /// Merge video then audio into one composition
    ///
    /// Video failures short-circuit. A missing audio channel is only fatal
    /// when audio is required.
    pub async fn build_composition(&self, video: &Path, audio: &Path) -> Result<Composition, MergeError> {
        let mut composition = Composition::new();
        self.merge_channel(&mut composition, MediaKind::Video, video).await?;

        match self.merge_channel(&mut composition, MediaKind::Audio, audio).await {
            Ok(()) => {}
            Err(MergeError::EmptyTracks(MediaKind::Audio)) if !self.merge_options.require_audio => {
                tracing::warn!("No audio captured; exporting video only");
            }
            Err(e) => return Err(e),
        }

        Ok(composition)
    }

    /// Merge both backing files and export the result to `output`
    pub async fn merge_and_export(&self, video: &Path, audio: &Path, output: &Path) -> Result<PathBuf, MergeError> {
        let composition = self.build_composition(video, audio).await?;

        match tokio::fs::remove_file(output).await {
            Ok(()) => tracing::debug!("Replaced stale output {:?}", output),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ExportError::Io(e).into()),
        }

        tracing::info!(
            "Exporting {} track(s), {} long, to {:?}",
            composition.track_count(),
            composition.duration(),
            output
        );
        self.exporter
            .export(&composition, output, &self.export_options)
            .await?;

        Ok(output.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ChannelTag, SampleBuffer};
    use crate::export::exporter::TrackFileExporter;
    use crate::writer::backend::{MediaWriter, WriterFactory};
    use crate::writer::mock::MockBackend;
    use crate::writer::settings::OutputSettings;
    use crate::writer::{TrackFile, TrackFileBackend};

    fn merger(require_audio: bool) -> MergeExporter {
        MergeExporter::new(
            Arc::new(TrackFileBackend::new()),
            Arc::new(TrackFileExporter::new()),
            MergeOptions { require_audio },
            ExportOptions::default(),
        )
    }

    /// Write `count` samples on the first port, finalizing unless `finalize` is unset
    async fn write_store(path: &Path, kind: MediaKind, base_us: i64, count: i64, finalize: bool) {
        let channel = match kind {
            MediaKind::Video => ChannelTag::Video,
            MediaKind::Audio => ChannelTag::AudioPrimary,
        };
        let backend = TrackFileBackend::with_flush_threshold(1);
        let mut writer = backend.create_writer(path, kind).unwrap();
        let mut inputs: Vec<_> = OutputSettings::for_surface(640, 480)
            .inputs_for(kind)
            .into_iter()
            .map(|s| writer.add_input(s).unwrap())
            .collect();
        assert!(writer.start_writing());
        writer.start_session(MediaTime::from_micros(base_us));
        for i in 0..count {
            let at = MediaTime::from_micros(base_us + i * 20_000);
            inputs[0].append(&SampleBuffer::new(at, channel, vec![1u8; 16])).unwrap();
        }
        if finalize {
            writer.finish_writing().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_round_trip_counts_tracks_from_zero() {
        let backend = MockBackend::new();
        let merger = MergeExporter::new(
            Arc::new(backend),
            Arc::new(TrackFileExporter::new()),
            MergeOptions::default(),
            ExportOptions::default(),
        );

        let composition = merger
            .build_composition(Path::new("/cache/video.mock"), Path::new("/cache/audio.mock"))
            .await
            .unwrap();

        assert_eq!(composition.track_count(), 2);
        assert!(composition.tracks().iter().all(|t| t.start() == Some(MediaTime::ZERO)));
        assert_eq!(composition.tracks_of(MediaKind::Video).count(), 1);
        assert_eq!(composition.tracks_of(MediaKind::Audio).count(), 1);
    }

    #[tokio::test]
    async fn test_merge_and_export_writes_clip() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("video.trk");
        let audio = dir.path().join("audio.trk");
        let output = dir.path().join("clip.trk");
        write_store(&video, MediaKind::Video, 3_000_000, 50, true).await;
        write_store(&audio, MediaKind::Audio, 3_005_000, 40, true).await;
        std::fs::write(&output, b"stale").unwrap();

        let path = merger(true).merge_and_export(&video, &audio, &output).await.unwrap();
        assert_eq!(path, output);

        let clip = TrackFile::read(&output).unwrap();
        assert!(clip.is_complete());
        assert_eq!(clip.declarations.len(), 2);
        assert_eq!(clip.samples_for(0).count(), 50);
        assert_eq!(clip.samples_for(1).count(), 40);
    }

    #[tokio::test]
    async fn test_missing_video_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("audio.trk");
        write_store(&audio, MediaKind::Audio, 0, 10, true).await;

        let result = merger(false)
            .merge_and_export(&dir.path().join("video.trk"), &audio, &dir.path().join("clip.trk"))
            .await;
        assert!(matches!(result, Err(MergeError::EmptyTracks(MediaKind::Video))));
        assert!(!dir.path().join("clip.trk").exists());
    }

    #[tokio::test]
    async fn test_missing_audio_follows_policy() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("video.trk");
        let audio = dir.path().join("audio.trk");
        write_store(&video, MediaKind::Video, 0, 10, true).await;

        let strict = merger(true).build_composition(&video, &audio).await;
        assert!(matches!(strict, Err(MergeError::EmptyTracks(MediaKind::Audio))));

        let lenient = merger(false).build_composition(&video, &audio).await.unwrap();
        assert_eq!(lenient.track_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_backing_file_fails_insert() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("video.trk");
        write_store(&video, MediaKind::Video, 0, 5, false).await;

        let mut composition = Composition::new();
        let result = merger(false)
            .merge_channel(&mut composition, MediaKind::Video, &video)
            .await;
        assert!(matches!(
            result,
            Err(MergeError::Insert {
                kind: MediaKind::Video,
                ..
            })
        ));
    }
}
