//! Composition timeline
//!
//! A composition is an editable, in-memory timeline: a list of tracks, each
//! made of segments that reference a time range of a source track in some
//! backing file. Nothing is read or written until an exporter renders it.

use crate::capture::MediaTime;
use crate::writer::settings::{InputSettings, MediaKind};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors building a composition
#[derive(Error, Debug)]
pub enum CompositionError {
    #[error("Cannot load {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Source {0:?} was not finalized")]
    IncompleteSource(PathBuf),

    #[error("Range {start}+{duration} exceeds source duration {available}")]
    OutOfRange {
        start: MediaTime,
        duration: MediaTime,
        available: MediaTime,
    },

    #[error("Cannot insert {source_kind} media into a {track_kind} track")]
    KindMismatch {
        source_kind: MediaKind,
        track_kind: MediaKind,
    },

    #[error("Segment at {0} overlaps an existing segment")]
    Overlap(MediaTime),
}

/// Half-open time range `[start, start + duration)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: MediaTime,
    pub duration: MediaTime,
}

impl TimeRange {
    pub fn new(start: MediaTime, duration: MediaTime) -> Self {
        Self { start, duration }
    }

    /// `[0, duration)`
    pub fn from_zero(duration: MediaTime) -> Self {
        Self::new(MediaTime::ZERO, duration)
    }

    pub fn end(&self) -> MediaTime {
        self.start.saturating_add(self.duration)
    }

    pub fn contains(&self, at: MediaTime) -> bool {
        at >= self.start && at < self.end()
    }
}

/// A track found in a backing file
///
/// Times are relative to the file's time zero (its session anchor).
#[derive(Debug, Clone, PartialEq)]
pub struct AssetTrack {
    pub source: PathBuf,
    pub track_id: u32,
    pub kind: MediaKind,
    pub settings: InputSettings,
    /// End of this track's last sample
    pub duration: MediaTime,
    /// Duration of the whole file (its longest track)
    pub asset_duration: MediaTime,
    /// Whether the file was finalized
    pub complete: bool,
}

/// Reads the tracks of a backing file
pub trait AssetLoader: Send + Sync {
    /// Tracks of `kind` that hold media
    fn load_tracks(&self, path: &Path, kind: MediaKind) -> Result<Vec<AssetTrack>, CompositionError>;
}

/// One inserted range of a source track
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub source: PathBuf,
    pub source_track_id: u32,
    pub settings: InputSettings,
    pub source_range: TimeRange,
    pub target_start: MediaTime,
}

impl Segment {
    /// Where this segment sits on the composition timeline
    pub fn target_range(&self) -> TimeRange {
        TimeRange::new(self.target_start, self.source_range.duration)
    }

    /// Map a source time into composition time, if it falls in this segment
    pub fn map_to_target(&self, source_time: MediaTime) -> Option<MediaTime> {
        if !self.source_range.contains(source_time) {
            return None;
        }
        Some(self.target_start.saturating_add(source_time.saturating_since(self.source_range.start)))
    }
}

/// A composition track: segments of one media kind
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionTrack {
    id: usize,
    kind: MediaKind,
    segments: Vec<Segment>,
}

impl CompositionTrack {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Earliest point covered on the timeline
    pub fn start(&self) -> Option<MediaTime> {
        self.segments.iter().map(|s| s.target_start).min()
    }

    pub fn end(&self) -> MediaTime {
        self.segments
            .iter()
            .map(|s| s.target_range().end())
            .max()
            .unwrap_or(MediaTime::ZERO)
    }

    /// Insert `range` of `source` so that it begins at `at`
    pub fn insert_time_range(
        &mut self,
        range: TimeRange,
        source: &AssetTrack,
        at: MediaTime,
    ) -> Result<(), CompositionError> {
        if source.kind != self.kind {
            return Err(CompositionError::KindMismatch {
                source_kind: source.kind,
                track_kind: self.kind,
            });
        }
        if !source.complete {
            return Err(CompositionError::IncompleteSource(source.source.clone()));
        }
        if range.start < MediaTime::ZERO || range.end() > source.asset_duration {
            return Err(CompositionError::OutOfRange {
                start: range.start,
                duration: range.duration,
                available: source.asset_duration,
            });
        }

        let segment = Segment {
            source: source.source.clone(),
            source_track_id: source.track_id,
            settings: source.settings,
            source_range: range,
            target_start: at,
        };
        let target = segment.target_range();
        let overlaps = self
            .segments
            .iter()
            .any(|s| target.start < s.target_range().end() && s.target_start < target.end());
        if overlaps {
            return Err(CompositionError::Overlap(at));
        }

        self.segments.push(segment);
        self.segments.sort_by_key(|s| s.target_start);
        Ok(())
    }
}

/// Multi-track timeline assembled from the backing files
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
    tracks: Vec<CompositionTrack>,
}

impl Composition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an empty track of `kind`
    pub fn add_track(&mut self, kind: MediaKind) -> &mut CompositionTrack {
        let id = self.tracks.len();
        self.tracks.push(CompositionTrack {
            id,
            kind,
            segments: Vec::new(),
        });
        &mut self.tracks[id]
    }

    pub fn tracks(&self) -> &[CompositionTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &CompositionTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Tracks that carry at least one segment
    pub fn non_empty_tracks(&self) -> impl Iterator<Item = &CompositionTrack> {
        self.tracks.iter().filter(|t| !t.segments.is_empty())
    }

    pub fn duration(&self) -> MediaTime {
        self.tracks.iter().map(|t| t.end()).max().unwrap_or(MediaTime::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::settings::VideoSettings;

    fn video_track(duration_us: i64, complete: bool) -> AssetTrack {
        AssetTrack {
            source: PathBuf::from("/cache/video.trk"),
            track_id: 0,
            kind: MediaKind::Video,
            settings: InputSettings::Video(VideoSettings::for_surface(640, 480)),
            duration: MediaTime::from_micros(duration_us),
            asset_duration: MediaTime::from_micros(duration_us),
            complete,
        }
    }

    #[test]
    fn test_insert_full_track_at_zero() {
        let source = video_track(2_000_000, true);
        let mut composition = Composition::new();
        composition
            .add_track(MediaKind::Video)
            .insert_time_range(TimeRange::from_zero(source.asset_duration), &source, MediaTime::ZERO)
            .unwrap();

        assert_eq!(composition.track_count(), 1);
        assert_eq!(composition.tracks()[0].start(), Some(MediaTime::ZERO));
        assert_eq!(composition.duration(), MediaTime::from_micros(2_000_000));
    }

    #[test]
    fn test_rejects_incomplete_source() {
        let source = video_track(1_000, false);
        let mut composition = Composition::new();
        let err = composition
            .add_track(MediaKind::Video)
            .insert_time_range(TimeRange::from_zero(source.asset_duration), &source, MediaTime::ZERO)
            .unwrap_err();
        assert!(matches!(err, CompositionError::IncompleteSource(_)));
    }

    #[test]
    fn test_rejects_range_past_source_end() {
        let source = video_track(1_000, true);
        let mut composition = Composition::new();
        let err = composition
            .add_track(MediaKind::Video)
            .insert_time_range(TimeRange::from_zero(MediaTime::from_micros(5_000)), &source, MediaTime::ZERO)
            .unwrap_err();
        assert!(matches!(err, CompositionError::OutOfRange { .. }));
    }

    #[test]
    fn test_rejects_kind_mismatch_and_overlap() {
        let source = video_track(1_000, true);
        let mut composition = Composition::new();
        let err = composition
            .add_track(MediaKind::Audio)
            .insert_time_range(TimeRange::from_zero(source.asset_duration), &source, MediaTime::ZERO)
            .unwrap_err();
        assert!(matches!(err, CompositionError::KindMismatch { .. }));

        let track = composition.add_track(MediaKind::Video);
        track
            .insert_time_range(TimeRange::from_zero(source.asset_duration), &source, MediaTime::ZERO)
            .unwrap();
        let err = track
            .insert_time_range(TimeRange::from_zero(source.asset_duration), &source, MediaTime::from_micros(500))
            .unwrap_err();
        assert!(matches!(err, CompositionError::Overlap(_)));
    }

    #[test]
    fn test_segment_maps_source_time() {
        let segment = Segment {
            source: PathBuf::from("/cache/audio.trk"),
            source_track_id: 1,
            settings: InputSettings::Audio(Default::default()),
            source_range: TimeRange::new(MediaTime::from_micros(1_000), MediaTime::from_micros(2_000)),
            target_start: MediaTime::from_micros(10_000),
        };
        assert_eq!(segment.map_to_target(MediaTime::from_micros(1_500)), Some(MediaTime::from_micros(10_500)));
        assert_eq!(segment.map_to_target(MediaTime::from_micros(3_000)), None);
    }
}
