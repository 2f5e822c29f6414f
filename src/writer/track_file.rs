//! Track-file backing store
//!
//! The built-in backend behind the writer seam. A track file is a flat,
//! append-only sequence of framed records so that a writer can persist
//! samples as they arrive and a crash leaves a readable (if incomplete)
//! prefix behind:
//!
//! ```text
//! magic "CLTRK1\0\0"
//! record := tag:u8 len:u32le body[len]
//!   'T' track declaration  (JSON)
//!   'A' session anchor     (timestamp i64le, microseconds)
//!   'S' sample             (track id u32le, timestamp i64le, payload)
//!   'F' trailer            (JSON summary, last record of a finalized file)
//! ```
//!
//! A file without trailer is incomplete: it can be inspected, but it is never
//! inserted into a composition.

use crate::capture::{MediaTime, SampleBuffer};
use crate::export::composition::{AssetLoader, AssetTrack, CompositionError};
use crate::writer::backend::{FinalizeFuture, MediaWriter, WriterError, WriterFactory, WriterInput, WriterStatus};
use crate::writer::settings::{InputSettings, MediaKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// File signature
pub const MAGIC: &[u8; 8] = b"CLTRK1\0\0";

/// File extension used for track files
pub const EXTENSION: &str = "trk";

const TAG_TRACK: u8 = b'T';
const TAG_ANCHOR: u8 = b'A';
const TAG_SAMPLE: u8 = b'S';
const TAG_TRAILER: u8 = b'F';

/// Buffered bytes that trigger a flush to disk
const DEFAULT_FLUSH_THRESHOLD: usize = 1 << 20;

/// Declares one track of a track file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDeclaration {
    pub track_id: u32,
    pub kind: MediaKind,
    pub settings: InputSettings,
}

/// Per-track statistics stored in the trailer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub track_id: u32,
    pub samples: u64,
    pub first_us: Option<i64>,
    pub last_us: Option<i64>,
}

impl TrackSummary {
    pub(crate) fn record(&mut self, timestamp: MediaTime) {
        let at = timestamp.as_micros();
        self.samples += 1;
        self.first_us = Some(self.first_us.map_or(at, |first| first.min(at)));
        self.last_us = Some(self.last_us.map_or(at, |last| last.max(at)));
    }
}

/// Summary written when a file is finalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trailer {
    pub file_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub session_start_us: Option<i64>,
    pub tracks: Vec<TrackSummary>,
}

/// A sample read back from a track file
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    pub track_id: u32,
    pub timestamp: MediaTime,
    pub payload: Vec<u8>,
}

/// Record encoder shared by the writer and the merged-output exporter
pub struct RecordWriter<W: Write> {
    out: W,
}

impl<W: Write> RecordWriter<W> {
    /// Write the file signature and wrap `out`
    pub fn begin(mut out: W) -> io::Result<Self> {
        out.write_all(MAGIC)?;
        Ok(Self { out })
    }

    fn record(&mut self, tag: u8, body: &[u8]) -> io::Result<usize> {
        let len = u32::try_from(body.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too large"))?;
        self.out.write_all(&[tag])?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(body)?;
        Ok(5 + body.len())
    }

    pub fn track(&mut self, declaration: &TrackDeclaration) -> io::Result<usize> {
        let body = serde_json::to_vec(declaration)?;
        self.record(TAG_TRACK, &body)
    }

    pub fn anchor(&mut self, at: MediaTime) -> io::Result<usize> {
        self.record(TAG_ANCHOR, &at.as_micros().to_le_bytes())
    }

    pub fn sample(&mut self, track_id: u32, timestamp: MediaTime, payload: &[u8]) -> io::Result<usize> {
        let mut body = Vec::with_capacity(12 + payload.len());
        body.extend_from_slice(&track_id.to_le_bytes());
        body.extend_from_slice(&timestamp.as_micros().to_le_bytes());
        body.extend_from_slice(payload);
        self.record(TAG_SAMPLE, &body)
    }

    pub fn trailer(&mut self, trailer: &Trailer) -> io::Result<usize> {
        let body = serde_json::to_vec(trailer)?;
        self.record(TAG_TRAILER, &body)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Parsed contents of a track file
#[derive(Debug, Clone, Default)]
pub struct TrackFile {
    pub declarations: Vec<TrackDeclaration>,
    pub session_start: Option<MediaTime>,
    pub samples: Vec<StoredSample>,
    pub trailer: Option<Trailer>,
}

impl TrackFile {
    /// Read a track file, tolerating a truncated tail
    pub fn read(path: &Path) -> io::Result<Self> {
        let handle = File::open(path)?;
        let size = handle.metadata()?.len();
        let mut reader = BufReader::new(handle);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not a track file"));
        }
        let mut position = magic.len() as u64;

        let mut file = TrackFile::default();
        loop {
            let mut header = [0u8; 5];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            position += header.len() as u64;
            let len = u64::from(u32::from_le_bytes([header[1], header[2], header[3], header[4]]));
            // never allocate past the end of the file
            if len > size.saturating_sub(position) {
                tracing::warn!("Truncated record at end of {:?}", path);
                break;
            }
            position += len;
            let mut body = vec![0u8; len as usize];
            match reader.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!("Truncated record at end of {:?}", path);
                    break;
                }
                Err(e) => return Err(e),
            }

            match header[0] {
                TAG_TRACK => file.declarations.push(serde_json::from_slice(&body)?),
                TAG_ANCHOR => file.session_start = Some(MediaTime::from_micros(read_i64(&body, 0)?)),
                TAG_SAMPLE => {
                    if body.len() < 12 {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, "short sample record"));
                    }
                    file.samples.push(StoredSample {
                        track_id: u32::from_le_bytes([body[0], body[1], body[2], body[3]]),
                        timestamp: MediaTime::from_micros(read_i64(&body, 4)?),
                        payload: body[12..].to_vec(),
                    });
                }
                TAG_TRAILER => {
                    file.trailer = Some(serde_json::from_slice(&body)?);
                    break;
                }
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unknown record tag {other:#x}"),
                    ));
                }
            }
        }

        Ok(file)
    }

    /// Whether the file was finalized
    pub fn is_complete(&self) -> bool {
        self.trailer.is_some()
    }

    /// Samples of one track, in file order
    pub fn samples_for(&self, track_id: u32) -> impl Iterator<Item = &StoredSample> {
        self.samples.iter().filter(move |s| s.track_id == track_id)
    }

    /// Time zero of the file: the session anchor, or the earliest sample
    pub fn time_zero(&self) -> MediaTime {
        self.session_start
            .or_else(|| self.samples.iter().map(|s| s.timestamp).min())
            .unwrap_or(MediaTime::ZERO)
    }

    /// End of the last sample of a track, relative to time zero
    fn track_end(&self, declaration: &TrackDeclaration) -> Option<MediaTime> {
        let zero = self.time_zero();
        self.samples_for(declaration.track_id)
            .map(|s| s.timestamp)
            .max()
            .map(|last| {
                last.saturating_since(zero)
                    .saturating_add(MediaTime::from_micros(declaration.settings.nominal_sample_micros()))
            })
    }

    /// Duration of the whole file: the longest track
    pub fn duration(&self) -> MediaTime {
        self.declarations
            .iter()
            .filter_map(|d| self.track_end(d))
            .max()
            .unwrap_or(MediaTime::ZERO)
    }
}

fn read_i64(body: &[u8], offset: usize) -> io::Result<i64> {
    body.get(offset..offset + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(i64::from_le_bytes)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short record"))
}

/// State shared between a writer and its inputs
struct Shared {
    path: PathBuf,
    status: WriterStatus,
    records: Option<RecordWriter<BufWriter<File>>>,
    declarations: Vec<TrackDeclaration>,
    summaries: Vec<TrackSummary>,
    session_start: Option<MediaTime>,
    unflushed: usize,
    flush_threshold: usize,
}

impl Shared {
    fn write_sample(&mut self, track_id: u32, buffer: &SampleBuffer) -> Result<(), WriterError> {
        if self.status != WriterStatus::Writing {
            return Err(WriterError::Closed);
        }
        let records = self.records.as_mut().ok_or(WriterError::Closed)?;
        self.unflushed += records.sample(track_id, buffer.timestamp(), buffer.payload())?;
        if self.unflushed >= self.flush_threshold {
            records.flush()?;
            self.unflushed = 0;
        }
        if let Some(summary) = self.summaries.get_mut(track_id as usize) {
            summary.record(buffer.timestamp());
        }
        Ok(())
    }

    fn discard_output(&mut self) {
        self.records = None;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove cancelled output {:?}: {}", self.path, e),
        }
    }
}

/// Underlying writer persisting to a track file
pub struct TrackFileWriter {
    kind: MediaKind,
    file_id: Uuid,
    created_at: DateTime<Utc>,
    shared: Arc<Mutex<Shared>>,
}

impl TrackFileWriter {
    /// Create a writer for `path`; the file must not exist yet
    pub fn create(path: &Path, kind: MediaKind, flush_threshold: usize) -> Result<Self, WriterError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| WriterError::Create {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let records = RecordWriter::begin(BufWriter::new(file))?;

        Ok(Self {
            kind,
            file_id: Uuid::new_v4(),
            created_at: Utc::now(),
            shared: Arc::new(Mutex::new(Shared {
                path: path.to_path_buf(),
                status: WriterStatus::Unknown,
                records: Some(records),
                declarations: Vec::new(),
                summaries: Vec::new(),
                session_start: None,
                unflushed: 0,
                flush_threshold,
            })),
        })
    }
}

impl MediaWriter for TrackFileWriter {
    fn status(&self) -> WriterStatus {
        self.shared.lock().status
    }

    fn can_add_input(&self, settings: &InputSettings) -> bool {
        let shared = self.shared.lock();
        shared.status == WriterStatus::Unknown && settings.media_kind() == self.kind
    }

    fn add_input(&mut self, settings: InputSettings) -> Result<Box<dyn WriterInput>, WriterError> {
        if !self.can_add_input(&settings) {
            return Err(WriterError::Backend(format!(
                "cannot add {} input to {} writer",
                settings.media_kind(),
                self.kind
            )));
        }

        let mut shared = self.shared.lock();
        let track_id = shared.declarations.len() as u32;
        shared.declarations.push(TrackDeclaration {
            track_id,
            kind: self.kind,
            settings,
        });
        shared.summaries.push(TrackSummary {
            track_id,
            ..TrackSummary::default()
        });

        Ok(Box::new(TrackFileInput {
            track_id,
            finished: false,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn start_writing(&mut self) -> bool {
        let mut shared = self.shared.lock();
        if shared.status != WriterStatus::Unknown {
            return false;
        }

        let declarations = shared.declarations.clone();
        let written = match shared.records.as_mut() {
            Some(records) => declarations
                .iter()
                .try_for_each(|d| records.track(d).map(|_| ()))
                .and_then(|()| records.flush()),
            None => Err(io::Error::new(io::ErrorKind::Other, "writer has no output")),
        };

        match written {
            Ok(()) => {
                shared.status = WriterStatus::Writing;
                true
            }
            Err(e) => {
                tracing::warn!("Failed to start {} track file {:?}: {}", self.kind, shared.path, e);
                shared.status = WriterStatus::Failed;
                false
            }
        }
    }

    fn start_session(&mut self, at: MediaTime) {
        let mut shared = self.shared.lock();
        if shared.status != WriterStatus::Writing || shared.session_start.is_some() {
            return;
        }
        shared.session_start = Some(at);
        let result = match shared.records.as_mut() {
            Some(records) => records.anchor(at),
            None => return,
        };
        match result {
            Ok(written) => shared.unflushed += written,
            Err(e) => tracing::warn!("Failed to write session anchor to {:?}: {}", shared.path, e),
        }
    }

    fn finish_writing(&mut self) -> FinalizeFuture {
        let (records, trailer, path) = {
            let mut shared = self.shared.lock();
            if shared.status != WriterStatus::Writing {
                return Box::pin(async { Err(WriterError::Closed) });
            }
            let trailer = Trailer {
                file_id: self.file_id,
                created_at: self.created_at,
                session_start_us: shared.session_start.map(|t| t.as_micros()),
                tracks: shared.summaries.clone(),
            };
            (shared.records.take(), trailer, shared.path.clone())
        };

        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let mut records = records.ok_or(WriterError::Closed)?;
            let written = tokio::task::spawn_blocking(move || -> io::Result<()> {
                records.trailer(&trailer)?;
                records.flush()?;
                records.into_inner().get_ref().sync_all()
            })
            .await
            .map_err(|e| WriterError::Backend(format!("finalize task failed: {e}")))?;

            let mut shared = shared.lock();
            match written {
                // Cancelled while the trailer was being written
                _ if shared.status == WriterStatus::Cancelled => {
                    shared.discard_output();
                    Err(WriterError::Closed)
                }
                Ok(()) => {
                    shared.status = WriterStatus::Completed;
                    tracing::debug!("Finalized track file {:?}", path);
                    Ok(())
                }
                Err(e) => {
                    shared.status = WriterStatus::Failed;
                    Err(WriterError::Io(e))
                }
            }
        })
    }

    fn cancel_writing(&mut self) {
        let mut shared = self.shared.lock();
        if matches!(shared.status, WriterStatus::Completed | WriterStatus::Cancelled) {
            return;
        }
        shared.status = WriterStatus::Cancelled;
        shared.discard_output();
    }
}

/// Input port of a [`TrackFileWriter`]
pub struct TrackFileInput {
    track_id: u32,
    finished: bool,
    shared: Arc<Mutex<Shared>>,
}

impl WriterInput for TrackFileInput {
    fn is_ready_for_more_media_data(&self) -> bool {
        !self.finished && self.shared.lock().status == WriterStatus::Writing
    }

    fn append(&mut self, buffer: &SampleBuffer) -> Result<(), WriterError> {
        if self.finished {
            return Err(WriterError::Closed);
        }
        self.shared.lock().write_sample(self.track_id, buffer)
    }

    fn mark_as_finished(&mut self) {
        self.finished = true;
    }
}

/// Track-file implementation of both the writer and the asset seams
#[derive(Debug, Clone)]
pub struct TrackFileBackend {
    flush_threshold: usize,
}

impl TrackFileBackend {
    pub fn new() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }

    pub fn with_flush_threshold(flush_threshold: usize) -> Self {
        Self { flush_threshold }
    }
}

impl Default for TrackFileBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterFactory for TrackFileBackend {
    fn file_extension(&self) -> &'static str {
        EXTENSION
    }

    fn create_writer(&self, path: &Path, kind: MediaKind) -> Result<Box<dyn MediaWriter>, WriterError> {
        Ok(Box::new(TrackFileWriter::create(path, kind, self.flush_threshold)?))
    }
}

impl AssetLoader for TrackFileBackend {
    fn load_tracks(&self, path: &Path, kind: MediaKind) -> Result<Vec<AssetTrack>, CompositionError> {
        let file = TrackFile::read(path).map_err(|e| CompositionError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let asset_duration = file.duration();
        let complete = file.is_complete();

        Ok(file
            .declarations
            .iter()
            .filter(|d| d.kind == kind)
            .filter_map(|d| {
                file.track_end(d).map(|end| AssetTrack {
                    source: path.to_path_buf(),
                    track_id: d.track_id,
                    kind: d.kind,
                    settings: d.settings,
                    duration: end,
                    asset_duration,
                    complete,
                })
            })
            .collect())
    }
}
