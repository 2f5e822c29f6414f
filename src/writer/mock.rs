//! Scriptable writer backend for unit tests

use crate::capture::{MediaTime, SampleBuffer};
use crate::export::composition::{AssetLoader, AssetTrack, CompositionError};
use crate::writer::backend::{FinalizeFuture, MediaWriter, WriterError, WriterFactory, WriterInput, WriterStatus};
use crate::writer::settings::{InputSettings, MediaKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    pub kind: MediaKind,
    pub port: usize,
    pub timestamp: MediaTime,
}

/// Knobs and observations shared by every mock writer of one backend
pub struct MockControl {
    pub ready: AtomicBool,
    pub start_succeeds: AtomicBool,
    pub fail_create: AtomicBool,
    pub gate_finalize: AtomicBool,
    pub starts: AtomicUsize,
    pub cancels: AtomicUsize,
    pub appended: Mutex<Vec<Appended>>,
    pub sessions: Mutex<Vec<(MediaKind, MediaTime)>>,
    pub finalized: Mutex<Vec<MediaKind>>,
    pub created: Mutex<Vec<PathBuf>>,
    gates: HashMap<MediaKind, Arc<Notify>>,
}

impl MockControl {
    fn new() -> Self {
        let gates = [MediaKind::Video, MediaKind::Audio]
            .into_iter()
            .map(|kind| (kind, Arc::new(Notify::new())))
            .collect();
        Self {
            ready: AtomicBool::new(true),
            start_succeeds: AtomicBool::new(true),
            fail_create: AtomicBool::new(false),
            gate_finalize: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            appended: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            finalized: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            gates,
        }
    }

    /// Let a gated finalize of `kind` complete
    pub fn release(&self, kind: MediaKind) {
        if let Some(gate) = self.gates.get(&kind) {
            gate.notify_one();
        }
    }

    pub fn appended_count(&self, kind: MediaKind) -> usize {
        self.appended.lock().iter().filter(|a| a.kind == kind).count()
    }
}

#[derive(Clone)]
pub struct MockBackend {
    pub control: Arc<MockControl>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            control: Arc::new(MockControl::new()),
        }
    }
}

impl WriterFactory for MockBackend {
    fn file_extension(&self) -> &'static str {
        "mock"
    }

    fn create_writer(&self, path: &Path, kind: MediaKind) -> Result<Box<dyn MediaWriter>, WriterError> {
        if self.control.fail_create.load(Ordering::SeqCst) {
            return Err(WriterError::Create {
                path: path.to_path_buf(),
                reason: "scripted failure".to_string(),
            });
        }
        self.control.created.lock().push(path.to_path_buf());
        Ok(Box::new(MockWriter {
            kind,
            ports: 0,
            status: Arc::new(Mutex::new(WriterStatus::Unknown)),
            control: Arc::clone(&self.control),
        }))
    }
}

/// Reports one complete track per media kind, without touching the disk
impl AssetLoader for MockBackend {
    fn load_tracks(&self, path: &Path, kind: MediaKind) -> Result<Vec<AssetTrack>, CompositionError> {
        let duration = MediaTime::from_micros(1_000_000);
        Ok(vec![AssetTrack {
            source: path.to_path_buf(),
            track_id: 0,
            kind,
            settings: match kind {
                MediaKind::Video => InputSettings::Video(crate::writer::VideoSettings::for_surface(640, 480)),
                MediaKind::Audio => InputSettings::Audio(Default::default()),
            },
            duration,
            asset_duration: duration,
            complete: true,
        }])
    }
}

struct MockWriter {
    kind: MediaKind,
    ports: usize,
    status: Arc<Mutex<WriterStatus>>,
    control: Arc<MockControl>,
}

impl MediaWriter for MockWriter {
    fn status(&self) -> WriterStatus {
        *self.status.lock()
    }

    fn can_add_input(&self, settings: &InputSettings) -> bool {
        settings.media_kind() == self.kind
    }

    fn add_input(&mut self, _settings: InputSettings) -> Result<Box<dyn WriterInput>, WriterError> {
        let port = self.ports;
        self.ports += 1;
        Ok(Box::new(MockInput {
            kind: self.kind,
            port,
            finished: false,
            status: Arc::clone(&self.status),
            control: Arc::clone(&self.control),
        }))
    }

    fn start_writing(&mut self) -> bool {
        self.control.starts.fetch_add(1, Ordering::SeqCst);
        let mut status = self.status.lock();
        if self.control.start_succeeds.load(Ordering::SeqCst) {
            *status = WriterStatus::Writing;
            true
        } else {
            *status = WriterStatus::Failed;
            false
        }
    }

    fn start_session(&mut self, at: MediaTime) {
        self.control.sessions.lock().push((self.kind, at));
    }

    fn finish_writing(&mut self) -> FinalizeFuture {
        let kind = self.kind;
        let status = Arc::clone(&self.status);
        let control = Arc::clone(&self.control);
        let gate = control
            .gate_finalize
            .load(Ordering::SeqCst)
            .then(|| control.gates.get(&kind).cloned())
            .flatten();

        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            control.finalized.lock().push(kind);
            *status.lock() = WriterStatus::Completed;
            Ok(())
        })
    }

    fn cancel_writing(&mut self) {
        self.control.cancels.fetch_add(1, Ordering::SeqCst);
        *self.status.lock() = WriterStatus::Cancelled;
    }
}

struct MockInput {
    kind: MediaKind,
    port: usize,
    finished: bool,
    status: Arc<Mutex<WriterStatus>>,
    control: Arc<MockControl>,
}

impl WriterInput for MockInput {
    fn is_ready_for_more_media_data(&self) -> bool {
        !self.finished && self.control.ready.load(Ordering::SeqCst) && *self.status.lock() == WriterStatus::Writing
    }

    fn append(&mut self, buffer: &SampleBuffer) -> Result<(), WriterError> {
        self.control.appended.lock().push(Appended {
            kind: self.kind,
            port: self.port,
            timestamp: buffer.timestamp(),
        });
        Ok(())
    }

    fn mark_as_finished(&mut self) {
        self.finished = true;
    }
}
