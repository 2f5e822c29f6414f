//! Write coordinator
//!
//! Owns the video and audio channel writers of one recorder and applies
//! every append and finish request on a single worker task, in submission
//! order. Cancellation bypasses that queue and takes effect immediately.
//!
//! Finishing is a two-of-two barrier: each writer finalizes on its own and
//! whichever completion arrives second runs the merge, exactly once.

use super::barrier::CompletionBarrier;
use super::state::{RecordingError, RecordingResult};
use crate::capture::{ChannelTag, SampleBuffer};
use crate::config::FileLayout;
use crate::export::MergeExporter;
use crate::writer::{ChannelWriter, FinishOutcome, MediaKind, OutputSettings, WriterFactory, WriterState};
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Receives the merged clip location, or the failure that prevented it
pub type ResultHandler = Box<dyn FnOnce(RecordingResult<PathBuf>) + Send>;

/// Receives the failure of one write
pub type ErrorHandler = Box<dyn FnOnce(RecordingError) + Send>;

/// Writes queued ahead of the worker before new ones are dropped
const QUEUE_DEPTH: usize = 1024;

enum Command {
    Write { buffer: SampleBuffer, on_error: ErrorHandler },
    Finish { on_result: Option<ResultHandler> },
}

/// Writers of one recording attempt
struct WriterPair {
    attempt: Uuid,
    video: Arc<ChannelWriter>,
    audio: Arc<ChannelWriter>,
    finish_requested: AtomicBool,
    /// Set by the first cancel; a cancelled attempt is never merged
    cancelled: AtomicBool,
}

impl WriterPair {
    fn route(&self, channel: ChannelTag) -> &ChannelWriter {
        match channel.media_kind() {
            MediaKind::Video => self.video.as_ref(),
            MediaKind::Audio => self.audio.as_ref(),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.video.cancel();
        self.audio.cancel();
    }
}

struct Shared {
    layout: FileLayout,
    settings: OutputSettings,
    factory: Arc<dyn WriterFactory>,
    merger: MergeExporter,
    writers: Mutex<Option<Arc<WriterPair>>>,
}

impl Shared {
    fn current(&self) -> Option<Arc<WriterPair>> {
        self.writers.lock().clone()
    }

    fn apply_write(&self, buffer: SampleBuffer, on_error: ErrorHandler) {
        let Some(pair) = self.current() else {
            on_error(RecordingError::Setup("no writers for this buffer".to_string()));
            return;
        };
        pair.route(buffer.channel()).append(buffer.channel(), &buffer);
    }

    fn apply_finish(&self, on_result: Option<ResultHandler>) {
        let Some(pair) = self.current() else {
            if let Some(on_result) = on_result {
                on_result(Err(RecordingError::Setup("no writers to finish".to_string())));
            }
            return;
        };
        if pair.finish_requested.swap(true, Ordering::SeqCst) {
            tracing::error!("[{}] finish requested twice", pair.attempt);
            if let Some(on_result) = on_result {
                on_result(Err(RecordingError::Setup("writers already finishing".to_string())));
            }
            return;
        }

        tracing::info!("[{}] Finishing writers", pair.attempt);
        let completion = Arc::new(Completion {
            pair: Arc::clone(&pair),
            barrier: CompletionBarrier::new(2),
            on_result: Mutex::new(on_result),
            merger: self.merger.clone(),
            layout: self.layout.clone(),
        });

        for writer in [&pair.video, &pair.audio] {
            let kind = writer.kind();
            let finishing = writer.finish();
            let completion = Arc::clone(&completion);
            tokio::spawn(async move {
                let outcome = finishing.await;
                completion.arrive(kind, outcome).await;
            });
        }
    }
}

/// Joint completion of one finish request
struct Completion {
    pair: Arc<WriterPair>,
    barrier: CompletionBarrier,
    on_result: Mutex<Option<ResultHandler>>,
    merger: MergeExporter,
    layout: FileLayout,
}

impl Completion {
    async fn arrive(&self, kind: MediaKind, outcome: FinishOutcome) {
        let attempt = self.pair.attempt;
        match &outcome {
            FinishOutcome::Finalized => tracing::debug!("[{}] {} writer finalized", attempt, kind),
            FinishOutcome::Cancelled => {
                self.pair.cancelled.store(true, Ordering::SeqCst);
                tracing::debug!("[{}] {} writer cancelled", attempt, kind);
            }
            FinishOutcome::Failed(e) => tracing::warn!("[{}] {} writer failed: {}", attempt, kind, e),
        }

        if !self.barrier.arrive() {
            return;
        }

        let on_result = self.on_result.lock().take();
        let Some(on_result) = on_result else {
            tracing::debug!("[{}] No result requested; skipping merge", attempt);
            return;
        };

        // A cancel that lands after a writer completed leaves its file intact
        if self.pair.cancelled.load(Ordering::SeqCst) {
            tracing::info!("[{}] Attempt cancelled while finishing; skipping merge", attempt);
            on_result(Err(RecordingError::State("recording discarded".to_string())));
            return;
        }

        let result = self
            .merger
            .merge_and_export(&self.layout.video, &self.layout.audio, &self.layout.clip)
            .await
            .map_err(RecordingError::from);
        match &result {
            Ok(path) => tracing::info!("[{}] Merged clip at {:?}", attempt, path),
            Err(e) => tracing::error!("[{}] Merge failed: {}", attempt, e),
        }
        on_result(result);
    }
}

/// Serializes writes and finishes for the video and audio writers
pub struct WriteCoordinator {
    shared: Arc<Shared>,
    queue: mpsc::Sender<Command>,
}

impl WriteCoordinator {
    /// Create a coordinator and start its worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        layout: FileLayout,
        settings: OutputSettings,
        factory: Arc<dyn WriterFactory>,
        merger: MergeExporter,
    ) -> Self {
        let shared = Arc::new(Shared {
            layout,
            settings,
            factory,
            merger,
            writers: Mutex::new(None),
        });
        let (queue, commands) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(run_worker(Arc::clone(&shared), commands));

        Self { shared, queue }
    }

    pub fn layout(&self) -> &FileLayout {
        &self.shared.layout
    }

    /// Id of the current recording attempt, if set up
    pub fn attempt_id(&self) -> Option<Uuid> {
        self.shared.current().map(|pair| pair.attempt)
    }

    pub fn writer_state(&self, kind: MediaKind) -> Option<WriterState> {
        self.shared.current().map(|pair| match kind {
            MediaKind::Video => pair.video.state(),
            MediaKind::Audio => pair.audio.state(),
        })
    }

    /// Purge stale files and create fresh writers for a new attempt
    ///
    /// On failure no writers remain; `set_up` must succeed before the
    /// coordinator accepts writes again.
    pub fn set_up(&self) -> RecordingResult<()> {
        let mut slot = self.shared.writers.lock();
        if let Some(previous) = slot.take() {
            previous.cancel();
        }

        let layout = &self.shared.layout;
        if let Some(dir) = layout.dir() {
            std::fs::create_dir_all(dir)?;
        }

        let writer = |kind: MediaKind| {
            Arc::new(ChannelWriter::new(
                kind,
                layout.backing_file(kind).to_path_buf(),
                self.shared.settings,
                Arc::clone(&self.shared.factory),
            ))
        };
        let video = writer(MediaKind::Video);
        let audio = writer(MediaKind::Audio);

        video.clear()?;
        audio.clear()?;
        match std::fs::remove_file(&layout.clip) {
            Ok(()) => tracing::debug!("Removed stale clip {:?}", layout.clip),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        for channel in [&video, &audio] {
            channel.initialize().map_err(|source| RecordingError::WriterInit {
                kind: channel.kind(),
                source,
            })?;
        }

        let attempt = Uuid::new_v4();
        tracing::info!("[{}] Writers ready in {:?}", attempt, layout.dir());
        *slot = Some(Arc::new(WriterPair {
            attempt,
            video,
            audio,
            finish_requested: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }));
        Ok(())
    }

    /// Queue one buffer for its channel's writer
    ///
    /// `on_error` is called if no writers exist when the buffer is applied.
    /// A full queue drops the buffer, like a port that is not ready.
    pub fn write(&self, buffer: SampleBuffer, on_error: impl FnOnce(RecordingError) + Send + 'static) {
        let command = Command::Write {
            buffer,
            on_error: Box::new(on_error),
        };
        match self.queue.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(Command::Write { buffer, .. })) => {
                tracing::trace!("Write queue full, dropping {} buffer at {}", buffer.channel(), buffer.timestamp());
            }
            Err(mpsc::error::TrySendError::Closed(Command::Write { on_error, .. })) => {
                on_error(RecordingError::Setup("write queue closed".to_string()));
            }
            Err(_) => {}
        }
    }

    /// Abort both writers now, ahead of anything still queued
    pub fn cancel_writing(&self) {
        if let Some(pair) = self.shared.current() {
            tracing::info!("[{}] Cancelling writers", pair.attempt);
            pair.cancel();
        }
    }

    /// Queue a finish request behind every write already submitted
    ///
    /// Without `on_result` the writers are still finalized but nothing is
    /// merged.
    pub fn finish_writing(&self, on_result: Option<ResultHandler>) {
        match self.queue.try_send(Command::Finish { on_result }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                // Never drop a finish; wait for room instead
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    if let Err(mpsc::error::SendError(command)) = queue.send(command).await {
                        reject_finish(command);
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(command)) => reject_finish(command),
        }
    }

    /// Finish and wait for the merged clip
    pub async fn finish(&self) -> RecordingResult<PathBuf> {
        let (tx, rx) = oneshot::channel();
        self.finish_writing(Some(Box::new(move |result| {
            let _ = tx.send(result);
        })));
        rx.await
            .unwrap_or_else(|_| Err(RecordingError::Setup("finish was abandoned".to_string())))
    }
}

fn reject_finish(command: Command) {
    if let Command::Finish { on_result: Some(on_result) } = command {
        on_result(Err(RecordingError::Setup("write queue closed".to_string())));
    }
}

async fn run_worker(shared: Arc<Shared>, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Write { buffer, on_error } => shared.apply_write(buffer, on_error),
            Command::Finish { on_result } => shared.apply_finish(on_result),
        }
    }
    tracing::debug!("Write queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MediaTime;
    use crate::export::{
        Composition, CompositionExporter, ExportError, ExportOptions, MergeError, MergeOptions, TrackFileExporter,
    };
    use crate::writer::mock::MockBackend;
    use crate::writer::{TrackFile, TrackFileBackend};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Counts exports without writing anything
    #[derive(Default)]
    struct CountingExporter {
        exports: AtomicUsize,
    }

    #[async_trait]
    impl CompositionExporter for CountingExporter {
        fn file_extension(&self) -> &'static str {
            "mock"
        }

        async fn export(&self, _: &Composition, _: &Path, _: &ExportOptions) -> Result<(), ExportError> {
            self.exports.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn track_file_coordinator(dir: &Path) -> WriteCoordinator {
        let backend = Arc::new(TrackFileBackend::new());
        WriteCoordinator::new(
            FileLayout::new(dir, "clip", "trk", "trk"),
            OutputSettings::for_surface(1280, 720),
            backend.clone(),
            MergeExporter::new(
                backend,
                Arc::new(TrackFileExporter::new()),
                MergeOptions::default(),
                ExportOptions::default(),
            ),
        )
    }

    fn mock_coordinator(dir: &Path, backend: &MockBackend, exporter: &Arc<CountingExporter>) -> WriteCoordinator {
        WriteCoordinator::new(
            FileLayout::new(dir, "clip", "mock", "mock"),
            OutputSettings::for_surface(1280, 720),
            Arc::new(backend.clone()),
            MergeExporter::new(
                Arc::new(backend.clone()),
                exporter.clone(),
                MergeOptions::default(),
                ExportOptions::default(),
            ),
        )
    }

    fn buffer(at_us: i64, channel: ChannelTag) -> SampleBuffer {
        SampleBuffer::new(MediaTime::from_micros(at_us), channel, vec![7u8; 32])
    }

    fn no_error(e: RecordingError) {
        panic!("unexpected write error: {e}");
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_hundred_video_buffers_merge_once() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = track_file_coordinator(dir.path());
        coordinator.set_up().unwrap();

        for i in 0..100 {
            coordinator.write(buffer(2_000_000 + i * 33_333, ChannelTag::Video), no_error);
        }
        assert!(coordinator.layout().video.exists());
        assert!(coordinator.layout().audio.exists());

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let counter = calls.clone();
        coordinator.finish_writing(Some(Box::new(move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        })));

        let clip = rx.await.unwrap().unwrap();
        assert_eq!(clip, coordinator.layout().clip);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let merged = TrackFile::read(&clip).unwrap();
        assert_eq!(merged.declarations.len(), 1);
        assert_eq!(merged.samples_for(0).count(), 100);
        assert_eq!(merged.samples_for(0).next().unwrap().timestamp, MediaTime::ZERO);
    }

    #[tokio::test]
    async fn test_no_buffers_reports_empty_video() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = track_file_coordinator(dir.path());
        coordinator.set_up().unwrap();

        let result = coordinator.finish().await;
        assert!(matches!(
            result,
            Err(RecordingError::Merge(MergeError::EmptyTracks(MediaKind::Video)))
        ));
        assert!(!coordinator.layout().clip.exists());
    }

    async fn finish_in_order(first: MediaKind, second: MediaKind) {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        backend.control.gate_finalize.store(true, Ordering::SeqCst);
        let exporter = Arc::new(CountingExporter::default());
        let coordinator = mock_coordinator(dir.path(), &backend, &exporter);
        coordinator.set_up().unwrap();

        coordinator.write(buffer(0, ChannelTag::Video), no_error);
        coordinator.write(buffer(0, ChannelTag::AudioPrimary), no_error);

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let counter = calls.clone();
        coordinator.finish_writing(Some(Box::new(move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        })));

        backend.control.release(first);
        let control = backend.control.clone();
        wait_for(move || control.finalized.lock().contains(&first)).await;
        assert_eq!(exporter.exports.load(Ordering::SeqCst), 0);
        backend.control.release(second);

        assert!(rx.await.unwrap().is_ok());
        assert_eq!(*backend.control.finalized.lock(), vec![first, second]);
        assert_eq!(exporter.exports.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_merge_runs_once_when_video_finishes_first() {
        finish_in_order(MediaKind::Video, MediaKind::Audio).await;
    }

    #[tokio::test]
    async fn test_merge_runs_once_when_audio_finishes_first() {
        finish_in_order(MediaKind::Audio, MediaKind::Video).await;
    }

    #[tokio::test]
    async fn test_cancel_during_finish_skips_merge() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        backend.control.gate_finalize.store(true, Ordering::SeqCst);
        let exporter = Arc::new(CountingExporter::default());
        let coordinator = mock_coordinator(dir.path(), &backend, &exporter);
        coordinator.set_up().unwrap();

        coordinator.write(buffer(0, ChannelTag::Video), no_error);
        coordinator.write(buffer(0, ChannelTag::AudioPrimary), no_error);

        let (tx, rx) = oneshot::channel();
        coordinator.finish_writing(Some(Box::new(move |result| {
            let _ = tx.send(result);
        })));
        // let the worker start both finalizes
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend.control.finalized.lock().is_empty());

        coordinator.cancel_writing();
        coordinator.cancel_writing();
        backend.control.release(MediaKind::Video);
        backend.control.release(MediaKind::Audio);

        assert!(matches!(rx.await.unwrap(), Err(RecordingError::State(_))));
        assert_eq!(exporter.exports.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_writers_completed_skips_merge() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        backend.control.gate_finalize.store(true, Ordering::SeqCst);
        let exporter = Arc::new(CountingExporter::default());
        let coordinator = mock_coordinator(dir.path(), &backend, &exporter);
        coordinator.set_up().unwrap();
        coordinator.write(buffer(0, ChannelTag::Video), no_error);
        coordinator.write(buffer(0, ChannelTag::AudioPrimary), no_error);

        let (tx, rx) = oneshot::channel();
        coordinator.finish_writing(Some(Box::new(move |result| {
            let _ = tx.send(result);
        })));

        // video is already on disk when the cancel lands
        backend.control.release(MediaKind::Video);
        let control = backend.control.clone();
        wait_for(move || control.finalized.lock().contains(&MediaKind::Video)).await;
        coordinator.cancel_writing();
        assert_eq!(coordinator.writer_state(MediaKind::Video), Some(WriterState::Finished));
        backend.control.release(MediaKind::Audio);

        assert!(matches!(rx.await.unwrap(), Err(RecordingError::State(_))));
        assert_eq!(exporter.exports.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finish_without_handler_skips_merge() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let exporter = Arc::new(CountingExporter::default());
        let coordinator = mock_coordinator(dir.path(), &backend, &exporter);
        coordinator.set_up().unwrap();
        coordinator.write(buffer(0, ChannelTag::Video), no_error);

        coordinator.finish_writing(None);
        let control = backend.control.clone();
        wait_for(move || control.finalized.lock().contains(&MediaKind::Video)).await;
        wait_for(|| coordinator.writer_state(MediaKind::Video) == Some(WriterState::Finished)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(exporter.exports.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_write_before_set_up_reports_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = track_file_coordinator(dir.path());

        let (tx, rx) = oneshot::channel();
        coordinator.write(buffer(0, ChannelTag::Video), move |e| {
            let _ = tx.send(e);
        });
        assert!(matches!(rx.await.unwrap(), RecordingError::Setup(_)));
    }

    #[tokio::test]
    async fn test_failed_set_up_leaves_no_writers() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        backend.control.fail_create.store(true, Ordering::SeqCst);
        let exporter = Arc::new(CountingExporter::default());
        let coordinator = mock_coordinator(dir.path(), &backend, &exporter);

        let err = coordinator.set_up().unwrap_err();
        assert!(matches!(
            err,
            RecordingError::WriterInit {
                kind: MediaKind::Video,
                ..
            }
        ));
        assert!(coordinator.attempt_id().is_none());
        assert!(matches!(coordinator.finish().await, Err(RecordingError::Setup(_))));
    }

    #[tokio::test]
    async fn test_set_up_purges_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = track_file_coordinator(dir.path());
        let layout = coordinator.layout().clone();
        for path in [&layout.video, &layout.audio, &layout.clip] {
            std::fs::write(path, b"stale").unwrap();
        }

        coordinator.set_up().unwrap();
        assert!(!layout.clip.exists());
        // replaced by fresh backing files
        assert_ne!(std::fs::read(&layout.video).unwrap(), b"stale".to_vec());
        assert_ne!(std::fs::read(&layout.audio).unwrap(), b"stale".to_vec());
    }

    #[tokio::test]
    async fn test_cancel_overtakes_queued_writes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let exporter = Arc::new(CountingExporter::default());
        let coordinator = mock_coordinator(dir.path(), &backend, &exporter);
        coordinator.set_up().unwrap();

        for i in 0..10 {
            coordinator.write(buffer(i, ChannelTag::Video), no_error);
        }
        coordinator.cancel_writing();
        assert_eq!(coordinator.writer_state(MediaKind::Video), Some(WriterState::Cancelled));
        assert_eq!(coordinator.writer_state(MediaKind::Audio), Some(WriterState::Cancelled));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.control.appended_count(MediaKind::Video), 0);
        assert_eq!(backend.control.cancels.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_finish_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let exporter = Arc::new(CountingExporter::default());
        let coordinator = mock_coordinator(dir.path(), &backend, &exporter);
        coordinator.set_up().unwrap();
        coordinator.write(buffer(0, ChannelTag::Video), no_error);

        assert!(coordinator.finish().await.is_ok());
        assert!(matches!(coordinator.finish().await, Err(RecordingError::Setup(_))));
        assert_eq!(exporter.exports.load(Ordering::SeqCst), 1);
    }
}
