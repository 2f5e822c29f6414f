//! Channel writer
//!
//! Owns one media channel's backing store. A channel writer wraps an
//! underlying [`MediaWriter`] plus its input ports and enforces the
//! per-channel lifecycle:
//!
//! ```text
//! NotInitialized -> Initialized -> Writing -> Finished
//!                        \             \
//!                         `-------------`--> Cancelled
//! ```
//!
//! The underlying writer and its ports exist only while the state is
//! `Initialized` or `Writing`, and are released exactly once on the
//! transition into `Finished` or `Cancelled`.

use crate::capture::{ChannelTag, SampleBuffer};
use crate::writer::backend::{FinalizeFuture, MediaWriter, WriterError, WriterFactory, WriterInput, WriterStatus};
use crate::writer::settings::{MediaKind, OutputSettings};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lifecycle state of a channel writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WriterState {
    NotInitialized,
    Initialized,
    Writing,
    Finished,
    Cancelled,
}

impl WriterState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WriterState::Finished | WriterState::Cancelled)
    }
}

/// What happened to one appended buffer
///
/// Every outcome except `Appended` is a silent drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The writer is not (or no longer) writing
    NotWriting,
    /// The target port reported backpressure
    NotReady,
    /// No port of this writer carries the buffer's channel
    NoPort,
    /// The underlying writer rejected the sample
    Failed,
}

/// How a finish request ended
#[derive(Debug)]
pub enum FinishOutcome {
    /// The backing store was finalized
    Finalized,
    /// Nothing was being written; the writer was cancelled instead
    Cancelled,
    /// Finalization failed; the writer is terminal anyway
    Failed(WriterError),
}

/// Underlying writer and its ports, held only while active
struct Resources {
    writer: Box<dyn MediaWriter>,
    inputs: Vec<Box<dyn WriterInput>>,
}

struct Inner {
    state: WriterState,
    session_anchored: bool,
    start_failed: bool,
    finish_requested: bool,
    resources: Option<Resources>,
}

impl Inner {
    /// Drop the underlying writer and ports, aborting the writer if asked
    fn release(&mut self, abort: bool) {
        if let Some(mut resources) = self.resources.take() {
            if abort {
                resources.writer.cancel_writing();
            }
        }
    }
}

enum FinishStep {
    Done(FinishOutcome),
    Finalize(FinalizeFuture),
}

/// Persists one media channel to its backing file
pub struct ChannelWriter {
    kind: MediaKind,
    path: PathBuf,
    settings: OutputSettings,
    factory: Arc<dyn WriterFactory>,
    inner: Mutex<Inner>,
}

impl ChannelWriter {
    pub fn new(kind: MediaKind, path: PathBuf, settings: OutputSettings, factory: Arc<dyn WriterFactory>) -> Self {
        Self {
            kind,
            path,
            settings,
            factory,
            inner: Mutex::new(Inner {
                state: WriterState::NotInitialized,
                session_anchored: false,
                start_failed: false,
                finish_requested: false,
                resources: None,
            }),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Backing file of this channel
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> WriterState {
        self.inner.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn session_anchored(&self) -> bool {
        self.inner.lock().session_anchored
    }

    /// Create the underlying writer and attach the channel's ports
    pub fn initialize(&self) -> Result<(), WriterError> {
        let mut inner = self.inner.lock();
        // A leftover writer from an earlier attempt is aborted, not leaked
        inner.release(true);

        let mut writer = self.factory.create_writer(&self.path, self.kind)?;
        let mut inputs = Vec::new();
        for settings in self.settings.inputs_for(self.kind) {
            if !writer.can_add_input(&settings) {
                tracing::warn!("{} writer does not accept input {:?}", self.kind, settings);
                continue;
            }
            inputs.push(writer.add_input(settings)?);
        }

        inner.state = WriterState::Initialized;
        inner.session_anchored = false;
        inner.start_failed = false;
        inner.finish_requested = false;
        inner.resources = Some(Resources { writer, inputs });

        tracing::debug!("Initialized {} writer at {:?}", self.kind, self.path);
        Ok(())
    }

    /// Remove a stale backing file; a missing file is not an error
    pub fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!("Removed stale {} backing file {:?}", self.kind, self.path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Port index carrying `channel`, if this writer has one
    fn port_for(&self, channel: ChannelTag) -> Option<usize> {
        match (self.kind, channel) {
            (MediaKind::Video, ChannelTag::Video) => Some(0),
            (MediaKind::Audio, ChannelTag::AudioPrimary) => Some(0),
            (MediaKind::Audio, ChannelTag::AudioSecondary) => Some(1),
            _ => None,
        }
    }

    /// Append one buffer, dropping it under backpressure
    ///
    /// The first call starts the underlying writer. If that start fails the
    /// writer stays non-writing and every later buffer is dropped. The first
    /// buffer that reaches a ready port anchors the session at its timestamp.
    pub fn append(&self, channel: ChannelTag, buffer: &SampleBuffer) -> AppendOutcome {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.state {
            WriterState::Writing => {}
            WriterState::Initialized if !inner.start_failed => {
                let Some(resources) = inner.resources.as_mut() else {
                    return AppendOutcome::NotWriting;
                };
                if resources.writer.start_writing() {
                    inner.state = WriterState::Writing;
                    tracing::debug!("{} writer started", self.kind);
                } else {
                    inner.start_failed = true;
                    tracing::warn!("{} writer failed to start; dropping its buffers", self.kind);
                    return AppendOutcome::NotWriting;
                }
            }
            _ => return AppendOutcome::NotWriting,
        }

        let Some(resources) = inner.resources.as_mut() else {
            return AppendOutcome::NotWriting;
        };
        let Some(port) = self.port_for(channel) else {
            return AppendOutcome::NoPort;
        };
        let Some(input) = resources.inputs.get_mut(port) else {
            return AppendOutcome::NoPort;
        };

        if !input.is_ready_for_more_media_data() {
            tracing::trace!("{} port not ready, dropping buffer at {}", channel, buffer.timestamp());
            return AppendOutcome::NotReady;
        }

        if !inner.session_anchored {
            resources.writer.start_session(buffer.timestamp());
            inner.session_anchored = true;
            tracing::debug!("{} session anchored at {}", self.kind, buffer.timestamp());
        }

        match input.append(buffer) {
            Ok(()) => AppendOutcome::Appended,
            Err(e) => {
                tracing::warn!("Failed to append {} buffer at {}: {}", channel, buffer.timestamp(), e);
                AppendOutcome::Failed
            }
        }
    }

    /// Finalize the backing store
    ///
    /// The synchronous part runs before this returns: ports are marked
    /// finished (or the writer is cancelled if it never started writing).
    /// The returned future resolves once the writer has reached a terminal
    /// state. Must be called at most once per lifecycle.
    pub fn finish(self: &Arc<Self>) -> impl Future<Output = FinishOutcome> + Send + 'static {
        let step = self.begin_finish();
        let this = Arc::clone(self);
        async move {
            match step {
                FinishStep::Done(outcome) => outcome,
                FinishStep::Finalize(finalize) => {
                    let result = finalize.await;
                    this.complete_finish(result)
                }
            }
        }
    }

    fn begin_finish(&self) -> FinishStep {
        let mut inner = self.inner.lock();

        if inner.finish_requested {
            debug_assert!(false, "finish called twice on the {} writer", self.kind);
            tracing::error!("finish called twice on the {} writer", self.kind);
            return FinishStep::Done(FinishOutcome::Cancelled);
        }
        inner.finish_requested = true;

        let writing = inner
            .resources
            .as_ref()
            .is_some_and(|r| r.writer.status() == WriterStatus::Writing);

        if !writing {
            inner.release(true);
            if !inner.state.is_terminal() {
                inner.state = WriterState::Cancelled;
            }
            tracing::debug!("{} writer was not writing; cancelled instead of finalized", self.kind);
            return FinishStep::Done(FinishOutcome::Cancelled);
        }

        match inner.resources.as_mut() {
            Some(resources) => {
                resources.inputs.iter_mut().for_each(|input| input.mark_as_finished());
                FinishStep::Finalize(resources.writer.finish_writing())
            }
            None => FinishStep::Done(FinishOutcome::Cancelled),
        }
    }

    fn complete_finish(&self, result: Result<(), WriterError>) -> FinishOutcome {
        let mut inner = self.inner.lock();

        if inner.state == WriterState::Cancelled {
            // cancel() won the race and already released everything
            return FinishOutcome::Cancelled;
        }

        inner.state = WriterState::Finished;
        inner.release(false);

        match result {
            Ok(()) => {
                tracing::debug!("{} writer finalized {:?}", self.kind, self.path);
                FinishOutcome::Finalized
            }
            Err(e) => {
                tracing::warn!("{} writer failed to finalize: {}", self.kind, e);
                FinishOutcome::Failed(e)
            }
        }
    }

    /// Abort the underlying writer immediately; a no-op once terminal
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.release(true);
        inner.state = WriterState::Cancelled;
        tracing::debug!("{} writer cancelled", self.kind);
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.resources.is_some() {
            tracing::debug!("{} writer dropped while active; aborting", self.kind);
            inner.release(true);
        }
    }
}
