//! Platform writer seam
//!
//! Encoding and container muxing are delegated to an underlying writer
//! object. A [`WriterFactory`] creates one [`MediaWriter`] per backing file;
//! the writer hands out [`WriterInput`] ports that accept sample buffers.

use crate::capture::{MediaTime, SampleBuffer};
use crate::writer::settings::{InputSettings, MediaKind};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by an underlying writer
#[derive(Error, Debug)]
pub enum WriterError {
    #[error("Cannot create writer for {path:?}: {reason}")]
    Create { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Writer is closed")]
    Closed,

    #[error("Writer error: {0}")]
    Backend(String),
}

/// Resolves once the underlying writer has durably closed its file
pub type FinalizeFuture = Pin<Box<dyn Future<Output = Result<(), WriterError>> + Send + 'static>>;

/// Status of an underlying writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterStatus {
    /// Created, `start_writing` not called yet
    Unknown,
    /// Accepting samples
    Writing,
    /// Finalized successfully
    Completed,
    /// Start or finalize failed
    Failed,
    /// Aborted, output discarded
    Cancelled,
}

/// One append target of an underlying writer
pub trait WriterInput: Send {
    /// Readiness / backpressure signal
    fn is_ready_for_more_media_data(&self) -> bool;

    /// Append one sample
    fn append(&mut self, buffer: &SampleBuffer) -> Result<(), WriterError>;

    /// No further appends will follow
    fn mark_as_finished(&mut self);
}

/// Underlying writer bound to one backing file
pub trait MediaWriter: Send {
    fn status(&self) -> WriterStatus;

    /// Whether an input with `settings` would be accepted
    fn can_add_input(&self, settings: &InputSettings) -> bool;

    /// Attach a new input port
    fn add_input(&mut self, settings: InputSettings) -> Result<Box<dyn WriterInput>, WriterError>;

    /// Begin writing; `false` leaves the writer non-writing
    fn start_writing(&mut self) -> bool;

    /// Fix time zero of the output to `at`
    fn start_session(&mut self, at: MediaTime);

    /// Finalize the file asynchronously
    ///
    /// The returned future does not borrow the writer, so it can be awaited
    /// after the writer itself has been released.
    fn finish_writing(&mut self) -> FinalizeFuture;

    /// Abort writing and discard the output
    fn cancel_writing(&mut self);
}

/// Creates underlying writers
pub trait WriterFactory: Send + Sync {
    /// Extension of the backing files this factory produces
    fn file_extension(&self) -> &'static str;

    fn create_writer(&self, path: &Path, kind: MediaKind) -> Result<Box<dyn MediaWriter>, WriterError>;
}
