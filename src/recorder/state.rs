//! Recording state management
//!
//! Defines the controller state machine and the recording error taxonomy.

use crate::capture::CaptureError;
use crate::export::MergeError;
use crate::writer::{MediaKind, WriterError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current state of the recording controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    /// No recording in progress
    #[default]
    Done,
    /// Capture confirmed and buffers flowing into the writers
    Recording,
}

/// Errors that can occur during a recording attempt
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Cannot create the {kind} writer: {source}")]
    WriterInit {
        kind: MediaKind,
        #[source]
        source: WriterError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("Writers are not set up: {0}")]
    Setup(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),
}

/// Result type for recording operations
pub type RecordingResult<T> = Result<T, RecordingError>;
