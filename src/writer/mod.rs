//! Per-channel writers
//!
//! - `backend`: the seam to the underlying platform writer
//! - `track_file`: the built-in file-backed implementation of that seam
//! - `channel`: the per-channel state machine on top of it

pub mod backend;
pub mod channel;
pub mod settings;
pub mod track_file;

#[cfg(test)]
pub(crate) mod mock;

pub use backend::{FinalizeFuture, MediaWriter, WriterError, WriterFactory, WriterInput, WriterStatus};
pub use channel::{AppendOutcome, ChannelWriter, FinishOutcome, WriterState};
pub use settings::{AudioSettings, InputSettings, MediaKind, OutputSettings, VideoSettings};
pub use track_file::{TrackFile, TrackFileBackend};
