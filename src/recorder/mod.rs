//! Recording system module
//!
//! This module implements the two-channel recording pipeline:
//! - WriteCoordinator to serialize writes into the video and audio writers
//! - CompletionBarrier to merge exactly once after both writers finish
//! - RecordingController to drive capture and react to lifecycle signals

pub mod barrier;
pub mod controller;
pub mod coordinator;
pub mod state;

pub use barrier::CompletionBarrier;
pub use controller::RecordingController;
pub use coordinator::{ErrorHandler, ResultHandler, WriteCoordinator};
pub use state::{RecorderState, RecordingError, RecordingResult};
