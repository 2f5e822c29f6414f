//! Capture source interface
//!
//! The capture subsystem is external; this module only defines the contract
//! the pipeline consumes, plus a synthetic source for tests and the demo.

pub mod synthetic;
pub mod traits;

pub use synthetic::SyntheticCaptureSource;
pub use traits::{
    BufferHandler, CaptureError, CaptureSource, ChannelTag, LifecycleEvent, MediaTime,
    SampleBuffer,
};
