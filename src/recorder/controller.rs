//! Recording controller
//!
//! Top-level Done/Recording state machine. Starts and stops the capture
//! source, hands every buffer to the [`WriteCoordinator`] and aborts the
//! recording when the app is backgrounded or capture turns inactive.

use super::coordinator::WriteCoordinator;
use super::state::{RecorderState, RecordingError, RecordingResult};
use crate::capture::{BufferHandler, CaptureError, CaptureSource, LifecycleEvent};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct Status {
    state: RecorderState,
    /// Bumped whenever an attempt ends, so late buffers of an old attempt
    /// cannot flip the state back to Recording
    generation: u64,
}

/// Clears the stopping flag when the stop returns or is dropped
struct StopInFlight(Arc<AtomicBool>);

impl Drop for StopInFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Shared {
    source: Arc<dyn CaptureSource>,
    coordinator: WriteCoordinator,
    status: Mutex<Status>,
    /// A capture stop is running and has not returned yet
    stopping: Arc<AtomicBool>,
    inactive_settle: Duration,
}

impl Shared {
    fn state(&self) -> RecorderState {
        self.status.lock().state
    }

    /// End the current attempt so buffers still in flight cannot revive it
    fn end_attempt(&self) {
        let mut status = self.status.lock();
        status.state = RecorderState::Done;
        status.generation += 1;
    }

    fn buffer_handler(self: &Arc<Self>, generation: u64) -> BufferHandler {
        let weak: Weak<Self> = Arc::downgrade(self);
        let confirmed = AtomicBool::new(false);

        Arc::new(move |event| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let buffer = match event {
                Ok(buffer) => buffer,
                Err(e) => {
                    tracing::error!("Capture error: {}", e);
                    return;
                }
            };

            // Trailing buffers can arrive after a stop; only a source that
            // still reports capturing may move the state to Recording
            if !confirmed.load(Ordering::SeqCst) && shared.source.is_capturing() {
                let mut status = shared.status.lock();
                if status.generation == generation && !confirmed.swap(true, Ordering::SeqCst) {
                    status.state = RecorderState::Recording;
                    tracing::info!("Capture confirmed; recording");
                }
            }

            shared.coordinator.write(buffer, |e| {
                tracing::warn!("Buffer lost: {}", e);
            });
        })
    }

    fn discard(&self) {
        self.end_attempt();
        if self.source.is_capturing() && !self.stopping.swap(true, Ordering::SeqCst) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let source = Arc::clone(&self.source);
                    let in_flight = StopInFlight(Arc::clone(&self.stopping));
                    handle.spawn(async move {
                        let _in_flight = in_flight;
                        if let Err(e) = source.stop_capture().await {
                            tracing::warn!("Failed to stop capture on discard: {}", e);
                        }
                    });
                }
                Err(_) => {
                    self.stopping.store(false, Ordering::SeqCst);
                    tracing::warn!("No runtime to stop capture on discard");
                }
            }
        }

        self.coordinator.cancel_writing();
        tracing::debug!("Recording discarded");
    }
}

/// Drives one capture source through record, stop and discard
pub struct RecordingController {
    shared: Arc<Shared>,
}

impl RecordingController {
    pub fn new(source: Arc<dyn CaptureSource>, coordinator: WriteCoordinator, inactive_settle: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                coordinator,
                status: Mutex::new(Status {
                    state: RecorderState::Done,
                    generation: 0,
                }),
                stopping: Arc::new(AtomicBool::new(false)),
                inactive_settle,
            }),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.shared.state()
    }

    /// The capture source's own capturing flag
    pub fn is_capturing(&self) -> bool {
        self.shared.source.is_capturing()
    }

    pub fn coordinator(&self) -> &WriteCoordinator {
        &self.shared.coordinator
    }

    /// Set up the writers and start capturing
    ///
    /// Any guard or setup failure discards the attempt before returning
    /// the error. The state turns to Recording once the first buffer
    /// arrives while the source confirms it is capturing.
    pub fn start_record(&self, mic_enabled: bool) -> RecordingResult<()> {
        let shared = &self.shared;

        let refusal = if !shared.source.is_available() {
            Some(RecordingError::Capture(CaptureError::Unavailable))
        } else if shared.source.is_capturing() {
            Some(RecordingError::Capture(CaptureError::AlreadyCapturing))
        } else if shared.state() != RecorderState::Done {
            Some(RecordingError::State("a recording is already in progress".to_string()))
        } else {
            None
        };
        if let Some(e) = refusal {
            tracing::warn!("Cannot start recording: {}", e);
            shared.discard();
            return Err(e);
        }

        if let Err(e) = shared.coordinator.set_up() {
            tracing::error!("Writer setup failed: {}", e);
            shared.discard();
            return Err(e);
        }

        let generation = shared.status.lock().generation;
        let handler = shared.buffer_handler(generation);
        if let Err(e) = shared.source.start_capture(mic_enabled, handler) {
            tracing::error!("Capture failed to start: {}", e);
            shared.discard();
            return Err(e.into());
        }

        tracing::info!(
            "Recording attempt {} started (mic {})",
            shared.coordinator.attempt_id().map(|id| id.to_string()).unwrap_or_default(),
            if mic_enabled { "on" } else { "off" }
        );
        Ok(())
    }

    /// Stop capturing and wait for the merged clip
    ///
    /// Finalizing runs even when stopping the capture fails; the first
    /// error of the two is returned.
    pub async fn stop_record(&self) -> RecordingResult<PathBuf> {
        let shared = &self.shared;
        if shared.state() != RecorderState::Recording || !shared.source.is_capturing() {
            shared.discard();
            return Err(RecordingError::State("not recording".to_string()));
        }

        tracing::info!("Stopping recording");
        shared.stopping.store(true, Ordering::SeqCst);
        let stopped = {
            let _in_flight = StopInFlight(Arc::clone(&shared.stopping));
            shared.source.stop_capture().await
        };
        shared.end_attempt();
        if let Err(e) = &stopped {
            tracing::warn!("Capture stop reported an error, finishing anyway: {}", e);
        }

        let finished = shared.coordinator.finish().await;
        match stopped {
            Err(e) => Err(e.into()),
            Ok(()) => finished,
        }
    }

    /// Abort the recording now; safe to call any number of times
    pub fn discard(&self) {
        self.shared.discard();
    }

    /// React to lifecycle signals until the sender goes away
    ///
    /// Backgrounding while recording discards at once. Capture turning
    /// inactive discards only if still recording after the settle delay,
    /// so a stop already in flight wins.
    pub fn bind(&self, mut events: broadcast::Receiver<LifecycleEvent>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} lifecycle events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(shared) = weak.upgrade() else {
                    break;
                };

                match event {
                    LifecycleEvent::DidEnterBackground => {
                        if shared.state() == RecorderState::Recording {
                            tracing::info!("Entered background while recording; discarding");
                            shared.discard();
                        }
                    }
                    LifecycleEvent::CaptureInactive => {
                        let weak = weak.clone();
                        let settle = shared.inactive_settle;
                        tokio::spawn(async move {
                            tokio::time::sleep(settle).await;
                            let Some(shared) = weak.upgrade() else {
                                return;
                            };
                            if shared.state() == RecorderState::Recording {
                                tracing::info!("Capture inactive while recording; discarding");
                                shared.discard();
                            }
                        });
                    }
                }
            }
            tracing::debug!("Lifecycle binding closed");
        })
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        self.shared.discard();
    }
}
