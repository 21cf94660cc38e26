//! Seam between the controller and the platform capture primitive.

use std::sync::{Arc, Weak};

use screenbridge_core::{CaptureConfiguration, CaptureError, PixelFormat};

use crate::frame::{CapturedFrame, ConnectionContext};
use crate::relay::FrameRelay;

/// Platform capture session: inputs, one video output, and a dedicated
/// delivery thread the platform owns.
///
/// All methods are called from the controller's worker thread only, so
/// they may block. Frames are delivered through the registered
/// [`FrameHandler`] on the session's own thread.
///
/// Configuration changes are bracketed by [`begin_configuration`] and
/// [`commit_configuration`]; nothing takes effect before the commit.
/// A commit that fails leaves the previous generation in place.
///
/// [`begin_configuration`]: CaptureSession::begin_configuration
/// [`commit_configuration`]: CaptureSession::commit_configuration
pub trait CaptureSession: Send + 'static {
    fn begin_configuration(&mut self);

    /// Select the input for `config`. Fails with
    /// [`CaptureError::NoInputDevice`] when nothing usable is attached.
    fn set_input(&mut self, config: &CaptureConfiguration) -> Result<(), CaptureError>;

    fn set_output_format(&mut self, format: PixelFormat) -> Result<(), CaptureError>;

    fn set_frame_handler(&mut self, handler: FrameHandler);

    /// Apply pending changes. Samples produced afterwards carry
    /// `generation` in their [`ConnectionContext`].
    fn commit_configuration(&mut self, generation: u64) -> Result<(), CaptureError>;

    fn start_running(&mut self) -> Result<(), CaptureError>;

    fn stop_running(&mut self);

    fn is_running(&self) -> bool;
}

/// Non-owning registration of a [`FrameRelay`] with a session.
///
/// Delivery after the relay has been dropped is a silent no-op.
#[derive(Debug, Clone)]
pub struct FrameHandler {
    relay: Weak<FrameRelay>,
}

impl FrameHandler {
    pub fn new(relay: &Arc<FrameRelay>) -> Self {
        Self { relay: Arc::downgrade(relay) }
    }

    /// Hand one sample to the relay. Called by the session once per frame.
    pub fn deliver(&self, frame: &CapturedFrame, connection: &ConnectionContext) {
        if let Some(relay) = self.relay.upgrade() {
            relay.capture_output(frame, connection);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.relay.strong_count() > 0
    }
}
