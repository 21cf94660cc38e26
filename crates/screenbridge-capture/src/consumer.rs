use std::collections::BTreeSet;

use screenbridge_core::PixelFormat;

use crate::frame::VideoFrame;

/// Downstream video source that receives relayed frames.
///
/// Implemented by the transport layer. `on_frame` is called on the capture
/// callback thread and must not block.
pub trait VideoFrameConsumer: Send + Sync + 'static {
    /// Pixel formats the consumer can ingest without conversion.
    fn supported_pixel_formats(&self) -> BTreeSet<PixelFormat>;

    fn on_frame(&self, frame: VideoFrame);
}
