//! Frame representations on both sides of the relay.

use std::time::Duration;

use bytes::Bytes;
use screenbridge_core::{PixelFormat, Rotation};

/// Reference-counted pixel storage plus the layout needed to read it.
///
/// Cloning shares the underlying buffer; no pixel data is copied.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub data:   Bytes,
    pub format: PixelFormat,
    pub width:  u32,
    pub height: u32,
    /// Bytes per row of the first plane.
    pub stride: usize,
}

impl PixelBuffer {
    /// Tightly packed buffer (stride = minimum row length).
    pub fn new(data: Bytes, format: PixelFormat, width: u32, height: u32) -> Self {
        let stride = format.min_stride(width);
        Self { data, format, width, height, stride }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Whether the layout is self-consistent enough to hand to a consumer.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && !self.data.is_empty()
            && self.stride >= self.format.min_stride(self.width)
            && self.data.len() >= self.stride * self.height as usize
    }
}

/// One sample as handed over by the platform session.
///
/// Only valid for the duration of the callback; the relay keeps nothing
/// beyond what it forwards.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub buffer:       PixelBuffer,
    pub rotation:     Rotation,
    /// Capture time on the platform's monotonic clock.
    pub capture_time: Duration,
}

/// Connection the sample arrived on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Configuration generation the session was running when it produced
    /// the sample. Bumped by every committed configuration.
    pub generation: u64,
}

/// Frame as delivered to the transport consumer, which owns it.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub buffer:       PixelBuffer,
    pub rotation:     Rotation,
    /// Nanoseconds since the first accepted frame; never decreases.
    pub timestamp_ns: i64,
}

impl VideoFrame {
    pub fn width(&self) -> u32 {
        self.buffer.width
    }

    pub fn height(&self) -> u32 {
        self.buffer.height
    }

    pub fn format(&self) -> PixelFormat {
        self.buffer.format
    }
}
