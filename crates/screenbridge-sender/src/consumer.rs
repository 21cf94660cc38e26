//! `LoggingConsumer`: stands in for a transport encoder and reports the
//! frame rate it is fed.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use screenbridge_capture::{FpsCounter, VideoFrame, VideoFrameConsumer};
use screenbridge_core::PixelFormat;
use tracing::{info, trace};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

pub struct LoggingConsumer {
    formats: BTreeSet<PixelFormat>,
    frames:  AtomicU64,
    fps:     Mutex<FpsCounter>,
}

impl Default for LoggingConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingConsumer {
    /// Accepts NV12 and BGRA, like a hardware H.264 encoder input.
    pub fn new() -> Self {
        Self {
            formats: [PixelFormat::Nv12, PixelFormat::Bgra].into_iter().collect(),
            frames: AtomicU64::new(0),
            fps: Mutex::new(FpsCounter::new()),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl VideoFrameConsumer for LoggingConsumer {
    fn supported_pixel_formats(&self) -> BTreeSet<PixelFormat> {
        self.formats.clone()
    }

    fn on_frame(&self, frame: VideoFrame) {
        let total = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("frame #{} ts={}ns", total, frame.timestamp_ns);

        let mut fps = self.fps.lock();
        fps.tick();
        if fps.window_elapsed(REPORT_INTERVAL) {
            info!(
                "Capture: {:.1} fps  {}x{} {}  rotation={}°  frames={}  ts={}ms",
                fps.fps(),
                frame.width(),
                frame.height(),
                frame.format(),
                frame.rotation.degrees(),
                total,
                frame.timestamp_ns / 1_000_000
            );
        }
    }
}
