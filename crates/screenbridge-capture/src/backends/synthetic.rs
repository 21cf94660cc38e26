//! Test-pattern capture session.
//!
//! Produces frames in the committed format on a dedicated thread, paced at
//! the configured frame rate, with capture times from a monotonic clock.
//! Used when no real display source is wanted (CI, demos, load tests).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use screenbridge_core::{CaptureConfiguration, CaptureError, PixelFormat, Rotation};
use tracing::{debug, info};

use crate::frame::{CapturedFrame, ConnectionContext, PixelBuffer};
use crate::session::{CaptureSession, FrameHandler};

#[derive(Debug, Clone)]
struct Committed {
    configuration: CaptureConfiguration,
    format:        PixelFormat,
    generation:    u64,
}

struct Producer {
    stop:   Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct SyntheticSession {
    available:      bool,
    pending_input:  Option<CaptureConfiguration>,
    pending_format: Option<PixelFormat>,
    committed:      Arc<Mutex<Option<Committed>>>,
    handler:        Arc<Mutex<Option<FrameHandler>>>,
    produced:       Arc<AtomicU64>,
    producer:       Option<Producer>,
}

impl Default for SyntheticSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticSession {
    pub fn new() -> Self {
        Self {
            available: true,
            pending_input: None,
            pending_format: None,
            committed: Arc::new(Mutex::new(None)),
            handler: Arc::new(Mutex::new(None)),
            produced: Arc::new(AtomicU64::new(0)),
            producer: None,
        }
    }

    /// A session with no display attached; selecting an input fails.
    pub fn unavailable() -> Self {
        let mut session = Self::new();
        session.available = false;
        session
    }

    /// Frames generated so far, delivered or not.
    pub fn frames_produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn committed_format(&self) -> Option<PixelFormat> {
        self.committed.lock().as_ref().map(|c| c.format)
    }
}

impl CaptureSession for SyntheticSession {
    fn begin_configuration(&mut self) {
        self.pending_input = None;
        self.pending_format = None;
    }

    fn set_input(&mut self, config: &CaptureConfiguration) -> Result<(), CaptureError> {
        if !self.available {
            return Err(CaptureError::NoInputDevice);
        }
        self.pending_input = Some(config.clone());
        Ok(())
    }

    fn set_output_format(&mut self, format: PixelFormat) -> Result<(), CaptureError> {
        self.pending_format = Some(format);
        Ok(())
    }

    fn set_frame_handler(&mut self, handler: FrameHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn commit_configuration(&mut self, generation: u64) -> Result<(), CaptureError> {
        let mut committed = self.committed.lock();
        let configuration = self
            .pending_input
            .take()
            .or_else(|| committed.as_ref().map(|c| c.configuration.clone()));
        let format = self.pending_format.take().or_else(|| committed.as_ref().map(|c| c.format));

        let (Some(configuration), Some(format)) = (configuration, format) else {
            return Err(CaptureError::configuration("no input or output selected"));
        };
        debug!(
            "synthetic session committed {} @{}fps {} (generation {})",
            configuration.resolution, configuration.frame_rate, format, generation
        );
        *committed = Some(Committed { configuration, format, generation });
        Ok(())
    }

    fn start_running(&mut self) -> Result<(), CaptureError> {
        if self.producer.is_some() {
            return Ok(());
        }
        if self.committed.lock().is_none() {
            return Err(CaptureError::configuration("session started before configuration"));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name("synthetic-capture".to_owned())
            .spawn({
                let stop = stop.clone();
                let committed = self.committed.clone();
                let handler = self.handler.clone();
                let produced = self.produced.clone();
                move || produce(stop, committed, handler, produced)
            })
            .map_err(CaptureError::Io)?;

        self.producer = Some(Producer { stop, thread });
        info!("synthetic capture session running");
        Ok(())
    }

    fn stop_running(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.stop.store(true, Ordering::Release);
            producer.thread.thread().unpark();
            let _ = producer.thread.join();
            info!("synthetic capture session stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.producer.is_some()
    }
}

impl Drop for SyntheticSession {
    fn drop(&mut self) {
        self.stop_running();
    }
}

// ── Producer thread ──────────────────────────────────────────────────────────

fn produce(
    stop: Arc<AtomicBool>,
    committed: Arc<Mutex<Option<Committed>>>,
    handler: Arc<Mutex<Option<FrameHandler>>>,
    produced: Arc<AtomicU64>,
) {
    let clock = Instant::now();
    let mut next_deadline = clock;
    let mut index: u64 = 0;

    while !stop.load(Ordering::Acquire) {
        let Some(current) = committed.lock().clone() else { break };
        let handler = handler.lock().clone();

        let capture_time = clock.elapsed();
        let frame = CapturedFrame {
            buffer: pattern(&current.configuration, current.format, index),
            rotation: Rotation::Deg0,
            capture_time,
        };
        if let Some(handler) = handler {
            handler.deliver(&frame, &ConnectionContext { generation: current.generation });
        }
        produced.fetch_add(1, Ordering::Relaxed);
        index += 1;

        next_deadline += current.configuration.frame_interval();
        if next_deadline <= Instant::now() {
            // Fell behind; do not try to catch up with a burst.
            next_deadline = Instant::now();
        }
        wait_until(next_deadline, &stop);
    }
}

/// Park until `deadline`; `stop_running` unparks the thread early.
fn wait_until(deadline: Instant, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::park_timeout(deadline - now);
    }
}

/// Flat frame whose brightness cycles with `index`.
fn pattern(configuration: &CaptureConfiguration, format: PixelFormat, index: u64) -> PixelBuffer {
    let (w, h) = (configuration.resolution.width, configuration.resolution.height);
    let shade = (index % 256) as u8;
    let size = format.frame_size(w, h);

    let data = if format.is_planar() {
        let luma = w as usize * h as usize;
        let mut data = vec![128u8; size];
        data[..luma].fill(shade);
        data
    } else {
        let px = match format {
            PixelFormat::Argb => [0xFF, shade, 0x40, 0x80],
            _ => [0x80, 0x40, shade, 0xFF],
        };
        px.repeat(size / 4)
    };
    PixelBuffer::new(Bytes::from(data), format, w, h)
}
