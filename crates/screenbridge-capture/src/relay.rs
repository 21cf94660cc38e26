//! Per-frame path from the capture callback to the consumer.
//!
//! ```text
//! platform thread ──► FrameHandler::deliver ──► FrameRelay::capture_output
//!                                                  │ gate: Running? same generation?
//!                                                  │ rebase timestamp
//!                                                  ▼
//!                                      VideoFrameConsumer::on_frame
//! ```
//!
//! Everything here runs on the session's delivery thread and only touches
//! atomics: no locks, no calls back into the controller.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::RgbaImage;
use screenbridge_core::{PixelFormat, Rotation};
use tracing::{debug, trace};

use crate::consumer::VideoFrameConsumer;
use crate::frame::{CapturedFrame, ConnectionContext, PixelBuffer, VideoFrame};
use crate::lifecycle::{LifecycleCell, LifecycleState};
use crate::stats::FrameStats;

const NO_BASE: i64 = i64::MIN;

pub struct FrameRelay {
    /// Read-only view of the controller's lifecycle.
    state:    Weak<LifecycleCell>,
    consumer: Arc<dyn VideoFrameConsumer>,
    /// Generation of the configuration currently committed.
    active_generation: AtomicU64,
    /// Set while an in-place reconfiguration is being applied.
    updating: AtomicBool,
    /// Capture time (ns) of the first frame accepted since the last anchor.
    base_ns:  AtomicI64,
    /// Output time (ns) the anchor frame maps to.
    offset_ns: AtomicI64,
    /// Last timestamp handed to the consumer.
    last_ns:  AtomicI64,
    /// Last accepted capture time and the relay-clock reading when it was
    /// seen, both in ns; lets injected images share the capture clock.
    last_capture_ns: AtomicI64,
    last_seen_ns:    AtomicI64,
    clock:    Instant,
    stats:    FrameStats,
}

impl FrameRelay {
    pub(crate) fn new(state: Weak<LifecycleCell>, consumer: Arc<dyn VideoFrameConsumer>) -> Self {
        Self {
            state,
            consumer,
            active_generation: AtomicU64::new(0),
            updating: AtomicBool::new(false),
            base_ns: AtomicI64::new(NO_BASE),
            offset_ns: AtomicI64::new(0),
            last_ns: AtomicI64::new(0),
            last_capture_ns: AtomicI64::new(NO_BASE),
            last_seen_ns: AtomicI64::new(0),
            clock: Instant::now(),
            stats: FrameStats::default(),
        }
    }

    // ── Platform callback ────────────────────────────────────────────────────

    /// Entry point for every captured sample.
    ///
    /// Frames outside `Running`, during an in-place update, or tagged with a
    /// superseded configuration generation are dropped silently.
    pub fn capture_output(&self, frame: &CapturedFrame, connection: &ConnectionContext) {
        if !self.accepts(connection.generation) {
            self.stats.record_drop();
            trace!("frame dropped (generation {})", connection.generation);
            return;
        }
        self.note_capture(frame.capture_time);
        self.forward(frame.buffer.clone(), frame.rotation, frame.capture_time);
    }

    // ── Injection ────────────────────────────────────────────────────────────

    /// Forward an externally captured sample with an explicit rotation.
    ///
    /// Malformed samples are skipped without error.
    pub fn push_sample(&self, frame: &CapturedFrame, rotation: Rotation) {
        if !frame.buffer.is_well_formed() {
            debug!(
                "push_sample: skipping malformed {} {}x{} buffer ({} bytes)",
                frame.buffer.format,
                frame.buffer.width,
                frame.buffer.height,
                frame.buffer.data.len()
            );
            return;
        }
        if !self.accepts(self.active_generation.load(Ordering::Acquire)) {
            self.stats.record_drop();
            return;
        }
        self.note_capture(frame.capture_time);
        self.forward(frame.buffer.clone(), rotation, frame.capture_time);
    }

    /// Convert an RGBA image to BGRA and forward it, timestamped now.
    ///
    /// "Now" is projected onto the capture clock from the last captured
    /// frame, so injected images interleave correctly with captured ones.
    pub fn push_image(&self, image: &RgbaImage) {
        if !self.accepts(self.active_generation.load(Ordering::Acquire)) {
            self.stats.record_drop();
            return;
        }
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return;
        }
        let mut bgra = Vec::with_capacity(image.as_raw().len());
        for px in image.as_raw().chunks_exact(4) {
            bgra.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
        }
        let buffer = PixelBuffer::new(Bytes::from(bgra), PixelFormat::Bgra, width, height);
        let capture_time = injected_capture_time(
            self.last_capture_ns.load(Ordering::Acquire),
            self.last_seen_ns.load(Ordering::Acquire),
            nanos(self.clock.elapsed()),
        );
        self.forward(buffer, Rotation::Deg0, capture_time);
    }

    // ── Controller side ──────────────────────────────────────────────────────

    /// Accept frames of `generation` from now on.
    pub(crate) fn activate(&self, generation: u64) {
        self.active_generation.store(generation, Ordering::Release);
        self.updating.store(false, Ordering::Release);
    }

    /// Accept frames of `generation` from a freshly started session.
    ///
    /// The session's capture clock may have restarted, so the timeline is
    /// re-anchored: the first frame of the new run maps to one nominal
    /// `frame_interval` after the last delivered timestamp.
    pub(crate) fn begin_run(&self, generation: u64, frame_interval: Duration) {
        if self.base_ns.load(Ordering::Acquire) != NO_BASE {
            let resume = self.last_ns.load(Ordering::Acquire).saturating_add(nanos(frame_interval));
            self.offset_ns.store(resume, Ordering::Release);
            self.base_ns.store(NO_BASE, Ordering::Release);
            self.last_capture_ns.store(NO_BASE, Ordering::Release);
        }
        self.activate(generation);
    }

    pub(crate) fn begin_update(&self) {
        self.updating.store(true, Ordering::Release);
    }

    pub(crate) fn end_update(&self, generation: u64) {
        self.activate(generation);
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn active_generation(&self) -> u64 {
        self.active_generation.load(Ordering::Acquire)
    }

    /// Last timestamp delivered to the consumer, in nanoseconds.
    pub fn last_timestamp_ns(&self) -> i64 {
        self.last_ns.load(Ordering::Acquire)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn accepts(&self, generation: u64) -> bool {
        let running = self
            .state
            .upgrade()
            .is_some_and(|state| state.load() == LifecycleState::Running);
        running
            && !self.updating.load(Ordering::Acquire)
            && generation == self.active_generation.load(Ordering::Acquire)
    }

    fn forward(&self, buffer: PixelBuffer, rotation: Rotation, capture_time: Duration) {
        let timestamp_ns = self.rebase(capture_time);
        self.consumer.on_frame(VideoFrame { buffer, rotation, timestamp_ns });
        self.stats.record_forward();
    }

    fn note_capture(&self, capture_time: Duration) {
        self.last_capture_ns.store(nanos(capture_time), Ordering::Release);
        self.last_seen_ns.store(nanos(self.clock.elapsed()), Ordering::Release);
    }

    /// Map a capture time onto the output timeline: offset from the anchor
    /// frame, clamped so it never goes backwards.
    fn rebase(&self, capture_time: Duration) -> i64 {
        let capture_ns = nanos(capture_time);
        let base = match self.base_ns.compare_exchange(
            NO_BASE,
            capture_ns,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => capture_ns,
            Err(existing) => existing,
        };
        let offset = self.offset_ns.load(Ordering::Acquire);
        let candidate = offset.saturating_add(capture_ns.saturating_sub(base).max(0));
        let previous = self.last_ns.fetch_max(candidate, Ordering::AcqRel);
        previous.max(candidate)
    }
}

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Capture-clock time for an injected frame seen at relay-clock `now_ns`.
fn injected_capture_time(last_capture_ns: i64, last_seen_ns: i64, now_ns: i64) -> Duration {
    let ns = if last_capture_ns == NO_BASE {
        now_ns
    } else {
        last_capture_ns.saturating_add(now_ns.saturating_sub(last_seen_ns).max(0))
    };
    Duration::from_nanos(ns.max(0) as u64)
}
