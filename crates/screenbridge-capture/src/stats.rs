//! Frame counters shared between the relay and whoever reports on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How recently a frame must have been forwarded for the relay to count
/// as active.
pub const ACTIVITY_WINDOW: Duration = Duration::from_secs(1);

/// Lock-free forwarded/dropped counters, updated on the capture thread.
#[derive(Debug)]
pub struct FrameStats {
    forwarded: AtomicU64,
    dropped:   AtomicU64,
    /// Milliseconds since `epoch` of the last forward, plus one; 0 = never.
    last_forward_ms: AtomicU64,
    epoch: Instant,
}

/// Point-in-time copy of [`FrameStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub forwarded: u64,
    pub dropped:   u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_forward_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }
}

impl FrameStats {
    pub(crate) fn record_forward(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        let ms = self.epoch.elapsed().as_millis() as u64 + 1;
        self.last_forward_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot { forwarded: self.forwarded(), dropped: self.dropped() }
    }

    /// Time since the last forwarded frame, if any was forwarded.
    pub fn since_last_forward(&self) -> Option<Duration> {
        let stamp = self.last_forward_ms.load(Ordering::Relaxed);
        if stamp == 0 {
            return None;
        }
        let now = self.epoch.elapsed().as_millis() as u64 + 1;
        Some(Duration::from_millis(now.saturating_sub(stamp)))
    }

    /// True while frames are flowing to the consumer.
    pub fn is_active(&self) -> bool {
        self.since_last_forward().is_some_and(|d| d < ACTIVITY_WINDOW)
    }
}

/// Rolling ~1 second FPS counter.
#[derive(Debug)]
pub struct FpsCounter {
    count:        u32,
    window_start: Instant,
    last_fps:     f32,
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FpsCounter {
    pub fn new() -> Self {
        Self { count: 0, window_start: Instant::now(), last_fps: 0.0 }
    }

    pub fn tick(&mut self) {
        self.count += 1;
    }

    /// Returns the FPS over the last window; resets the counter once at
    /// least half a second has elapsed.
    pub fn fps(&mut self) -> f32 {
        let elapsed = self.window_start.elapsed().as_secs_f32();
        if elapsed >= 0.5 {
            self.last_fps = self.count as f32 / elapsed;
            self.count = 0;
            self.window_start = Instant::now();
        }
        self.last_fps
    }

    /// Whether the current window is at least `window` old.
    pub fn window_elapsed(&self, window: Duration) -> bool {
        self.window_start.elapsed() >= window
    }
}
