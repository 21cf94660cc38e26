//! Shared fixtures: a scripted capture session and a recording consumer.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use screenbridge_capture::{
    CaptureController, CaptureSession, CapturedFrame, Completion, ConnectionContext, FrameHandler,
    LifecycleState, PixelBuffer, VideoFrame, VideoFrameConsumer,
};
use screenbridge_core::{CaptureConfiguration, CaptureError, PixelFormat, Resolution, Rotation};
use tokio::sync::oneshot;

// ── Fake session ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFailure {
    Interrupted,
    Backend,
}

#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub begin:         usize,
    pub inputs:        Vec<CaptureConfiguration>,
    pub formats:       Vec<PixelFormat>,
    pub commits:       Vec<u64>,
    pub start_running: usize,
    pub stop_running:  usize,
}

impl Calls {
    pub fn total(&self) -> usize {
        self.begin + self.inputs.len() + self.formats.len() + self.commits.len()
            + self.start_running + self.stop_running
    }
}

#[derive(Default)]
struct Inner {
    calls:        Calls,
    handler:      Option<FrameHandler>,
    generation:   u64,
    running:      bool,
    fail_input:   bool,
    /// Applies to the next commit only.
    fail_commit:  Option<CommitFailure>,
}

/// Holds the worker inside `begin_configuration` / `stop_running` so a
/// test can observe the transitional state.
#[derive(Default)]
struct Gate {
    paused:  Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    fn pass(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.changed.wait(&mut paused);
        }
    }

    fn set(&self, paused: bool) {
        *self.paused.lock() = paused;
        self.changed.notify_all();
    }
}

/// Session that records every call and lets the test drive frames.
pub struct FakeSession {
    inner: Arc<Mutex<Inner>>,
    gate:  Arc<Gate>,
}

/// Test-side view of a [`FakeSession`] after the controller owns it.
#[derive(Clone)]
pub struct FakeHandle {
    inner: Arc<Mutex<Inner>>,
    gate:  Arc<Gate>,
}

pub fn fake_session() -> (FakeSession, FakeHandle) {
    let inner = Arc::new(Mutex::new(Inner::default()));
    let gate = Arc::new(Gate::default());
    (
        FakeSession { inner: inner.clone(), gate: gate.clone() },
        FakeHandle { inner, gate },
    )
}

impl CaptureSession for FakeSession {
    fn begin_configuration(&mut self) {
        self.gate.pass();
        self.inner.lock().calls.begin += 1;
    }

    fn set_input(&mut self, config: &CaptureConfiguration) -> Result<(), CaptureError> {
        let mut inner = self.inner.lock();
        if inner.fail_input {
            return Err(CaptureError::NoInputDevice);
        }
        inner.calls.inputs.push(config.clone());
        Ok(())
    }

    fn set_output_format(&mut self, format: PixelFormat) -> Result<(), CaptureError> {
        self.inner.lock().calls.formats.push(format);
        Ok(())
    }

    fn set_frame_handler(&mut self, handler: FrameHandler) {
        self.inner.lock().handler = Some(handler);
    }

    fn commit_configuration(&mut self, generation: u64) -> Result<(), CaptureError> {
        let mut inner = self.inner.lock();
        match inner.fail_commit.take() {
            Some(CommitFailure::Interrupted) => {
                Err(CaptureError::Interrupted { reason: "display reclaimed".to_owned() })
            }
            Some(CommitFailure::Backend) => Err(CaptureError::Backend("commit rejected".to_owned())),
            None => {
                inner.calls.commits.push(generation);
                inner.generation = generation;
                Ok(())
            }
        }
    }

    fn start_running(&mut self) -> Result<(), CaptureError> {
        let mut inner = self.inner.lock();
        inner.calls.start_running += 1;
        inner.running = true;
        Ok(())
    }

    fn stop_running(&mut self) {
        self.gate.pass();
        let mut inner = self.inner.lock();
        inner.calls.stop_running += 1;
        inner.running = false;
    }

    fn is_running(&self) -> bool {
        self.inner.lock().running
    }
}

impl FakeHandle {
    pub fn calls(&self) -> Calls {
        self.inner.lock().calls.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn fail_input(&self, fail: bool) {
        self.inner.lock().fail_input = fail;
    }

    pub fn fail_next_commit(&self, failure: CommitFailure) {
        self.inner.lock().fail_commit = Some(failure);
    }

    /// Block the worker at its next `begin_configuration` or `stop_running`.
    pub fn pause(&self) {
        self.gate.set(true);
    }

    pub fn resume(&self) {
        self.gate.set(false);
    }

    /// Deliver a frame captured at `at`, tagged with the committed generation.
    pub fn deliver(&self, at: Duration) {
        let generation = self.generation();
        self.deliver_tagged(at, generation);
    }

    /// Deliver a frame captured at `at`, tagged with `generation`.
    pub fn deliver_tagged(&self, at: Duration, generation: u64) {
        let handler = self.inner.lock().handler.clone();
        if let Some(handler) = handler {
            handler.deliver(&frame(at), &ConnectionContext { generation });
        }
    }
}

pub fn frame(at: Duration) -> CapturedFrame {
    let (w, h) = (4, 2);
    CapturedFrame {
        buffer: PixelBuffer::new(
            Bytes::from(vec![0u8; PixelFormat::Nv12.frame_size(w, h)]),
            PixelFormat::Nv12,
            w,
            h,
        ),
        rotation: Rotation::Deg0,
        capture_time: at,
    }
}

// ── Consumer ─────────────────────────────────────────────────────────────────

pub struct RecordingConsumer {
    formats: BTreeSet<PixelFormat>,
    frames:  Mutex<Vec<VideoFrame>>,
    waiter:  Mutex<Option<(usize, oneshot::Sender<()>)>>,
}

impl RecordingConsumer {
    pub fn new(formats: impl IntoIterator<Item = PixelFormat>) -> Arc<Self> {
        Arc::new(Self {
            formats: formats.into_iter().collect(),
            frames: Mutex::new(Vec::new()),
            waiter: Mutex::new(None),
        })
    }

    /// NV12 and BGRA, like a typical hardware encoder.
    pub fn nv12_bgra() -> Arc<Self> {
        Self::new([PixelFormat::Nv12, PixelFormat::Bgra])
    }

    pub fn count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn frames(&self) -> Vec<VideoFrame> {
        self.frames.lock().clone()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.frames.lock().iter().map(|f| f.timestamp_ns).collect()
    }

    /// Resolves once at least `n` frames have been received.
    pub fn wait_for(&self, n: usize) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.count() >= n {
            let _ = tx.send(());
        } else {
            *self.waiter.lock() = Some((n, tx));
        }
        rx
    }
}

impl VideoFrameConsumer for RecordingConsumer {
    fn supported_pixel_formats(&self) -> BTreeSet<PixelFormat> {
        self.formats.clone()
    }

    fn on_frame(&self, frame: VideoFrame) {
        let count = {
            let mut frames = self.frames.lock();
            frames.push(frame);
            frames.len()
        };
        let mut waiter = self.waiter.lock();
        if waiter.as_ref().is_some_and(|(n, _)| count >= *n) {
            if let Some((_, tx)) = waiter.take() {
                let _ = tx.send(());
            }
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

pub fn small_config() -> CaptureConfiguration {
    CaptureConfiguration {
        resolution: Resolution::new(64, 32),
        frame_rate: 100,
        ..Default::default()
    }
}

/// Completion that reports through a oneshot.
pub fn signal() -> (Option<Completion>, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    (Some(Box::new(move || {
        let _ = tx.send(());
    })), rx)
}

/// Completion that appends `tag` to `log`.
pub fn logged(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> Option<Completion> {
    let log = log.clone();
    Some(Box::new(move || log.lock().push(tag)))
}

/// Wait until every command queued so far has been processed.
///
/// Uses whichever command is a no-op in the current settled state.
pub async fn settle<S: CaptureSession>(controller: &CaptureController<S>) {
    let (on_complete, rx) = signal();
    match controller.state() {
        LifecycleState::Running => controller.start_capture(controller.desired_configuration(), on_complete),
        _ => controller.stop_capture_with_completion_handler(on_complete),
    }
    let _ = rx.await;
}

pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}
