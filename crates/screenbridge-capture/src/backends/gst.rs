//! GStreamer-backed capture session.
//!
//! # Pipeline
//!
//! ```text
//! <source>                    videotestsrc is-live=true  (default)
//!   │                         pipewiresrc fd=X path=Y    (portal stream)
//!   ▼
//! videoconvert ! videoscale ! videorate
//!   │
//! capsfilter name=caps        video/x-raw,format=<negotiated>,width,height,framerate
//!   │
//! appsink name=sink           max-buffers=2 drop=true sync=false
//!   │  new_sample callback (GStreamer streaming thread)
//!   ▼
//! FrameHandler::deliver
//! ```
//!
//! In-place reconfiguration swaps the capsfilter caps while the pipeline
//! keeps playing. Each sample is tagged with the generation whose committed
//! layout (format and size) matches the sample's caps, so buffers produced
//! under the old caps but delivered after the commit keep the old tag. Bus
//! errors are posted to the optional [`ChangeNotifier`]
//! as interruptions so the controller restarts the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks};
use gstreamer_video::{VideoCapsBuilder, VideoFormat, VideoInfo};
use parking_lot::Mutex;
use screenbridge_core::{CaptureConfiguration, CaptureError, PixelFormat, Rotation};
use tracing::{debug, error, info, warn};

use crate::frame::{CapturedFrame, ConnectionContext, PixelBuffer};
use crate::reconfigure::{ChangeNotifier, SessionChange};
use crate::session::{CaptureSession, FrameHandler};

const DEFAULT_SOURCE: &str = "videotestsrc is-live=true pattern=smpte";

/// Output layout of a committed configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Committed {
    generation: u64,
    /// Generation in force before this commit.
    previous:   u64,
    format:     PixelFormat,
    width:      u32,
    height:     u32,
}

struct Built {
    pipeline:   gstreamer::Pipeline,
    capsfilter: gstreamer::Element,
}

pub struct GstSession {
    source:         String,
    notifier:       Option<ChangeNotifier>,
    built:          Option<Built>,
    pending_input:  Option<CaptureConfiguration>,
    pending_format: Option<PixelFormat>,
    input:          Option<CaptureConfiguration>,
    format:         Option<PixelFormat>,
    handler:        Arc<Mutex<Option<FrameHandler>>>,
    committed:      Arc<Mutex<Option<Committed>>>,
    running:        bool,
    bus_stop:       Arc<AtomicBool>,
    bus_thread:     Option<JoinHandle<()>>,
}

impl Default for GstSession {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE)
    }
}

impl GstSession {
    /// `source` is a gst-launch fragment producing raw video, e.g.
    /// `pipewiresrc fd=12 path=42 do-timestamp=true`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            notifier: None,
            built: None,
            pending_input: None,
            pending_format: None,
            input: None,
            format: None,
            handler: Arc::new(Mutex::new(None)),
            committed: Arc::new(Mutex::new(None)),
            running: false,
            bus_stop: Arc::new(AtomicBool::new(false)),
            bus_thread: None,
        }
    }

    /// Post bus errors to `notifier` as interruptions.
    pub fn with_notifier(mut self, notifier: ChangeNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn ensure_built(&mut self) -> Result<&Built, CaptureError> {
        if self.built.is_none() {
            gstreamer::init().map_err(|e| CaptureError::Backend(e.to_string()))?;
            let element = self.source.split_whitespace().next().unwrap_or_default();
            if gstreamer::ElementFactory::find(element).is_none() {
                warn!("GStreamer source element '{}' not available", element);
                return Err(CaptureError::NoInputDevice);
            }
            let built = build_pipeline(&self.source, self.handler.clone(), self.committed.clone())
                .map_err(|e| CaptureError::Backend(format!("{e:#}")))?;
            self.built = Some(built);
        }
        self.built
            .as_ref()
            .ok_or_else(|| CaptureError::Backend("pipeline missing".to_owned()))
    }

    fn spawn_bus_watch(&mut self) {
        let Some(built) = &self.built else { return };
        let Some(bus) = built.pipeline.bus() else { return };
        let notifier = self.notifier.clone();
        let stop = Arc::new(AtomicBool::new(false));
        self.bus_stop = stop.clone();

        // Watch the bus for errors / EOS on a background thread.
        self.bus_thread = Some(std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let Some(msg) = bus.timed_pop(gstreamer::ClockTime::from_mseconds(200)) else {
                    continue;
                };
                match msg.view() {
                    gstreamer::MessageView::Eos(_) => {
                        info!("GStreamer capture EOS");
                        if let Some(n) = &notifier {
                            n.notify(&SessionChange::interruption("source reached end of stream"));
                        }
                        break;
                    }
                    gstreamer::MessageView::Error(e) => {
                        error!("GStreamer capture error: {}", e.error());
                        if let Some(n) = &notifier {
                            n.notify(&SessionChange::interruption(e.error().to_string()));
                        }
                        break;
                    }
                    _ => {}
                }
            }
        }));
    }
}

impl CaptureSession for GstSession {
    fn begin_configuration(&mut self) {
        self.pending_input = None;
        self.pending_format = None;
    }

    fn set_input(&mut self, config: &CaptureConfiguration) -> Result<(), CaptureError> {
        self.ensure_built()?;
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
        let input = self.pending_input.take().or_else(|| self.input.clone());
        let format = self.pending_format.take().or(self.format);
        let (Some(input), Some(format)) = (input, format) else {
            return Err(CaptureError::configuration("no input or output selected"));
        };

        let caps = VideoCapsBuilder::new()
            .format(video_format(format))
            .width(input.resolution.width as i32)
            .height(input.resolution.height as i32)
            .framerate(gstreamer::Fraction::new(input.frame_rate as i32, 1))
            .build();
        debug!("GStreamer caps (generation {}): {}", generation, caps);

        let built = self.ensure_built()?;
        built.capsfilter.set_property("caps", caps);

        {
            let mut committed = self.committed.lock();
            let previous = committed.map_or(0, |c| c.generation);
            *committed = Some(Committed {
                generation,
                previous,
                format,
                width: input.resolution.width,
                height: input.resolution.height,
            });
        }
        self.input = Some(input);
        self.format = Some(format);
        Ok(())
    }

    fn start_running(&mut self) -> Result<(), CaptureError> {
        if self.running {
            return Ok(());
        }
        let built = self.ensure_built()?;
        built
            .pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| CaptureError::Backend(format!("set Playing: {e}")))?;
        self.running = true;
        self.spawn_bus_watch();
        info!("GStreamer capture running ({})", self.source);
        Ok(())
    }

    fn stop_running(&mut self) {
        if !self.running {
            return;
        }
        self.bus_stop.store(true, Ordering::Release);
        // Wake the bus watch instead of waiting out its poll timeout.
        if let Some(bus) = self.built.as_ref().and_then(|b| b.pipeline.bus()) {
            let wake = gstreamer::message::Application::new(gstreamer::Structure::new_empty("stop"));
            let _ = bus.post(wake);
        }
        if let Some(thread) = self.bus_thread.take() {
            let _ = thread.join();
        }
        if let Some(built) = &self.built {
            let _ = built.pipeline.set_state(gstreamer::State::Null);
        }
        self.running = false;
        info!("GStreamer capture stopped");
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for GstSession {
    fn drop(&mut self) {
        self.stop_running();
    }
}

// ── Pipeline construction ────────────────────────────────────────────────────

fn video_format(format: PixelFormat) -> VideoFormat {
    match format {
        PixelFormat::Nv12 | PixelFormat::Nv12VideoRange => VideoFormat::Nv12,
        PixelFormat::I420 => VideoFormat::I420,
        PixelFormat::Bgra => VideoFormat::Bgra,
        PixelFormat::Argb => VideoFormat::Argb,
    }
}

/// Map what GStreamer negotiated back to our format, preferring the
/// committed one when both describe the same layout.
fn pixel_format(format: VideoFormat, committed: Option<PixelFormat>) -> Option<PixelFormat> {
    if let Some(committed) = committed.filter(|c| video_format(*c) == format) {
        return Some(committed);
    }
    match format {
        VideoFormat::Nv12 => Some(PixelFormat::Nv12),
        VideoFormat::I420 => Some(PixelFormat::I420),
        VideoFormat::Bgra => Some(PixelFormat::Bgra),
        VideoFormat::Argb => Some(PixelFormat::Argb),
        _ => None,
    }
}

/// Generation a sample with this layout was produced under.
///
/// Caps changes travel with the buffers, so a sample that still carries the
/// previous layout predates the latest commit. Commits that keep the layout
/// (frame rate only) cannot be told apart and take the current generation.
fn sample_generation(committed: &Committed, format: VideoFormat, width: u32, height: u32) -> u64 {
    let matches = video_format(committed.format) == format
        && committed.width == width
        && committed.height == height;
    if matches {
        committed.generation
    } else {
        committed.previous
    }
}

fn build_pipeline(
    source: &str,
    handler: Arc<Mutex<Option<FrameHandler>>>,
    committed: Arc<Mutex<Option<Committed>>>,
) -> anyhow::Result<Built> {
    let desc = format!(
        "{source} \
         ! videoconvert ! videoscale ! videorate \
         ! capsfilter name=caps \
         ! appsink name=sink max-buffers=2 drop=true sync=false emit-signals=false"
    );
    debug!("GStreamer pipeline: {}", desc);

    let pipeline = gstreamer::parse::launch(&desc)
        .context("Parsing GStreamer pipeline")?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| anyhow::anyhow!("Expected Pipeline element"))?;

    let capsfilter = pipeline.by_name("caps").context("Finding capsfilter 'caps'")?;

    let appsink: AppSink = pipeline
        .by_name("sink")
        .context("Finding appsink 'sink'")?
        .downcast::<AppSink>()
        .map_err(|_| anyhow::anyhow!("Expected AppSink"))?;

    appsink.set_callbacks(
        AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gstreamer::FlowError::Error)?;
                let caps = sample.caps().ok_or(gstreamer::FlowError::NotNegotiated)?;
                let info = VideoInfo::from_caps(caps).map_err(|_| gstreamer::FlowError::NotNegotiated)?;
                // Nothing committed yet: no consumer expects this sample.
                let Some(layout) = *committed.lock() else {
                    return Ok(gstreamer::FlowSuccess::Ok);
                };
                let Some(format) = pixel_format(info.format(), Some(layout.format)) else {
                    return Err(gstreamer::FlowError::NotNegotiated);
                };

                let capture_time = Duration::from_nanos(buffer.pts().map(|t| t.nseconds()).unwrap_or(0));
                let map = buffer.map_readable().map_err(|_| gstreamer::FlowError::Error)?;
                let stride = info.stride().first().copied().unwrap_or(0).max(0) as usize;
                let data = Bytes::copy_from_slice(map.as_slice());

                let frame = CapturedFrame {
                    buffer: PixelBuffer::new(data, format, info.width(), info.height()).with_stride(stride),
                    rotation: Rotation::Deg0,
                    capture_time,
                };
                let connection = ConnectionContext {
                    generation: sample_generation(&layout, info.format(), info.width(), info.height()),
                };
                if let Some(handler) = handler.lock().clone() {
                    handler.deliver(&frame, &connection);
                }
                Ok(gstreamer::FlowSuccess::Ok)
            })
            .build(),
    );

    Ok(Built { pipeline, capsfilter })
}
