//! Screen capture session core for ScreenBridge.
//!
//! Bridges a platform capture session to a real-time video consumer:
//! negotiates the pixel format, runs the session lifecycle on a dedicated
//! worker, and relays every captured frame with a rebased, monotonic
//! timestamp.
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`negotiator`] | picks the output pixel format |
//! | [`controller`] | Idle/Starting/Running/Stopping state machine, owns the session |
//! | [`relay`] | per-frame path from capture callback to consumer |
//! | [`reconfigure`] | device/format/orientation/interruption handling |
//! | [`backends`] | synthetic and GStreamer session implementations |
//!
//! # Usage
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use screenbridge_capture::{CaptureController, VideoFrameConsumer, VideoFrame};
//! # use screenbridge_capture::backends::SyntheticSession;
//! # use screenbridge_core::{CaptureConfiguration, PixelFormat};
//! # struct Sink;
//! # impl VideoFrameConsumer for Sink {
//! #     fn supported_pixel_formats(&self) -> std::collections::BTreeSet<PixelFormat> {
//! #         [PixelFormat::Nv12].into_iter().collect()
//! #     }
//! #     fn on_frame(&self, _frame: VideoFrame) {}
//! # }
//! # async fn example() -> Result<(), screenbridge_core::CaptureError> {
//! let config = CaptureConfiguration::default();
//! let controller = CaptureController::new(SyntheticSession::new(), Arc::new(Sink), config.clone())?;
//! controller.start(config).await;
//! // frames flow to Sink::on_frame on the session thread …
//! controller.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! start/stop ──► CaptureController ──► worker thread ──► CaptureSession
//!                                         │                   │ platform thread
//!                                  FormatNegotiator           ▼
//!                                                       FrameHandler
//!                                                             │
//!                                                        FrameRelay ──► VideoFrameConsumer
//! ChangeNotifier ──► ReconfigurationHandler ──► worker thread
//! ```

pub mod backends;
pub mod consumer;
pub mod controller;
pub mod frame;
pub mod lifecycle;
pub mod negotiator;
pub mod reconfigure;
pub mod relay;
pub mod session;
pub mod stats;

pub use consumer::VideoFrameConsumer;
pub use controller::{CaptureController, Completion};
pub use frame::{CapturedFrame, ConnectionContext, PixelBuffer, VideoFrame};
pub use lifecycle::LifecycleState;
pub use negotiator::{FormatNegotiator, CANONICAL_FORMAT};
pub use reconfigure::{ChangeKind, ChangeNotifier, ReconfigurationHandler, SessionChange, Subscription};
pub use relay::FrameRelay;
pub use session::{CaptureSession, FrameHandler};
pub use stats::{FpsCounter, FrameStats, StatsSnapshot};
