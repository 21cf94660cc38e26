//! Platform session implementations.
//!
//! | Backend | Source | Availability |
//! |---------|--------|--------------|
//! | [`SyntheticSession`] | generated test pattern | always |
//! | `GstSession` | `videotestsrc` / `pipewiresrc` via GStreamer | feature `gstreamer` |

mod synthetic;
pub use synthetic::SyntheticSession;

#[cfg(feature = "gstreamer")]
mod gst;
#[cfg(feature = "gstreamer")]
pub use gst::GstSession;
