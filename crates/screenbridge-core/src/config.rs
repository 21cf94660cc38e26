use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::CaptureError;
use crate::types::{PixelFormat, Resolution};

/// Desired capture parameters supplied by the caller of start.
///
/// Treated as immutable once capture is running; a different configuration
/// needs a reconfiguration or a stop/start cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfiguration {
    pub resolution: Resolution,
    #[serde(alias = "frameRate")]
    pub frame_rate: u32,
    /// Pixel format the caller would like; `None` means no preference.
    #[serde(alias = "preferredFormat")]
    pub preferred_format: Option<PixelFormat>,
    /// Zero-based display to capture.
    #[serde(alias = "displayIndex")]
    pub display_index: u8,
}

impl Default for CaptureConfiguration {
    fn default() -> Self {
        Self {
            resolution: Resolution::HD,
            frame_rate: 30,
            preferred_format: None,
            display_index: 0,
        }
    }
}

impl CaptureConfiguration {
    /// 1080p60, the equivalent of a "high" session preset.
    pub fn high() -> Self {
        Self {
            resolution: Resolution::FHD,
            frame_rate: 60,
            ..Default::default()
        }
    }

    pub fn with_preferred_format(mut self, format: PixelFormat) -> Self {
        self.preferred_format = Some(format);
        self
    }

    /// Nominal spacing between frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.frame_rate.max(1) as u64)
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.resolution.is_empty() {
            return Err(CaptureError::configuration(format!(
                "resolution {} has a zero dimension",
                self.resolution
            )));
        }
        if self.frame_rate == 0 {
            return Err(CaptureError::configuration("frame rate must be non-zero"));
        }
        Ok(())
    }

    /// Load and validate a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        debug!("Loaded capture configuration from {}: {:?}", path.display(), config);
        Ok(config)
    }
}
