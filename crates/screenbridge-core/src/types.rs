use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CaptureError;

// MARK: - Resolution

/// Capture resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self { width: 1280, height: 720 };
    pub const FHD: Self = Self { width: 1920, height: 1080 };
    pub const QHD: Self = Self { width: 2560, height: 1440 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - PixelFormat

/// Pixel formats understood by both the capture side and the transport
/// pipeline. Each maps to a four-character platform code.
///
/// Ordering is the negotiator's fallback ranking: earlier variants are
/// cheaper for the transport to ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Bi-planar YUV 4:2:0, full range (`420f`).
    Nv12,
    /// Bi-planar YUV 4:2:0, video range (`420v`).
    Nv12VideoRange,
    /// Tri-planar YUV 4:2:0 (`y420`).
    I420,
    /// 32-bit BGRA, 8 bits per channel (`BGRA`).
    Bgra,
    /// 32-bit ARGB, 8 bits per channel.
    Argb,
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    ((code[0] as u32) << 24) | ((code[1] as u32) << 16) | ((code[2] as u32) << 8) | code[3] as u32
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 5] = [
        PixelFormat::Nv12,
        PixelFormat::Nv12VideoRange,
        PixelFormat::I420,
        PixelFormat::Bgra,
        PixelFormat::Argb,
    ];

    /// Four-character platform code for this format.
    pub const fn fourcc(self) -> u32 {
        match self {
            Self::Nv12 => fourcc(b"420f"),
            Self::Nv12VideoRange => fourcc(b"420v"),
            Self::I420 => fourcc(b"y420"),
            Self::Bgra => fourcc(b"BGRA"),
            // kCVPixelFormatType_32ARGB is the plain integer 32, not a text code.
            Self::Argb => 0x0000_0020,
        }
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.fourcc() == code)
    }

    /// Whether the luma and chroma samples live in separate planes.
    pub fn is_planar(self) -> bool {
        matches!(self, Self::Nv12 | Self::Nv12VideoRange | Self::I420)
    }

    /// Bytes per row of the first plane, without padding.
    pub fn min_stride(self, width: u32) -> usize {
        if self.is_planar() {
            width as usize
        } else {
            width as usize * 4
        }
    }

    /// Minimum number of bytes for a tightly packed `width × height` image.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        if self.is_planar() {
            // 4:2:0 chroma is subsampled both ways; odd sizes round up.
            w * h + 2 * w.div_ceil(2) * h.div_ceil(2)
        } else {
            w * h * 4
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        if code <= 0xFF {
            return write!(f, "{code:#04x}");
        }
        let bytes = code.to_be_bytes();
        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

impl FromStr for PixelFormat {
    type Err = CaptureError;

    /// Accepts the four-character code (`420f`, `BGRA`, …) or a common name
    /// (`nv12`, `i420`, `bgra`, `argb`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let format = match lower.as_str() {
            "420f" | "nv12" => Self::Nv12,
            "420v" | "nv12-video" | "nv12videorange" => Self::Nv12VideoRange,
            "y420" | "i420" => Self::I420,
            "bgra" => Self::Bgra,
            "argb" | "0x20" => Self::Argb,
            _ => {
                return Err(CaptureError::Configuration {
                    reason: format!("unknown pixel format '{s}'"),
                })
            }
        };
        Ok(format)
    }
}

// MARK: - Rotation

/// Clockwise rotation the consumer must apply to display a frame upright.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    #[serde(rename = "0")]
    Deg0,
    #[serde(rename = "90")]
    Deg90,
    #[serde(rename = "180")]
    Deg180,
    #[serde(rename = "270")]
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Whether width and height swap once the rotation is applied.
    pub fn is_transposed(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}
