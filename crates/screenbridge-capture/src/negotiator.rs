//! Pixel-format negotiation between the capture session and the consumer.
//!
//! # Rules
//!
//! 1. The caller's preferred format wins if the consumer supports it.
//! 2. Otherwise the canonical default (bi-planar YUV 4:2:0, full range).
//! 3. If the consumer does not list the default either, the consumer's
//!    best-ranked format (see [`PixelFormat`] ordering), so the result is
//!    always something the consumer declared.
//!
//! An empty supported set is a contract violation and yields
//! [`CaptureError::Configuration`].

use std::collections::BTreeSet;

use screenbridge_core::{CaptureError, PixelFormat};

/// Most broadly compatible format for the transport pipeline.
pub const CANONICAL_FORMAT: PixelFormat = PixelFormat::Nv12;

/// Pure, deterministic format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatNegotiator {
    canonical: PixelFormat,
}

impl Default for FormatNegotiator {
    fn default() -> Self {
        Self { canonical: CANONICAL_FORMAT }
    }
}

impl FormatNegotiator {
    pub fn with_canonical(canonical: PixelFormat) -> Self {
        Self { canonical }
    }

    pub fn canonical(&self) -> PixelFormat {
        self.canonical
    }

    pub fn select_format(
        &self,
        preferred: Option<PixelFormat>,
        supported: &BTreeSet<PixelFormat>,
    ) -> Result<PixelFormat, CaptureError> {
        if supported.is_empty() {
            return Err(CaptureError::configuration(
                "consumer declared no supported pixel formats",
            ));
        }
        if let Some(format) = preferred.filter(|f| supported.contains(f)) {
            return Ok(format);
        }
        if supported.contains(&self.canonical) {
            return Ok(self.canonical);
        }
        // Non-empty, so `first` is the best-ranked declared format.
        supported
            .first()
            .copied()
            .ok_or_else(|| CaptureError::configuration("no supported pixel format"))
    }
}
