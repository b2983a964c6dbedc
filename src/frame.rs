//! Decoded frames.
//!
//! - `Frame`: one interleaved RGB24 image with its capture index and instant.
//! - `FrameRef`: the metadata an inference slot keeps about the frame it was
//!   submitted for (dimensions are needed to denormalize detector boxes).

use anyhow::{anyhow, Result};
use std::time::Instant;

/// One decoded RGB24 frame.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Zero-based position in the stream.
    pub index: u64,
    /// When the frame left the decoder.
    pub captured_at: Instant,
}

impl Frame {
    /// Wrap interleaved RGB bytes. The length must be `width * height * 3`.
    pub fn new(data: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        Self::with_instant(data, width, height, index, Instant::now())
    }

    pub fn with_instant(
        data: Vec<u8>,
        width: u32,
        height: u32,
        index: u64,
        captured_at: Instant,
    ) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            index,
            captured_at,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }

    pub fn frame_ref(&self) -> FrameRef {
        FrameRef {
            index: self.index,
            width: self.width,
            height: self.height,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// What an inference slot remembers about its submitted frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRef {
    pub index: u64,
    pub width: u32,
    pub height: u32,
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
