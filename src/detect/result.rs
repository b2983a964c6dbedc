use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::frame::FrameRef;

/// Values per detection row in an SSD `DetectionOutput` blob:
/// `[image_id, label, confidence, xmin, ymin, xmax, ymax]`.
pub const SSD_ROW_LEN: usize = 7;

/// Box in pixel coordinates of the submitted frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub xmin: i32,
    pub ymin: i32,
    pub xmax: i32,
    pub ymax: i32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        (self.xmax - self.xmin).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.ymax - self.ymin).max(0) as u32
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: i32,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Detections for one frame, as produced by one inference request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub request_id: usize,
    pub frame_index: u64,
    pub detections: Vec<Detection>,
    /// Submit-to-ready time of the request.
    pub inference_time: Duration,
}

impl DetectionResult {
    /// Parse a flattened SSD output blob. Rows stop at the first negative
    /// `image_id`; coordinates are denormalized against `frame`.
    pub fn from_ssd_output(raw: &[f32], request_id: usize, frame: FrameRef) -> Result<Self> {
        if raw.len() % SSD_ROW_LEN != 0 {
            return Err(anyhow!(
                "detection output has {} values, not a multiple of {}",
                raw.len(),
                SSD_ROW_LEN
            ));
        }
        let detections = raw
            .chunks_exact(SSD_ROW_LEN)
            .take_while(|row| row[0] >= 0.0)
            .map(|row| Detection {
                label: row[1] as i32,
                confidence: row[2],
                bbox: BoundingBox {
                    xmin: denormalize(row[3], frame.width),
                    ymin: denormalize(row[4], frame.height),
                    xmax: denormalize(row[5], frame.width),
                    ymax: denormalize(row[6], frame.height),
                },
            })
            .collect();
        Ok(Self {
            request_id,
            frame_index: frame.index,
            detections,
            inference_time: Duration::ZERO,
        })
    }

    /// Detections whose confidence is strictly above `threshold`.
    pub fn above(&self, threshold: f32) -> impl Iterator<Item = &Detection> + '_ {
        self.detections
            .iter()
            .filter(move |d| d.confidence > threshold)
    }

    /// Number of boxes above `threshold`. Overlapping boxes are not merged.
    pub fn count_above(&self, threshold: f32) -> usize {
        self.above(threshold).count()
    }
}

fn denormalize(value: f32, extent: u32) -> i32 {
    (value.clamp(0.0, 1.0) * extent as f32) as i32
}
