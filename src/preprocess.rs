//! Frame-to-tensor conversion: resize to the model input and repack
//! interleaved RGB bytes into planar NCHW floats.

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, RgbImage};
use serde::Deserialize;

use crate::detect::{Tensor, TensorShape};
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// Channel order and value scale the model expects.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InputLayout {
    pub order: ChannelOrder,
    /// Multiplier applied to each 0..=255 byte.
    pub scale: f32,
}

impl Default for InputLayout {
    fn default() -> Self {
        Self {
            order: ChannelOrder::Rgb,
            scale: 1.0 / 255.0,
        }
    }
}

pub fn frame_to_tensor(frame: &Frame, shape: TensorShape, layout: InputLayout) -> Result<Tensor> {
    let [n, c, h, w] = shape;
    if n != 1 || c != 3 {
        return Err(anyhow!(
            "model input {:?} is not a single 3-channel image",
            shape
        ));
    }
    let (w32, h32) = (
        u32::try_from(w).context("model input width")?,
        u32::try_from(h).context("model input height")?,
    );

    let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
        .ok_or_else(|| anyhow!("frame {} has inconsistent dimensions", frame.index))?;
    let resized = if (frame.width, frame.height) == (w32, h32) {
        image
    } else {
        image::imageops::resize(&image, w32, h32, FilterType::Triangle)
    };

    let plane = w * h;
    let mut data = vec![0.0f32; 3 * plane];
    for (i, pixel) in resized.pixels().enumerate() {
        let [r, g, b] = pixel.0;
        let ordered = match layout.order {
            ChannelOrder::Rgb => [r, g, b],
            ChannelOrder::Bgr => [b, g, r],
        };
        for (channel, value) in ordered.iter().enumerate() {
            data[channel * plane + i] = *value as f32 * layout.scale;
        }
    }
    Tensor::new(shape, data)
}
