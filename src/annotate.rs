//! Detection overlays and annotated frame output.
//!
//! Boxes need nothing but the frame. The inference-time label needs a
//! TrueType font, loaded at runtime from a configured path or a handful of
//! common system locations; without one the label is left off.

use std::path::Path;
use std::time::Duration;

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::rect::Rect;

use crate::detect::Detection;
use crate::frame::Frame;

pub const BOX_COLOR: [u8; 3] = [255, 55, 0];
pub const LABEL_COLOR: [u8; 3] = [0, 51, 102];

const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
];

/// Font used for the per-frame inference-time label.
pub struct LabelFont {
    font: FontVec,
}

impl LabelFont {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|_| anyhow!("{} is not a TrueType/OpenType font", path.display()))?;
        Ok(Self { font })
    }

    /// First loadable font among the usual system locations.
    pub fn discover() -> Option<Self> {
        SYSTEM_FONTS
            .iter()
            .map(Path::new)
            .filter(|path| path.is_file())
            .find_map(|path| match Self::load(path) {
                Ok(font) => {
                    log::debug!("label font {}", path.display());
                    Some(font)
                }
                Err(err) => {
                    log::debug!("skipping font: {:#}", err);
                    None
                }
            })
    }
}

impl std::fmt::Debug for LabelFont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LabelFont")
    }
}

pub fn inference_label(elapsed: Duration) -> String {
    format!("Time for Inference: {:.2}ms", elapsed.as_secs_f64() * 1000.0)
}

fn frame_canvas(frame: &mut Frame) -> Result<ImageBuffer<Rgb<u8>, &mut [u8]>> {
    let (width, height, index) = (frame.width, frame.height, frame.index);
    ImageBuffer::<Rgb<u8>, &mut [u8]>::from_raw(width, height, frame.pixels_mut())
        .ok_or_else(|| anyhow!("frame {} has inconsistent dimensions", index))
}

/// Outline each detection on the frame in place.
pub fn draw_detections<'a, I>(frame: &mut Frame, detections: I) -> Result<()>
where
    I: IntoIterator<Item = &'a Detection>,
{
    let mut img = frame_canvas(frame)?;
    for detection in detections {
        let bbox = detection.bbox;
        let rect = Rect::at(bbox.xmin, bbox.ymin)
            .of_size(bbox.width().max(1) as u32, bbox.height().max(1) as u32);
        imageproc::drawing::draw_hollow_rect_mut(&mut img, rect, Rgb(BOX_COLOR));
    }
    Ok(())
}

/// Write `text` near the bottom-left corner, sized to the frame height.
pub fn draw_label(frame: &mut Frame, font: &LabelFont, text: &str) -> Result<()> {
    let height = frame.height;
    let scale = PxScale::from((height as f32 / 18.0).max(12.0));
    let x = (frame.width / 20) as i32;
    let y = (height as i32 - (height / 10) as i32 - scale.y as i32).max(0);
    let mut img = frame_canvas(frame)?;
    imageproc::drawing::draw_text_mut(&mut img, Rgb(LABEL_COLOR), x, y, scale, &font.font, text);
    Ok(())
}

/// Encode the frame to `path`; the format follows the extension.
pub fn write_image(frame: &Frame, path: &Path) -> Result<()> {
    let img = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
        .ok_or_else(|| anyhow!("frame {} has inconsistent dimensions", frame.index))?;
    img.save(path)
        .with_context(|| format!("write annotated image {}", path.display()))
}
