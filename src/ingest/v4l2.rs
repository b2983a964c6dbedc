//! Live camera capture through V4L2.

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, SourceStats, DEFAULT_CAMERA_DEVICE};
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub device: String,
    /// Requested frame rate; 0 leaves the driver default.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_CAMERA_DEVICE.to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

#[self_referencing]
struct CaptureState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// Camera frames. The stream is infinite; it ends only on close.
pub struct CameraSource {
    config: CameraConfig,
    state: Option<CaptureState>,
    format: PixelFormat,
    width: u32,
    height: u32,
    next_index: u64,
    stats: SourceStats,
}

impl CameraSource {
    pub fn open(config: CameraConfig) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&config.device)
            .with_context(|| format!("open v4l2 device {}", config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("failed to set RGB3 on {}: {}", config.device, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "{} only offers {}, which cannot be converted to RGB",
                config.device,
                format.fourcc
            )
        })?;

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("failed to set fps on {}: {}", config.device, err);
            }
        }

        let state = CaptureStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "capturing {} ({}x{}, {:?})",
            config.device,
            format.width,
            format.height,
            pixel_format
        );
        Ok(Self {
            config,
            state: Some(state),
            format: pixel_format,
            width: format.width,
            height: format.height,
            next_index: 0,
            stats: SourceStats::default(),
        })
    }
}

impl FrameSource for CameraSource {
    fn describe(&self) -> String {
        format!("camera {} ({}x{})", self.config.device, self.width, self.height)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let Some(state) = self.state.as_mut() else {
            return Ok(None);
        };
        let (width, height, format) = (self.width, self.height, self.format);
        let captured = state.with_mut(|fields| -> Result<Vec<u8>> {
            let (buf, _meta) = fields.stream.next().context("capture v4l2 frame")?;
            normalize_to_rgb(buf, width, height, format)
        });
        let pixels = match captured {
            Ok(pixels) => pixels,
            Err(err) => {
                self.stats.frames_failed += 1;
                return Err(err);
            }
        };

        let index = self.next_index;
        self.next_index += 1;
        self.stats.frames_captured += 1;
        Frame::with_instant(pixels, width, height, index, Instant::now()).map(Some)
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }

    fn close(&mut self) -> Result<()> {
        if self.state.take().is_some() {
            log::info!("released {}", self.config.device);
        }
        Ok(())
    }
}
