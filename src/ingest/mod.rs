//! Frame sources.
//!
//! - Video files (feature: ingest-file-ffmpeg)
//! - Still images (`.jpg`, `.jpeg`, `.bmp`, `.png`)
//! - The live camera, `CAM` (feature: ingest-v4l2)
//! - Synthetic `stub://` scenes for tests and dry runs
//!
//! A source yields frames in order and `Ok(None)` once exhausted. An `Err`
//! from `next_frame` is a per-frame failure; the caller decides whether to go
//! on. Sources are not restartable; open a new one instead.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod still;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::error::PresenceError;
use crate::frame::Frame;

pub use file::FileSource;
pub use still::StillImageSource;
pub use synthetic::{OccupiedSpan, SyntheticScene};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{CameraConfig, CameraSource};

/// Input value that selects the live camera.
pub const CAMERA_INPUT: &str = "CAM";
pub const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";

const STILL_IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "bmp", "png"];

pub trait FrameSource {
    /// Human-readable origin, for logs.
    fn describe(&self) -> String;

    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn stats(&self) -> SourceStats;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub frames_failed: u64,
}

/// What `--input` resolved to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaInput {
    Camera { device: String },
    Synthetic { name: String },
    Image(PathBuf),
    Video(PathBuf),
}

impl MediaInput {
    pub fn parse(input: &str) -> Result<Self, PresenceError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(PresenceError::Configuration("input is empty".into()));
        }
        if input == CAMERA_INPUT {
            return Ok(Self::Camera {
                device: DEFAULT_CAMERA_DEVICE.to_string(),
            });
        }
        if let Some(name) = input.strip_prefix("stub://") {
            return Ok(Self::Synthetic {
                name: name.to_string(),
            });
        }
        if input.contains("://") {
            return Err(PresenceError::Configuration(format!(
                "only local inputs are supported, got {}",
                input
            )));
        }

        let path = PathBuf::from(input);
        if is_still_image(&path) {
            return Ok(Self::Image(path));
        }
        if !path.is_file() {
            return Err(PresenceError::SourceUnavailable(format!(
                "input file {} does not exist",
                path.display()
            )));
        }
        Ok(Self::Video(path))
    }

    /// Single-image mode writes one annotated file instead of a frame stream.
    pub fn is_single_image(&self) -> bool {
        matches!(self, Self::Image(_))
    }
}

impl std::fmt::Display for MediaInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Camera { device } => write!(f, "camera {}", device),
            Self::Synthetic { name } => write!(f, "stub://{}", name),
            Self::Image(path) => write!(f, "image {}", path.display()),
            Self::Video(path) => write!(f, "video {}", path.display()),
        }
    }
}

fn is_still_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            STILL_IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Open `input`. Any failure to open is reported as `SourceUnavailable`.
pub fn open_source(input: &MediaInput) -> Result<Box<dyn FrameSource>, PresenceError> {
    let unavailable = |e: anyhow::Error| PresenceError::SourceUnavailable(format!("{:#}", e));
    let source: Box<dyn FrameSource> = match input {
        MediaInput::Synthetic { name } => {
            Box::new(FileSource::synthetic(SyntheticScene::named(name)))
        }
        MediaInput::Image(path) => Box::new(StillImageSource::open(path).map_err(unavailable)?),
        MediaInput::Video(path) => Box::new(FileSource::open(path).map_err(unavailable)?),
        MediaInput::Camera { device } => open_camera(device)?,
    };
    log::info!("opened {}", source.describe());
    Ok(source)
}

#[cfg(feature = "ingest-v4l2")]
fn open_camera(device: &str) -> Result<Box<dyn FrameSource>, PresenceError> {
    let config = CameraConfig {
        device: device.to_string(),
        ..CameraConfig::default()
    };
    CameraSource::open(config)
        .map(|source| Box::new(source) as Box<dyn FrameSource>)
        .map_err(|e| PresenceError::SourceUnavailable(format!("{:#}", e)))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_camera(device: &str) -> Result<Box<dyn FrameSource>, PresenceError> {
    Err(PresenceError::SourceUnavailable(format!(
        "camera {} requires the ingest-v4l2 feature",
        device
    )))
}
