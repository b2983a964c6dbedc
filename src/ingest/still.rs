//! Single still image as a one-frame source.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

pub struct StillImageSource {
    path: PathBuf,
    frame: Option<Frame>,
    stats: SourceStats,
}

impl StillImageSource {
    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("read image {}", path.display()))?
            .to_rgb8();
        let (width, height) = image.dimensions();
        let frame = Frame::new(image.into_raw(), width, height, 0)?;
        Ok(Self {
            path: path.to_path_buf(),
            frame: Some(frame),
            stats: SourceStats::default(),
        })
    }
}

impl FrameSource for StillImageSource {
    fn describe(&self) -> String {
        format!("image {}", self.path.display())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.frame.take();
        if frame.is_some() {
            self.stats.frames_captured += 1;
        }
        Ok(frame)
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }

    fn close(&mut self) -> Result<()> {
        self.frame = None;
        Ok(())
    }
}
