//! Local video file frame source.
//!
//! Real files decode through FFmpeg when built with `ingest-file-ffmpeg`.
//! `stub://` inputs are served by a synthetic scene so the whole pipeline can
//! run without media or codecs.

use std::path::Path;

use anyhow::Result;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::synthetic::{SyntheticFrames, SyntheticScene};
use super::{FrameSource, SourceStats};
use crate::frame::Frame;

pub struct FileSource {
    backend: FileBackend,
    stats: SourceStats,
}

enum FileBackend {
    Synthetic(SyntheticFrames),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
    Closed,
}

impl FileSource {
    pub fn synthetic(scene: SyntheticScene) -> Self {
        Self {
            backend: FileBackend::Synthetic(SyntheticFrames::new(scene)),
            stats: SourceStats::default(),
        }
    }

    #[cfg(feature = "ingest-file-ffmpeg")]
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            backend: FileBackend::Ffmpeg(FfmpegFileSource::open(path)?),
            stats: SourceStats::default(),
        })
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    pub fn open(path: &Path) -> Result<Self> {
        Err(anyhow::anyhow!(
            "decoding {} requires the ingest-file-ffmpeg feature",
            path.display()
        ))
    }
}

impl FrameSource for FileSource {
    fn describe(&self) -> String {
        match &self.backend {
            FileBackend::Synthetic(frames) => {
                let scene = frames.scene();
                format!(
                    "stub:// scene {}x{} @ {} fps",
                    scene.width, scene.height, scene.fps
                )
            }
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => format!("{} (ffmpeg)", source.path().display()),
            FileBackend::Closed => "closed file source".to_string(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let result = match &mut self.backend {
            FileBackend::Synthetic(frames) => frames.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
            FileBackend::Closed => Ok(None),
        };
        match &result {
            Ok(Some(_)) => self.stats.frames_captured += 1,
            Ok(None) => {}
            Err(_) => self.stats.frames_failed += 1,
        }
        result
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }

    fn close(&mut self) -> Result<()> {
        if !matches!(self.backend, FileBackend::Closed) {
            log::debug!(
                "closing {} after {} frames",
                self.describe(),
                self.stats.frames_captured
            );
        }
        self.backend = FileBackend::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::OccupiedSpan;

    #[test]
    fn synthetic_source_ends_and_counts() -> Result<()> {
        let mut source = FileSource::synthetic(SyntheticScene {
            frames: Some(3),
            occupied: vec![OccupiedSpan::new(1..2, 1)],
            ..SyntheticScene::default()
        });
        let mut indices = Vec::new();
        while let Some(frame) = source.next_frame()? {
            assert_eq!((frame.width, frame.height), (320, 240));
            indices.push(frame.index);
        }
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(source.stats().frames_captured, 3);
        Ok(())
    }

    #[test]
    fn closed_source_yields_nothing() -> Result<()> {
        let mut source = FileSource::synthetic(SyntheticScene::default());
        source.close()?;
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    #[test]
    fn video_files_need_ffmpeg() {
        assert!(FileSource::open(Path::new("clip.mp4")).is_err());
    }
}
