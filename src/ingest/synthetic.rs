//! Synthetic scenes.
//!
//! Each person in view is painted as a saturated green rectangle on a grey
//! background, which the stub engine's scene mode reports as one detection.
//! Timestamps follow a virtual clock (`index / fps` after the first frame) so
//! visit durations are reproducible regardless of how fast frames are pulled.

use std::ops::Range;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::frame::{rgb_len, Frame};

const BACKGROUND: [u8; 3] = [90, 90, 90];
const MARKER: [u8; 3] = [0, 255, 0];

/// `people` persons are in view for every frame index in `frames`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OccupiedSpan {
    pub frames: Range<u64>,
    pub people: u32,
}

impl OccupiedSpan {
    pub fn new(frames: Range<u64>, people: u32) -> Self {
        Self { frames, people }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticScene {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// `None` streams forever.
    pub frames: Option<u64>,
    pub occupied: Vec<OccupiedSpan>,
    /// Every n-th frame fails to decode.
    pub dropout_every: Option<u64>,
}

impl Default for SyntheticScene {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 10,
            frames: Some(300),
            occupied: vec![
                OccupiedSpan::new(20..80, 1),
                OccupiedSpan::new(50..70, 1),
                OccupiedSpan::new(150..220, 1),
            ],
            dropout_every: None,
        }
    }
}

impl SyntheticScene {
    /// Scene for a `stub://<name>` input. `empty` has nobody in it, `endless`
    /// never ends; anything else is the default scene.
    pub fn named(name: &str) -> Self {
        match name {
            "empty" => Self {
                occupied: Vec::new(),
                ..Self::default()
            },
            "endless" => Self {
                frames: None,
                ..Self::default()
            },
            _ => Self::default(),
        }
    }

    /// People in view at `index`.
    pub fn people_at(&self, index: u64) -> u32 {
        self.occupied
            .iter()
            .filter(|span| span.frames.contains(&index))
            .map(|span| span.people)
            .sum()
    }

    fn marker_geometry(&self) -> (u32, u32) {
        let marker_w = (self.width / 10).max(2);
        let gap = (self.width / 20).max(2);
        (marker_w, gap)
    }

    /// Most people that fit side by side without touching.
    pub fn capacity(&self) -> u32 {
        let (marker_w, gap) = self.marker_geometry();
        self.width.saturating_sub(gap) / (marker_w + gap)
    }

    pub(crate) fn render(&self, index: u64) -> Result<Vec<u8>> {
        let mut pixels = Vec::with_capacity(rgb_len(self.width, self.height)?);
        for _ in 0..(self.width as usize * self.height as usize) {
            pixels.extend_from_slice(&BACKGROUND);
        }

        let people = self.people_at(index).min(self.capacity());
        let (marker_w, gap) = self.marker_geometry();
        let top = self.height / 6;
        let bottom = self.height - self.height / 6;
        for person in 0..people {
            let left = gap + person * (marker_w + gap);
            for y in top..bottom {
                for x in left..left + marker_w {
                    let offset = (y as usize * self.width as usize + x as usize) * 3;
                    pixels[offset..offset + 3].copy_from_slice(&MARKER);
                }
            }
        }
        Ok(pixels)
    }

    fn is_dropout(&self, index: u64) -> bool {
        self.dropout_every
            .is_some_and(|every| every > 0 && (index + 1) % every == 0)
    }
}

/// Iterates a `SyntheticScene`.
pub(crate) struct SyntheticFrames {
    scene: SyntheticScene,
    origin: Option<Instant>,
    next_index: u64,
}

impl SyntheticFrames {
    pub(crate) fn new(scene: SyntheticScene) -> Self {
        Self {
            scene,
            origin: None,
            next_index: 0,
        }
    }

    pub(crate) fn scene(&self) -> &SyntheticScene {
        &self.scene
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        let index = self.next_index;
        if self.scene.frames.is_some_and(|total| index >= total) {
            return Ok(None);
        }
        self.next_index += 1;

        let origin = *self.origin.get_or_insert_with(Instant::now);
        if self.scene.is_dropout(index) {
            return Err(anyhow!("synthetic frame {} failed to decode", index));
        }

        let fps = self.scene.fps.max(1);
        let at = origin + Duration::from_secs_f64(index as f64 / fps as f64);
        let pixels = self.scene.render(index)?;
        Frame::with_instant(pixels, self.scene.width, self.scene.height, index, at).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_overlapping_spans() {
        let scene = SyntheticScene::default();
        assert_eq!(scene.people_at(0), 0);
        assert_eq!(scene.people_at(20), 1);
        assert_eq!(scene.people_at(60), 2);
        assert_eq!(scene.people_at(80), 0);
    }

    #[test]
    fn paints_one_marker_per_person() -> Result<()> {
        let scene = SyntheticScene {
            width: 40,
            height: 12,
            occupied: vec![OccupiedSpan::new(0..1, 2)],
            ..SyntheticScene::default()
        };
        let pixels = scene.render(0)?;
        let row = 6 * 40 * 3;
        let greens: Vec<bool> = (0..40)
            .map(|x| pixels[row + x * 3 + 1] == 255 && pixels[row + x * 3] == 0)
            .collect();
        let runs = greens
            .windows(2)
            .filter(|pair| !pair[0] && pair[1])
            .count();
        assert_eq!(runs, 2);
        Ok(())
    }

    #[test]
    fn timestamps_follow_frame_rate() -> Result<()> {
        let mut frames = SyntheticFrames::new(SyntheticScene {
            fps: 4,
            frames: Some(5),
            ..SyntheticScene::default()
        });
        let first = frames.next_frame()?.expect("frame 0");
        let mut last = None;
        while let Some(frame) = frames.next_frame()? {
            last = Some(frame);
        }
        let last = last.expect("frame 4");
        assert_eq!(last.index, 4);
        assert_eq!(last.captured_at - first.captured_at, Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn dropouts_fail_without_ending_the_stream() {
        let mut frames = SyntheticFrames::new(SyntheticScene {
            frames: Some(4),
            dropout_every: Some(2),
            ..SyntheticScene::default()
        });
        assert!(frames.next_frame().is_ok());
        assert!(frames.next_frame().is_err());
        let frame = frames.next_frame().unwrap().unwrap();
        assert_eq!(frame.index, 2);
        assert!(frames.next_frame().is_err());
        assert!(frames.next_frame().unwrap().is_none());
    }
}
