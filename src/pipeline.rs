//! Frame loop: source → preprocess → detector slots → tracker → sink.
//!
//! With one slot the loop is synchronous in effect: each frame is submitted
//! and then waited on before the next one is decoded. With `n` slots up to `n`
//! frames are in flight. Results are always taken from the oldest request, so
//! the tracker sees frames in capture order even when a later request
//! finishes first.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::annotate::{draw_detections, draw_label, inference_label, write_image, LabelFont};
use crate::detect::{DetectionResult, DetectorAdapter, InferenceRequest, SlotStatus, Wait};
use crate::error::PresenceError;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::preprocess::{frame_to_tensor, InputLayout};
use crate::presence::{PresenceTracker, TrackerConfig};
use crate::transport::{publish_events, EventSink, Topics};

pub const DEFAULT_PROB_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MAX_CONSECUTIVE_FRAME_ERRORS: u32 = 30;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to do with a frame that could not be decoded or inferred.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameErrorPolicy {
    /// Stop the run.
    #[default]
    Abort,
    /// Leave the tracker untouched for that frame.
    Skip,
    /// Step the tracker with a count of zero.
    #[serde(rename = "absent", alias = "treat_as_absent")]
    TreatAsAbsent,
}

impl FromStr for FrameErrorPolicy {
    type Err = PresenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            "absent" | "treat-as-absent" | "treat_as_absent" => Ok(Self::TreatAsAbsent),
            other => Err(PresenceError::Configuration(format!(
                "unknown frame error policy '{}' (expected abort, skip or absent)",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Detections must score strictly above this to count.
    pub prob_threshold: f32,
    pub tracker: TrackerConfig,
    pub topics: Topics,
    pub frame_errors: FrameErrorPolicy,
    /// Consecutive failed frames tolerated by `Skip` and `TreatAsAbsent`
    /// before the run aborts anyway. 0 means no limit.
    pub max_consecutive_frame_errors: u32,
    /// Longest single wait on a slot; bounds how late a stop is noticed.
    pub poll_interval: Duration,
    pub layout: InputLayout,
    /// Draw detection boxes on output frames.
    pub annotate: bool,
    pub health_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prob_threshold: DEFAULT_PROB_THRESHOLD,
            tracker: TrackerConfig::default(),
            topics: Topics::default(),
            frame_errors: FrameErrorPolicy::default(),
            max_consecutive_frame_errors: DEFAULT_MAX_CONSECUTIVE_FRAME_ERRORS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            layout: InputLayout::default(),
            annotate: true,
            health_interval: Duration::from_secs(10),
        }
    }
}

/// Where processed frames go.
pub enum FrameOutput {
    None,
    /// Raw RGB24 bytes of every frame, flushed per frame.
    Stream(Box<dyn Write + Send>),
    /// One encoded image, rewritten for each frame (single-image mode).
    Image(PathBuf),
}

impl std::fmt::Debug for FrameOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Image(path) => f.debug_tuple("Image").field(path).finish(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Interrupted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    /// Frames that reached the tracker.
    pub frames_processed: u64,
    /// Frames without a detection result.
    pub frames_skipped: u64,
    pub total_visits: u64,
    pub final_count: u32,
    pub mean_inference_latency: Option<Duration>,
    pub stop_reason: StopReason,
}

enum Pending {
    Inference { slot: usize, frame: Frame },
    Failed { at: Instant, error: anyhow::Error },
}

#[derive(Default)]
struct RunStats {
    frames_processed: u64,
    frames_skipped: u64,
    consecutive_errors: u32,
    latency_total: Duration,
    latency_samples: u32,
}

pub struct Pipeline {
    source: Box<dyn FrameSource>,
    adapter: DetectorAdapter,
    tracker: PresenceTracker,
    sink: Box<dyn EventSink>,
    output: FrameOutput,
    config: PipelineConfig,
    stop: Arc<AtomicBool>,
    stats: RunStats,
    last_capture: Option<Instant>,
    label_font: Option<LabelFont>,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        adapter: DetectorAdapter,
        sink: Box<dyn EventSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            adapter,
            tracker: PresenceTracker::new(config.tracker.clone()),
            sink,
            output: FrameOutput::None,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            stats: RunStats::default(),
            last_capture: None,
            label_font: None,
        }
    }

    pub fn with_output(mut self, output: FrameOutput) -> Self {
        self.output = output;
        self
    }

    /// Stamp each annotated frame with its inference time.
    pub fn with_label_font(mut self, font: LabelFont) -> Self {
        self.label_font = Some(font);
        self
    }

    /// Share an externally owned stop flag (e.g. one set by a signal handler).
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run until the source ends or a stop is requested. Teardown happens on
    /// every path; a loop error wins over a teardown error.
    pub fn run(mut self) -> Result<RunSummary> {
        log::info!(
            "processing {} with {} slot(s), threshold {}",
            self.source.describe(),
            self.adapter.slot_count(),
            self.config.prob_threshold
        );
        let outcome = self.run_loop();
        let teardown = self.teardown();
        let stop_reason = match (outcome, teardown) {
            (Ok(reason), Ok(())) => reason,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), teardown) => {
                if let Err(te) = teardown {
                    log::warn!("teardown after failure: {:#}", te);
                }
                return Err(e);
            }
        };

        let summary = self.summary(stop_reason);
        log::info!(
            "stopped ({:?}): {} frames, {} skipped, {} visits",
            summary.stop_reason,
            summary.frames_processed,
            summary.frames_skipped,
            summary.total_visits
        );
        Ok(summary)
    }

    fn run_loop(&mut self) -> Result<StopReason> {
        let slots = self.adapter.slot_count();
        let input_shape = self.adapter.input_shape();
        let mut pending: VecDeque<Pending> = VecDeque::with_capacity(slots);
        let mut exhausted = false;
        let mut last_health_log = Instant::now();

        loop {
            if self.stop_requested() {
                return Ok(StopReason::Interrupted);
            }

            while !exhausted && pending.len() < slots && !self.stop_requested() {
                match self.source.next_frame() {
                    Ok(Some(frame)) => {
                        self.last_capture = Some(frame.captured_at);
                        pending.push_back(self.submit(frame, input_shape)?);
                    }
                    Ok(None) => {
                        log::info!("end of stream");
                        exhausted = true;
                    }
                    Err(error) => pending.push_back(Pending::Failed {
                        at: self.last_capture.unwrap_or_else(Instant::now),
                        error: error.context("decode frame"),
                    }),
                }
            }

            let Some(head) = pending.pop_front() else {
                if exhausted {
                    return Ok(StopReason::EndOfStream);
                }
                continue;
            };
            match head {
                Pending::Failed { at, error } => self.on_frame_error(at, error)?,
                Pending::Inference { slot, frame } => {
                    if !self.await_slot(slot)? {
                        return Ok(StopReason::Interrupted);
                    }
                    match self.adapter.fetch_result(slot) {
                        Ok(result) => self.on_result(frame, result)?,
                        Err(error) => {
                            let at = frame.captured_at;
                            let error = error.context(format!("infer frame {}", frame.index));
                            self.on_frame_error(at, error)?
                        }
                    }
                }
            }

            if last_health_log.elapsed() >= self.config.health_interval {
                self.log_health();
                last_health_log = Instant::now();
            }
        }
    }

    fn submit(&mut self, frame: Frame, input_shape: crate::detect::TensorShape) -> Result<Pending> {
        let tensor = match frame_to_tensor(&frame, input_shape, self.config.layout) {
            Ok(tensor) => tensor,
            Err(error) => {
                return Ok(Pending::Failed {
                    at: frame.captured_at,
                    error: error.context(format!("preprocess frame {}", frame.index)),
                })
            }
        };
        let slot = (0..self.adapter.slot_count())
            .find(|slot| self.adapter.is_idle(*slot))
            .ok_or_else(|| anyhow!("no idle inference slot for frame {}", frame.index))?;
        self.adapter.submit(
            slot,
            InferenceRequest {
                tensor,
                frame: frame.frame_ref(),
            },
        )?;
        Ok(Pending::Inference { slot, frame })
    }

    /// Block on `slot` in poll-interval steps. False when a stop arrived first.
    fn await_slot(&mut self, slot: usize) -> Result<bool> {
        loop {
            if self.stop_requested() {
                return Ok(false);
            }
            match self
                .adapter
                .poll_or_wait(slot, Wait::Bounded(self.config.poll_interval))?
            {
                SlotStatus::Pending => continue,
                SlotStatus::Ready | SlotStatus::Error(_) => return Ok(true),
            }
        }
    }

    fn on_result(&mut self, mut frame: Frame, result: DetectionResult) -> Result<()> {
        let threshold = self.config.prob_threshold;
        let raw_count = u32::try_from(result.count_above(threshold)).unwrap_or(u32::MAX);
        log::debug!(
            "frame {}: {} of {} detections above {}, inference {:?}",
            frame.index,
            raw_count,
            result.detections.len(),
            threshold,
            result.inference_time
        );

        self.stats.consecutive_errors = 0;
        self.stats.frames_processed += 1;
        self.stats.latency_total += result.inference_time;
        self.stats.latency_samples += 1;

        let events = self.tracker.step(raw_count, frame.captured_at);
        publish_events(&mut self.sink, &self.config.topics, &events);

        if matches!(self.output, FrameOutput::None) {
            return Ok(());
        }
        if self.config.annotate {
            draw_detections(&mut frame, result.above(threshold))?;
            if let Some(font) = &self.label_font {
                draw_label(&mut frame, font, &inference_label(result.inference_time))?;
            }
        }
        match &mut self.output {
            FrameOutput::None => {}
            FrameOutput::Stream(writer) => {
                writer
                    .write_all(frame.pixels())
                    .and_then(|()| writer.flush())
                    .with_context(|| format!("write frame {}", frame.index))?;
            }
            FrameOutput::Image(path) => {
                write_image(&frame, path)?;
                log::info!("wrote {}", path.display());
            }
        }
        Ok(())
    }

    fn on_frame_error(&mut self, at: Instant, error: anyhow::Error) -> Result<()> {
        self.stats.consecutive_errors += 1;
        let limit = self.config.max_consecutive_frame_errors;
        match self.config.frame_errors {
            FrameErrorPolicy::Abort => return Err(error),
            _ if limit > 0 && self.stats.consecutive_errors >= limit => {
                return Err(error.context(format!("{} consecutive frame errors", limit)));
            }
            FrameErrorPolicy::Skip => {
                log::warn!("skipping frame: {:#}", error);
            }
            FrameErrorPolicy::TreatAsAbsent => {
                log::warn!("treating frame as empty: {:#}", error);
                self.stats.frames_processed += 1;
                let events = self.tracker.step(0, at);
                publish_events(&mut self.sink, &self.config.topics, &events);
            }
        }
        self.stats.frames_skipped += 1;
        Ok(())
    }

    fn log_health(&self) {
        let source = self.source.stats();
        let state = self.tracker.state();
        log::info!(
            "frames={} failed={} present={} visits={} mean_inference={:?}",
            source.frames_captured,
            source.frames_failed,
            state.smoothed_count,
            state.total_visits,
            self.mean_latency()
        );
    }

    fn teardown(&mut self) -> Result<()> {
        self.adapter.release();
        let mut first_error = None;
        if let Err(e) = self.source.close() {
            first_error.get_or_insert(e.context("close frame source"));
        }
        if let Err(e) = self.sink.close() {
            first_error.get_or_insert(e.context("close event sink"));
        }
        if let FrameOutput::Stream(writer) = &mut self.output {
            if let Err(e) = writer.flush() {
                first_error.get_or_insert(anyhow::Error::new(e).context("flush frame output"));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn mean_latency(&self) -> Option<Duration> {
        (self.stats.latency_samples > 0)
            .then(|| self.stats.latency_total / self.stats.latency_samples)
    }

    fn summary(&self, stop_reason: StopReason) -> RunSummary {
        let state = self.tracker.state();
        RunSummary {
            frames_processed: self.stats.frames_processed,
            frames_skipped: self.stats.frames_skipped,
            total_visits: state.total_visits,
            final_count: state.smoothed_count,
            mean_inference_latency: self.mean_latency(),
            stop_reason,
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}
