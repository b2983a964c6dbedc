use anyhow::Result;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::detect::backend::{Device, InferenceEngine, Tensor, Topology};
use crate::detect::result::SSD_ROW_LEN;

/// Class id the stub reports for people (SSD/COCO numbering).
pub const PERSON_LABEL: f32 = 1.0;

const STUB_CONFIDENCE: f32 = 0.9;

type LatencyFn = Box<dyn Fn(&Tensor) -> Duration + Send + Sync>;

enum StubMode {
    /// Find green marker regions in the input, one detection per region.
    Scene,
    /// Hand out prepared outputs in call order, then nothing.
    Scripted(Mutex<VecDeque<Vec<f32>>>),
}

/// Stub engine for tests and the synthetic demo scene.
///
/// In scene mode a "person" is any horizontal run of columns containing
/// pixels that are bright green relative to the brightest value in the input;
/// the synthetic frame source paints exactly such markers.
pub struct StubEngine {
    topology: Topology,
    unsupported: BTreeSet<String>,
    mode: StubMode,
    latency: Option<LatencyFn>,
    calls: AtomicU64,
}

impl StubEngine {
    pub fn scene(width: u32, height: u32) -> Self {
        Self::with_mode(width, height, StubMode::Scene)
    }

    /// Each entry is one call's output: the number of person boxes to report.
    pub fn scripted_counts(width: u32, height: u32, counts: &[usize]) -> Self {
        let outputs = counts
            .iter()
            .map(|&count| {
                let rows: Vec<[f32; SSD_ROW_LEN]> = (0..count)
                    .map(|i| {
                        let x = (i % 4) as f32 * 0.25;
                        [0.0, PERSON_LABEL, STUB_CONFIDENCE, x, 0.1, x + 0.2, 0.9]
                    })
                    .collect();
                flatten(&rows)
            })
            .collect();
        Self::scripted(width, height, outputs)
    }

    /// Each entry is one call's flattened SSD output.
    pub fn scripted(width: u32, height: u32, outputs: Vec<Vec<f32>>) -> Self {
        Self::with_mode(
            width,
            height,
            StubMode::Scripted(Mutex::new(outputs.into_iter().collect())),
        )
    }

    fn with_mode(width: u32, height: u32, mode: StubMode) -> Self {
        Self {
            topology: Topology {
                input_shapes: vec![[1, 3, height as usize, width as usize]],
                output_count: 1,
                layers: ["Convolution", "ReLU", "Pooling", "PriorBox", "DetectionOutput"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            unsupported: BTreeSet::new(),
            mode,
            latency: None,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_input_count(mut self, count: usize) -> Self {
        let shape = self.topology.input_shapes[0];
        self.topology.input_shapes = vec![shape; count];
        self
    }

    pub fn with_output_count(mut self, count: usize) -> Self {
        self.topology.output_count = count;
        self
    }

    /// Pretend the engine lacks kernels for these layers.
    pub fn with_unsupported_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for layer in layers {
            let layer = layer.into();
            if !self.topology.layers.contains(&layer) {
                self.topology.layers.push(layer.clone());
            }
            self.unsupported.insert(layer);
        }
        self
    }

    /// Sleep for `latency(input)` on every call, outside any lock.
    pub fn with_latency<F>(mut self, latency: F) -> Self
    where
        F: Fn(&Tensor) -> Duration + Send + Sync + 'static,
    {
        self.latency = Some(Box::new(latency));
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn supported_layers(&self, _device: Device) -> Option<BTreeSet<String>> {
        Some(
            self.topology
                .layers
                .iter()
                .filter(|layer| !self.unsupported.contains(*layer))
                .cloned()
                .collect(),
        )
    }

    fn infer(&self, input: &Tensor) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = &self.latency {
            std::thread::sleep(latency(input));
        }
        match &self.mode {
            StubMode::Scene => Ok(detect_markers(input)),
            StubMode::Scripted(outputs) => {
                let mut outputs = outputs
                    .lock()
                    .map_err(|_| anyhow::anyhow!("stub script lock poisoned"))?;
                Ok(outputs.pop_front().unwrap_or_default())
            }
        }
    }
}

fn flatten(rows: &[[f32; SSD_ROW_LEN]]) -> Vec<f32> {
    rows.iter().flat_map(|row| row.iter().copied()).collect()
}

/// True when the pixel at `(y, x)` is a marker pixel.
fn is_marker(input: &Tensor, y: usize, x: usize, high: f32, low: f32) -> bool {
    input.at(1, y, x) > high && input.at(0, y, x) < low && input.at(2, y, x) < low
}

fn detect_markers(input: &Tensor) -> Vec<f32> {
    let [_, channels, h, w] = input.shape();
    let peak = input.data().iter().copied().fold(0.0f32, f32::max);
    if channels < 3 || peak <= 0.0 {
        return Vec::new();
    }
    let (high, low) = (peak * 0.5, peak * 0.25);

    // Vertical extent of marker pixels per column.
    let mut extents: Vec<Option<(usize, usize)>> = vec![None; w];
    for (x, extent) in extents.iter_mut().enumerate() {
        for y in 0..h {
            if is_marker(input, y, x, high, low) {
                *extent = Some(match *extent {
                    Some((top, _)) => (top, y),
                    None => (y, y),
                });
            }
        }
    }

    let mut rows = Vec::new();
    let mut run: Option<(usize, usize, usize)> = None; // (x0, ymin, ymax)
    for x in 0..=w {
        let extent = extents.get(x).copied().flatten();
        match (run, extent) {
            (None, Some((top, bottom))) => run = Some((x, top, bottom)),
            (Some((x0, ymin, ymax)), Some((top, bottom))) => {
                run = Some((x0, ymin.min(top), ymax.max(bottom)))
            }
            (Some((x0, ymin, ymax)), None) => {
                rows.push([
                    0.0,
                    PERSON_LABEL,
                    STUB_CONFIDENCE,
                    x0 as f32 / w as f32,
                    ymin as f32 / h as f32,
                    x as f32 / w as f32,
                    (ymax + 1) as f32 / h as f32,
                ]);
                run = None;
            }
            (None, None) => {}
        }
    }
    rows.push([-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    flatten(&rows)
}
