use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::PresenceError;

/// NCHW tensor shape.
pub type TensorShape = [usize; 4];

/// Target device for inference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
    Fpga,
    Myriad,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "CPU",
            Device::Gpu => "GPU",
            Device::Fpga => "FPGA",
            Device::Myriad => "MYRIAD",
        }
    }

    /// Devices whose plugin rejects layers it cannot run, so the model must be
    /// checked against the supported-operation set before loading.
    pub fn checks_layer_support(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = PresenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CPU" => Ok(Device::Cpu),
            "GPU" => Ok(Device::Gpu),
            "FPGA" => Ok(Device::Fpga),
            "MYRIAD" => Ok(Device::Myriad),
            other => Err(PresenceError::Configuration(format!(
                "unknown device '{}' (expected CPU, GPU, FPGA or MYRIAD)",
                other
            ))),
        }
    }
}

/// Dense `f32` tensor in NCHW layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: TensorShape,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: TensorShape, data: Vec<f32>) -> Result<Self> {
        let expected = shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| anyhow!("tensor shape {:?} overflows", shape))?;
        if data.len() != expected {
            return Err(anyhow!(
                "tensor shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Value at `(0, channel, y, x)`.
    pub(crate) fn at(&self, channel: usize, y: usize, x: usize) -> f32 {
        let [_, _, h, w] = self.shape;
        self.data[(channel * h + y) * w + x]
    }
}

/// What a loaded model looks like from the outside.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub input_shapes: Vec<TensorShape>,
    pub output_count: usize,
    /// Layer (operation) types in the network, in graph order.
    pub layers: Vec<String>,
}

/// Black-box detection model.
///
/// `infer` takes `&self` so several slots can run at once; engines that cannot
/// run concurrently serialize internally.
pub trait InferenceEngine: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn topology(&self) -> &Topology;

    /// Layer types the engine can execute on `device`. `None` means no
    /// restriction is known. The adapter only consults this for devices
    /// where `Device::checks_layer_support` holds.
    fn supported_layers(&self, device: Device) -> Option<BTreeSet<String>>;

    /// Run the network on one input tensor and return the flattened output of
    /// the single output blob (SSD rows of seven values).
    fn infer(&self, input: &Tensor) -> Result<Vec<f32>>;
}
