#![cfg(feature = "backend-tract")]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{Device, InferenceEngine, Tensor as InputTensor, Topology};

type Plan = TypedRunnableModel<TypedModel>;

/// Tract-based engine for ONNX SSD-style detectors.
///
/// The model is compiled for a fixed `[1, 3, height, width]` input. Every
/// operation tract managed to load is runnable, so no layer filtering applies.
pub struct TractEngine {
    plan: Mutex<Plan>,
    topology: Topology,
}

impl TractEngine {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?;

        let input_count = model.input_outlets()?.len();
        let output_count = model.output_outlets()?.len();
        let layers = model
            .nodes()
            .iter()
            .map(|node| node.op().name().to_string())
            .collect();

        let plan = model
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            plan: Mutex::new(plan),
            topology: Topology {
                input_shapes: vec![[1, 3, height as usize, width as usize]; input_count],
                output_count,
                layers,
            },
        })
    }
}

impl InferenceEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn supported_layers(&self, _device: Device) -> Option<BTreeSet<String>> {
        None
    }

    fn infer(&self, input: &InputTensor) -> Result<Vec<f32>> {
        let [n, c, h, w] = input.shape();
        let array = tract_ndarray::Array4::from_shape_vec((n, c, h, w), input.data().to_vec())
            .context("input tensor does not match its shape")?;
        let plan = self
            .plan
            .lock()
            .map_err(|_| anyhow!("tract plan lock poisoned"))?;
        let outputs = plan
            .run(tvec!(array.into_tensor().into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        Ok(values.iter().copied().collect())
    }
}
