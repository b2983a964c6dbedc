pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

use anyhow::Result;
use std::sync::Arc;

use crate::detect::backend::{Device, InferenceEngine};
use crate::detect::model::{ModelDescriptor, ModelFormat};
use crate::error::PresenceError;

pub use stub::StubEngine;

#[cfg(feature = "backend-tract")]
pub use tract::TractEngine;

/// Instantiate the engine that can run `model`.
pub fn load_engine(model: &ModelDescriptor, device: Device) -> Result<Arc<dyn InferenceEngine>> {
    let (width, height) = model.input_size;
    match model.format {
        ModelFormat::Stub => {
            log::info!("loading stub engine for {} on {}", model.reference, device);
            Ok(Arc::new(StubEngine::scene(width, height)))
        }
        #[cfg(feature = "backend-tract")]
        ModelFormat::Onnx => {
            let path = model
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("ONNX model has no path"))?;
            if device != Device::Cpu {
                log::warn!("tract runs on the host CPU; device {} is ignored", device);
            }
            Ok(Arc::new(TractEngine::new(path, width, height)?))
        }
        #[cfg(not(feature = "backend-tract"))]
        ModelFormat::Onnx => Err(PresenceError::Configuration(format!(
            "{}: ONNX models require the backend-tract feature",
            model.reference
        ))
        .into()),
        ModelFormat::Ir => Err(PresenceError::Configuration(format!(
            "{}: no engine can load XML/BIN models, export the model to ONNX",
            model.reference
        ))
        .into()),
    }
}
