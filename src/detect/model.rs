use std::path::{Path, PathBuf};

use crate::error::PresenceError;

pub const DEFAULT_MODEL_INPUT: (u32, u32) = (300, 300);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelFormat {
    /// Built-in synthetic engine (`stub://name`).
    Stub,
    /// ONNX graph; weights live in the same file.
    Onnx,
    /// XML topology with a sibling `.bin` weights file.
    Ir,
}

/// Resolved reference to a detection model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub reference: String,
    pub format: ModelFormat,
    /// File holding the topology (and, for ONNX, the weights). `None` for stub models.
    pub path: Option<PathBuf>,
    /// Separate weights file, when the format has one.
    pub weights: Option<PathBuf>,
    /// Spatial input size (width, height) for backends that need it fixed.
    pub input_size: (u32, u32),
}

impl ModelDescriptor {
    pub fn resolve(reference: &str) -> Result<Self, PresenceError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(PresenceError::Configuration("model reference is empty".into()));
        }
        if reference.starts_with("stub://") {
            return Ok(Self {
                reference: reference.to_string(),
                format: ModelFormat::Stub,
                path: None,
                weights: None,
                input_size: DEFAULT_MODEL_INPUT,
            });
        }
        if reference.contains("://") {
            return Err(PresenceError::Configuration(format!(
                "model must be a local path: {}",
                reference
            )));
        }

        let path = Path::new(reference);
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        let format = match extension.as_deref() {
            Some("onnx") => ModelFormat::Onnx,
            Some("xml") => ModelFormat::Ir,
            _ => {
                return Err(PresenceError::Configuration(format!(
                    "{}: unrecognised model format",
                    reference
                )))
            }
        };
        if !path.is_file() {
            return Err(PresenceError::Configuration(format!(
                "model file {} does not exist",
                path.display()
            )));
        }
        let weights = match format {
            ModelFormat::Ir => {
                let weights = path.with_extension("bin");
                if !weights.is_file() {
                    return Err(PresenceError::Configuration(format!(
                        "weights file {} does not exist",
                        weights.display()
                    )));
                }
                Some(weights)
            }
            _ => None,
        };
        Ok(Self {
            reference: reference.to_string(),
            format,
            path: Some(path.to_path_buf()),
            weights,
            input_size: DEFAULT_MODEL_INPUT,
        })
    }

    pub fn with_input_size(mut self, width: u32, height: u32) -> Self {
        self.input_size = (width, height);
        self
    }
}
