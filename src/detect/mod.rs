mod adapter;
mod backend;
pub mod backends;
mod model;
mod result;

pub use adapter::{AdapterSpec, DetectorAdapter, InferenceRequest, SlotStatus, Wait};
pub use backend::{Device, InferenceEngine, Tensor, TensorShape, Topology};
pub use backends::StubEngine;
pub use model::{ModelDescriptor, ModelFormat, DEFAULT_MODEL_INPUT};
pub use result::{BoundingBox, Detection, DetectionResult, SSD_ROW_LEN};
