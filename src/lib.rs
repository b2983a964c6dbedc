//! Presence counter
//!
//! Counts people in a video stream and reports visits.
//!
//! # Architecture
//!
//! Frames flow one way through the pipeline:
//!
//! 1. **Ingest**: a `FrameSource` yields RGB frames from a file, a still
//!    image, the camera or a synthetic scene.
//! 2. **Preprocess**: each frame is resized to the model input and packed
//!    into a planar `f32` tensor.
//! 3. **Detect**: `DetectorAdapter` runs the model on one or more request
//!    slots and parses the SSD output into boxes.
//! 4. **Track**: `PresenceTracker` debounces the per-frame person count and
//!    turns its edges into visit events.
//! 5. **Publish**: events go out as JSON over MQTT; annotated frames go to
//!    stdout or an image file.
//!
//! # Module Structure
//!
//! - `frame`: decoded frames and the metadata slots keep about them
//! - `ingest`: frame sources
//! - `preprocess`: frame to tensor conversion
//! - `detect`: inference engines, the request/slot adapter, SSD parsing
//! - `presence`: the occupancy state machine
//! - `pipeline`: the frame loop
//! - `transport`: event encoding and sinks
//! - `annotate`: box overlays and image output
//! - `config`: file and environment configuration
//! - `error`: typed fatal errors and exit codes

pub mod annotate;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod preprocess;
pub mod presence;
pub mod transport;

pub use config::PresenceConfig;
pub use detect::{
    AdapterSpec, Detection, DetectionResult, DetectorAdapter, Device, InferenceEngine,
    ModelDescriptor, SlotStatus, StubEngine, Wait,
};
pub use error::{exit_code_for, DeliveryError, PresenceError};
pub use frame::{Frame, FrameRef};
pub use ingest::{open_source, FileSource, FrameSource, MediaInput, SyntheticScene};
pub use pipeline::{
    FrameErrorPolicy, FrameOutput, Pipeline, PipelineConfig, RunSummary, StopReason,
};
pub use presence::{OccupancyState, PresenceEvent, PresenceTracker, TrackerConfig, VisitCounting};
pub use transport::{EventMessage, EventSink, LogSink, MemorySink, MqttSink, Topics};
