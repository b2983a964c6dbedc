//! Request/response wrapper around an inference engine.
//!
//! Each slot carries at most one request. `submit` hands the tensor to a worker
//! thread and returns at once; `poll_or_wait` observes completion with the
//! caller's choice of blocking; `fetch_result` turns the raw output into a
//! `DetectionResult` and frees the slot for the next submission.

use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::backend::{Device, InferenceEngine, Tensor, TensorShape};
use super::backends::load_engine;
use super::model::ModelDescriptor;
use super::result::DetectionResult;
use crate::error::PresenceError;
use crate::frame::FrameRef;

/// Topology constraints and slot count for `DetectorAdapter::configure`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterSpec {
    pub input_count: usize,
    pub output_count: usize,
    pub concurrent_requests: usize,
}

impl Default for AdapterSpec {
    fn default() -> Self {
        Self {
            input_count: 1,
            output_count: 1,
            concurrent_requests: 1,
        }
    }
}

/// How long `poll_or_wait` may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    Infinite,
    Bounded(Duration),
    Immediate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotStatus {
    Ready,
    Pending,
    Error(String),
}

/// Input for one slot.
#[derive(Clone, Debug)]
pub struct InferenceRequest {
    pub tensor: Tensor,
    pub frame: FrameRef,
}

type EngineOutput = Result<Vec<f32>>;

enum SlotState {
    Idle,
    InFlight {
        frame: FrameRef,
        submitted_at: Instant,
        rx: Receiver<EngineOutput>,
        worker: JoinHandle<()>,
    },
    Done {
        frame: FrameRef,
        latency: Duration,
        output: Result<Vec<f32>, String>,
    },
}

struct InferenceSlot {
    request_id: usize,
    state: SlotState,
}

pub struct DetectorAdapter {
    engine: Option<Arc<dyn InferenceEngine>>,
    engine_name: &'static str,
    device: Device,
    input_shape: TensorShape,
    slots: Vec<InferenceSlot>,
}

impl DetectorAdapter {
    /// Load `model` for `device` and validate it against `spec`.
    ///
    /// Returns the adapter together with the model's NCHW input shape.
    pub fn configure(
        model: &ModelDescriptor,
        device: Device,
        spec: AdapterSpec,
    ) -> Result<(Self, TensorShape)> {
        let engine = load_engine(model, device)
            .with_context(|| format!("failed to load model {}", model.reference))?;
        let adapter = Self::from_engine(engine, device, spec)?;
        let shape = adapter.input_shape();
        Ok((adapter, shape))
    }

    /// Wrap an already loaded engine, applying the same checks as `configure`.
    pub fn from_engine(
        engine: Arc<dyn InferenceEngine>,
        device: Device,
        spec: AdapterSpec,
    ) -> Result<Self> {
        if spec.concurrent_requests == 0 {
            return Err(PresenceError::Configuration(
                "at least one concurrent request is required".into(),
            )
            .into());
        }

        let topology = engine.topology();
        let supported = if device.checks_layer_support() {
            engine.supported_layers(device)
        } else {
            None
        };
        if let Some(supported) = supported {
            let unsupported: Vec<String> = topology
                .layers
                .iter()
                .filter(|layer| !supported.contains(*layer))
                .cloned()
                .collect();
            if !unsupported.is_empty() {
                log::error!(
                    "unsupported layers found on {}: {:?}",
                    device,
                    unsupported
                );
                return Err(PresenceError::UnsupportedOperation {
                    device: device.to_string(),
                    layers: unsupported,
                }
                .into());
            }
        }

        if topology.input_shapes.len() != spec.input_count {
            return Err(PresenceError::UnsupportedTopology {
                kind: "input",
                expected: spec.input_count,
                actual: topology.input_shapes.len(),
            }
            .into());
        }
        if topology.output_count != spec.output_count {
            return Err(PresenceError::UnsupportedTopology {
                kind: "output",
                expected: spec.output_count,
                actual: topology.output_count,
            }
            .into());
        }
        let input_shape = topology.input_shapes.first().copied().ok_or(
            PresenceError::UnsupportedTopology {
                kind: "input",
                expected: 1,
                actual: 0,
            },
        )?;

        log::info!(
            "{} engine ready on {}: input {:?}, {} request slot(s)",
            engine.name(),
            device,
            input_shape,
            spec.concurrent_requests
        );

        Ok(Self {
            engine_name: engine.name(),
            engine: Some(engine),
            device,
            input_shape,
            slots: (0..spec.concurrent_requests)
                .map(|request_id| InferenceSlot {
                    request_id,
                    state: SlotState::Idle,
                })
                .collect(),
        })
    }

    pub fn input_shape(&self) -> TensorShape {
        self.input_shape
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine_name
    }

    /// True when `slot_id` can accept a submission.
    pub fn is_idle(&self, slot_id: usize) -> bool {
        self.slots
            .get(slot_id)
            .is_some_and(|slot| matches!(slot.state, SlotState::Idle))
    }

    /// Start inference for `slot_id`. A busy slot is rejected and its
    /// in-flight request is left untouched.
    pub fn submit(&mut self, slot_id: usize, request: InferenceRequest) -> Result<()> {
        let input_shape = self.input_shape;
        let engine = self
            .engine
            .clone()
            .context("detector adapter already released")?;
        let slot = self.slot_mut(slot_id)?;
        if !matches!(slot.state, SlotState::Idle) {
            return Err(PresenceError::SlotBusy(slot_id).into());
        }
        if request.tensor.shape() != input_shape {
            return Err(PresenceError::ShapeMismatch {
                expected: input_shape,
                actual: request.tensor.shape(),
            }
            .into());
        }

        let (tx, rx) = mpsc::channel();
        let tensor = request.tensor;
        let worker = std::thread::Builder::new()
            .name(format!("infer-slot-{}", slot.request_id))
            .spawn(move || {
                let _ = tx.send(engine.infer(&tensor));
            })
            .context("failed to spawn inference worker")?;

        slot.state = SlotState::InFlight {
            frame: request.frame,
            submitted_at: Instant::now(),
            rx,
            worker,
        };
        log::debug!("slot {} submitted frame {}", slot_id, request.frame.index);
        Ok(())
    }

    /// Observe the request on `slot_id`, blocking as `wait` allows.
    pub fn poll_or_wait(&mut self, slot_id: usize, wait: Wait) -> Result<SlotStatus> {
        let slot = self.slot_mut(slot_id)?;
        let state = std::mem::replace(&mut slot.state, SlotState::Idle);
        let (state, status) = match state {
            SlotState::Idle => return Err(PresenceError::SlotIdle(slot_id).into()),
            SlotState::Done {
                frame,
                latency,
                output,
            } => {
                let status = match &output {
                    Ok(_) => SlotStatus::Ready,
                    Err(message) => SlotStatus::Error(message.clone()),
                };
                (
                    SlotState::Done {
                        frame,
                        latency,
                        output,
                    },
                    status,
                )
            }
            SlotState::InFlight {
                frame,
                submitted_at,
                rx,
                worker,
            } => {
                let received = match wait {
                    Wait::Infinite => rx.recv().map_err(|_| None),
                    Wait::Bounded(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                        RecvTimeoutError::Timeout => Some(()),
                        RecvTimeoutError::Disconnected => None,
                    }),
                    Wait::Immediate => rx.try_recv().map_err(|e| match e {
                        TryRecvError::Empty => Some(()),
                        TryRecvError::Disconnected => None,
                    }),
                };
                match received {
                    // Still running.
                    Err(Some(())) => (
                        SlotState::InFlight {
                            frame,
                            submitted_at,
                            rx,
                            worker,
                        },
                        SlotStatus::Pending,
                    ),
                    finished => {
                        let latency = submitted_at.elapsed();
                        let _ = worker.join();
                        let output = match finished {
                            Ok(Ok(values)) => Ok(values),
                            Ok(Err(err)) => Err(format!("{:#}", err)),
                            Err(_) => Err("inference worker exited without a result".to_string()),
                        };
                        let status = match &output {
                            Ok(_) => SlotStatus::Ready,
                            Err(message) => SlotStatus::Error(message.clone()),
                        };
                        (
                            SlotState::Done {
                                frame,
                                latency,
                                output,
                            },
                            status,
                        )
                    }
                }
            }
        };
        slot.state = state;
        Ok(status)
    }

    /// Take the finished result of `slot_id` and free the slot.
    ///
    /// A request that failed frees the slot and reports `Inference`.
    pub fn fetch_result(&mut self, slot_id: usize) -> Result<DetectionResult> {
        let slot = self.slot_mut(slot_id)?;
        match std::mem::replace(&mut slot.state, SlotState::Idle) {
            SlotState::Done {
                frame,
                latency,
                output,
            } => {
                let raw = output.map_err(|message| PresenceError::Inference {
                    slot: slot_id,
                    message,
                })?;
                let mut result = DetectionResult::from_ssd_output(&raw, slot.request_id, frame)
                    .with_context(|| format!("malformed output for frame {}", frame.index))?;
                result.inference_time = latency;
                Ok(result)
            }
            in_flight @ SlotState::InFlight { .. } => {
                slot.state = in_flight;
                Err(PresenceError::NotReady(slot_id).into())
            }
            SlotState::Idle => Err(PresenceError::SlotIdle(slot_id).into()),
        }
    }

    /// Wait for outstanding workers and drop the engine. Called once; `Drop`
    /// covers owners that never call it.
    pub fn release(&mut self) {
        if self.engine.is_none() {
            return;
        }
        for slot in &mut self.slots {
            if let SlotState::InFlight { worker, .. } =
                std::mem::replace(&mut slot.state, SlotState::Idle)
            {
                let _ = worker.join();
            }
        }
        self.engine = None;
        log::info!("{} engine released", self.engine_name);
    }

    pub fn is_released(&self) -> bool {
        self.engine.is_none()
    }

    fn slot_mut(&mut self, slot_id: usize) -> Result<&mut InferenceSlot> {
        self.slots
            .get_mut(slot_id)
            .ok_or_else(|| PresenceError::UnknownSlot(slot_id).into())
    }
}

impl std::fmt::Debug for DetectorAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorAdapter")
            .field("engine", &self.engine_name)
            .field("device", &self.device)
            .field("input_shape", &self.input_shape)
            .field("slots", &self.slots.len())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for DetectorAdapter {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubEngine;

    fn frame(index: u64) -> FrameRef {
        FrameRef {
            index,
            width: 100,
            height: 50,
        }
    }

    fn request(index: u64) -> InferenceRequest {
        InferenceRequest {
            tensor: Tensor::new([1, 3, 4, 4], vec![0.0; 48]).unwrap(),
            frame: frame(index),
        }
    }

    fn adapter(engine: StubEngine, slots: usize) -> Result<DetectorAdapter> {
        DetectorAdapter::from_engine(
            Arc::new(engine),
            Device::Cpu,
            AdapterSpec {
                concurrent_requests: slots,
                ..AdapterSpec::default()
            },
        )
    }

    fn error_of(result: Result<impl std::fmt::Debug>) -> PresenceError {
        let err = result.expect_err("expected failure");
        match err.downcast::<PresenceError>() {
            Ok(err) => err,
            Err(other) => panic!("unexpected error: {other:#}"),
        }
    }

    #[test]
    fn two_outputs_fail_configuration() {
        let err = error_of(adapter(StubEngine::scene(4, 4).with_output_count(2), 1));
        assert!(matches!(
            err,
            PresenceError::UnsupportedTopology {
                kind: "output",
                expected: 1,
                actual: 2
            }
        ));
    }

    #[test]
    fn two_inputs_fail_configuration() {
        let err = error_of(adapter(StubEngine::scene(4, 4).with_input_count(2), 1));
        assert!(matches!(
            err,
            PresenceError::UnsupportedTopology { kind: "input", .. }
        ));
    }

    #[test]
    fn unsupported_cpu_layers_are_fatal() {
        let err = error_of(adapter(
            StubEngine::scene(4, 4).with_unsupported_layers(["CustomNms"]),
            1,
        ));
        match err {
            PresenceError::UnsupportedOperation { device, layers } => {
                assert_eq!(device, "CPU");
                assert_eq!(layers, vec!["CustomNms".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unsupported_layers_are_ignored_off_cpu() {
        // The engine reports the gap on every device; only CPU rejects it.
        for device in [Device::Gpu, Device::Fpga, Device::Myriad] {
            let engine = StubEngine::scene(4, 4).with_unsupported_layers(["CustomNms"]);
            let adapter =
                DetectorAdapter::from_engine(Arc::new(engine), device, AdapterSpec::default())
                    .unwrap();
            assert_eq!(adapter.input_shape(), [1, 3, 4, 4]);
        }
    }

    #[test]
    fn inputless_models_fail_configuration() {
        let spec = AdapterSpec {
            input_count: 0,
            ..AdapterSpec::default()
        };
        let engine = StubEngine::scene(4, 4).with_input_count(0);
        let err = error_of(DetectorAdapter::from_engine(Arc::new(engine), Device::Cpu, spec));
        assert!(matches!(
            err,
            PresenceError::UnsupportedTopology {
                kind: "input",
                actual: 0,
                ..
            }
        ));
    }

    #[test]
    fn zero_slots_is_a_configuration_error() {
        let err = error_of(adapter(StubEngine::scene(4, 4), 0));
        assert!(matches!(err, PresenceError::Configuration(_)));
    }

    #[test]
    fn request_lifecycle() -> Result<()> {
        let mut adapter = adapter(StubEngine::scripted_counts(4, 4, &[3]), 1)?;
        assert!(adapter.is_idle(0));
        adapter.submit(0, request(9))?;
        assert!(!adapter.is_idle(0));
        assert_eq!(adapter.poll_or_wait(0, Wait::Infinite)?, SlotStatus::Ready);
        // Observing again does not consume the result.
        assert_eq!(adapter.poll_or_wait(0, Wait::Immediate)?, SlotStatus::Ready);
        let result = adapter.fetch_result(0)?;
        assert_eq!(result.frame_index, 9);
        assert_eq!(result.request_id, 0);
        assert_eq!(result.count_above(0.5), 3);
        assert!(adapter.is_idle(0));
        Ok(())
    }

    #[test]
    fn double_submit_is_rejected_without_losing_the_first_request() -> Result<()> {
        let engine = StubEngine::scripted_counts(4, 4, &[1, 2])
            .with_latency(|_| Duration::from_millis(30));
        let mut adapter = adapter(engine, 1)?;
        adapter.submit(0, request(0))?;
        let err = error_of(adapter.submit(0, request(1)));
        assert!(matches!(err, PresenceError::SlotBusy(0)));

        assert_eq!(adapter.poll_or_wait(0, Wait::Infinite)?, SlotStatus::Ready);
        let result = adapter.fetch_result(0)?;
        assert_eq!(result.frame_index, 0);
        assert_eq!(result.count_above(0.5), 1);
        Ok(())
    }

    #[test]
    fn bounded_wait_reports_pending() -> Result<()> {
        let engine = StubEngine::scripted_counts(4, 4, &[1])
            .with_latency(|_| Duration::from_millis(200));
        let mut adapter = adapter(engine, 1)?;
        adapter.submit(0, request(0))?;
        assert_eq!(adapter.poll_or_wait(0, Wait::Immediate)?, SlotStatus::Pending);
        assert_eq!(
            adapter.poll_or_wait(0, Wait::Bounded(Duration::from_millis(1)))?,
            SlotStatus::Pending
        );
        let err = error_of(adapter.fetch_result(0));
        assert!(matches!(err, PresenceError::NotReady(0)));
        assert_eq!(adapter.poll_or_wait(0, Wait::Infinite)?, SlotStatus::Ready);
        let result = adapter.fetch_result(0)?;
        assert!(result.inference_time >= Duration::from_millis(200));
        Ok(())
    }

    #[test]
    fn wrong_shape_and_unknown_slots_are_rejected() -> Result<()> {
        let mut adapter = adapter(StubEngine::scene(8, 8), 1)?;
        let err = error_of(adapter.submit(0, request(0)));
        assert!(matches!(err, PresenceError::ShapeMismatch { .. }));
        assert!(adapter.is_idle(0));

        let err = error_of(adapter.poll_or_wait(3, Wait::Immediate));
        assert!(matches!(err, PresenceError::UnknownSlot(3)));
        let err = error_of(adapter.poll_or_wait(0, Wait::Immediate));
        assert!(matches!(err, PresenceError::SlotIdle(0)));
        Ok(())
    }

    #[test]
    fn release_is_idempotent_and_blocks_submission() -> Result<()> {
        let engine = StubEngine::scripted_counts(4, 4, &[1])
            .with_latency(|_| Duration::from_millis(20));
        let mut adapter = adapter(engine, 2)?;
        adapter.submit(1, request(0))?;
        adapter.release();
        adapter.release();
        assert!(adapter.is_released());
        assert!(adapter.is_idle(1));
        assert!(adapter.submit(0, request(1)).is_err());
        Ok(())
    }
}
