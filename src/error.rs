use thiserror::Error;

/// Fatal conditions the binary maps to distinct exit codes.
///
/// Everything else travels as `anyhow::Error`; these variants are attached at
/// the point of failure so callers can `downcast_ref` them back out.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unsupported topology: model has {actual} {kind}(s), only {expected} supported")]
    UnsupportedTopology {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("unsupported layers on {device}: {}", layers.join(", "))]
    UnsupportedOperation { device: String, layers: Vec<String> },
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("input tensor shape {actual:?} does not match model input {expected:?}")]
    ShapeMismatch {
        expected: [usize; 4],
        actual: [usize; 4],
    },
    #[error("slot {0} already has a request in flight")]
    SlotBusy(usize),
    #[error("slot {0} has no request in flight")]
    SlotIdle(usize),
    #[error("slot {0} does not exist")]
    UnknownSlot(usize),
    #[error("slot {0} result is not ready")]
    NotReady(usize),
    #[error("inference failed on slot {slot}: {message}")]
    Inference { slot: usize, message: String },
}

impl PresenceError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            PresenceError::Configuration(_) => 2,
            PresenceError::UnsupportedTopology { .. } | PresenceError::UnsupportedOperation { .. } => 3,
            PresenceError::SourceUnavailable(_) => 4,
            _ => 1,
        }
    }
}

/// A message could not be handed to the transport. Never fatal.
#[derive(Debug, Error)]
#[error("delivery to {topic} failed: {reason}")]
pub struct DeliveryError {
    pub topic: String,
    pub reason: String,
}

/// Exit code for an arbitrary error chain.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PresenceError>())
        .map(PresenceError::exit_code)
        .unwrap_or(1)
}
