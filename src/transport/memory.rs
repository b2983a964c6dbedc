use std::sync::{Arc, Mutex};

use super::{EventMessage, EventSink};
use crate::error::DeliveryError;

/// Records messages in memory. Clones share the same record.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<EventMessage>>>,
    accept_limit: Option<usize>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `limit` messages, then fail every send.
    pub fn failing_after(limit: usize) -> Self {
        Self {
            accept_limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<EventMessage> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().map(|closed| *closed).unwrap_or(false)
    }
}

impl EventSink for MemorySink {
    fn send(&mut self, message: EventMessage) -> Result<(), DeliveryError> {
        let mut messages = self.messages.lock().map_err(|_| DeliveryError {
            topic: message.topic.clone(),
            reason: "memory sink lock poisoned".into(),
        })?;
        if self
            .accept_limit
            .is_some_and(|limit| messages.len() >= limit)
        {
            return Err(DeliveryError {
                topic: message.topic,
                reason: "memory sink rejected message".into(),
            });
        }
        messages.push(message);
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = true;
        }
        Ok(())
    }
}

/// Writes messages to the log instead of a broker.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn send(&mut self, message: EventMessage) -> Result<(), DeliveryError> {
        log::info!("{} {}", message.topic, message.payload_str());
        Ok(())
    }
}
