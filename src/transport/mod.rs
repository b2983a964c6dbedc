//! Event delivery.
//!
//! Presence events become small JSON messages keyed by topic:
//! - `presence`: `{"count": n}` every frame, `{"total": n}` on a new visit
//! - `presence/duration`: `{"duration": seconds}` when a visit ends
//!
//! Delivery is fire-and-forget. A failed send is logged and the frame loop
//! carries on.

mod memory;
mod mqtt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;
use crate::presence::PresenceEvent;

pub use memory::{LogSink, MemorySink};
pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, MqttSettings, MqttSink, DEFAULT_BROKER_ADDR};

pub const DEFAULT_PRESENCE_TOPIC: &str = "presence";
pub const DEFAULT_DURATION_TOPIC: &str = "presence/duration";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Topics {
    pub presence: String,
    pub duration: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            presence: DEFAULT_PRESENCE_TOPIC.to_string(),
            duration: DEFAULT_DURATION_TOPIC.to_string(),
        }
    }
}

#[derive(Serialize)]
struct CountPayload {
    count: u32,
}

#[derive(Serialize)]
struct TotalPayload {
    total: u64,
}

#[derive(Serialize)]
struct DurationPayload {
    duration: u64,
}

/// One serialized event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl EventMessage {
    pub fn encode(event: &PresenceEvent, topics: &Topics) -> Result<Self> {
        let (topic, payload) = match *event {
            PresenceEvent::CurrentCount(count) => {
                (&topics.presence, serde_json::to_vec(&CountPayload { count })?)
            }
            PresenceEvent::TotalVisitsChanged(total) => {
                (&topics.presence, serde_json::to_vec(&TotalPayload { total })?)
            }
            PresenceEvent::VisitDuration(duration) => (
                &topics.duration,
                serde_json::to_vec(&DurationPayload { duration })?,
            ),
        };
        Ok(Self {
            topic: topic.clone(),
            payload,
        })
    }

    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<binary>")
    }
}

/// Destination for presence messages.
pub trait EventSink {
    /// Hand one message to the transport without waiting for delivery.
    fn send(&mut self, message: EventMessage) -> Result<(), DeliveryError>;

    /// Flush and disconnect. Further sends may fail.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn send(&mut self, message: EventMessage) -> Result<(), DeliveryError> {
        (**self).send(message)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Encode and send `events`, logging failures. Returns how many were handed
/// to the transport.
pub fn publish_events<S: EventSink + ?Sized>(
    sink: &mut S,
    topics: &Topics,
    events: &[PresenceEvent],
) -> usize {
    let mut delivered = 0;
    for event in events {
        let message = match EventMessage::encode(event, topics) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("failed to encode {:?}: {}", event, e);
                continue;
            }
        };
        match sink.send(message) {
            Ok(()) => delivered += 1,
            Err(e) => log::warn!("{}", e),
        }
    }
    delivered
}
