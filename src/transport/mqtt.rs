use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::Deserialize;

use super::{EventMessage, EventSink};
use crate::error::{DeliveryError, PresenceError};

pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:3001";

const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse a broker address.
///
/// Accepted forms are `host:port`, `[ipv6]:port`, and either of those behind
/// `mqtt://`, `tcp://`, `mqtts://` or `ssl://`. The last two select TLS.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint, PresenceError> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => {
                return Err(PresenceError::Configuration(format!(
                    "unsupported MQTT scheme: {}",
                    other
                )))
            }
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)
        .map_err(|e| PresenceError::Configuration(format!("{:#}", e)))?;
    if host.is_empty() {
        return Err(PresenceError::Configuration(format!(
            "missing MQTT host in {}",
            addr
        )));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// Connection options beyond the broker address.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Outgoing request queue depth. A full queue drops messages.
    pub queue_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            client_id: format!("presence-counter-{}", std::process::id()),
            username: None,
            password: None,
            keep_alive_secs: 60,
            queue_capacity: 64,
        }
    }
}

/// Publishes presence messages with QoS 0.
///
/// The network event loop runs on its own thread and keeps reconnecting
/// until the sink is closed, so a missing broker never stalls the caller.
pub struct MqttSink {
    client: Client,
    endpoint: MqttEndpoint,
    stop: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttSink {
    pub fn connect(endpoint: &MqttEndpoint, settings: &MqttSettings) -> Result<Self> {
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, settings.queue_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_event_loop(connection, Arc::clone(&stop))?;
        log::info!(
            "MQTT client started for {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            endpoint: endpoint.clone(),
            stop,
            connection_handle: Some(handle),
        })
    }

    pub fn endpoint(&self) -> &MqttEndpoint {
        &self.endpoint
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.stop.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let disconnected = self.client.try_disconnect();
        if let Some(handle) = self.connection_handle.take() {
            // The loop only sees the flag between events. A broker that never
            // answers can hold it in a connect attempt, so the thread is
            // detached after a short grace period.
            let deadline = std::time::Instant::now() + SHUTDOWN_GRACE;
            while !handle.is_finished() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::debug!("MQTT event loop still connecting; detaching");
            }
        }
        disconnected.map_err(|e| anyhow!("MQTT disconnect failed: {}", e))
    }
}

fn spawn_event_loop(mut connection: Connection, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("mqtt-eventloop".into())
        .spawn(move || {
            let mut last_error: Option<String> = None;
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {
                        if last_error.take().is_some() {
                            log::info!("MQTT connection restored");
                        }
                    }
                    Err(e) => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let message = e.to_string();
                        if last_error.as_deref() != Some(message.as_str()) {
                            log::warn!("MQTT connection error: {}", message);
                            last_error = Some(message);
                        }
                        std::thread::sleep(RECONNECT_BACKOFF);
                    }
                }
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
        })
        .context("spawn MQTT event loop")?;
    Ok(handle)
}

impl EventSink for MqttSink {
    fn send(&mut self, message: EventMessage) -> Result<(), DeliveryError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(DeliveryError {
                topic: message.topic,
                reason: "MQTT client closed".into(),
            });
        }
        let topic = message.topic.clone();
        self.client
            .try_publish(message.topic, QoS::AtMostOnce, false, message.payload)
            .map_err(|e| DeliveryError {
                topic,
                reason: e.to_string(),
            })
    }

    fn close(&mut self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::debug!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoint_plain() {
        let ep = parse_mqtt_endpoint("127.0.0.1:3001").unwrap();
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 3001);
        assert!(!ep.use_tls);
    }

    #[test]
    fn parse_endpoint_schemes() {
        let ep = parse_mqtt_endpoint("mqtts://broker.local:8883").unwrap();
        assert!(ep.use_tls);
        assert_eq!(ep.port, 8883);
        let ep = parse_mqtt_endpoint("tcp://broker.local:1883").unwrap();
        assert!(!ep.use_tls);
    }

    #[test]
    fn parse_endpoint_ipv6() {
        let ep = parse_mqtt_endpoint("[::1]:1883").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 1883);
    }

    #[test]
    fn parse_endpoint_rejects_bad_input() {
        for addr in ["localhost", "ws://host:80", "host:notaport", ":1883"] {
            let err = parse_mqtt_endpoint(addr).unwrap_err();
            assert!(
                matches!(err, PresenceError::Configuration(_)),
                "{} gave {:?}",
                addr,
                err
            );
        }
    }

    #[test]
    fn unreachable_broker_does_not_block_sends() {
        // Port 9 on loopback is almost never an MQTT broker.
        let endpoint = parse_mqtt_endpoint("127.0.0.1:9").unwrap();
        let mut sink = MqttSink::connect(&endpoint, &MqttSettings::default()).unwrap();
        let message = EventMessage {
            topic: "presence".into(),
            payload: br#"{"count":0}"#.to_vec(),
        };
        // Queued or rejected, but never blocking.
        let _ = sink.send(message);
        let _ = sink.close();
        assert!(sink.send(EventMessage {
            topic: "presence".into(),
            payload: Vec::new(),
        })
        .is_err());
    }
}
