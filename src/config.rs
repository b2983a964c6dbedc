//! Run configuration.
//!
//! Values come from, in increasing priority: built-in defaults, a JSON file
//! (`PRESENCE_CONFIG`), and `PRESENCE_*` environment variables. The binary
//! applies command-line flags on top and then calls `validate` again.

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::detect::Device;
use crate::error::PresenceError;
use crate::pipeline::{
    FrameErrorPolicy, DEFAULT_MAX_CONSECUTIVE_FRAME_ERRORS, DEFAULT_POLL_INTERVAL,
    DEFAULT_PROB_THRESHOLD,
};
use crate::preprocess::{ChannelOrder, InputLayout};
use crate::presence::{TrackerConfig, VisitCounting, DEFAULT_GRACE_FRAMES, DEFAULT_MIN_VISIT};
use crate::transport::{parse_mqtt_endpoint, MqttSettings, Topics, DEFAULT_BROKER_ADDR};

pub const CONFIG_ENV: &str = "PRESENCE_CONFIG";
pub const DEFAULT_OUTPUT_IMAGE: &str = "output_image.jpg";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PresenceConfigFile {
    model: Option<String>,
    model_input: Option<(u32, u32)>,
    input: Option<String>,
    device: Option<String>,
    prob_threshold: Option<f32>,
    requests: Option<usize>,
    tracker: Option<TrackerConfigFile>,
    mqtt: Option<MqttConfigFile>,
    frames: Option<FramesConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrackerConfigFile {
    grace_frames: Option<u32>,
    min_visit_secs: Option<f64>,
    visit_counting: Option<VisitCounting>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MqttConfigFile {
    enabled: Option<bool>,
    broker_addr: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    presence_topic: Option<String>,
    duration_topic: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FramesConfigFile {
    errors: Option<FrameErrorPolicy>,
    max_consecutive_errors: Option<u32>,
    output_image: Option<PathBuf>,
    stream: Option<bool>,
    annotate: Option<bool>,
    label_font: Option<PathBuf>,
    channel_order: Option<ChannelOrder>,
    input_scale: Option<f32>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// `stub://...`, or a path to an ONNX model.
    pub model: Option<String>,
    /// Overrides the model's declared input size, as `(width, height)`.
    pub model_input: Option<(u32, u32)>,
    pub input: Option<String>,
    pub device: Device,
    pub prob_threshold: f32,
    pub requests: usize,
    pub tracker: TrackerConfig,
    pub mqtt: MqttConfig,
    pub frames: FrameSettings,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_addr: String,
    pub settings: MqttSettings,
    pub topics: Topics,
}

#[derive(Debug, Clone)]
pub struct FrameSettings {
    pub errors: FrameErrorPolicy,
    pub max_consecutive_errors: u32,
    pub output_image: PathBuf,
    /// Write raw frames to stdout outside single-image mode.
    pub stream: bool,
    pub annotate: bool,
    /// TrueType font for the inference-time label; system fonts are tried
    /// when unset.
    pub label_font: Option<PathBuf>,
    pub layout: InputLayout,
    pub poll_interval: Duration,
}

impl PresenceConfig {
    /// Load from the file named by `PRESENCE_CONFIG` (if set) plus env.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from `path` (if any) plus env, then validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => PresenceConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PresenceConfigFile) -> Result<Self> {
        let tracker_file = file.tracker.unwrap_or_default();
        let tracker = TrackerConfig {
            grace_frames: tracker_file.grace_frames.unwrap_or(DEFAULT_GRACE_FRAMES),
            min_visit: tracker_file
                .min_visit_secs
                .map(min_visit_from_secs)
                .transpose()?
                .unwrap_or(DEFAULT_MIN_VISIT),
            visit_counting: tracker_file.visit_counting.unwrap_or_default(),
        };

        let mqtt_file = file.mqtt.unwrap_or_default();
        let mut settings = MqttSettings::default();
        if let Some(client_id) = mqtt_file.client_id {
            settings.client_id = client_id;
        }
        settings.username = mqtt_file.username;
        settings.password = mqtt_file.password;
        let defaults = Topics::default();
        let mqtt = MqttConfig {
            enabled: mqtt_file.enabled.unwrap_or(true),
            broker_addr: mqtt_file
                .broker_addr
                .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
            settings,
            topics: Topics {
                presence: mqtt_file.presence_topic.unwrap_or(defaults.presence),
                duration: mqtt_file.duration_topic.unwrap_or(defaults.duration),
            },
        };

        let frames_file = file.frames.unwrap_or_default();
        let default_layout = InputLayout::default();
        let frames = FrameSettings {
            errors: frames_file.errors.unwrap_or_default(),
            max_consecutive_errors: frames_file
                .max_consecutive_errors
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FRAME_ERRORS),
            output_image: frames_file
                .output_image
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_IMAGE)),
            stream: frames_file.stream.unwrap_or(true),
            annotate: frames_file.annotate.unwrap_or(true),
            label_font: frames_file.label_font,
            layout: InputLayout {
                order: frames_file.channel_order.unwrap_or(default_layout.order),
                scale: frames_file.input_scale.unwrap_or(default_layout.scale),
            },
            poll_interval: frames_file
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        };

        let device = match file.device.as_deref() {
            Some(device) => device.parse()?,
            None => Device::default(),
        };
        Ok(Self {
            model: file.model,
            model_input: file.model_input,
            input: file.input,
            device,
            prob_threshold: file.prob_threshold.unwrap_or(DEFAULT_PROB_THRESHOLD),
            requests: file.requests.unwrap_or(1),
            tracker,
            mqtt,
            frames,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(model) = env_value("PRESENCE_MODEL") {
            self.model = Some(model);
        }
        if let Some(input) = env_value("PRESENCE_INPUT") {
            self.input = Some(input);
        }
        if let Some(device) = env_value("PRESENCE_DEVICE") {
            self.device = device.parse()?;
        }
        if let Some(threshold) = env_value("PRESENCE_PROB_THRESHOLD") {
            self.prob_threshold = parse_env("PRESENCE_PROB_THRESHOLD", &threshold)?;
        }
        if let Some(addr) = env_value("PRESENCE_MQTT_BROKER_ADDR") {
            self.mqtt.broker_addr = addr;
        }
        if let Some(frames) = env_value("PRESENCE_GRACE_FRAMES") {
            self.tracker.grace_frames = parse_env("PRESENCE_GRACE_FRAMES", &frames)?;
        }
        if let Some(secs) = env_value("PRESENCE_MIN_VISIT_SECS") {
            let secs: f64 = parse_env("PRESENCE_MIN_VISIT_SECS", &secs)?;
            self.tracker.min_visit = min_visit_from_secs(secs)?;
        }
        if let Some(requests) = env_value("PRESENCE_REQUESTS") {
            self.requests = parse_env("PRESENCE_REQUESTS", &requests)?;
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PresenceError> {
        if !(0.0..=1.0).contains(&self.prob_threshold) {
            return Err(PresenceError::Configuration(format!(
                "probability threshold must be within 0..=1, got {}",
                self.prob_threshold
            )));
        }
        if self.requests == 0 {
            return Err(PresenceError::Configuration(
                "at least one inference request slot is required".into(),
            ));
        }
        if self.mqtt.enabled {
            parse_mqtt_endpoint(&self.mqtt.broker_addr)?;
        }
        if self.mqtt.topics.presence.trim().is_empty() || self.mqtt.topics.duration.trim().is_empty()
        {
            return Err(PresenceError::Configuration("MQTT topics must not be empty".into()));
        }
        if !(self.frames.layout.scale.is_finite() && self.frames.layout.scale > 0.0) {
            return Err(PresenceError::Configuration(format!(
                "input scale must be positive, got {}",
                self.frames.layout.scale
            )));
        }
        if self.frames.poll_interval.is_zero() {
            return Err(PresenceError::Configuration(
                "poll interval must be greater than zero".into(),
            ));
        }
        if let Some(font) = self.frames.label_font.as_deref().filter(|font| !font.is_file()) {
            return Err(PresenceError::Configuration(format!(
                "label font {} does not exist",
                font.display()
            )));
        }
        if self.model_input.is_some_and(|(w, h)| w == 0 || h == 0) {
            return Err(PresenceError::Configuration(
                "model input size must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Model and input must be known before a run starts.
    pub fn require_sources(&self) -> Result<(&str, &str), PresenceError> {
        let model = self
            .model
            .as_deref()
            .filter(|model| !model.trim().is_empty())
            .ok_or_else(|| PresenceError::Configuration("no model given (--model)".into()))?;
        let input = self
            .input
            .as_deref()
            .filter(|input| !input.trim().is_empty())
            .ok_or_else(|| PresenceError::Configuration("no input given (--input)".into()))?;
        Ok((model, input))
    }
}

pub fn min_visit_from_secs(secs: f64) -> Result<Duration, PresenceError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        PresenceError::Configuration(format!(
            "minimum visit must be a non-negative number of seconds, got {}",
            secs
        ))
    })
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, PresenceError> {
    value
        .parse()
        .map_err(|_| PresenceError::Configuration(format!("{} has an invalid value: {}", key, value)))
}

fn read_config_file(path: &Path) -> Result<PresenceConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PresenceError::Configuration(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    let cfg = serde_json::from_str(&raw).map_err(|e| {
        PresenceError::Configuration(format!("invalid config file {}: {}", path.display(), e))
    })?;
    Ok(cfg)
}
