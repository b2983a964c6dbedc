//! presence_counter
//!
//! Runs person detection over a video, still image or camera feed, publishes
//! presence events to MQTT and writes annotated frames to stdout.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use presence_counter::annotate::LabelFont;
use presence_counter::config::min_visit_from_secs;
use presence_counter::detect::DEFAULT_MODEL_INPUT;
use presence_counter::transport::parse_mqtt_endpoint;
use presence_counter::{
    exit_code_for, open_source, AdapterSpec, DetectorAdapter, Device, EventSink, FrameErrorPolicy,
    FrameOutput, LogSink, MediaInput, ModelDescriptor, MqttSink, Pipeline, PipelineConfig,
    PresenceConfig, PresenceError,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Count people in a video feed and publish presence events over MQTT"
)]
struct Args {
    /// Detection model: a `.onnx` file, or `stub://name` for the built-in engine.
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Input: a video file, a still image (.jpg/.jpeg/.bmp/.png), CAM for the
    /// camera, or stub://name for a synthetic scene.
    #[arg(short = 'i', long)]
    input: Option<String>,

    /// Target device: CPU, GPU, FPGA or MYRIAD (default CPU).
    #[arg(short = 'd', long)]
    device: Option<Device>,

    /// Minimum detection confidence (default 0.5).
    #[arg(short = 't', long)]
    prob_threshold: Option<f32>,

    /// JSON configuration file.
    #[arg(long, env = "PRESENCE_CONFIG")]
    config: Option<PathBuf>,

    /// MQTT broker address (default 127.0.0.1:3001).
    #[arg(long)]
    mqtt_broker_addr: Option<String>,

    /// Log events instead of publishing them.
    #[arg(long)]
    no_mqtt: bool,

    /// Empty frames tolerated before a visit ends (default 35).
    #[arg(long)]
    grace_frames: Option<u32>,

    /// Shortest visit whose duration is reported, in seconds (default 2).
    #[arg(long)]
    min_visit_secs: Option<f64>,

    /// Inference requests kept in flight (default 1).
    #[arg(long)]
    requests: Option<usize>,

    /// Handling of frames that fail to decode or infer.
    #[arg(long, value_name = "abort|skip|absent")]
    frame_errors: Option<FrameErrorPolicy>,

    /// Annotated image written in single-image mode (default output_image.jpg).
    #[arg(long)]
    output_image: Option<PathBuf>,

    /// TrueType font for the inference-time label on output frames.
    #[arg(long)]
    label_font: Option<PathBuf>,

    /// Do not write raw frames to stdout.
    #[arg(long)]
    no_frame_output: bool,

    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value_t = ui::UiMode::Auto, value_name = "MODE")]
    ui: ui::UiMode,
}

impl Args {
    fn apply(&self, cfg: &mut PresenceConfig) -> Result<()> {
        if let Some(model) = &self.model {
            cfg.model = Some(model.clone());
        }
        if let Some(input) = &self.input {
            cfg.input = Some(input.clone());
        }
        if let Some(device) = self.device {
            cfg.device = device;
        }
        if let Some(threshold) = self.prob_threshold {
            cfg.prob_threshold = threshold;
        }
        if let Some(addr) = &self.mqtt_broker_addr {
            cfg.mqtt.broker_addr = addr.clone();
        }
        if self.no_mqtt {
            cfg.mqtt.enabled = false;
        }
        if let Some(frames) = self.grace_frames {
            cfg.tracker.grace_frames = frames;
        }
        if let Some(secs) = self.min_visit_secs {
            cfg.tracker.min_visit = min_visit_from_secs(secs)?;
        }
        if let Some(requests) = self.requests {
            cfg.requests = requests;
        }
        if let Some(policy) = self.frame_errors {
            cfg.frames.errors = policy;
        }
        if let Some(path) = &self.output_image {
            cfg.frames.output_image = path.clone();
        }
        if let Some(path) = &self.label_font {
            cfg.frames.label_font = Some(path.clone());
        }
        if self.no_frame_output {
            cfg.frames.stream = false;
        }
        cfg.validate()?;
        Ok(())
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        log::error!("{:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

fn run(args: &Args) -> Result<()> {
    let ui = ui::Ui::new(args.ui, std::io::stderr().is_terminal());

    let stage = ui.stage("Load configuration");
    let mut cfg = PresenceConfig::load_from(args.config.as_deref())?;
    args.apply(&mut cfg)?;
    let (model, input) = cfg.require_sources()?;
    let media = MediaInput::parse(input)?;
    let (width, height) = cfg.model_input.unwrap_or(DEFAULT_MODEL_INPUT);
    let descriptor = ModelDescriptor::resolve(model)?.with_input_size(width, height);
    stage.finish();

    let stage = ui.stage("Load model");
    let spec = AdapterSpec {
        concurrent_requests: cfg.requests,
        ..AdapterSpec::default()
    };
    let (adapter, input_shape) = DetectorAdapter::configure(&descriptor, cfg.device, spec)?;
    log::info!("model input {:?}", input_shape);
    stage.finish();

    let stage = ui.stage("Open input");
    let source = open_source(&media)?;
    stage.finish();

    let sink: Box<dyn EventSink> = if cfg.mqtt.enabled {
        let stage = ui.stage("Start MQTT client");
        let endpoint = parse_mqtt_endpoint(&cfg.mqtt.broker_addr)?;
        let sink = MqttSink::connect(&endpoint, &cfg.mqtt.settings)?;
        stage.finish();
        Box::new(sink)
    } else {
        log::info!("MQTT disabled; events are logged");
        Box::new(LogSink)
    };

    let output = if media.is_single_image() {
        FrameOutput::Image(cfg.frames.output_image.clone())
    } else if !cfg.frames.stream {
        FrameOutput::None
    } else if std::io::stdout().is_terminal() {
        log::info!("stdout is a terminal; raw frame output disabled");
        FrameOutput::None
    } else {
        FrameOutput::Stream(Box::new(std::io::stdout()))
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .context("install Ctrl-C handler")?;
    }

    let pipeline_cfg = PipelineConfig {
        prob_threshold: cfg.prob_threshold,
        tracker: cfg.tracker,
        topics: cfg.mqtt.topics.clone(),
        frame_errors: cfg.frames.errors,
        max_consecutive_frame_errors: cfg.frames.max_consecutive_errors,
        poll_interval: cfg.frames.poll_interval,
        layout: cfg.frames.layout,
        annotate: cfg.frames.annotate,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(source, adapter, sink, pipeline_cfg)
        .with_output(output)
        .with_stop_flag(stop);
    if cfg.frames.annotate {
        let font = match &cfg.frames.label_font {
            Some(path) => Some(
                LabelFont::load(path)
                    .map_err(|err| PresenceError::Configuration(format!("{:#}", err)))?,
            ),
            None => LabelFont::discover(),
        };
        match font {
            Some(font) => pipeline = pipeline.with_label_font(font),
            None => log::info!("no label font found; inference time is not drawn"),
        }
    }
    let summary = pipeline.run()?;
    ui.summary(&summary);
    Ok(())
}
