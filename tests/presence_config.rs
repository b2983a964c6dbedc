use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use presence_counter::config::PresenceConfig;
use presence_counter::{exit_code_for, Device, FrameErrorPolicy, VisitCounting};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PRESENCE_CONFIG",
        "PRESENCE_MODEL",
        "PRESENCE_INPUT",
        "PRESENCE_DEVICE",
        "PRESENCE_PROB_THRESHOLD",
        "PRESENCE_MQTT_BROKER_ADDR",
        "PRESENCE_GRACE_FRAMES",
        "PRESENCE_MIN_VISIT_SECS",
        "PRESENCE_REQUESTS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PresenceConfig::load().expect("load defaults");
    assert_eq!(cfg.model, None);
    assert_eq!(cfg.device, Device::Cpu);
    assert_eq!(cfg.prob_threshold, 0.5);
    assert_eq!(cfg.requests, 1);
    assert_eq!(cfg.tracker.grace_frames, 35);
    assert_eq!(cfg.tracker.min_visit, Duration::from_secs(2));
    assert_eq!(cfg.tracker.visit_counting, VisitCounting::Episodes);
    assert_eq!(cfg.mqtt.broker_addr, "127.0.0.1:3001");
    assert_eq!(cfg.mqtt.topics.presence, "presence");
    assert_eq!(cfg.mqtt.topics.duration, "presence/duration");
    assert_eq!(cfg.frames.errors, FrameErrorPolicy::Abort);
    assert_eq!(cfg.frames.max_consecutive_errors, 30);
    assert_eq!(cfg.frames.output_image.to_str(), Some("output_image.jpg"));
    assert_eq!(cfg.frames.label_font, None);
    assert!(cfg.require_sources().is_err());
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "model": "models/person-detection.onnx",
            "input": "lobby.mp4",
            "device": "gpu",
            "prob_threshold": 0.7,
            "requests": 2,
            "tracker": {
                "grace_frames": 20,
                "min_visit_secs": 1.5,
                "visit_counting": "occupants"
            },
            "mqtt": {
                "broker_addr": "mqtts://broker.local:8883",
                "client_id": "lobby-counter",
                "presence_topic": "lobby/presence",
                "duration_topic": "lobby/duration"
            },
            "frames": {
                "errors": "absent",
                "max_consecutive_errors": 5,
                "channel_order": "bgr",
                "input_scale": 1.0
            }
        }"#,
    );

    std::env::set_var("PRESENCE_CONFIG", file.path());
    std::env::set_var("PRESENCE_INPUT", "CAM");
    std::env::set_var("PRESENCE_GRACE_FRAMES", "10");
    std::env::set_var("PRESENCE_REQUESTS", "3");

    let cfg = PresenceConfig::load().expect("load config");

    assert_eq!(cfg.model.as_deref(), Some("models/person-detection.onnx"));
    assert_eq!(cfg.input.as_deref(), Some("CAM"));
    assert_eq!(cfg.device, Device::Gpu);
    assert_eq!(cfg.prob_threshold, 0.7);
    assert_eq!(cfg.requests, 3);
    assert_eq!(cfg.tracker.grace_frames, 10);
    assert_eq!(cfg.tracker.min_visit, Duration::from_millis(1500));
    assert_eq!(cfg.tracker.visit_counting, VisitCounting::Occupants);
    assert_eq!(cfg.mqtt.broker_addr, "mqtts://broker.local:8883");
    assert_eq!(cfg.mqtt.settings.client_id, "lobby-counter");
    assert_eq!(cfg.mqtt.topics.presence, "lobby/presence");
    assert_eq!(cfg.frames.errors, FrameErrorPolicy::TreatAsAbsent);
    assert_eq!(cfg.frames.max_consecutive_errors, 5);
    assert_eq!(cfg.frames.layout.scale, 1.0);
    assert_eq!(
        cfg.require_sources().unwrap(),
        ("models/person-detection.onnx", "CAM")
    );

    clear_env();
}

#[test]
fn invalid_values_are_configuration_errors() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PRESENCE_PROB_THRESHOLD", "1.5");
    let err = PresenceConfig::load().unwrap_err();
    assert_eq!(exit_code_for(&err), 2);

    clear_env();
    std::env::set_var("PRESENCE_DEVICE", "HETERO:FPGA,CPU");
    let err = PresenceConfig::load().unwrap_err();
    assert_eq!(exit_code_for(&err), 2);

    clear_env();
    std::env::set_var("PRESENCE_MQTT_BROKER_ADDR", "localhost");
    let err = PresenceConfig::load().unwrap_err();
    assert_eq!(exit_code_for(&err), 2);

    clear_env();
    std::env::set_var("PRESENCE_REQUESTS", "0");
    let err = PresenceConfig::load().unwrap_err();
    assert_eq!(exit_code_for(&err), 2);

    clear_env();
}

#[test]
fn broken_config_files_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let unknown = write_config(r#"{ "modle": "typo.onnx" }"#);
    let err = PresenceConfig::load_from(Some(unknown.path())).unwrap_err();
    assert_eq!(exit_code_for(&err), 2);

    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("absent.json");
    let err = PresenceConfig::load_from(Some(&missing)).unwrap_err();
    assert_eq!(exit_code_for(&err), 2);

    let negative = write_config(r#"{ "tracker": { "min_visit_secs": -1 } }"#);
    assert!(PresenceConfig::load_from(Some(negative.path())).is_err());

    let missing_font = write_config(r#"{ "frames": { "label_font": "/nonexistent/font.ttf" } }"#);
    let err = PresenceConfig::load_from(Some(missing_font.path())).unwrap_err();
    assert_eq!(exit_code_for(&err), 2);
}
