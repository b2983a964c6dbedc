use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use presence_counter::ingest::OccupiedSpan;
use presence_counter::{
    open_source, AdapterSpec, DetectorAdapter, Device, EventMessage, FileSource, FrameOutput,
    MediaInput, MemorySink, Pipeline, PipelineConfig, StopReason, StubEngine, SyntheticScene,
    TrackerConfig, VisitCounting,
};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

fn scene(frames: Option<u64>, occupied: Vec<OccupiedSpan>) -> SyntheticScene {
    SyntheticScene {
        width: WIDTH,
        height: HEIGHT,
        fps: 10,
        frames,
        occupied,
        dropout_every: None,
    }
}

fn adapter(engine: StubEngine, requests: usize) -> DetectorAdapter {
    let spec = AdapterSpec {
        concurrent_requests: requests,
        ..AdapterSpec::default()
    };
    DetectorAdapter::from_engine(Arc::new(engine), Device::Cpu, spec).expect("adapter")
}

fn config(grace_frames: u32) -> PipelineConfig {
    PipelineConfig {
        tracker: TrackerConfig {
            grace_frames,
            min_visit: Duration::from_secs(2),
            visit_counting: VisitCounting::Episodes,
        },
        poll_interval: Duration::from_millis(20),
        ..PipelineConfig::default()
    }
}

fn payloads(messages: &[EventMessage]) -> Vec<(String, String)> {
    messages
        .iter()
        .map(|m| (m.topic.clone(), m.payload_str().to_string()))
        .collect()
}

#[test]
fn synthetic_visit_produces_total_and_duration() -> Result<()> {
    let sink = MemorySink::new();
    let summary = Pipeline::new(
        Box::new(FileSource::synthetic(scene(
            Some(120),
            vec![OccupiedSpan::new(10..40, 1)],
        ))),
        adapter(StubEngine::scene(WIDTH, HEIGHT), 1),
        Box::new(sink.clone()),
        config(5),
    )
    .run()?;

    assert_eq!(summary.stop_reason, StopReason::EndOfStream);
    assert_eq!(summary.frames_processed, 120);
    assert_eq!(summary.frames_skipped, 0);
    assert_eq!(summary.total_visits, 1);
    assert_eq!(summary.final_count, 0);
    assert!(summary.mean_inference_latency.is_some());

    let messages = payloads(&sink.messages());
    assert_eq!(messages.len(), 122);
    let totals: Vec<_> = messages
        .iter()
        .filter(|(_, payload)| payload.contains("total"))
        .collect();
    assert_eq!(totals.len(), 1);
    assert_eq!(totals[0].1, r#"{"total":1}"#);
    // Present from frame 10, gone at frame 45 after five grace frames.
    let durations: Vec<_> = messages
        .iter()
        .filter(|(topic, _)| topic == "presence/duration")
        .collect();
    assert_eq!(durations.len(), 1);
    assert_eq!(durations[0].1, r#"{"duration":3}"#);
    assert_eq!(messages[10].1, r#"{"total":1}"#);
    assert!(sink.is_closed());
    Ok(())
}

#[test]
fn two_people_overlapping_count_as_one_visit() -> Result<()> {
    let sink = MemorySink::new();
    let summary = Pipeline::new(
        Box::new(FileSource::synthetic(scene(
            Some(40),
            vec![OccupiedSpan::new(5..30, 1), OccupiedSpan::new(10..20, 1)],
        ))),
        adapter(StubEngine::scene(WIDTH, HEIGHT), 1),
        Box::new(sink.clone()),
        config(3),
    )
    .run()?;

    assert_eq!(summary.total_visits, 1);
    assert!(payloads(&sink.messages())
        .iter()
        .any(|(_, payload)| payload == r#"{"count":2}"#));
    Ok(())
}

#[test]
fn multi_slot_results_arrive_in_capture_order() -> Result<()> {
    // Occupied frames are slow to infer, empty ones instant, so later frames
    // routinely finish before earlier ones.
    let slow_when_occupied = |tensor: &presence_counter::detect::Tensor| {
        if tensor.data().iter().any(|v| *v > 0.9) {
            Duration::from_millis(15)
        } else {
            Duration::ZERO
        }
    };
    let occupied: Vec<OccupiedSpan> = (0..30u64)
        .step_by(3)
        .map(|start| OccupiedSpan::new(start..start + 1, 1))
        .collect();

    let run = |requests: usize| -> Result<Vec<(String, String)>> {
        let sink = MemorySink::new();
        let engine = StubEngine::scene(WIDTH, HEIGHT).with_latency(slow_when_occupied);
        Pipeline::new(
            Box::new(FileSource::synthetic(scene(Some(30), occupied.clone()))),
            adapter(engine, requests),
            Box::new(sink.clone()),
            config(0),
        )
        .run()?;
        Ok(payloads(&sink.messages()))
    };

    let sequential = run(1)?;
    let overlapped = run(3)?;
    let counts: Vec<&str> = sequential
        .iter()
        .filter(|(_, payload)| payload.starts_with(r#"{"count""#))
        .map(|(_, payload)| payload.as_str())
        .collect();
    assert_eq!(counts.len(), 30);
    assert_eq!(&counts[..4], &[r#"{"count":1}"#, r#"{"count":0}"#, r#"{"count":0}"#, r#"{"count":1}"#]);
    assert_eq!(sequential, overlapped);
    Ok(())
}

#[test]
fn stop_flag_interrupts_an_endless_stream() -> Result<()> {
    let engine = Arc::new(
        StubEngine::scene(WIDTH, HEIGHT).with_latency(|_| Duration::from_millis(5)),
    );
    let adapter = DetectorAdapter::from_engine(
        Arc::clone(&engine) as Arc<dyn presence_counter::InferenceEngine>,
        Device::Cpu,
        AdapterSpec {
            concurrent_requests: 2,
            ..AdapterSpec::default()
        },
    )?;
    let sink = MemorySink::new();
    let pipeline = Pipeline::new(
        Box::new(FileSource::synthetic(scene(None, Vec::new()))),
        adapter,
        Box::new(sink.clone()),
        config(35),
    );
    let stop = pipeline.stop_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        stop.store(true, Ordering::SeqCst);
        Instant::now()
    });

    let summary = pipeline.run()?;
    let stopped_at = stopper.join().expect("stopper thread");

    assert_eq!(summary.stop_reason, StopReason::Interrupted);
    assert!(summary.frames_processed > 0);
    assert!(stopped_at.elapsed() < Duration::from_secs(2));
    // Every worker has been joined and the adapter dropped its engine handle.
    assert_eq!(Arc::strong_count(&engine), 1);
    assert!(sink.is_closed());
    Ok(())
}

#[test]
fn delivery_failures_do_not_stop_the_run() -> Result<()> {
    let sink = MemorySink::failing_after(3);
    let summary = Pipeline::new(
        Box::new(FileSource::synthetic(scene(
            Some(20),
            vec![OccupiedSpan::new(2..6, 1)],
        ))),
        adapter(StubEngine::scene(WIDTH, HEIGHT), 1),
        Box::new(sink.clone()),
        config(2),
    )
    .run()?;

    assert_eq!(summary.stop_reason, StopReason::EndOfStream);
    assert_eq!(summary.frames_processed, 20);
    assert_eq!(sink.messages().len(), 3);
    Ok(())
}

#[test]
fn single_image_mode_writes_an_annotated_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("door.png");
    let mut img = image::RgbImage::from_pixel(120, 90, image::Rgb([90, 90, 90]));
    for y in 20..70 {
        for x in 40..60 {
            img.put_pixel(x, y, image::Rgb([0, 255, 0]));
        }
    }
    img.save(&input)?;
    let output = dir.path().join("output_image.jpg");

    let media = MediaInput::parse(input.to_str().expect("utf-8 path"))?;
    assert!(media.is_single_image());
    let sink = MemorySink::new();
    let summary = Pipeline::new(
        open_source(&media)?,
        adapter(StubEngine::scene(300, 300), 1),
        Box::new(sink.clone()),
        config(35),
    )
    .with_output(FrameOutput::Image(output.clone()))
    .run()?;

    assert_eq!(summary.frames_processed, 1);
    assert_eq!(summary.total_visits, 1);
    let written = image::open(&output)?;
    assert_eq!((written.width(), written.height()), (120, 90));
    Ok(())
}
