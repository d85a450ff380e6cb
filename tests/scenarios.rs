// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use inspector_rs::camera::{FrameCollector, SourceConfig};
use inspector_rs::pipeline::RecordStatus;
use inspector_rs::tools::ToolEnv;
use inspector_rs::{
    BoundingBox, CameraMode, CameraSettings, Detection, DisplayMode, Frame, FrameSource, JobManager,
    PipelineContext, PixelLayout, ResultManager, ReviewRing, Status, StubCamera, ToolKind, Verdict,
    ViewCoordinator,
};

fn trigger_source(cooldown_ms: u64, fps: f32) -> FrameSource {
    let (cam, _handle) = StubCamera::new(640, 480);
    let source = FrameSource::new(
        Box::new(cam),
        SourceConfig {
            cooldown: Duration::from_millis(cooldown_ms),
            ..Default::default()
        },
    );
    source
        .configure(CameraSettings {
            width: 64,
            height: 48,
            target_fps: fps,
            ..Default::default()
        })
        .unwrap();
    source
}

fn det(name: &str, id: usize, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
    Detection::new(id, name, 0.9, BoundingBox::new(x1, y1, x2, y2))
}

fn verdict(status: Status) -> Verdict {
    Verdict {
        status,
        similarity: if status == Status::Ok { 1.0 } else { 0.0 },
        reason: String::new(),
        source_tool: "test".into(),
    }
}

#[test]
fn live_then_trigger_then_single_shot() {
    let source = trigger_source(250, 10.0);
    let collector = Arc::new(FrameCollector::new());
    source.subscribe(collector.clone());

    source.set_mode(CameraMode::Live).unwrap();
    thread::sleep(Duration::from_secs(1));
    source.set_mode(CameraMode::Trigger).unwrap();
    let emitted = collector.len();
    assert!(emitted >= 5, "live mode should have produced frames, got {}", emitted);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(collector.len(), emitted, "trigger mode must not stream");

    let previous = collector.last_sequence().unwrap();
    let shot = source.capture_once().expect("shot after idle period");
    assert_eq!(shot.sequence(), previous + 1);
    assert_eq!(collector.len(), emitted + 1);
    source.shutdown();
}

#[test]
fn cooldown_allows_one_shot() {
    let source = trigger_source(250, 30.0);
    source.set_mode(CameraMode::Trigger).unwrap();

    let started = Instant::now();
    let shots = (0..5)
        .filter_map(|_| {
            let shot = source.capture_once();
            thread::sleep(Duration::from_millis(20));
            shot
        })
        .count();
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(shots, 1);
    source.shutdown();
}

#[test]
fn detection_reference_ok_and_ng() {
    let results = ResultManager::new(5);
    results.set_reference_detections(
        vec![det("A", 0, 10.0, 10.0, 50.0, 50.0), det("B", 1, 60.0, 10.0, 100.0, 50.0)],
        None,
    );

    let current = vec![det("A", 0, 12.0, 12.0, 52.0, 52.0), det("B", 1, 58.0, 12.0, 102.0, 52.0)];
    let ok = results.evaluate_detections(&current, 0.8, "detect");
    assert_eq!(ok.status, Status::Ok);
    assert!(ok.similarity > 0.8 && ok.similarity <= 1.0);

    let ng = results.evaluate_detections(&current[..1], 0.8, "detect");
    assert_eq!(ng.status, Status::Ng);
    assert!((ng.similarity - 0.5).abs() < 0.05, "similarity {}", ng.similarity);
}

#[test]
fn failing_tool_does_not_stop_pipeline() {
    let results = Arc::new(ResultManager::new(5));
    results.set_reference_detections(
        vec![det("A", 0, 10.0, 10.0, 50.0, 50.0), det("B", 1, 60.0, 10.0, 100.0, 50.0)],
        None,
    );
    let env = ToolEnv::new(results);
    let mut jobs = JobManager::new(env);
    let camera = jobs.add_tool(ToolKind::CameraSource, None).unwrap();
    // 未设置模型路径, 每帧都会失败
    let detect = jobs.add_tool(ToolKind::Detect, None).unwrap();
    let result = jobs.add_tool(ToolKind::Result, None).unwrap();

    let frame = Frame::new((0..48u8).collect(), 4, 4, PixelLayout::Bgr).unwrap();
    let run = jobs.run(&frame);

    assert!(run.error.is_none());
    assert_eq!(run.failed_tools(), vec![detect]);
    assert!(run.context.tool_error(detect).is_some());
    assert!(run.context.extra(&PipelineContext::error_key(detect)).is_some());
    assert_eq!(run.record(camera).unwrap().status, RecordStatus::Ok);
    assert_eq!(run.record(result).unwrap().status, RecordStatus::Ok);
    // 检测失败按"没有检测结果"判定, 而不是"没有参考"
    let verdict = run.context.verdict.as_ref().unwrap();
    assert_eq!(verdict.status, Status::Ng);
    assert_eq!(verdict.reason, "no detections (expected 2)");
    assert_eq!(verdict.source_tool, format!("detect#{}", detect));
    assert!(run.output.pixels_eq(&frame));

    let order: Vec<Instant> = run.results.iter().map(|r| r.invoked_at).collect();
    assert!(order.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn display_conversion_follows_channel_count() {
    let store = Arc::new(inspector_rs::pipeline::FrameStore::new());
    let mut view = ViewCoordinator::new(store.clone());
    view.set_mode(DisplayMode::Raw);

    // 四通道按 BGRA 处理, 与格式名无关
    let bgra = vec![10, 20, 30, 255, 40, 50, 60, 255];
    store.record_raw(&Frame::from_camera_buffer(bgra, 2, 1, "XBGR8888").unwrap());
    let img = view.display_image();
    assert_eq!(img.get_pixel(0, 0).0, [30, 20, 10]);
    assert_eq!(img.get_pixel(1, 0).0, [60, 50, 40]);

    // "RGB888" 实际是 BGR 字节序
    let bgr = vec![1, 2, 3, 4, 5, 6];
    store.record_raw(&Frame::from_camera_buffer(bgr, 2, 1, "RGB888").unwrap());
    let img = view.display_image();
    assert_eq!(img.get_pixel(0, 0).0, [3, 2, 1]);
    assert_eq!(img.get_pixel(1, 0).0, [6, 5, 4]);
}

#[test]
fn review_panes_stay_aligned() {
    let ring = ReviewRing::new(5);
    let results = ResultManager::new(5);
    let statuses = [
        Status::Ng,
        Status::Ok,
        Status::Ok,
        Status::Ng,
        Status::Ok,
        Status::Ng,
        Status::Ok,
    ];
    for (i, status) in statuses.iter().enumerate() {
        let frame = Frame::black(4, 4).stamped(i as u64 + 1, Instant::now());
        ring.append(frame, verdict(*status));
        results.record(verdict(*status));
    }

    assert_eq!(ring.len(), 5);
    let expected = [Status::Ok, Status::Ng, Status::Ok, Status::Ng, Status::Ok];
    for pane in 1..=5 {
        let entry = ring.pane(pane).unwrap();
        assert_eq!(entry.frame.sequence(), 8 - pane as u64);
        assert_eq!(entry.verdict.status, expected[pane - 1]);
        assert_eq!(results.pane_status(pane), Some(expected[pane - 1]));
    }
    assert!(ring.pane(6).is_none());
}
