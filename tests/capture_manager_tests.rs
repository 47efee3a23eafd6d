mod support;

use std::sync::Arc;
use std::time::Duration;

use support::*;
use tokio::sync::Notify;
use voice_capture::audio::WavHeader;
use voice_capture::{
    CaptureConfig, CaptureError, CaptureEvent, CaptureManager, DefaultPipelineFactory,
    DeviceError, EmptyReason, StopReason,
};

fn manager(config: CaptureConfig, backend: FakeBackend) -> (CaptureManager, Arc<Counters>) {
    let counters = Arc::clone(&backend.counters);
    let manager = CaptureManager::new(config, Arc::new(backend), Arc::new(DefaultPipelineFactory));
    (manager, counters)
}

fn record_events(manager: &CaptureManager) -> (EventLog, voice_capture::Subscription) {
    let log = EventLog::new();
    let sink = log.clone();
    let subscription = manager.events().subscribe(move |event| sink.record(event));
    (log, subscription)
}

#[tokio::test(start_paused = true)]
async fn test_speech_then_silence_auto_stops() {
    let (manager, counters) = manager(
        CaptureConfig::default(),
        FakeBackend::new(vec![loud(1000)]),
    );
    let (log, _sub) = record_events(&manager);

    manager.initialize(None).await.unwrap();
    manager.start().unwrap();
    assert!(manager.is_recording());

    assert!(log.wait_for(is_finished, Duration::from_secs(10)).await);

    let events = log.snapshot();
    assert!(matches!(events[0], CaptureEvent::RecordingStarted { .. }));

    let speech_ms = events
        .iter()
        .find_map(|e| match e {
            CaptureEvent::SpeechEnded { duration_ms } => Some(*duration_ms),
            _ => None,
        })
        .expect("speech should end");
    assert!((900..=1200).contains(&speech_ms), "speech lasted {speech_ms}ms");

    let stop_at = events
        .iter()
        .position(|e| {
            *e == CaptureEvent::AutoStopped {
                reason: StopReason::SilenceTimeout,
            }
        })
        .expect("silence should stop the recording");
    let stopped_at = events
        .iter()
        .position(|e| *e == CaptureEvent::RecordingStopped)
        .unwrap();
    assert!(stop_at < stopped_at);

    let result = match events.last() {
        Some(CaptureEvent::RecordingComplete(result)) => result.clone(),
        other => panic!("expected a result, got {other:?}"),
    };
    assert!(result.file_name.starts_with("voice_recording_"));
    assert!(result.file_name.ends_with(".wav"));
    assert_eq!(result.mime_type, "audio/wav");
    let header = WavHeader::parse(&result.bytes).unwrap();
    assert_eq!(header.sample_rate, RATE);
    assert_eq!(header.channels, 1);
    let speech = result.speech.expect("speech segment recorded");
    assert_eq!(speech.duration_ms(), speech_ms);

    assert!(!manager.is_recording());
    assert!(!manager.is_initialized());
    assert_eq!(counters.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_max_duration_stops_exactly_once() {
    let config = CaptureConfig {
        max_recording_duration_ms: 5000,
        ..Default::default()
    };
    let (manager, counters) = manager(config, FakeBackend::new(Vec::new()).with_tail(LOUD));
    let (log, _sub) = record_events(&manager);

    manager.initialize(None).await.unwrap();
    manager.start().unwrap();

    assert!(log.wait_for(is_finished, Duration::from_secs(10)).await);
    tokio::time::sleep(Duration::from_secs(10)).await;

    let max_duration = CaptureEvent::AutoStopped {
        reason: StopReason::MaxDuration,
    };
    assert_eq!(log.count(|e| *e == max_duration), 1);
    assert_eq!(log.count(is_complete), 1);
    assert_eq!(log.count(|e| *e == CaptureEvent::RecordingStopped), 1);

    let events = log.snapshot();
    let result = events
        .iter()
        .find_map(|e| match e {
            CaptureEvent::RecordingComplete(result) => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    assert!((5000..5100).contains(&result.duration_ms));
    assert_eq!(counters.releases(), 1);
    assert!(!manager.is_initialized());
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let (manager, _counters) = manager(
        CaptureConfig::default(),
        FakeBackend::new(Vec::new()).with_tail(LOUD),
    );
    let (log, _sub) = record_events(&manager);

    assert!(!manager.stop());

    manager.initialize(None).await.unwrap();
    manager.start().unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(manager.stop());
    assert!(!manager.stop());

    assert!(log.wait_for(is_finished, Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(log.count(is_complete), 1);
    assert_eq!(log.count(|e| *e == CaptureEvent::RecordingStopped), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_immediately_reports_empty_capture() {
    let (manager, _counters) = manager(
        CaptureConfig::default(),
        FakeBackend::new(Vec::new()).with_tail(LOUD),
    );
    let (log, _sub) = record_events(&manager);

    manager.initialize(None).await.unwrap();
    manager.start().unwrap();
    assert!(manager.stop());

    assert!(log.wait_for(is_finished, Duration::from_secs(5)).await);
    let events = log.snapshot();
    assert!(events
        .iter()
        .any(|e| *e == CaptureEvent::Error(CaptureError::EmptyCapture(EmptyReason::NoData))));
    assert_eq!(log.count(is_complete), 0);
}

#[tokio::test(start_paused = true)]
async fn test_small_capture_is_rejected() {
    let config = CaptureConfig {
        min_capture_bytes: 10_000_000,
        ..Default::default()
    };
    let (manager, _counters) = manager(config, FakeBackend::new(Vec::new()).with_tail(LOUD));
    let (log, _sub) = record_events(&manager);

    manager.initialize(None).await.unwrap();
    manager.start().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    manager.stop();

    assert!(log.wait_for(is_finished, Duration::from_secs(5)).await);
    let error = log
        .snapshot()
        .into_iter()
        .find_map(|e| match e {
            CaptureEvent::Error(e) => Some(e),
            _ => None,
        })
        .unwrap();
    match error {
        CaptureError::EmptyCapture(EmptyReason::TooSmall { size, minimum }) => {
            assert!(size > 0);
            assert_eq!(minimum, 10_000_000);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_requires_initialize() {
    let (manager, _counters) = manager(
        CaptureConfig::default(),
        FakeBackend::new(Vec::new()).with_tail(LOUD),
    );

    assert_eq!(manager.start(), Err(CaptureError::NotInitialized));

    manager.initialize(None).await.unwrap();
    assert_eq!(
        manager.initialize(None).await,
        Err(CaptureError::AlreadyActive)
    );

    manager.start().unwrap();
    assert_eq!(manager.start(), Err(CaptureError::AlreadyActive));
    assert!(manager.duration_ms() < 100);
    assert!(manager.encoding().unwrap().is_wav());
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_is_reported() {
    let (manager, counters) = manager(
        CaptureConfig::default(),
        FakeBackend::failing(DeviceError::PermissionDenied),
    );

    let err = manager.initialize(None).await.unwrap_err();
    assert_eq!(err, CaptureError::Device(DeviceError::PermissionDenied));
    assert!(err.to_string().to_lowercase().contains("permission denied"));
    assert!(!manager.is_initialized());

    // A failed open leaves the manager ready to try again
    assert_eq!(
        manager.initialize(None).await,
        Err(CaptureError::Device(DeviceError::PermissionDenied))
    );
    assert_eq!(counters.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_during_initialize_cancels() {
    let gate = Arc::new(Notify::new());
    let mut backend = FakeBackend::new(Vec::new());
    backend.gate = Some(Arc::clone(&gate));
    let (manager, counters) = manager(CaptureConfig::default(), backend);
    let manager = Arc::new(manager);
    let (log, _sub) = record_events(&manager);

    let pending = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.initialize(None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    manager.destroy();
    gate.notify_one();

    assert_eq!(pending.await.unwrap(), Err(CaptureError::Cancelled));
    assert!(!manager.is_initialized());
    assert_eq!(counters.opens(), 1);
    assert_eq!(counters.releases(), 1);
    assert!(log.snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_destroy_discards_recording() {
    let (manager, counters) = manager(
        CaptureConfig::default(),
        FakeBackend::new(Vec::new()).with_tail(LOUD),
    );
    let (log, _sub) = record_events(&manager);

    manager.initialize(None).await.unwrap();
    manager.start().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    manager.destroy();
    manager.destroy();
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(log.count(is_finished), 0);
    assert!(!manager.is_recording());
    assert_eq!(counters.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_device_fault_tears_down_graph() {
    let mut backend = FakeBackend::new(Vec::new()).with_tail(LOUD);
    backend.fault_after_ms = Some(200);
    let (manager, counters) = manager(CaptureConfig::default(), backend);
    let (log, _sub) = record_events(&manager);

    manager.initialize(None).await.unwrap();
    manager.start().unwrap();

    assert!(log.wait_for(is_error, Duration::from_secs(5)).await);
    let error = log
        .snapshot()
        .into_iter()
        .find_map(|e| match e {
            CaptureEvent::Error(e) => Some(e),
            _ => None,
        })
        .unwrap();
    match error {
        CaptureError::Pipeline(message) => assert!(message.contains("unplugged")),
        other => panic!("unexpected error {other:?}"),
    }

    assert!(!manager.is_initialized());
    assert!(!manager.is_recording());
    assert_eq!(counters.releases(), 1);
    assert_eq!(log.count(is_complete), 0);
}

#[tokio::test(start_paused = true)]
async fn test_kept_device_records_again() {
    let config = CaptureConfig {
        release_device_on_stop: false,
        ..Default::default()
    };
    let (manager, counters) = manager(config, FakeBackend::new(Vec::new()).with_tail(LOUD));
    let (log, _sub) = record_events(&manager);

    manager.initialize(None).await.unwrap();
    for _ in 0..2 {
        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        manager.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(log.count(is_complete), 2);
    assert!(manager.is_initialized());
    assert_eq!(counters.opens(), 1);
    assert_eq!(counters.releases(), 0);

    manager.destroy();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_stop_is_flushing_is_refused() {
    let (manager, counters) = manager(
        CaptureConfig::default(),
        FakeBackend::new(Vec::new()).with_tail(LOUD),
    );
    let (log, _sub) = record_events(&manager);

    manager.initialize(None).await.unwrap();
    manager.start().unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(manager.stop());
    assert_eq!(manager.start(), Err(CaptureError::AlreadyActive));
    assert!(!manager.is_recording());

    manager.settled().await;
    assert!(!manager.is_initialized());
    assert_eq!(counters.releases(), 1);

    manager.initialize(None).await.unwrap();
    manager.start().unwrap();
    assert!(manager.is_recording());
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(manager.stop());
    manager.settled().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = |e: &CaptureEvent| matches!(e, CaptureEvent::RecordingStarted { .. });
    assert_eq!(log.count(started), 2);
    assert_eq!(log.count(is_complete), 2);
    assert_eq!(counters.opens(), 2);
    assert_eq!(counters.peak(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_kept_device_restarts_after_settling() {
    let config = CaptureConfig {
        release_device_on_stop: false,
        ..Default::default()
    };
    let (manager, counters) = manager(config, FakeBackend::new(Vec::new()).with_tail(LOUD));
    let (log, _sub) = record_events(&manager);

    manager.initialize(None).await.unwrap();
    manager.start().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(manager.stop());
    assert_eq!(manager.start(), Err(CaptureError::AlreadyActive));

    manager.settled().await;
    manager.start().unwrap();
    assert!(manager.is_recording());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(manager.stop());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(log.count(is_complete), 2);
    assert!(manager.is_initialized());
    assert_eq!(counters.opens(), 1);
    manager.destroy();
}

#[tokio::test(start_paused = true)]
async fn test_settled_returns_without_a_stop() {
    let (manager, _counters) = manager(
        CaptureConfig::default(),
        FakeBackend::new(Vec::new()).with_tail(LOUD),
    );
    manager.settled().await;

    manager.initialize(None).await.unwrap();
    manager.start().unwrap();
    manager.settled().await;
    assert!(manager.is_recording());
    manager.destroy();
}
