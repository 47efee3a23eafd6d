// Shared fakes for integration tests: a scripted audio backend and a
// loudness-driven speech model.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use voice_capture::audio::{
    AudioBackend, AudioFrame, DeviceConstraints, DeviceHandle, DeviceStream, InputDevice,
};
use voice_capture::error::{CaptureError, DeviceError};
use voice_capture::events::CaptureEvent;
use voice_capture::neural::{ModelRuntime, RuntimeLoader, SpeechModel};

pub const RATE: u32 = 16_000;
pub const FRAME_MS: u64 = 20;
pub const LOUD: f32 = 0.1;
pub const SILENT: f32 = 0.0;

/// Constant-amplitude stretch of audio
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub amplitude: f32,
    pub duration_ms: u64,
}

pub fn loud(duration_ms: u64) -> Segment {
    Segment {
        amplitude: LOUD,
        duration_ms,
    }
}

pub fn silence(duration_ms: u64) -> Segment {
    Segment {
        amplitude: SILENT,
        duration_ms,
    }
}

#[derive(Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub releases: AtomicUsize,
    /// Streams open right now, and the most ever open at once
    pub live: AtomicUsize,
    pub peak: AtomicUsize,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Plays a script of segments in real (tokio) time, then `tail` forever.
pub struct FakeBackend {
    pub script: Vec<Segment>,
    pub tail: f32,
    pub open_error: Option<DeviceError>,
    pub fault_after_ms: Option<u64>,
    pub devices: Vec<InputDevice>,
    /// When set, `open` waits for a notification before completing
    pub gate: Option<Arc<Notify>>,
    pub counters: Arc<Counters>,
}

impl FakeBackend {
    pub fn new(script: Vec<Segment>) -> Self {
        Self {
            script,
            tail: SILENT,
            open_error: None,
            fault_after_ms: None,
            devices: vec![InputDevice {
                id: "fake".into(),
                label: "Fake Microphone".into(),
                is_default: true,
            }],
            gate: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_tail(mut self, tail: f32) -> Self {
        self.tail = tail;
        self
    }

    pub fn failing(error: DeviceError) -> Self {
        let mut backend = Self::new(Vec::new());
        backend.open_error = Some(error);
        backend
    }
}

struct FakeHandle {
    task: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl DeviceHandle for FakeHandle {
    fn release(&mut self) {
        self.task.abort();
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl AudioBackend for FakeBackend {
    fn is_available(&self) -> bool {
        true
    }

    async fn input_devices(&self) -> Result<Vec<InputDevice>, DeviceError> {
        Ok(self.devices.clone())
    }

    async fn open(&self, _constraints: &DeviceConstraints) -> Result<DeviceStream, DeviceError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(e) = &self.open_error {
            return Err(e.clone());
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(live, Ordering::SeqCst);

        let (frame_tx, frame_rx) = mpsc::channel(256);
        let (fault_tx, fault_rx) = oneshot::channel();
        let script = self.script.clone();
        let tail = self.tail;
        let fault_after_ms = self.fault_after_ms;

        let task = tokio::spawn(async move {
            let mut fault_tx = Some(fault_tx);
            let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
            let frame_len = (RATE as u64 * FRAME_MS / 1000) as usize;
            let mut now_ms = 0u64;

            loop {
                ticker.tick().await;

                if let (Some(limit), true) = (fault_after_ms, fault_tx.is_some()) {
                    if now_ms >= limit {
                        if let Some(tx) = fault_tx.take() {
                            let _ = tx.send("device unplugged".into());
                        }
                    }
                }

                let amplitude = amplitude_at(&script, tail, now_ms);
                let frame = AudioFrame {
                    samples: vec![amplitude; frame_len],
                    sample_rate: RATE,
                    channels: 1,
                    timestamp_ms: now_ms,
                };
                if frame_tx.send(frame).await.is_err() {
                    break;
                }
                now_ms += FRAME_MS;
            }
        });

        Ok(DeviceStream::new(
            frame_rx,
            fault_rx,
            RATE,
            1,
            "Fake Microphone",
            Box::new(FakeHandle {
                task,
                counters: Arc::clone(&self.counters),
            }),
        ))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

fn amplitude_at(script: &[Segment], tail: f32, at_ms: u64) -> f32 {
    let mut start = 0;
    for segment in script {
        if at_ms < start + segment.duration_ms {
            return segment.amplitude;
        }
        start += segment.duration_ms;
    }
    tail
}

/// Speech probability 0.9 for loud frames, 0.05 otherwise.
pub struct LoudnessModel;

impl SpeechModel for LoudnessModel {
    fn frame_samples(&self) -> usize {
        512
    }

    fn speech_probability(&mut self, frame: &[f32]) -> Result<f32, CaptureError> {
        let peak = frame.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        Ok(if peak > LOUD / 2.0 { 0.9 } else { 0.05 })
    }

    fn reset(&mut self) {}
}

pub struct LoudnessRuntime;

impl ModelRuntime for LoudnessRuntime {
    fn name(&self) -> &str {
        "loudness"
    }

    fn create_model(&self) -> Result<Box<dyn SpeechModel>, CaptureError> {
        Ok(Box::new(LoudnessModel))
    }
}

pub struct FakeLoader {
    id: String,
    fail: bool,
    pub loads: AtomicUsize,
}

impl FakeLoader {
    /// Every loader gets its own cache slot in the process-wide cache
    pub fn new() -> Self {
        Self {
            id: format!("fake-{}", uuid::Uuid::new_v4()),
            fail: false,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

#[async_trait::async_trait]
impl RuntimeLoader for FakeLoader {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn load(&self) -> Result<Arc<dyn ModelRuntime>, CaptureError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CaptureError::ModelLoad("model fetch failed".into()));
        }
        Ok(Arc::new(LoudnessRuntime))
    }
}

/// Collects every event and wakes waiters.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<CaptureEvent>>>,
    notify: Arc<Notify>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &CaptureEvent) {
        self.events.lock().push(event.clone());
        self.notify.notify_waiters();
    }

    pub fn snapshot(&self) -> Vec<CaptureEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&CaptureEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    /// Wait (in tokio time) until an event matching `pred` has been recorded.
    pub async fn wait_for(&self, pred: impl Fn(&CaptureEvent) -> bool, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count(&pred) > 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

pub fn is_complete(event: &CaptureEvent) -> bool {
    matches!(event, CaptureEvent::RecordingComplete(_))
}

pub fn is_error(event: &CaptureEvent) -> bool {
    matches!(event, CaptureEvent::Error(_))
}

pub fn is_finished(event: &CaptureEvent) -> bool {
    is_complete(event) || is_error(event)
}
