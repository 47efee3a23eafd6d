//! Threshold capture: device stream → analyzer → detector, recorded through a
//! negotiated pipeline.
//!
//! All graph state lives in one task per initialized manager. The public methods
//! only touch a small shared state block and send commands, so `stop` and
//! `destroy` stay synchronous and may be called from event handlers.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::config::CaptureConfig;
use super::encoding::{negotiate_encoding, Encoding, PipelineFactory, RecordingPipeline, StreamFormat};
use super::session::{AudioSession, SpeechSegment};
use crate::analysis::{DetectorEvent, LevelMeter, SignalAnalyzer, ThresholdDetector};
use crate::audio::{AudioBackend, AudioFrame, DeviceStream};
use crate::error::CaptureError;
use crate::events::{CaptureEvent, EventEmitter, StopReason};

enum Command {
    Start {
        session: AudioSession,
        pipeline: Box<dyn RecordingPipeline>,
    },
    Stop,
    Destroy,
}

struct GraphHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    format: StreamFormat,
}

#[derive(Default)]
struct ManagerState {
    initializing: bool,
    /// A session is being flushed; no new session may start until it settles
    finishing: bool,
    graph: Option<GraphHandle>,
    recording_since: Option<Instant>,
    encoding: Option<Encoding>,
}

struct Shared {
    /// Bumped by `destroy`; async work started under an older value is stale
    generation: AtomicU64,
    next_graph_id: AtomicU64,
    state: Mutex<ManagerState>,
    /// Woken whenever `finishing` clears
    settled: Notify,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn owns_graph(state: &ManagerState, id: u64) -> bool {
        state.graph.as_ref().map(|g| g.id) == Some(id)
    }

    /// Forget the graph if it is still the one identified by `id`.
    fn detach_graph(&self, id: u64) {
        {
            let mut state = self.state.lock();
            if !Self::owns_graph(&state, id) {
                return;
            }
            state.graph = None;
            state.recording_since = None;
            state.finishing = false;
        }
        self.settled.notify_waiters();
    }

    /// Mark the session on graph `id` as flushed.
    fn finish_settled(&self, id: u64) {
        {
            let mut state = self.state.lock();
            if !Self::owns_graph(&state, id) {
                return;
            }
            state.finishing = false;
        }
        self.settled.notify_waiters();
    }
}

pub struct CaptureManager {
    config: CaptureConfig,
    backend: Arc<dyn AudioBackend>,
    pipelines: Arc<dyn PipelineFactory>,
    events: EventEmitter<CaptureEvent>,
    shared: Arc<Shared>,
}

impl CaptureManager {
    pub fn new(
        config: CaptureConfig,
        backend: Arc<dyn AudioBackend>,
        pipelines: Arc<dyn PipelineFactory>,
    ) -> Self {
        Self {
            config,
            backend,
            pipelines,
            events: EventEmitter::new(),
            shared: Arc::new(Shared {
                generation: AtomicU64::new(0),
                next_graph_id: AtomicU64::new(1),
                state: Mutex::new(ManagerState::default()),
                settled: Notify::new(),
            }),
        }
    }

    pub fn events(&self) -> &EventEmitter<CaptureEvent> {
        &self.events
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Open the device and build the audio graph.
    pub async fn initialize(&self, device_id: Option<&str>) -> Result<(), CaptureError> {
        let generation = {
            let mut state = self.shared.state.lock();
            if state.initializing || state.graph.is_some() {
                return Err(CaptureError::AlreadyActive);
            }
            state.initializing = true;
            self.shared.generation.load(Ordering::SeqCst)
        };

        let mut constraints = self.config.device.clone();
        if let Some(id) = device_id {
            constraints.device_id = Some(id.to_string());
        }

        info!("Initializing audio capture via {}", self.backend.name());
        let opened = self.backend.open(&constraints).await;

        if !self.shared.is_current(generation) {
            // Destroyed while the device was opening; dropping releases it
            drop(opened);
            info!("Audio capture destroyed during initialization");
            return Err(CaptureError::Cancelled);
        }

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.state.lock().initializing = false;
                error!("Failed to open audio device: {}", e);
                return Err(e.into());
            }
        };

        let encoding = negotiate_encoding(&self.config.encodings, self.pipelines.as_ref());
        let format = StreamFormat {
            sample_rate: stream.sample_rate,
            channels: stream.channels,
            bits_per_second: self.config.audio_bits_per_second,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_graph_id.fetch_add(1, Ordering::SeqCst);
        let graph = Graph::new(
            id,
            generation,
            self.config.clone(),
            stream,
            self.events.clone(),
            Arc::clone(&self.shared),
        );

        {
            let mut state = self.shared.state.lock();
            state.initializing = false;
            state.encoding = Some(encoding);
            state.graph = Some(GraphHandle {
                id,
                commands: tx,
                format,
            });
        }
        tokio::spawn(graph.run(rx));

        info!(
            "Audio capture initialized ({}Hz, {} channels)",
            format.sample_rate, format.channels
        );
        Ok(())
    }

    /// Begin a recording session on the initialized graph.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut state = self.shared.state.lock();
        let graph = state.graph.as_ref().ok_or(CaptureError::NotInitialized)?;
        if state.recording_since.is_some() || state.finishing {
            return Err(CaptureError::AlreadyActive);
        }

        let encoding = state.encoding.clone().unwrap_or_else(Encoding::wav);
        let mut pipeline = self.pipelines.create(&encoding, graph.format)?;
        pipeline.start()?;
        let session = AudioSession::new(encoding);
        let started_at = session.started_at;

        graph
            .commands
            .send(Command::Start { session, pipeline })
            .map_err(|_| CaptureError::NotInitialized)?;
        state.recording_since = Some(started_at);
        Ok(())
    }

    /// Stop the current recording; the result arrives as an event.
    ///
    /// Until the session has been flushed, `start` reports `AlreadyActive`; use
    /// [`settled`](Self::settled) to wait for it.
    pub fn stop(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.recording_since.is_none() {
            return false;
        }
        state.recording_since = None;
        state.finishing = true;

        match state.graph.as_ref() {
            Some(graph) => graph.commands.send(Command::Stop).is_ok(),
            None => false,
        }
    }

    /// Wait until no stopped session is still being flushed.
    ///
    /// With `release_device_on_stop` the graph is gone afterwards and the next
    /// recording needs `initialize` again.
    pub async fn settled(&self) {
        loop {
            let notified = self.shared.settled.notified();
            if !self.shared.state.lock().finishing {
                return;
            }
            notified.await;
        }
    }

    /// Release everything. Any in-flight session is discarded without a result.
    pub fn destroy(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let graph = {
            let mut state = self.shared.state.lock();
            state.initializing = false;
            state.finishing = false;
            state.recording_since = None;
            state.encoding = None;
            state.graph.take()
        };
        self.shared.settled.notify_waiters();

        if let Some(graph) = graph {
            debug!("Destroying audio graph {}", graph.id);
            // A closed channel means the graph already tore itself down
            let _ = graph.commands.send(Command::Destroy);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.state.lock().graph.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.state.lock().recording_since.is_some()
    }

    /// Length of the current recording, 0 when idle
    pub fn duration_ms(&self) -> u64 {
        self.shared
            .state
            .lock()
            .recording_since
            .map(|since| since.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.shared.state.lock().encoding.clone()
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct ActiveSession {
    session: AudioSession,
    pipeline: Box<dyn RecordingPipeline>,
    deadline: Instant,
    speech_start_ms: Option<u64>,
}

/// Outcome of handling one graph input
enum Flow {
    Continue,
    Teardown,
}

struct Graph {
    id: u64,
    generation: u64,
    config: CaptureConfig,
    stream: DeviceStream,
    analyzer: SignalAnalyzer,
    detector: ThresholdDetector,
    meter: LevelMeter,
    events: EventEmitter<CaptureEvent>,
    shared: Arc<Shared>,
    active: Option<ActiveSession>,
    fault_open: bool,
}

impl Graph {
    fn new(
        id: u64,
        generation: u64,
        config: CaptureConfig,
        stream: DeviceStream,
        events: EventEmitter<CaptureEvent>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            generation,
            analyzer: SignalAnalyzer::new(config.fft_size, config.smoothing_time_constant),
            detector: ThresholdDetector::new(config.detector.clone()),
            meter: LevelMeter::new(),
            config,
            stream,
            events,
            shared,
            active: None,
            fault_open: true,
        }
    }

    fn alive(&self) -> bool {
        self.shared.is_current(self.generation)
    }

    fn emit(&self, event: CaptureEvent) {
        if self.alive() {
            self.events.emit(&event);
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut frame_tick = time::interval(Duration::from_millis(self.config.frame_interval_ms.max(1)));
        frame_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut chunk_tick = time::interval(Duration::from_millis(self.config.chunk_interval_ms.max(1)));
        chunk_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!("Audio graph {} running", self.id);

        loop {
            let recording = self.active.is_some();
            let deadline = self.active.as_ref().map(|a| a.deadline);

            let flow = tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Start { session, pipeline }) => {
                        self.begin(session, pipeline);
                        frame_tick.reset();
                        chunk_tick.reset();
                        Flow::Continue
                    }
                    Some(Command::Stop) => self.finish().await,
                    Some(Command::Destroy) | None => Flow::Teardown,
                },

                fault = &mut self.stream.fault, if self.fault_open => match fault {
                    Ok(message) => self.fail(format!("audio device failed: {message}")),
                    Err(_) => {
                        self.fault_open = false;
                        Flow::Continue
                    }
                },

                frame = self.stream.frames.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => self.fail("audio device disconnected".to_string()),
                },

                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    info!("Max recording duration reached ({}ms)", self.config.max_recording_duration_ms);
                    self.emit(CaptureEvent::AutoStopped { reason: StopReason::MaxDuration });
                    self.finish().await
                }

                _ = frame_tick.tick(), if recording => self.on_frame_tick().await,

                _ = chunk_tick.tick(), if recording => {
                    self.on_chunk_tick();
                    Flow::Continue
                }
            };

            if let Flow::Teardown = flow {
                break;
            }
        }

        self.teardown();
    }

    fn begin(&mut self, session: AudioSession, pipeline: Box<dyn RecordingPipeline>) {
        let deadline = session.started_at + Duration::from_millis(self.config.max_recording_duration_ms);
        let session_id = session.id.clone();

        self.detector.reset();
        self.meter.reset();
        self.active = Some(ActiveSession {
            session,
            pipeline,
            deadline,
            speech_start_ms: None,
        });

        info!("Recording started: session {}", session_id);
        self.emit(CaptureEvent::RecordingStarted { session_id });
    }

    fn on_frame(&mut self, frame: AudioFrame) -> Flow {
        self.analyzer.push(&frame);

        if let Some(active) = self.active.as_mut() {
            if let Err(e) = active.pipeline.write(&frame) {
                return self.fail(e.to_string());
            }
        }
        Flow::Continue
    }

    fn on_chunk_tick(&mut self) {
        if let Some(active) = self.active.as_mut() {
            if let Some(bytes) = active.pipeline.take_chunk() {
                debug!("Chunk {}: {} bytes", active.session.chunk_count(), bytes.len());
                active.session.push_chunk(bytes);
            }
        }
    }

    async fn on_frame_tick(&mut self) -> Flow {
        let Some(active) = self.active.as_mut() else {
            return Flow::Continue;
        };
        let now_ms = active.session.elapsed_ms();
        let rms = self.analyzer.sample();

        if let Some(level) = self.meter.update(rms) {
            self.emit(CaptureEvent::LevelChanged { level });
        }

        let mut silence_timeout = false;
        for event in self.detector.observe(rms, now_ms) {
            match event {
                DetectorEvent::SpeechStart { at_ms } => {
                    if let Some(active) = self.active.as_mut() {
                        active.speech_start_ms = Some(at_ms);
                    }
                    self.emit(CaptureEvent::SpeechStarted { at_ms });
                }
                DetectorEvent::SpeechEnd { duration_ms } => {
                    info!("Speech ended after {}ms", duration_ms);
                    if let Some(active) = self.active.as_mut() {
                        let start_ms = active.speech_start_ms.unwrap_or(0);
                        active.session.set_speech(SpeechSegment {
                            start_ms,
                            end_ms: start_ms + duration_ms,
                        });
                    }
                    self.emit(CaptureEvent::SpeechEnded { duration_ms });
                }
                DetectorEvent::Misfire => {
                    if let Some(active) = self.active.as_mut() {
                        active.speech_start_ms = None;
                    }
                    self.emit(CaptureEvent::Misfire);
                }
                DetectorEvent::SilenceTimeout => silence_timeout = true,
            }
        }

        if silence_timeout {
            self.emit(CaptureEvent::AutoStopped {
                reason: StopReason::SilenceTimeout,
            });
            return self.finish().await;
        }
        Flow::Continue
    }

    /// Flush and hand over the current session, if any.
    async fn finish(&mut self) -> Flow {
        let Some(mut active) = self.active.take() else {
            self.shared.finish_settled(self.id);
            return Flow::Continue;
        };
        self.detector.reset();
        {
            let mut state = self.shared.state.lock();
            if Shared::owns_graph(&state, self.id) {
                state.recording_since = None;
                state.finishing = true;
            }
        }

        let last = active.pipeline.finish().await;
        if !self.alive() {
            debug!("Session {} discarded by destroy", active.session.id);
            return Flow::Teardown;
        }

        // Settle before emitting so handlers may record again from the completion event
        let release = self.config.release_device_on_stop;
        if release {
            self.stream.release();
            self.shared.detach_graph(self.id);
        } else {
            self.shared.finish_settled(self.id);
        }

        match last {
            Ok(Some(bytes)) => active.session.push_chunk(bytes),
            Ok(None) => {}
            Err(e) => {
                error!("Failed to flush recording pipeline: {}", e);
                self.emit(CaptureEvent::Error(e));
                return Flow::Teardown;
            }
        }

        info!("Recording stopped: session {}", active.session.id);
        self.emit(CaptureEvent::RecordingStopped);

        match active
            .session
            .finish(active.pipeline.as_ref(), self.config.min_capture_bytes)
        {
            Ok(result) => self.emit(CaptureEvent::RecordingComplete(result)),
            Err(e) => self.emit(CaptureEvent::Error(e)),
        }

        if release {
            Flow::Teardown
        } else {
            Flow::Continue
        }
    }

    fn fail(&mut self, message: String) -> Flow {
        error!("Audio graph {} failed: {}", self.id, message);
        if let Some(active) = self.active.take() {
            warn!("Discarding session {} after failure", active.session.id);
        }
        self.stream.release();
        self.shared.detach_graph(self.id);
        self.emit(CaptureEvent::Error(CaptureError::Pipeline(message)));
        Flow::Teardown
    }

    fn teardown(&mut self) {
        self.active = None;
        self.stream.release();
        self.shared.detach_graph(self.id);
        debug!("Audio graph {} torn down", self.id);
    }
}
