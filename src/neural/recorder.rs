use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{ModelConfig, RuntimeCache, RuntimeLoader, SpeechModel, MODEL_SAMPLE_RATE};
use super::processor::{FrameProcessor, ProcessorEvent, ProcessorOptions};
use crate::audio::wav::{encode_wav, WAV_MIME_TYPE};
use crate::audio::{downmix_to_mono, AudioBackend, AudioFrame, DeviceConstraints, DeviceStream, StreamResampler};
use crate::capture::{capture_file_name, CaptureResult, Encoding, SpeechSegment};
use crate::error::CaptureError;
use crate::events::{CaptureEvent, EventEmitter, StopReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuralConfig {
    pub positive_speech_threshold: f32,
    pub negative_speech_threshold: f32,
    pub redemption_ms: u64,
    pub pre_speech_pad_ms: u64,
    pub min_speech_ms: u64,
    pub max_recording_ms: u64,
    /// Submit an in-progress segment when stopped by the caller
    pub submit_speech_on_pause: bool,
    /// Keep listening after a completed segment
    pub continuous: bool,
    pub model: ModelConfig,
}

impl Default for NeuralConfig {
    fn default() -> Self {
        Self {
            positive_speech_threshold: 0.3,
            negative_speech_threshold: 0.25,
            redemption_ms: 1400,
            pre_speech_pad_ms: 800,
            min_speech_ms: 400,
            max_recording_ms: 30_000,
            submit_speech_on_pause: true,
            continuous: false,
            model: ModelConfig::default(),
        }
    }
}

impl NeuralConfig {
    /// Convert the millisecond settings into frame counts for a model frame size.
    pub fn processor_options(&self, frame_samples: usize) -> ProcessorOptions {
        let frame_ms = (frame_samples as f64 * 1000.0 / MODEL_SAMPLE_RATE as f64).max(1.0);
        let frames = |ms: u64| (ms as f64 / frame_ms).ceil() as usize;
        ProcessorOptions {
            positive_speech_threshold: self.positive_speech_threshold,
            negative_speech_threshold: self.negative_speech_threshold,
            redemption_frames: frames(self.redemption_ms).max(1),
            pre_speech_pad_frames: frames(self.pre_speech_pad_ms),
            min_speech_frames: frames(self.min_speech_ms),
        }
    }
}

enum Command {
    Stop,
    Destroy,
}

#[derive(Default)]
struct RecorderState {
    starting: bool,
    /// A worker still holds the device
    worker_live: bool,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

struct Shared {
    generation: AtomicU64,
    state: Mutex<RecorderState>,
    /// Woken when a worker has released its device
    released: Notify,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Speech-model capture: the model decides where speech begins and ends, and
/// each segment is delivered as a WAV file.
pub struct NeuralRecorder {
    config: NeuralConfig,
    constraints: DeviceConstraints,
    backend: Arc<dyn AudioBackend>,
    loader: Arc<dyn RuntimeLoader>,
    cache: &'static RuntimeCache,
    events: EventEmitter<CaptureEvent>,
    shared: Arc<Shared>,
}

impl NeuralRecorder {
    pub fn new(
        config: NeuralConfig,
        constraints: DeviceConstraints,
        backend: Arc<dyn AudioBackend>,
        loader: Arc<dyn RuntimeLoader>,
    ) -> Self {
        Self::with_cache(config, constraints, backend, loader, RuntimeCache::global())
    }

    pub fn with_cache(
        config: NeuralConfig,
        constraints: DeviceConstraints,
        backend: Arc<dyn AudioBackend>,
        loader: Arc<dyn RuntimeLoader>,
        cache: &'static RuntimeCache,
    ) -> Self {
        Self {
            config,
            constraints,
            backend,
            loader,
            cache,
            events: EventEmitter::new(),
            shared: Arc::new(Shared {
                generation: AtomicU64::new(0),
                state: Mutex::new(RecorderState::default()),
                released: Notify::new(),
            }),
        }
    }

    pub fn events(&self) -> &EventEmitter<CaptureEvent> {
        &self.events
    }

    pub fn config(&self) -> &NeuralConfig {
        &self.config
    }

    /// Start listening. After a `stop`, this waits for the previous session to
    /// release the microphone before opening it again.
    pub async fn start(&self) -> Result<(), CaptureError> {
        let requested = self.shared.generation.load(Ordering::SeqCst);
        let generation = loop {
            let released = self.shared.released.notified();
            {
                let mut state = self.shared.state.lock();
                if state.starting || state.commands.is_some() {
                    return Err(CaptureError::AlreadyActive);
                }
                if !self.shared.is_current(requested) {
                    return Err(CaptureError::Cancelled);
                }
                if !state.worker_live {
                    state.starting = true;
                    break requested;
                }
            }
            debug!("Waiting for the previous session to release the microphone");
            released.await;
        };

        match self.open(generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.shared.is_current(generation) {
                    self.shared.state.lock().starting = false;
                }
                Err(e)
            }
        }
    }

    async fn open(&self, generation: u64) -> Result<(), CaptureError> {
        let runtime = self.cache.get_or_load(self.loader.as_ref()).await?;
        if !self.shared.is_current(generation) {
            return Err(CaptureError::Cancelled);
        }
        let model = runtime.create_model()?;
        info!("Speech model ready: {}", runtime.name());

        let stream = self.backend.open(&self.constraints).await?;
        if !self.shared.is_current(generation) {
            drop(stream);
            info!("Neural recorder destroyed while opening the microphone");
            return Err(CaptureError::Cancelled);
        }

        let resampler = StreamResampler::new(stream.sample_rate, MODEL_SAMPLE_RATE)?;
        let options = self.config.processor_options(model.frame_samples());
        debug!("Frame processor options: {:?}", options);

        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4().to_string();
        let worker = Worker {
            generation,
            config: self.config.clone(),
            stream,
            model,
            resampler,
            processor: FrameProcessor::new(options),
            pending: Vec::new(),
            started_at: Instant::now(),
            session_id: session_id.clone(),
            events: self.events.clone(),
            shared: Arc::clone(&self.shared),
            fault_open: true,
        };

        {
            let mut state = self.shared.state.lock();
            state.starting = false;
            state.worker_live = true;
            state.commands = Some(tx);
        }

        info!("Neural recording started: session {}", session_id);
        self.events.emit(&CaptureEvent::RecordingStarted { session_id });
        tokio::spawn(worker.run(rx));
        Ok(())
    }

    /// Pause listening. With `submit_speech_on_pause` an open segment is delivered.
    pub fn stop(&self) -> bool {
        let commands = self.shared.state.lock().commands.take();
        match commands {
            Some(commands) => commands.send(Command::Stop).is_ok(),
            None => false,
        }
    }

    pub fn destroy(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let commands = {
            let mut state = self.shared.state.lock();
            state.starting = false;
            state.commands.take()
        };
        if let Some(commands) = commands {
            let _ = commands.send(Command::Destroy);
        }
    }

    pub fn is_recording(&self) -> bool {
        self.shared.state.lock().commands.is_some()
    }
}

impl Drop for NeuralRecorder {
    fn drop(&mut self) {
        self.destroy();
    }
}

enum Flow {
    Continue,
    Done,
}

struct Worker {
    generation: u64,
    config: NeuralConfig,
    stream: DeviceStream,
    model: Box<dyn SpeechModel>,
    resampler: StreamResampler,
    processor: FrameProcessor,
    pending: Vec<f32>,
    started_at: Instant,
    session_id: String,
    events: EventEmitter<CaptureEvent>,
    shared: Arc<Shared>,
    fault_open: bool,
}

impl Worker {
    fn alive(&self) -> bool {
        self.shared.is_current(self.generation)
    }

    fn emit(&self, event: CaptureEvent) {
        if self.alive() {
            self.events.emit(&event);
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let deadline = self.started_at + Duration::from_millis(self.config.max_recording_ms);
        let ceiling = time::sleep_until(deadline);
        tokio::pin!(ceiling);

        loop {
            let flow = tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Stop) => {
                        self.pause(self.config.submit_speech_on_pause);
                        Flow::Done
                    }
                    Some(Command::Destroy) | None => {
                        debug!("Neural recorder destroyed: session {}", self.session_id);
                        Flow::Done
                    }
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

                _ = &mut ceiling => {
                    info!("Max recording duration reached ({}ms)", self.config.max_recording_ms);
                    self.emit(CaptureEvent::AutoStopped { reason: StopReason::MaxDuration });
                    self.pause(true);
                    Flow::Done
                }
            };

            if let Flow::Done = flow {
                break;
            }
        }

        self.stream.release();
        drop(commands);

        {
            let mut state = self.shared.state.lock();
            state.worker_live = false;
            state.commands = None;
        }
        self.shared.released.notify_waiters();
    }

    fn on_frame(&mut self, frame: AudioFrame) -> Flow {
        let mono = downmix_to_mono(&frame.samples, frame.channels);
        match self.resampler.process(&mono) {
            Ok(samples) => self.pending.extend(samples),
            Err(e) => return self.fail(e.to_string()),
        }

        let frame_samples = self.model.frame_samples();
        while self.pending.len() >= frame_samples {
            let model_frame: Vec<f32> = self.pending.drain(..frame_samples).collect();
            let probability = match self.model.speech_probability(&model_frame) {
                Ok(p) => p,
                Err(e) => return self.fail(e.to_string()),
            };
            self.emit(CaptureEvent::LevelChanged { level: probability });

            if let Some(event) = self.processor.process(&model_frame, probability) {
                if let Flow::Done = self.handle(event) {
                    return Flow::Done;
                }
            }
        }
        Flow::Continue
    }

    fn handle(&mut self, event: ProcessorEvent) -> Flow {
        match event {
            ProcessorEvent::SpeechStart => {
                let at_ms = self.elapsed_ms();
                debug!("Speech started at {}ms", at_ms);
                self.emit(CaptureEvent::SpeechStarted { at_ms });
                Flow::Continue
            }
            ProcessorEvent::Misfire => {
                debug!("Speech segment too short, discarded");
                self.emit(CaptureEvent::Misfire);
                Flow::Continue
            }
            ProcessorEvent::SpeechEnd(samples) => {
                self.deliver(samples);
                if self.config.continuous {
                    Flow::Continue
                } else {
                    self.emit(CaptureEvent::AutoStopped {
                        reason: StopReason::SpeechEnded,
                    });
                    self.emit(CaptureEvent::RecordingStopped);
                    Flow::Done
                }
            }
        }
    }

    fn deliver(&mut self, samples: Vec<f32>) {
        let duration_ms = samples.len() as u64 * 1000 / MODEL_SAMPLE_RATE as u64;
        let end_ms = self.elapsed_ms();
        self.emit(CaptureEvent::SpeechEnded { duration_ms });

        let bytes = encode_wav(&samples, MODEL_SAMPLE_RATE);
        let file_name = capture_file_name("speech", Utc::now(), "wav");
        info!(
            "Speech segment captured: {} ({} bytes, {}ms)",
            file_name,
            bytes.len(),
            duration_ms
        );

        self.emit(CaptureEvent::RecordingComplete(CaptureResult {
            file_name,
            bytes,
            duration_ms,
            mime_type: WAV_MIME_TYPE.to_string(),
            encoding: Encoding::wav(),
            session_id: self.session_id.clone(),
            speech: Some(SpeechSegment {
                start_ms: end_ms.saturating_sub(duration_ms),
                end_ms,
            }),
        }));
    }

    /// Stop listening; optionally submit whatever segment is still open.
    fn pause(&mut self, submit: bool) {
        let open = if submit {
            self.processor.flush()
        } else {
            self.processor.reset();
            None
        };

        match open {
            Some(ProcessorEvent::SpeechEnd(samples)) => self.deliver(samples),
            Some(ProcessorEvent::Misfire) => self.emit(CaptureEvent::Misfire),
            _ => {}
        }
        self.model.reset();
        info!("Neural recording stopped: session {}", self.session_id);
        self.emit(CaptureEvent::RecordingStopped);
    }

    fn fail(&mut self, message: String) -> Flow {
        error!("Neural recorder failed: {}", message);
        if self.processor.is_speaking() {
            warn!("Discarding open speech segment after failure");
        }
        self.processor.reset();
        self.emit(CaptureEvent::Error(CaptureError::Pipeline(message)));
        Flow::Done
    }
}
