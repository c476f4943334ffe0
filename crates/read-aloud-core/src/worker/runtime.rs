//! The worker context: owns the neural model and answers worker requests.
//!
//! The runtime starts loading its model as soon as it is spawned. Requests are
//! answered immediately; `generate` only acknowledges, and the audio follows
//! later as `WorkerEvent`s tagged with the request id and target page.

use super::WorkerEventSender;
use crate::messages::{
    ChunkInfo, EncodedAudio, LoadStatus, ModelState, PageId, RequestId, VoiceInfo, WorkerEvent,
    WorkerRequest, WorkerResponse,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A loaded text-to-speech model. Calls block; the runtime runs them on the
/// blocking pool.
pub trait SpeechModel: Send + Sync + 'static {
    fn voices(&self) -> Vec<VoiceInfo>;

    /// Synthesize the whole text into one buffer.
    fn generate(&self, text: &str, voice: &str, speed: f32) -> Result<EncodedAudio>;

    /// Synthesize piece by piece, handing each encoded piece to `emit` as
    /// soon as it exists. An error from `emit` aborts the stream.
    fn stream(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
        emit: &mut dyn FnMut(EncodedAudio) -> Result<()>,
    ) -> Result<()>;
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, progress: ProgressReporter) -> Result<Arc<dyn SpeechModel>>;
}

/// Relays model load progress as `status-update` events.
#[derive(Clone)]
pub struct ProgressReporter {
    events: WorkerEventSender,
}

impl ProgressReporter {
    pub fn new(events: WorkerEventSender) -> Self {
        Self { events }
    }

    pub fn report(&self, status: LoadStatus, message: impl Into<String>, progress: Option<f32>) {
        let _ = self.events.send(WorkerEvent::StatusUpdate {
            status,
            message: message.into(),
            progress: progress.map(|p| p.clamp(0.0, 100.0)),
        });
    }
}

/// One request plus the slot its response goes to.
pub struct WorkerCall {
    pub request: WorkerRequest,
    pub reply: oneshot::Sender<WorkerResponse>,
}

pub type CallSender = mpsc::UnboundedSender<WorkerCall>;
pub type CallReceiver = mpsc::UnboundedReceiver<WorkerCall>;

/// Send one request to a runtime and wait for its response.
pub async fn call(sender: &CallSender, request: WorkerRequest) -> Result<WorkerResponse> {
    let action = request.action();
    let (reply, response) = oneshot::channel();
    sender
        .send(WorkerCall { request, reply })
        .map_err(|_| anyhow!("worker is not running (action={action})"))?;
    response
        .await
        .map_err(|_| anyhow!("worker dropped the {action} request"))
}

struct ModelSlot {
    state: ModelState,
    model: Option<Arc<dyn SpeechModel>>,
    error: Option<String>,
}

impl ModelSlot {
    fn ready_model(&self) -> Option<Arc<dyn SpeechModel>> {
        match self.state {
            ModelState::Ready => self.model.clone(),
            _ => None,
        }
    }
}

struct GenerateJob {
    request_id: RequestId,
    target_page: Option<PageId>,
    text: String,
    voice: String,
    speed: f32,
    streaming: bool,
}

pub struct WorkerRuntime {
    loader: Arc<dyn ModelLoader>,
    events: WorkerEventSender,
    streaming_threshold: usize,
    slot: Arc<Mutex<ModelSlot>>,
}

impl WorkerRuntime {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        events: WorkerEventSender,
        streaming_threshold: usize,
    ) -> Self {
        Self {
            loader,
            events,
            streaming_threshold,
            slot: Arc::new(Mutex::new(ModelSlot {
                state: ModelState::Idle,
                model: None,
                error: None,
            })),
        }
    }

    /// Spawn the runtime on the current tokio runtime.
    pub fn spawn(self) -> (CallSender, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    /// Serve requests until `shutdown` or until every sender is dropped.
    pub async fn run(self, mut calls: CallReceiver) {
        self.start_loading();
        while let Some(WorkerCall { request, reply }) = calls.recv().await {
            let shutdown = matches!(request, WorkerRequest::Shutdown);
            let response = self.handle(request);
            let _ = reply.send(response);
            if shutdown {
                info!("Worker runtime shutting down");
                break;
            }
        }
        debug!("Worker runtime stopped");
    }

    fn handle(&self, request: WorkerRequest) -> WorkerResponse {
        match request {
            WorkerRequest::Init => {
                self.start_loading();
                WorkerResponse::Ack
            }
            WorkerRequest::Status => {
                let Ok(slot) = self.slot.lock() else {
                    return WorkerResponse::Failed {
                        message: "model state unavailable".to_string(),
                    };
                };
                WorkerResponse::Status {
                    state: slot.state,
                    error: slot.error.clone(),
                }
            }
            WorkerRequest::Voices => match self.ready_model() {
                Ok(model) => WorkerResponse::Voices {
                    voices: model.voices(),
                },
                Err(message) => WorkerResponse::Failed { message },
            },
            WorkerRequest::Generate {
                request_id,
                target_page,
                text,
                voice,
                speed,
                allow_streaming,
            } => {
                let model = match self.ready_model() {
                    Ok(model) => model,
                    Err(message) => return WorkerResponse::Failed { message },
                };
                let streaming = allow_streaming && text.chars().count() > self.streaming_threshold;
                let job = GenerateJob {
                    request_id,
                    target_page,
                    text,
                    voice,
                    speed,
                    streaming,
                };
                let events = self.events.clone();
                tokio::task::spawn_blocking(move || run_generation(model.as_ref(), job, &events));
                WorkerResponse::Accepted { request_id }
            }
            WorkerRequest::Shutdown => WorkerResponse::Ack,
        }
    }

    fn ready_model(&self) -> std::result::Result<Arc<dyn SpeechModel>, String> {
        let Ok(slot) = self.slot.lock() else {
            return Err("model state unavailable".to_string());
        };
        slot.ready_model().ok_or_else(|| match (&slot.state, &slot.error) {
            (ModelState::Failed, Some(error)) => error.clone(),
            _ => "model not loaded".to_string(),
        })
    }

    /// Begin loading unless a load is running or has succeeded.
    fn start_loading(&self) {
        {
            let Ok(mut slot) = self.slot.lock() else {
                return;
            };
            if matches!(slot.state, ModelState::Loading | ModelState::Ready) {
                return;
            }
            slot.state = ModelState::Loading;
            slot.error = None;
        }

        let loader = Arc::clone(&self.loader);
        let slot = Arc::clone(&self.slot);
        let progress = ProgressReporter::new(self.events.clone());
        tokio::spawn(async move {
            let started = Instant::now();
            progress.report(LoadStatus::Loading, "Loading speech model...", None);
            let outcome = loader.load(progress.clone()).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let Ok(mut guard) = slot.lock() else {
                return;
            };
            match outcome {
                Ok(model) => {
                    guard.model = Some(model);
                    guard.state = ModelState::Ready;
                    drop(guard);
                    info!(elapsed_ms, "Speech model ready");
                    progress.report(LoadStatus::Ready, "Speech model ready", Some(100.0));
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    guard.state = ModelState::Failed;
                    guard.error = Some(message.clone());
                    drop(guard);
                    error!(elapsed_ms, "Speech model failed to load: {message}");
                    progress.report(LoadStatus::Error, message, None);
                }
            }
        });
    }
}

fn run_generation(model: &dyn SpeechModel, job: GenerateJob, events: &WorkerEventSender) {
    let started = Instant::now();
    let chars = job.text.chars().count();
    let request_id = job.request_id;
    let target_page = job.target_page;

    let result = if job.streaming {
        let mut index = 0u32;
        let streamed = model.stream(&job.text, &job.voice, job.speed, &mut |audio: EncodedAudio| {
            let chunk = ChunkInfo {
                index,
                is_first: index == 0,
                is_final: false,
            };
            events
                .send(WorkerEvent::AudioChunk {
                    request_id,
                    target_page,
                    audio,
                    chunk,
                })
                .map_err(|_| anyhow!("coordinator stopped listening"))?;
            if index == 0 {
                info!(
                    %request_id,
                    first_chunk_ms = started.elapsed().as_millis() as u64,
                    "First chunk ready"
                );
            }
            index += 1;
            Ok(())
        });
        streamed.map(|()| {
            let _ = events.send(WorkerEvent::StreamEnd {
                request_id,
                target_page,
            });
            index
        })
    } else {
        model
            .generate(&job.text, &job.voice, job.speed)
            .map(|audio| {
                let _ = events.send(WorkerEvent::AudioReady {
                    request_id,
                    target_page,
                    audio,
                });
                1
            })
    };

    match result {
        Ok(chunks) => info!(
            %request_id,
            chars,
            chunks,
            streaming = job.streaming,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generation complete"
        ),
        Err(err) => {
            warn!(%request_id, chars, "Generation failed: {err:#}");
            let _ = events.send(WorkerEvent::AudioError {
                request_id,
                target_page,
                message: format!("{err:#}"),
            });
        }
    }
}
