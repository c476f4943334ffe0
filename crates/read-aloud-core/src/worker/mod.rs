//! Lifecycle of the long-lived local model worker.
//!
//! There is one worker per process, owned by `WorkerManager`. The manager is
//! the only thing that creates or destroys it, and it forwards requests so the
//! raw worker handle never escapes.
//!
//! ```text
//! uninitialized --create--> initializing --ready--> ready
//!       ^                        |                    |
//!       +------error/timeout-----+                    |
//!       +-----------health check finds it gone--------+
//! ```

mod local;
pub mod runtime;

pub use local::InProcessWorkerHost;
pub use runtime::{ModelLoader, ProgressReporter, SpeechModel, WorkerRuntime};

use crate::config::WorkerTimings;
use crate::error::ReadError;
use crate::messages::{
    ModelState, PageId, RequestId, VoiceInfo, WorkerEvent, WorkerRequest, WorkerResponse,
};
use crate::retry::{PollOutcome, Probe};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub type WorkerEventSender = mpsc::UnboundedSender<WorkerEvent>;
pub type WorkerEventReceiver = mpsc::UnboundedReceiver<WorkerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Creates and addresses worker contexts.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Start a worker whose unsolicited events go to `events`.
    async fn create(&self, events: WorkerEventSender) -> Result<WorkerId>;

    async fn exists(&self, id: WorkerId) -> bool;

    async fn request(&self, id: WorkerId, request: WorkerRequest) -> Result<WorkerResponse>;

    /// Tear the worker down. Unknown ids are ignored.
    async fn destroy(&self, id: WorkerId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Uninitialized,
    Initializing,
    Ready,
}

/// One generation job for the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateJob {
    pub request_id: RequestId,
    pub target_page: Option<PageId>,
    pub text: String,
    pub voice: String,
    pub speed: f32,
    pub allow_streaming: bool,
}

impl From<GenerateJob> for WorkerRequest {
    fn from(job: GenerateJob) -> Self {
        WorkerRequest::Generate {
            request_id: job.request_id,
            target_page: job.target_page,
            text: job.text,
            voice: job.voice,
            speed: job.speed,
            allow_streaming: job.allow_streaming,
        }
    }
}

struct WorkerSlot {
    phase: WorkerPhase,
    worker: Option<WorkerId>,
    last_error: Option<String>,
}

enum Claim {
    Ready(WorkerId),
    Wait,
    Create,
}

pub struct WorkerManager {
    host: Arc<dyn WorkerHost>,
    events: WorkerEventSender,
    timings: WorkerTimings,
    slot: Mutex<WorkerSlot>,
}

impl WorkerManager {
    pub fn new(host: Arc<dyn WorkerHost>, events: WorkerEventSender, timings: WorkerTimings) -> Self {
        Self {
            host,
            events,
            timings,
            slot: Mutex::new(WorkerSlot {
                phase: WorkerPhase::Uninitialized,
                worker: None,
                last_error: None,
            }),
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        self.slot
            .lock()
            .map(|slot| slot.phase)
            .unwrap_or(WorkerPhase::Uninitialized)
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == WorkerPhase::Ready
    }

    pub fn last_error(&self) -> Option<String> {
        self.slot.lock().ok().and_then(|slot| slot.last_error.clone())
    }

    /// Make sure a healthy worker exists, creating one if needed.
    ///
    /// Concurrent callers share a single initialisation: the first one
    /// creates, the rest poll until it resolves.
    pub async fn ensure_ready(&self) -> bool {
        match self.claim() {
            Claim::Ready(id) => {
                if self.host.exists(id).await {
                    return true;
                }
                warn!(worker = %id, "Worker disappeared; recreating");
                self.forget(id);
                self.host.destroy(id).await;
                match self.claim() {
                    Claim::Ready(_) => true,
                    Claim::Wait => self.wait_for_init().await,
                    Claim::Create => self.initialize().await,
                }
            }
            Claim::Wait => self.wait_for_init().await,
            Claim::Create => self.initialize().await,
        }
    }

    /// Drop the current worker so the next `ensure_ready` starts fresh.
    pub async fn invalidate(&self) {
        let previous = match self.slot.lock() {
            Ok(mut slot) => {
                slot.phase = WorkerPhase::Uninitialized;
                slot.worker.take()
            }
            Err(_) => None,
        };
        if let Some(id) = previous {
            info!(worker = %id, "Invalidating worker");
            self.host.destroy(id).await;
        }
    }

    /// Hand a generation job to the ready worker. Audio arrives later as
    /// worker events.
    pub async fn generate(&self, job: GenerateJob) -> Result<(), ReadError> {
        let request_id = job.request_id;
        match self.request(job.into()).await? {
            WorkerResponse::Accepted { .. } => {
                debug!(%request_id, "Worker accepted generation");
                Ok(())
            }
            WorkerResponse::Failed { message } => Err(ReadError::EngineUnavailable(message)),
            other => Err(ReadError::engine_unavailable(format!(
                "unexpected worker response to generate: {other:?}"
            ))),
        }
    }

    pub async fn voices(&self) -> Result<Vec<VoiceInfo>, ReadError> {
        match self.request(WorkerRequest::Voices).await? {
            WorkerResponse::Voices { voices } => Ok(voices),
            WorkerResponse::Failed { message } => Err(ReadError::EngineUnavailable(message)),
            other => Err(ReadError::engine_unavailable(format!(
                "unexpected worker response to voices: {other:?}"
            ))),
        }
    }

    async fn request(&self, request: WorkerRequest) -> Result<WorkerResponse, ReadError> {
        let id = self
            .ready_worker()
            .ok_or_else(|| ReadError::engine_unavailable("local model worker is not ready"))?;
        let action = request.action();
        match self.host.request(id, request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(worker = %id, action, "Worker request failed: {err:#}");
                self.invalidate().await;
                Err(ReadError::engine_unavailable(format!("{err:#}")))
            }
        }
    }

    fn ready_worker(&self) -> Option<WorkerId> {
        let slot = self.slot.lock().ok()?;
        match slot.phase {
            WorkerPhase::Ready => slot.worker,
            _ => None,
        }
    }

    fn claim(&self) -> Claim {
        let Ok(mut slot) = self.slot.lock() else {
            return Claim::Wait;
        };
        match (slot.phase, slot.worker) {
            (WorkerPhase::Ready, Some(id)) => Claim::Ready(id),
            (WorkerPhase::Initializing, _) => Claim::Wait,
            _ => {
                slot.phase = WorkerPhase::Initializing;
                slot.worker = None;
                Claim::Create
            }
        }
    }

    fn forget(&self, id: WorkerId) {
        if let Ok(mut slot) = self.slot.lock() {
            if slot.worker == Some(id) {
                slot.worker = None;
                slot.phase = WorkerPhase::Uninitialized;
            }
        }
    }

    async fn wait_for_init(&self) -> bool {
        debug!("Worker initialisation in flight; waiting");
        let outcome = self
            .timings
            .readiness
            .poll(|_| {
                let phase = self.phase();
                async move {
                    match phase {
                        WorkerPhase::Ready => Probe::Done(true),
                        WorkerPhase::Uninitialized => Probe::Done(false),
                        WorkerPhase::Initializing => Probe::NotYet,
                    }
                }
            })
            .await;
        match outcome {
            PollOutcome::Done(ready) => ready,
            PollOutcome::Exhausted { attempts } => {
                warn!(attempts, "Gave up waiting for worker initialisation");
                false
            }
        }
    }

    async fn initialize(&self) -> bool {
        info!("Creating local model worker");
        let id = match self.host.create(self.events.clone()).await {
            Ok(id) => id,
            Err(err) => {
                self.fail(None, format!("{err:#}")).await;
                return false;
            }
        };
        if let Ok(mut slot) = self.slot.lock() {
            slot.worker = Some(id);
        }
        if let Err(err) = self.host.request(id, WorkerRequest::Init).await {
            debug!(worker = %id, "Init request not answered yet: {err:#}");
        }

        let outcome = self
            .timings
            .readiness
            .poll(|attempt| {
                let host = Arc::clone(&self.host);
                let current = self.slot.lock().ok().and_then(|slot| slot.worker);
                async move {
                    if current != Some(id) {
                        return Probe::Done(Err("worker invalidated during startup".to_string()));
                    }
                    match host.request(id, WorkerRequest::Status).await {
                        Ok(WorkerResponse::Status {
                            state: ModelState::Ready,
                            ..
                        }) => Probe::Done(Ok(())),
                        Ok(WorkerResponse::Status {
                            state: ModelState::Failed,
                            error,
                        }) => Probe::Done(Err(
                            error.unwrap_or_else(|| "model failed to load".to_string())
                        )),
                        Ok(response) => {
                            trace!(worker = %id, attempt, ?response, "Worker not ready");
                            Probe::NotYet
                        }
                        Err(err) => {
                            trace!(worker = %id, attempt, "Status probe failed: {err:#}");
                            Probe::NotYet
                        }
                    }
                }
            })
            .await;

        match outcome {
            PollOutcome::Done(Ok(())) => {
                if let Ok(mut slot) = self.slot.lock() {
                    slot.phase = WorkerPhase::Ready;
                    slot.last_error = None;
                }
                info!(worker = %id, "Local model worker ready");
                true
            }
            PollOutcome::Done(Err(message)) => {
                self.fail(Some(id), message).await;
                false
            }
            PollOutcome::Exhausted { attempts } => {
                self.fail(
                    Some(id),
                    format!("worker not ready after {attempts} status checks"),
                )
                .await;
                false
            }
        }
    }

    /// Record a failed initialisation and destroy whatever was created.
    async fn fail(&self, id: Option<WorkerId>, message: String) {
        warn!(worker = ?id.map(|id| id.to_string()), "Worker initialisation failed: {message}");
        if let Ok(mut slot) = self.slot.lock() {
            if slot.worker == id || id.is_none() {
                slot.phase = WorkerPhase::Uninitialized;
                slot.worker = None;
            }
            slot.last_error = Some(message);
        }
        if let Some(id) = id {
            self.host.destroy(id).await;
        }
    }
}
