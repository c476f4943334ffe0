//! The synthesis coordinator.
//!
//! One coordinator task owns the worker manager and the page registry. It
//! resolves an engine for every read, walks the fallback chain, relays worker
//! audio to the page that asked for it and answers status queries. Handlers
//! that wait on I/O run as their own tasks so the inbox keeps draining while a
//! remote call or a model load is in flight.

use crate::bus::PageRegistry;
use crate::cancellation::{CancelReason, CancellationToken};
use crate::config::{RuntimeConfig, Settings};
use crate::engine::{EngineKind, FallbackChain, Selection, select_engine};
use crate::error::ReadError;
use crate::messages::{
    EncodedAudio, LoadStatus, PageId, PageMessage, PlaybackState, ReadOrigin, RemoteVoice,
    RequestId, VoiceInfo, WorkerEvent,
};
use crate::remote::RemoteSynth;
use crate::store::{SettingsStore, load_settings};
use crate::worker::{GenerateJob, WorkerEventReceiver, WorkerHost, WorkerManager};
use anyhow::{Context, anyhow};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

const PREVIEW_TEXT: &str = "Hello! This is a preview of the selected voice.";

/// A request to read text aloud.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    /// `None` for requests that do not come from a page.
    pub page: Option<PageId>,
    pub origin: ReadOrigin,
}

/// How a request ended, as far as the coordinator is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisOutcome {
    /// Complete audio was sent to the page.
    Delivered {
        request_id: RequestId,
        engine: EngineKind,
    },
    /// The worker accepted the job; audio follows as worker events.
    Pending { request_id: RequestId },
    /// The page was told to speak with its native synthesizer.
    Delegated { request_id: RequestId },
    /// Audio for a caller without a page.
    Audio(EncodedAudio),
    /// A newer request or a stop made this one obsolete.
    Cancelled(CancelReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub is_playing: bool,
    pub auto_read: bool,
}

/// Named keyboard commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutCommand {
    ReadSelection,
    StopReading,
    ToggleAutoRead,
}

impl ShortcutCommand {
    pub fn parse(name: &str) -> Result<Self, ReadError> {
        match name {
            "read-selection" => Ok(ShortcutCommand::ReadSelection),
            "stop-reading" => Ok(ShortcutCommand::StopReading),
            "toggle-auto-read" => Ok(ShortcutCommand::ToggleAutoRead),
            other => Err(ReadError::UnknownAction(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShortcutCommand::ReadSelection => "read-selection",
            ShortcutCommand::StopReading => "stop-reading",
            ShortcutCommand::ToggleAutoRead => "toggle-auto-read",
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

pub enum CoordinatorMessage {
    Read {
        request: SynthesisRequest,
        reply: Option<Reply<Result<SynthesisOutcome, ReadError>>>,
    },
    Stop,
    Pause {
        page: Option<PageId>,
    },
    Resume {
        page: Option<PageId>,
    },
    PlaybackState {
        page: PageId,
        state: PlaybackState,
    },
    PageClosed {
        page: PageId,
    },
    Status {
        reply: Reply<CoordinatorStatus>,
    },
    /// `None` toggles.
    SetAutoRead {
        enabled: Option<bool>,
        reply: Option<Reply<anyhow::Result<bool>>>,
    },
    Engine {
        reply: Reply<Selection>,
    },
    RemoteVoices {
        reply: Reply<Result<Vec<RemoteVoice>, ReadError>>,
    },
    LocalVoices {
        reply: Reply<Result<Vec<VoiceInfo>, ReadError>>,
    },
    Preview {
        engine: EngineKind,
        voice_id: String,
        text: String,
        reply: Reply<Result<EncodedAudio, ReadError>>,
    },
    Installed {
        reply: Reply<anyhow::Result<()>>,
    },
    Command {
        name: String,
        page: Option<PageId>,
        reply: Option<Reply<Result<(), ReadError>>>,
    },
    /// Stop everything and tear the worker down; the coordinator keeps
    /// serving afterwards.
    Shutdown {
        reply: Reply<()>,
    },
}

impl CoordinatorMessage {
    pub fn action(&self) -> &'static str {
        match self {
            CoordinatorMessage::Read { .. } => "read",
            CoordinatorMessage::Stop => "stop",
            CoordinatorMessage::Pause { .. } => "pause",
            CoordinatorMessage::Resume { .. } => "resume",
            CoordinatorMessage::PlaybackState { .. } => "playback-state",
            CoordinatorMessage::PageClosed { .. } => "page-closed",
            CoordinatorMessage::Status { .. } => "status",
            CoordinatorMessage::SetAutoRead { .. } => "set-auto-read",
            CoordinatorMessage::Engine { .. } => "engine",
            CoordinatorMessage::RemoteVoices { .. } => "remote-voices",
            CoordinatorMessage::LocalVoices { .. } => "local-voices",
            CoordinatorMessage::Preview { .. } => "preview",
            CoordinatorMessage::Installed { .. } => "installed",
            CoordinatorMessage::Command { .. } => "command",
            CoordinatorMessage::Shutdown { .. } => "shutdown",
        }
    }
}

fn coordinator_gone() -> ReadError {
    ReadError::engine_unavailable("coordinator is not running")
}

/// Cheap, cloneable address of the coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
}

impl CoordinatorHandle {
    /// A handle plus the inbox a `Coordinator` is built around.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoordinatorMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn post(&self, message: CoordinatorMessage) {
        let action = message.action();
        if self.tx.send(message).is_err() {
            debug!(action, "Coordinator gone; dropping message");
        }
    }

    async fn ask<T>(&self, build: impl FnOnce(Reply<T>) -> CoordinatorMessage) -> Option<T> {
        let (reply, response) = oneshot::channel();
        self.tx.send(build(reply)).ok()?;
        response.await.ok()
    }

    /// Fire-and-forget read; progress and errors reach the page as messages.
    pub fn read(&self, text: String, page: Option<PageId>, origin: ReadOrigin) {
        self.post(CoordinatorMessage::Read {
            request: SynthesisRequest { text, page, origin },
            reply: None,
        });
    }

    /// Read and wait for the dispatch outcome.
    pub async fn synthesize(
        &self,
        request: SynthesisRequest,
    ) -> Result<SynthesisOutcome, ReadError> {
        self.ask(|reply| CoordinatorMessage::Read {
            request,
            reply: Some(reply),
        })
        .await
        .unwrap_or_else(|| Err(coordinator_gone()))
    }

    pub fn stop(&self) {
        self.post(CoordinatorMessage::Stop);
    }

    pub fn pause(&self, page: Option<PageId>) {
        self.post(CoordinatorMessage::Pause { page });
    }

    pub fn resume(&self, page: Option<PageId>) {
        self.post(CoordinatorMessage::Resume { page });
    }

    pub fn playback_state(&self, page: PageId, state: PlaybackState) {
        self.post(CoordinatorMessage::PlaybackState { page, state });
    }

    pub fn page_closed(&self, page: PageId) {
        self.post(CoordinatorMessage::PageClosed { page });
    }

    pub async fn status(&self) -> Option<CoordinatorStatus> {
        self.ask(|reply| CoordinatorMessage::Status { reply }).await
    }

    pub async fn toggle_auto_read(&self) -> anyhow::Result<bool> {
        self.set_auto_read_inner(None).await
    }

    pub async fn set_auto_read(&self, enabled: bool) -> anyhow::Result<bool> {
        self.set_auto_read_inner(Some(enabled)).await
    }

    async fn set_auto_read_inner(&self, enabled: Option<bool>) -> anyhow::Result<bool> {
        self.ask(|reply| CoordinatorMessage::SetAutoRead {
            enabled,
            reply: Some(reply),
        })
        .await
        .unwrap_or_else(|| Err(anyhow!("coordinator is not running")))
    }

    pub async fn engine(&self) -> Option<Selection> {
        self.ask(|reply| CoordinatorMessage::Engine { reply }).await
    }

    pub async fn remote_voices(&self) -> Result<Vec<RemoteVoice>, ReadError> {
        self.ask(|reply| CoordinatorMessage::RemoteVoices { reply })
            .await
            .unwrap_or_else(|| Err(coordinator_gone()))
    }

    pub async fn local_voices(&self) -> Result<Vec<VoiceInfo>, ReadError> {
        self.ask(|reply| CoordinatorMessage::LocalVoices { reply })
            .await
            .unwrap_or_else(|| Err(coordinator_gone()))
    }

    /// Synthesize a short sample with `voice_id`; blank text uses a stock
    /// sentence.
    pub async fn preview_voice(
        &self,
        engine: EngineKind,
        voice_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<EncodedAudio, ReadError> {
        let voice_id = voice_id.into();
        let text = text.into();
        self.ask(|reply| CoordinatorMessage::Preview {
            engine,
            voice_id,
            text,
            reply,
        })
        .await
        .unwrap_or_else(|| Err(coordinator_gone()))
    }

    /// Stop every page and destroy the worker; resolves once both are done.
    pub async fn shutdown(&self) {
        let _ = self.ask(|reply| CoordinatorMessage::Shutdown { reply }).await;
    }

    pub async fn installed(&self) -> anyhow::Result<()> {
        self.ask(|reply| CoordinatorMessage::Installed { reply })
            .await
            .unwrap_or_else(|| Err(anyhow!("coordinator is not running")))
    }

    pub async fn command(&self, name: &str, page: Option<PageId>) -> Result<(), ReadError> {
        let name = name.to_string();
        self.ask(|reply| CoordinatorMessage::Command {
            name,
            page,
            reply: Some(reply),
        })
        .await
        .unwrap_or_else(|| Err(coordinator_gone()))
    }
}

/// The outside world the coordinator talks to.
pub struct Collaborators {
    pub store: Arc<dyn SettingsStore>,
    pub remote: Arc<dyn RemoteSynth>,
    pub worker_host: Arc<dyn WorkerHost>,
    pub pages: PageRegistry,
}

struct ActiveRequest {
    id: RequestId,
    token: CancellationToken,
}

#[derive(Default)]
struct CoordinatorState {
    /// The current request of each page.
    active: HashMap<PageId, ActiveRequest>,
    playing: HashSet<PageId>,
    /// Local previews waiting for their audio event.
    previews: HashMap<RequestId, Reply<Result<EncodedAudio, ReadError>>>,
}

struct Shared {
    store: Arc<dyn SettingsStore>,
    remote: Arc<dyn RemoteSynth>,
    worker: WorkerManager,
    pages: PageRegistry,
    preview_timeout: Duration,
    prewarm: bool,
    next_request: AtomicU64,
    state: Mutex<CoordinatorState>,
}

pub struct Coordinator {
    shared: Arc<Shared>,
    inbox: mpsc::UnboundedReceiver<CoordinatorMessage>,
    worker_events: WorkerEventReceiver,
}

impl Coordinator {
    pub fn new(collaborators: Collaborators, config: &RuntimeConfig) -> (Self, CoordinatorHandle) {
        let (handle, inbox) = CoordinatorHandle::channel();
        let (events_tx, worker_events) = mpsc::unbounded_channel();
        let timings = config.worker_timings();
        let shared = Shared {
            store: collaborators.store,
            remote: collaborators.remote,
            worker: WorkerManager::new(collaborators.worker_host, events_tx, timings),
            pages: collaborators.pages,
            preview_timeout: timings.preview_timeout,
            prewarm: config.prewarm_local_model,
            next_request: AtomicU64::new(1),
            state: Mutex::new(CoordinatorState::default()),
        };
        let coordinator = Self {
            shared: Arc::new(shared),
            inbox,
            worker_events,
        };
        (coordinator, handle)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Serve until every handle is dropped.
    pub async fn run(mut self) {
        info!("Coordinator started");
        loop {
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                Some(event) = self.worker_events.recv() => self.shared.relay(event),
            }
        }
        self.shared.worker.invalidate().await;
        info!("Coordinator stopped");
    }

    fn handle(&self, message: CoordinatorMessage) {
        trace!(action = message.action(), "Coordinator message");
        let shared = Arc::clone(&self.shared);
        match message {
            CoordinatorMessage::Read { request, reply } => shared.start_read(request, reply),
            CoordinatorMessage::Stop => shared.stop_all(),
            CoordinatorMessage::Pause { page } => shared.to_pages(page, PageMessage::PauseAudio),
            CoordinatorMessage::Resume { page } => shared.to_pages(page, PageMessage::ResumeAudio),
            CoordinatorMessage::PlaybackState { page, state } => shared.record_playback(page, state),
            CoordinatorMessage::PageClosed { page } => shared.forget_page(page),
            CoordinatorMessage::Status { reply } => {
                let is_playing = shared.is_playing();
                tokio::spawn(async move {
                    let settings = load_settings(shared.store.as_ref()).await;
                    let _ = reply.send(CoordinatorStatus {
                        is_playing,
                        auto_read: settings.auto_read,
                    });
                });
            }
            CoordinatorMessage::SetAutoRead { enabled, reply } => {
                tokio::spawn(async move {
                    let result = shared.set_auto_read(enabled).await;
                    if let Err(err) = &result {
                        warn!("Failed to update auto-read: {err:#}");
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                });
            }
            CoordinatorMessage::Engine { reply } => {
                tokio::spawn(async move {
                    let settings = load_settings(shared.store.as_ref()).await;
                    let _ = reply.send(select_engine(&settings));
                });
            }
            CoordinatorMessage::RemoteVoices { reply } => {
                tokio::spawn(async move {
                    let _ = reply.send(shared.remote_voices().await);
                });
            }
            CoordinatorMessage::LocalVoices { reply } => {
                tokio::spawn(async move {
                    let _ = reply.send(shared.local_voices().await);
                });
            }
            CoordinatorMessage::Preview {
                engine,
                voice_id,
                text,
                reply,
            } => {
                tokio::spawn(async move {
                    let _ = reply.send(shared.preview(engine, voice_id, text).await);
                });
            }
            CoordinatorMessage::Installed { reply } => {
                tokio::spawn(async move {
                    let _ = reply.send(shared.installed().await);
                });
            }
            CoordinatorMessage::Shutdown { reply } => {
                shared.stop_all();
                tokio::spawn(async move {
                    shared.worker.invalidate().await;
                    let _ = reply.send(());
                });
            }
            CoordinatorMessage::Command { name, page, reply } => {
                let result = shared.command(&name, page);
                if let Err(err) = &result {
                    warn!(command = %name, "Rejected command: {err}");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }
}

impl Shared {
    fn send(&self, page: Option<PageId>, message: PageMessage) {
        if let Some(page) = page {
            self.pages.send(page, message);
        }
    }

    fn to_pages(&self, page: Option<PageId>, message: PageMessage) {
        match page {
            Some(page) => {
                self.pages.send(page, message);
            }
            None => self.pages.broadcast(message),
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    /// Validate, claim the page and hand the slow part to its own task.
    ///
    /// Claiming happens here, in inbox order, so a later read for the same
    /// page always supersedes an earlier one.
    fn start_read(
        self: Arc<Self>,
        request: SynthesisRequest,
        reply: Option<Reply<Result<SynthesisOutcome, ReadError>>>,
    ) {
        if request.text.trim().is_empty() {
            let err = ReadError::NoText;
            debug!(page = ?request.page, origin = ?request.origin, "Rejected empty read");
            self.send(request.page, PageMessage::error(&err));
            if let Some(reply) = reply {
                let _ = reply.send(Err(err));
            }
            return;
        }

        let (id, token) = self.begin(request.page);
        info!(
            request = %id,
            page = ?request.page,
            origin = ?request.origin,
            chars = request.text.chars().count(),
            "Read requested"
        );
        tokio::spawn(async move {
            let result = self.dispatch(id, &token, &request).await;
            match &result {
                Ok(outcome) => debug!(request = %id, ?outcome, "Read dispatched"),
                Err(err) => {
                    warn!(request = %id, kind = err.kind(), "Read failed: {err}");
                    if let Some(page) = request.page {
                        if self.is_current(page, id) {
                            self.pages.send(page, PageMessage::error(err));
                        } else {
                            debug!(request = %id, %page, "Dropping error for a stale request");
                        }
                    }
                }
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        });
    }

    /// Allocate a request id and make it the page's current request.
    fn begin(&self, page: Option<PageId>) -> (RequestId, CancellationToken) {
        let id = self.next_request_id();
        let token = CancellationToken::new();
        let Some(page) = page else {
            return (id, token);
        };
        let previous = match self.state.lock() {
            Ok(mut state) => state.active.insert(
                page,
                ActiveRequest {
                    id,
                    token: token.clone(),
                },
            ),
            Err(_) => None,
        };
        if let Some(previous) = previous {
            debug!(%page, superseded = %previous.id, by = %id, "Superseding request");
            previous.token.cancel(CancelReason::Superseded);
        }
        self.pages.send(page, PageMessage::StopAudio);
        (id, token)
    }

    fn is_current(&self, page: PageId, id: RequestId) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state
            .active
            .get(&page)
            .is_some_and(|active| active.id == id && !active.token.is_cancelled())
    }

    async fn dispatch(
        &self,
        id: RequestId,
        token: &CancellationToken,
        request: &SynthesisRequest,
    ) -> Result<SynthesisOutcome, ReadError> {
        let page = request.page;
        let settings = load_settings(self.store.as_ref()).await;
        let selection = select_engine(&settings);
        if let Some(notice) = selection.notice {
            info!(request = %id, engine = %selection.engine, "{notice}");
            self.send(page, PageMessage::Notice { message: notice });
        }

        let chain = FallbackChain::for_engine(selection.engine);
        let mut step = chain.first();
        loop {
            if let Some(reason) = token.reason() {
                debug!(request = %id, reason = reason.as_str(), "Request cancelled before dispatch");
                return Ok(SynthesisOutcome::Cancelled(reason));
            }
            self.send(page, PageMessage::EngineSelected { engine: step.engine });
            let result = match step.engine {
                EngineKind::Remote => self.run_remote(id, token, page, &request.text, &settings).await,
                EngineKind::Local => self.run_local(id, token, page, &request.text, &settings).await,
                EngineKind::Native => self.run_native(id, page, &request.text, &settings),
            };
            let err = match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };
            let Some(next) = chain.next_after(step, &err) else {
                return Err(err);
            };
            warn!(
                request = %id,
                from = %step.engine,
                to = %next.engine,
                "Engine failed, falling back: {err}"
            );
            self.send(
                page,
                PageMessage::Notice {
                    message: format!(
                        "{} unavailable; using {} instead.",
                        step.engine.label(),
                        next.engine.label().to_lowercase()
                    ),
                },
            );
            step = next;
        }
    }

    async fn run_remote(
        &self,
        id: RequestId,
        token: &CancellationToken,
        page: Option<PageId>,
        text: &str,
        settings: &Settings,
    ) -> Result<SynthesisOutcome, ReadError> {
        if !settings.has_credential() {
            return Err(ReadError::CredentialMissing);
        }
        self.send(
            page,
            PageMessage::StartLoading {
                engine: EngineKind::Remote,
                message: "Generating speech...".to_string(),
            },
        );
        let audio = self.remote.synthesize(text, &settings.remote_params()).await?;
        if let Err(err) = token.check_cancelled("deliver") {
            debug!(request = %id, "Dropping remote audio: {err}");
            return Ok(SynthesisOutcome::Cancelled(
                token.reason().unwrap_or(CancelReason::Superseded),
            ));
        }
        match page {
            Some(page) => {
                self.pages.send(
                    page,
                    PageMessage::PlayAudio {
                        request_id: id,
                        audio,
                    },
                );
                Ok(SynthesisOutcome::Delivered {
                    request_id: id,
                    engine: EngineKind::Remote,
                })
            }
            None => Ok(SynthesisOutcome::Audio(audio)),
        }
    }

    async fn ready_worker(&self) -> Result<(), ReadError> {
        if self.worker.ensure_ready().await {
            return Ok(());
        }
        Err(ReadError::EngineUnavailable(
            self.worker
                .last_error()
                .unwrap_or_else(|| "local model worker did not start".to_string()),
        ))
    }

    async fn run_local(
        &self,
        id: RequestId,
        token: &CancellationToken,
        page: Option<PageId>,
        text: &str,
        settings: &Settings,
    ) -> Result<SynthesisOutcome, ReadError> {
        let message = if self.worker.is_ready() {
            "Generating speech..."
        } else {
            "Loading local model..."
        };
        self.send(
            page,
            PageMessage::StartLoading {
                engine: EngineKind::Local,
                message: message.to_string(),
            },
        );
        self.ready_worker().await?;
        if let Some(reason) = token.reason() {
            return Ok(SynthesisOutcome::Cancelled(reason));
        }
        self.worker
            .generate(GenerateJob {
                request_id: id,
                target_page: page,
                text: text.to_string(),
                voice: settings.local_voice_id.clone(),
                speed: settings.speed,
                allow_streaming: page.is_some(),
            })
            .await?;
        Ok(SynthesisOutcome::Pending { request_id: id })
    }

    fn run_native(
        &self,
        id: RequestId,
        page: Option<PageId>,
        text: &str,
        settings: &Settings,
    ) -> Result<SynthesisOutcome, ReadError> {
        let Some(page) = page else {
            return Err(ReadError::engine_unavailable(
                "native speech is only available inside a page",
            ));
        };
        self.pages.send(
            page,
            PageMessage::SpeakWithNative {
                request_id: id,
                text: text.to_string(),
                voice: settings.native_voice.clone(),
                rate: settings.native_rate,
            },
        );
        Ok(SynthesisOutcome::Delegated { request_id: id })
    }

    /// Route one worker event to the page or preview it belongs to.
    fn relay(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::StatusUpdate {
                status,
                message,
                progress,
            } => match status {
                LoadStatus::Downloading | LoadStatus::Loading => {
                    self.pages.broadcast(PageMessage::UpdateLoadingStatus {
                        engine: EngineKind::Local,
                        status,
                        message,
                        progress,
                    });
                }
                LoadStatus::Ready | LoadStatus::Error => {
                    debug!(?status, "Worker status: {message}");
                }
            },
            WorkerEvent::AudioReady {
                request_id,
                target_page,
                audio,
            } => {
                if let Some(preview) = self.take_preview(request_id) {
                    let _ = preview.send(Ok(audio));
                    return;
                }
                self.deliver(
                    request_id,
                    target_page,
                    PageMessage::PlayAudio { request_id, audio },
                );
            }
            WorkerEvent::AudioChunk {
                request_id,
                target_page,
                audio,
                chunk,
            } => self.deliver(
                request_id,
                target_page,
                PageMessage::PlayAudioChunk {
                    request_id,
                    audio,
                    chunk,
                },
            ),
            WorkerEvent::StreamEnd {
                request_id,
                target_page,
            } => self.deliver(request_id, target_page, PageMessage::StreamEnd { request_id }),
            WorkerEvent::AudioError {
                request_id,
                target_page,
                message,
            } => {
                let err = ReadError::EngineUnavailable(message);
                if let Some(preview) = self.take_preview(request_id) {
                    let _ = preview.send(Err(err));
                    return;
                }
                warn!(request = %request_id, "Local generation failed: {err}");
                self.deliver(request_id, target_page, PageMessage::error(&err));
            }
            WorkerEvent::Unknown => debug!("Ignoring unknown worker event"),
        }
    }

    fn deliver(&self, id: RequestId, page: Option<PageId>, message: PageMessage) {
        let Some(page) = page else {
            debug!(request = %id, action = message.action(), "Worker event without a page");
            return;
        };
        if self.is_current(page, id) {
            self.pages.send(page, message);
        } else {
            debug!(
                request = %id,
                %page,
                action = message.action(),
                "Dropping stale worker event"
            );
        }
    }

    fn take_preview(&self, id: RequestId) -> Option<Reply<Result<EncodedAudio, ReadError>>> {
        self.state.lock().ok()?.previews.remove(&id)
    }

    fn stop_all(&self) {
        let cancelled: Vec<ActiveRequest> = match self.state.lock() {
            Ok(mut state) => {
                state.playing.clear();
                state.active.drain().map(|(_, active)| active).collect()
            }
            Err(_) => Vec::new(),
        };
        for active in &cancelled {
            active.token.cancel(CancelReason::Stopped);
        }
        info!(cancelled = cancelled.len(), "Stopping all playback");
        self.pages.broadcast(PageMessage::StopAudio);
    }

    fn record_playback(&self, page: PageId, playback: PlaybackState) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match playback {
            PlaybackState::Idle => {
                state.playing.remove(&page);
            }
            PlaybackState::Playing | PlaybackState::Paused => {
                state.playing.insert(page);
            }
        }
        debug!(%page, ?playback, playing = state.playing.len(), "Playback state");
    }

    fn is_playing(&self) -> bool {
        self.state
            .lock()
            .map(|state| !state.playing.is_empty())
            .unwrap_or(false)
    }

    fn forget_page(&self, page: PageId) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(active) = state.active.remove(&page) {
                active.token.cancel(CancelReason::Stopped);
            }
            state.playing.remove(&page);
        }
        self.pages.unregister(page);
        debug!(%page, "Page closed");
    }

    async fn set_auto_read(&self, enabled: Option<bool>) -> anyhow::Result<bool> {
        let mut settings = load_settings(self.store.as_ref()).await;
        settings.auto_read = enabled.unwrap_or(!settings.auto_read);
        self.store
            .save(&settings)
            .await
            .context("saving auto-read setting")?;
        info!(enabled = settings.auto_read, "Auto-read changed");
        self.pages.broadcast(PageMessage::AutoReadChanged {
            enabled: settings.auto_read,
        });
        Ok(settings.auto_read)
    }

    async fn remote_voices(&self) -> Result<Vec<RemoteVoice>, ReadError> {
        let settings = load_settings(self.store.as_ref()).await;
        if !settings.has_credential() {
            return Err(ReadError::CredentialMissing);
        }
        self.remote.voices(settings.api_key.trim()).await
    }

    async fn local_voices(&self) -> Result<Vec<VoiceInfo>, ReadError> {
        self.ready_worker().await?;
        self.worker.voices().await
    }

    async fn preview(
        &self,
        engine: EngineKind,
        voice_id: String,
        text: String,
    ) -> Result<EncodedAudio, ReadError> {
        let text = match text.trim() {
            "" => PREVIEW_TEXT.to_string(),
            trimmed => trimmed.to_string(),
        };
        let settings = load_settings(self.store.as_ref()).await;
        let id = self.next_request_id();
        debug!(request = %id, %engine, voice = %voice_id, "Voice preview");
        match engine {
            EngineKind::Remote => {
                if !settings.has_credential() {
                    return Err(ReadError::CredentialMissing);
                }
                let mut params = settings.remote_params();
                params.voice_id = voice_id;
                self.remote.synthesize(&text, &params).await
            }
            EngineKind::Local => {
                self.ready_worker().await?;
                let (reply, audio) = oneshot::channel();
                if let Ok(mut state) = self.state.lock() {
                    state.previews.insert(id, reply);
                }
                let job = GenerateJob {
                    request_id: id,
                    target_page: None,
                    text,
                    voice: voice_id,
                    speed: settings.speed,
                    allow_streaming: false,
                };
                if let Err(err) = self.worker.generate(job).await {
                    self.take_preview(id);
                    return Err(err);
                }
                match tokio::time::timeout(self.preview_timeout, audio).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(ReadError::engine_unavailable("preview was abandoned")),
                    Err(_) => {
                        self.take_preview(id);
                        Err(ReadError::engine_unavailable(format!(
                            "no preview audio after {}s",
                            self.preview_timeout.as_secs()
                        )))
                    }
                }
            }
            EngineKind::Native => Err(ReadError::engine_unavailable(
                "native voices are previewed by the page",
            )),
        }
    }

    async fn installed(self: Arc<Self>) -> anyhow::Result<()> {
        if self.store.load().await.ok().flatten().is_none() {
            info!("Writing default settings");
            self.store
                .save(&Settings::default())
                .await
                .context("writing default settings")?;
        }
        if self.prewarm {
            let shared = Arc::clone(&self);
            tokio::spawn(async move {
                info!("Pre-warming local model worker");
                if !shared.worker.ensure_ready().await {
                    warn!(error = ?shared.worker.last_error(), "Pre-warm failed");
                }
            });
        }
        Ok(())
    }

    fn command(self: Arc<Self>, name: &str, page: Option<PageId>) -> Result<(), ReadError> {
        let command = ShortcutCommand::parse(name)?;
        debug!(command = command.as_str(), page = ?page, "Shortcut command");
        match command {
            ShortcutCommand::ReadSelection => match page {
                Some(page) => {
                    self.pages.send(page, PageMessage::GetSelection);
                }
                None => debug!("No page to read a selection from"),
            },
            ShortcutCommand::StopReading => self.stop_all(),
            ShortcutCommand::ToggleAutoRead => {
                tokio::spawn(async move {
                    if let Err(err) = self.set_auto_read(None).await {
                        warn!("Failed to toggle auto-read: {err:#}");
                    }
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PageReceiver;
    use crate::config::{EnginePreference, RemoteParams};
    use crate::messages::{AudioFormat, ChunkInfo};
    use crate::store::MemoryStore;
    use crate::worker::InProcessWorkerHost;
    use crate::worker::runtime::tests::StaticLoader;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct StubRemote {
        failure: Option<ReadError>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl StubRemote {
        fn ok(delay: Duration) -> Self {
            Self {
                failure: None,
                delay,
                calls: AtomicU32::new(0),
            }
        }

        fn failing(err: ReadError) -> Self {
            Self {
                failure: Some(err),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteSynth for StubRemote {
        async fn synthesize(
            &self,
            text: &str,
            _params: &RemoteParams,
        ) -> Result<EncodedAudio, ReadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match &self.failure {
                Some(err) => Err(err.clone()),
                None => Ok(EncodedAudio::new(AudioFormat::Mpeg, text.as_bytes().to_vec())),
            }
        }

        async fn voices(&self, _api_key: &str) -> Result<Vec<RemoteVoice>, ReadError> {
            Ok(vec![RemoteVoice {
                voice_id: "v1".to_string(),
                name: "Rachel".to_string(),
                category: None,
                preview_url: None,
            }])
        }
    }

    const PAGE: PageId = PageId(7);

    struct Fixture {
        handle: CoordinatorHandle,
        page: PageReceiver,
        store: Arc<MemoryStore>,
        remote: Arc<StubRemote>,
    }

    fn settings(engine: EnginePreference, api_key: &str) -> Settings {
        Settings {
            engine,
            api_key: api_key.to_string(),
            ..Settings::default()
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            worker_poll_interval_ms: 10,
            streaming_threshold_chars: 10,
            preview_timeout_secs: 5,
            ..RuntimeConfig::default()
        }
    }

    fn build(settings: Settings, remote: StubRemote) -> (Coordinator, CoordinatorHandle, Fixture) {
        build_with(Arc::new(MemoryStore::with_settings(settings)), remote)
    }

    fn build_with(
        store: Arc<MemoryStore>,
        remote: StubRemote,
    ) -> (Coordinator, CoordinatorHandle, Fixture) {
        let pages = PageRegistry::new();
        let page = pages.open(PAGE);
        let remote = Arc::new(remote);
        let config = config();
        let host = InProcessWorkerHost::new(
            Arc::new(StaticLoader {
                fail: false,
                delay: Duration::ZERO,
            }),
            config.streaming_threshold_chars,
        );
        let (coordinator, handle) = Coordinator::new(
            Collaborators {
                store: Arc::clone(&store) as Arc<dyn SettingsStore>,
                remote: Arc::clone(&remote) as Arc<dyn RemoteSynth>,
                worker_host: Arc::new(host),
                pages,
            },
            &config,
        );
        let fixture = Fixture {
            handle: handle.clone(),
            page,
            store,
            remote,
        };
        (coordinator, handle, fixture)
    }

    fn start(settings: Settings, remote: StubRemote) -> Fixture {
        let (coordinator, _handle, fixture) = build(settings, remote);
        coordinator.spawn();
        fixture
    }

    fn read(text: &str) -> SynthesisRequest {
        SynthesisRequest {
            text: text.to_string(),
            page: Some(PAGE),
            origin: ReadOrigin::ContextMenu,
        }
    }

    fn drain(page: &mut PageReceiver) -> Vec<PageMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = page.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn selected(messages: &[PageMessage]) -> Vec<EngineKind> {
        messages
            .iter()
            .filter_map(|message| match message {
                PageMessage::EngineSelected { engine } => Some(*engine),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn remote_audio_is_delivered_to_the_page() {
        let mut f = start(
            settings(EnginePreference::Auto, "sk"),
            StubRemote::ok(Duration::from_millis(200)),
        );
        let outcome = f.handle.synthesize(read("Hello world.")).await;
        assert!(matches!(
            outcome,
            Ok(SynthesisOutcome::Delivered {
                engine: EngineKind::Remote,
                ..
            })
        ));

        let messages = drain(&mut f.page);
        assert_eq!(messages[0], PageMessage::StopAudio);
        assert_eq!(selected(&messages), vec![EngineKind::Remote]);
        assert!(messages.iter().any(|message| matches!(
            message,
            PageMessage::PlayAudio { audio, .. } if audio.bytes == b"Hello world."
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_falls_back_exactly_once() {
        let mut f = start(
            settings(EnginePreference::Remote, "sk"),
            StubRemote::failing(ReadError::Network("503".into())),
        );
        let outcome = f.handle.synthesize(read("Hello world.")).await;
        assert!(matches!(outcome, Ok(SynthesisOutcome::Delegated { .. })));
        assert_eq!(f.remote.calls.load(Ordering::SeqCst), 1);

        let messages = drain(&mut f.page);
        assert_eq!(
            selected(&messages),
            vec![EngineKind::Remote, EngineKind::Native]
        );
        let spoken: Vec<_> = messages
            .iter()
            .filter(|message| matches!(message, PageMessage::SpeakWithNative { .. }))
            .collect();
        assert_eq!(spoken.len(), 1);
        assert!(
            messages
                .iter()
                .any(|message| matches!(message, PageMessage::Notice { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_transport_failure_is_terminal() {
        let mut f = start(
            settings(EnginePreference::Remote, "sk"),
            StubRemote::failing(ReadError::EngineUnavailable("quota".into())),
        );
        let outcome = f.handle.synthesize(read("Hello world.")).await;
        assert_eq!(outcome, Err(ReadError::EngineUnavailable("quota".into())));

        let messages = drain(&mut f.page);
        assert_eq!(selected(&messages), vec![EngineKind::Remote]);
        assert!(messages.iter().any(|message| matches!(
            message,
            PageMessage::Error { kind, .. } if kind == "engine-unavailable"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credential_demotes_with_a_notice() {
        let mut f = start(
            settings(EnginePreference::Remote, ""),
            StubRemote::ok(Duration::ZERO),
        );
        let outcome = f.handle.synthesize(read("Hi.")).await;
        assert!(matches!(outcome, Ok(SynthesisOutcome::Delegated { .. })));
        assert_eq!(f.remote.calls.load(Ordering::SeqCst), 0);

        let messages = drain(&mut f.page);
        assert!(matches!(messages[1], PageMessage::Notice { .. }));
        assert_eq!(selected(&messages), vec![EngineKind::Native]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_is_rejected_without_preempting() {
        let mut f = start(
            settings(EnginePreference::Auto, "sk"),
            StubRemote::ok(Duration::ZERO),
        );
        assert_eq!(f.handle.synthesize(read("   ")).await, Err(ReadError::NoText));
        let messages = drain(&mut f.page);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            PageMessage::Error { kind, .. } if kind == "no-text"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_read_supersedes_an_older_one() {
        let mut f = start(
            settings(EnginePreference::Auto, "sk"),
            StubRemote::ok(Duration::from_millis(300)),
        );
        let (first, second) = tokio::join!(
            f.handle.synthesize(read("first")),
            f.handle.synthesize(read("second"))
        );
        assert_eq!(
            first,
            Ok(SynthesisOutcome::Cancelled(CancelReason::Superseded))
        );
        assert!(matches!(second, Ok(SynthesisOutcome::Delivered { .. })));

        let played: Vec<_> = drain(&mut f.page)
            .into_iter()
            .filter_map(|message| match message {
                PageMessage::PlayAudio { audio, .. } => Some(audio.bytes),
                _ => None,
            })
            .collect();
        assert_eq!(played, vec![b"second".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_invalidates_requests_in_flight() {
        let mut f = start(
            settings(EnginePreference::Auto, "sk"),
            StubRemote::ok(Duration::from_millis(300)),
        );
        let handle = f.handle.clone();
        let (outcome, ()) = tokio::join!(f.handle.synthesize(read("Hello world.")), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.stop();
        });
        assert_eq!(
            outcome,
            Ok(SynthesisOutcome::Cancelled(CancelReason::Stopped))
        );

        let messages = drain(&mut f.page);
        assert!(
            !messages
                .iter()
                .any(|message| matches!(message, PageMessage::PlayAudio { .. }))
        );
        assert_eq!(messages.last(), Some(&PageMessage::StopAudio));
    }

    #[tokio::test]
    async fn shutdown_stops_pages_and_destroys_the_worker() {
        let (coordinator, handle, mut f) = build(
            settings(EnginePreference::Local, ""),
            StubRemote::ok(Duration::ZERO),
        );
        let shared = Arc::clone(&coordinator.shared);
        assert!(shared.worker.ensure_ready().await);
        coordinator.spawn();
        drain(&mut f.page);

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown completes");
        assert!(!shared.worker.is_ready());
        assert!(drain(&mut f.page).contains(&PageMessage::StopAudio));
    }

    #[tokio::test]
    async fn stale_worker_events_are_dropped() {
        let (coordinator, _handle, mut f) = build(
            settings(EnginePreference::Local, ""),
            StubRemote::ok(Duration::ZERO),
        );
        let shared = Arc::clone(&coordinator.shared);
        let (old, _) = shared.begin(Some(PAGE));
        let (current, _) = shared.begin(Some(PAGE));
        drain(&mut f.page);

        let chunk = |request_id| WorkerEvent::AudioChunk {
            request_id,
            target_page: Some(PAGE),
            audio: EncodedAudio::new(AudioFormat::Wav, vec![1, 2, 3]),
            chunk: ChunkInfo {
                index: 0,
                is_first: true,
                is_final: false,
            },
        };
        shared.relay(chunk(old));
        assert!(drain(&mut f.page).is_empty());

        shared.relay(chunk(current));
        assert!(matches!(
            drain(&mut f.page).as_slice(),
            [PageMessage::PlayAudioChunk { request_id, .. }] if *request_id == current
        ));

        shared.stop_all();
        drain(&mut f.page);
        shared.relay(WorkerEvent::StreamEnd {
            request_id: current,
            target_page: Some(PAGE),
        });
        assert!(drain(&mut f.page).is_empty());
    }

    #[tokio::test]
    async fn local_reads_stream_chunks_through_to_the_page() {
        let mut f = start(
            settings(EnginePreference::Local, ""),
            StubRemote::ok(Duration::ZERO),
        );
        let outcome = f
            .handle
            .synthesize(read("One sentence. Two sentence. Three."))
            .await;
        let request_id = match outcome {
            Ok(SynthesisOutcome::Pending { request_id }) => request_id,
            other => panic!("expected a pending local request, got {other:?}"),
        };

        let mut indices = Vec::new();
        let collect = async {
            while let Some(message) = f.page.recv().await {
                match message {
                    PageMessage::PlayAudioChunk {
                        request_id: id,
                        chunk,
                        ..
                    } => {
                        assert_eq!(id, request_id);
                        indices.push(chunk.index);
                    }
                    PageMessage::StreamEnd { request_id: id } => {
                        assert_eq!(id, request_id);
                        break;
                    }
                    _ => {}
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), collect)
            .await
            .expect("stream finished");
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn local_preview_returns_audio_to_the_caller() {
        let f = start(
            settings(EnginePreference::Auto, ""),
            StubRemote::ok(Duration::ZERO),
        );
        let audio = f
            .handle
            .preview_voice(EngineKind::Local, "bf_emma", "A long enough preview sentence.")
            .await
            .expect("preview audio");
        assert_eq!(audio.bytes, b"A long enough preview sentence.");

        let voices = f.handle.local_voices().await.expect("voices");
        assert_eq!(voices[0].id, "af_heart");
    }

    #[tokio::test(start_paused = true)]
    async fn remote_preview_needs_a_credential() {
        let f = start(
            settings(EnginePreference::Auto, ""),
            StubRemote::ok(Duration::ZERO),
        );
        assert_eq!(
            f.handle.preview_voice(EngineKind::Remote, "v1", "").await,
            Err(ReadError::CredentialMissing)
        );
        assert_eq!(
            f.handle.remote_voices().await,
            Err(ReadError::CredentialMissing)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auto_read_toggle_is_saved_and_broadcast() {
        let mut f = start(Settings::default(), StubRemote::ok(Duration::ZERO));
        assert!(f.handle.toggle_auto_read().await.expect("toggle"));
        assert_eq!(f.store.snapshot().map(|s| s.auto_read), Some(true));
        assert_eq!(
            drain(&mut f.page),
            vec![PageMessage::AutoReadChanged { enabled: true }]
        );

        assert!(f.handle.set_auto_read(true).await.expect("set"));
        let status = f.handle.status().await.expect("status");
        assert!(status.auto_read);
        assert!(!status.is_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_reports_drive_the_status() {
        let f = start(Settings::default(), StubRemote::ok(Duration::ZERO));
        f.handle.playback_state(PAGE, PlaybackState::Playing);
        assert!(f.handle.status().await.expect("status").is_playing);
        f.handle.playback_state(PAGE, PlaybackState::Idle);
        assert!(!f.handle.status().await.expect("status").is_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn shortcut_commands_are_routed() {
        let mut f = start(Settings::default(), StubRemote::ok(Duration::ZERO));
        assert_eq!(
            f.handle.command("read-selection", Some(PAGE)).await,
            Ok(())
        );
        assert_eq!(drain(&mut f.page), vec![PageMessage::GetSelection]);
        assert_eq!(
            f.handle.command("dance", Some(PAGE)).await,
            Err(ReadError::UnknownAction("dance".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn installed_writes_defaults_when_nothing_is_stored() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, handle, _f) = build_with(Arc::clone(&store), StubRemote::ok(Duration::ZERO));
        coordinator.spawn();
        handle.installed().await.expect("installed");
        assert_eq!(store.snapshot(), Some(Settings::default()));
    }
}
