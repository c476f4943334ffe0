//! The page context: plays what the coordinator sends and reports back.
//!
//! A `PageAgent` runs as its own task. It owns the playback scheduler and the
//! native speech handle for one page, listens to the coordinator's messages
//! and to local commands from the page surface, and publishes `PageEvent`s for
//! whatever renders the page UI.

pub mod output;
pub mod scheduler;

pub use output::{AudioOutput, Decoded, PlaybackClock};
pub use scheduler::PlaybackScheduler;

use crate::bus::PageReceiver;
use crate::config::{RuntimeConfig, Settings};
use crate::coordinator::CoordinatorHandle;
use crate::engine::EngineKind;
use crate::error::ReadError;
use crate::messages::{LoadStatus, PageId, PageMessage, PlaybackState, ReadOrigin};
use crate::native::{NativeSpeech, NativeUtterance};
use crate::text;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// What the page's status indicator shows.
#[derive(Debug, Clone, PartialEq)]
pub enum UiStatus {
    Idle,
    Loading {
        engine: Option<EngineKind>,
        message: String,
        progress: Option<f32>,
        downloading: bool,
    },
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    StatusChanged(UiStatus),
    Notification {
        level: NotificationLevel,
        message: String,
    },
    EngineSelected(EngineKind),
    AutoReadChanged(bool),
}

/// Input from the page itself rather than from the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum PageCommand {
    /// The user's current selection changed.
    SetSelection(String),
    /// The extracted readable text of the page changed.
    SetContent(String),
    SetVisible(bool),
    ReadSelection,
    ReadPage,
    Stop,
    TogglePause,
    Close,
}

#[derive(Debug, Clone)]
pub struct PageOptions {
    pub auto_read: bool,
    pub auto_read_delay: Duration,
    pub max_chars: usize,
    pub drain_interval: Duration,
}

impl PageOptions {
    pub fn new(config: &RuntimeConfig, settings: &Settings) -> Self {
        Self {
            auto_read: settings.auto_read,
            auto_read_delay: Duration::from_millis(settings.auto_read_delay_ms),
            max_chars: config.max_page_chars,
            drain_interval: config.drain_poll_interval(),
        }
    }
}

impl Default for PageOptions {
    fn default() -> Self {
        Self::new(&RuntimeConfig::default(), &Settings::default())
    }
}

/// Local control of a running page.
#[derive(Clone)]
pub struct PageHandle {
    id: PageId,
    commands: mpsc::UnboundedSender<PageCommand>,
}

impl PageHandle {
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Returns false once the page has closed.
    pub fn send(&self, command: PageCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn set_selection(&self, selection: impl Into<String>) -> bool {
        self.send(PageCommand::SetSelection(selection.into()))
    }

    pub fn set_content(&self, content: impl Into<String>) -> bool {
        self.send(PageCommand::SetContent(content.into()))
    }

    pub fn set_visible(&self, visible: bool) -> bool {
        self.send(PageCommand::SetVisible(visible))
    }

    pub fn close(&self) -> bool {
        self.send(PageCommand::Close)
    }
}

#[derive(Debug, Clone)]
struct Loading {
    engine: Option<EngineKind>,
    message: String,
    progress: Option<f32>,
    downloading: bool,
}

pub struct PageAgent<O: AudioOutput, N: NativeSpeech> {
    id: PageId,
    coordinator: CoordinatorHandle,
    inbox: PageReceiver,
    commands: mpsc::UnboundedReceiver<PageCommand>,
    events: mpsc::UnboundedSender<PageEvent>,
    scheduler: PlaybackScheduler<O>,
    native: N,
    native_active: bool,
    options: PageOptions,
    selection: String,
    content: String,
    visible: bool,
    last_read: Option<String>,
    auto_read_at: Option<Instant>,
    loading: Option<Loading>,
    ui: UiStatus,
    reported: PlaybackState,
}

impl<O, N> PageAgent<O, N>
where
    O: AudioOutput + 'static,
    N: NativeSpeech + 'static,
{
    /// Build an agent around a page inbox obtained from `PageRegistry::open`.
    pub fn new(
        id: PageId,
        coordinator: CoordinatorHandle,
        inbox: PageReceiver,
        output: O,
        native: N,
        options: PageOptions,
    ) -> (Self, PageHandle, mpsc::UnboundedReceiver<PageEvent>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let agent = Self {
            id,
            coordinator,
            inbox,
            commands,
            events,
            scheduler: PlaybackScheduler::new(output),
            native,
            native_active: false,
            options,
            selection: String::new(),
            content: String::new(),
            visible: true,
            last_read: None,
            auto_read_at: None,
            loading: None,
            ui: UiStatus::Idle,
            reported: PlaybackState::Idle,
        };
        let handle = PageHandle {
            id,
            commands: command_tx,
        };
        (agent, handle, event_rx)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!(page = %self.id, "Page agent started");
        let mut drain = tokio::time::interval(self.options.drain_interval);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if self.options.auto_read {
            self.schedule_auto_read();
        }

        loop {
            let auto_read_at = self.auto_read_at;
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(PageCommand::Close) | None => break,
                    Some(command) => self.handle_command(command),
                },
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => {
                        debug!(page = %self.id, "Coordinator closed the page inbox");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(auto_read_at.unwrap_or_else(Instant::now)), if auto_read_at.is_some() => {
                    self.auto_read_due();
                }
                _ = drain.tick() => self.drain(),
            }
            self.sync();
        }

        self.stop_local();
        self.sync();
        self.coordinator.page_closed(self.id);
        info!(page = %self.id, "Page agent stopped");
    }

    fn handle_message(&mut self, message: PageMessage) {
        trace!(page = %self.id, action = message.action(), "Page message");
        match message {
            PageMessage::StartLoading { engine, message } => {
                self.set_loading(Some(engine), message, None, false);
            }
            PageMessage::EngineSelected { engine } => {
                self.emit(PageEvent::EngineSelected(engine));
                if let Some(loading) = self.loading.as_mut() {
                    loading.engine = Some(engine);
                }
            }
            PageMessage::PlayAudio { request_id, audio } => {
                self.cancel_native();
                self.loading = None;
                match self.scheduler.play_whole(&audio) {
                    Ok(()) => debug!(page = %self.id, %request_id, "Playing audio"),
                    Err(err) => self.report_error(&err),
                }
            }
            PageMessage::PlayAudioChunk {
                request_id,
                audio,
                chunk,
            } => {
                if chunk.is_first {
                    self.cancel_native();
                    self.loading = None;
                }
                match self.scheduler.play_chunk(&audio, chunk) {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!(
                        page = %self.id,
                        %request_id,
                        index = chunk.index,
                        "Chunk arrived after the stream ended"
                    ),
                    Err(err) => self.report_error(&err),
                }
            }
            PageMessage::StreamEnd { request_id } => {
                if self.scheduler.end_stream() {
                    debug!(page = %self.id, %request_id, "Stream ended with nothing pending");
                }
            }
            PageMessage::SpeakWithNative {
                request_id,
                text,
                voice,
                rate,
            } => {
                self.scheduler.stop();
                self.cancel_native();
                self.loading = None;
                let utterance = NativeUtterance { text, voice, rate };
                match self.native.speak(&utterance) {
                    Ok(()) => {
                        self.native_active = true;
                        debug!(page = %self.id, %request_id, "Speaking with native voice");
                    }
                    Err(err) => {
                        warn!(page = %self.id, "Native speech failed: {err:#}");
                        self.report_error(&ReadError::engine_unavailable(format!("{err:#}")));
                    }
                }
            }
            PageMessage::StopAudio => {
                self.stop_local();
            }
            PageMessage::PauseAudio => {
                self.scheduler.pause();
            }
            PageMessage::ResumeAudio => {
                self.scheduler.resume();
            }
            PageMessage::UpdateLoadingStatus {
                engine,
                status,
                message,
                progress,
            } => match status {
                LoadStatus::Downloading | LoadStatus::Loading if self.loading.is_some() => {
                    self.set_loading(
                        Some(engine),
                        message,
                        progress,
                        status == LoadStatus::Downloading,
                    );
                }
                _ => trace!(page = %self.id, ?status, "Loading status not shown"),
            },
            PageMessage::AutoReadChanged { enabled } => {
                self.options.auto_read = enabled;
                self.emit(PageEvent::AutoReadChanged(enabled));
                if enabled {
                    self.schedule_auto_read();
                } else {
                    self.auto_read_at = None;
                }
            }
            PageMessage::GetSelection => self.read_selection(ReadOrigin::Shortcut),
            PageMessage::ReadPageContent => self.read_page(ReadOrigin::ContextMenu, true),
            PageMessage::Notice { message } => self.notify(NotificationLevel::Info, message),
            PageMessage::Error { kind, message } => {
                debug!(page = %self.id, %kind, "Coordinator reported an error");
                self.loading = None;
                // No more chunks follow; already queued audio drains to idle.
                self.scheduler.end_stream();
                self.notify(NotificationLevel::Error, message);
            }
            PageMessage::Unknown => {
                debug!(page = %self.id, "Ignoring unknown page message");
            }
        }
    }

    fn handle_command(&mut self, command: PageCommand) {
        match command {
            PageCommand::SetSelection(selection) => self.selection = selection,
            PageCommand::SetContent(content) => {
                self.content = content;
                if self.options.auto_read {
                    self.schedule_auto_read();
                }
            }
            PageCommand::SetVisible(visible) => {
                self.visible = visible;
                if visible && self.options.auto_read {
                    self.schedule_auto_read();
                }
            }
            PageCommand::ReadSelection => self.read_selection(ReadOrigin::Page),
            PageCommand::ReadPage => self.read_page(ReadOrigin::Page, false),
            PageCommand::Stop => {
                self.stop_local();
                self.coordinator.stop();
            }
            PageCommand::TogglePause => {
                if !self.scheduler.pause() {
                    self.scheduler.resume();
                }
            }
            PageCommand::Close => {}
        }
    }

    fn read_selection(&mut self, origin: ReadOrigin) {
        match text::selection_text(&self.selection) {
            Some(selection) => self.request_read(selection, origin),
            None => self.notify(NotificationLevel::Info, "Select some text to read.".to_string()),
        }
    }

    /// Read the page body; with `skip_repeat`, text identical to the last
    /// page read is not read again.
    fn read_page(&mut self, origin: ReadOrigin, skip_repeat: bool) {
        let Some(content) = text::page_text(&self.content, self.options.max_chars) else {
            debug!(page = %self.id, "No readable page content");
            return;
        };
        if skip_repeat && self.last_read.as_deref() == Some(content.as_str()) {
            debug!(page = %self.id, "Page content already read");
            return;
        }
        self.last_read = Some(content.clone());
        self.request_read(content, origin);
    }

    fn request_read(&mut self, text: String, origin: ReadOrigin) {
        info!(page = %self.id, ?origin, chars = text.chars().count(), "Requesting read");
        self.set_loading(None, "Preparing speech...".to_string(), None, false);
        self.coordinator.read(text, Some(self.id), origin);
    }

    fn schedule_auto_read(&mut self) {
        if self.visible {
            self.auto_read_at = Some(Instant::now() + self.options.auto_read_delay);
        }
    }

    fn auto_read_due(&mut self) {
        self.auto_read_at = None;
        if self.options.auto_read && self.visible {
            self.read_page(ReadOrigin::AutoRead, true);
        }
    }

    fn drain(&mut self) {
        self.scheduler.poll();
        if self.native_active && !self.native.is_speaking() {
            debug!(page = %self.id, "Native speech finished");
            self.native_active = false;
        }
    }

    fn stop_local(&mut self) {
        self.scheduler.stop();
        self.cancel_native();
        self.loading = None;
    }

    fn cancel_native(&mut self) {
        if self.native_active {
            self.native.cancel();
            self.native_active = false;
        }
    }

    fn report_error(&mut self, err: &ReadError) {
        self.loading = None;
        self.notify(NotificationLevel::Error, err.user_message());
    }

    fn set_loading(
        &mut self,
        engine: Option<EngineKind>,
        message: String,
        progress: Option<f32>,
        downloading: bool,
    ) {
        let engine = engine.or_else(|| self.loading.as_ref().and_then(|l| l.engine));
        self.loading = Some(Loading {
            engine,
            message,
            progress,
            downloading,
        });
    }

    fn playback(&self) -> PlaybackState {
        if self.native_active {
            PlaybackState::Playing
        } else {
            self.scheduler.state()
        }
    }

    /// Publish UI changes and report playback transitions.
    fn sync(&mut self) {
        let playback = self.playback();
        if playback != PlaybackState::Idle {
            self.loading = None;
        }
        let ui = match playback {
            PlaybackState::Playing => UiStatus::Playing,
            PlaybackState::Paused => UiStatus::Paused,
            PlaybackState::Idle => match &self.loading {
                Some(loading) => UiStatus::Loading {
                    engine: loading.engine,
                    message: loading.message.clone(),
                    progress: loading.progress,
                    downloading: loading.downloading,
                },
                None => UiStatus::Idle,
            },
        };
        if ui != self.ui {
            self.ui = ui.clone();
            self.emit(PageEvent::StatusChanged(ui));
        }
        if playback != self.reported {
            self.reported = playback;
            self.coordinator.playback_state(self.id, playback);
        }
    }

    fn notify(&self, level: NotificationLevel, message: String) {
        self.emit(PageEvent::Notification { level, message });
    }

    fn emit(&self, event: PageEvent) {
        let _ = self.events.send(event);
    }
}
