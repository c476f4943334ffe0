//! Entry point for the read-aloud reader.
//!
//! Responsibilities here are intentionally minimal:
//! - Dispatch to the worker process when launched with `--tts-worker`.
//! - Parse command-line arguments and load `conf/config.toml`.
//! - Wire the coordinator to the settings file, the remote client, the worker
//!   host and one page backed by the default audio device.

mod audio;
#[cfg(feature = "piper")]
mod piper;
mod speech;
mod tts_worker;
mod worker_host;

use crate::audio::RodioOutput;
use crate::speech::CommandSpeech;
use crate::worker_host::ProcessWorkerHost;
use anyhow::{Context, Result, anyhow};
use read_aloud_core::bus::PageRegistry;
use read_aloud_core::config::{RuntimeConfig, WorkerMode, load_config};
use read_aloud_core::messages::PageId;
use read_aloud_core::page::{
    NotificationLevel, PageAgent, PageCommand, PageEvent, PageOptions, UiStatus,
};
use read_aloud_core::remote::ElevenLabsClient;
use read_aloud_core::store::{JsonFileStore, SettingsStore, load_settings};
use read_aloud_core::worker::{InProcessWorkerHost, WorkerHost};
use read_aloud_core::{Collaborators, Coordinator, CoordinatorHandle};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

const PAGE: PageId = PageId(1);

fn main() {
    if tts_worker::maybe_run_worker() {
        return;
    }
    let reload_handle = init_tracing();
    if let Err(err) = run(&reload_handle) {
        error!("{err:?}");
        std::process::exit(1);
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Input {
    /// Read as the user's selection.
    Selection(String),
    /// Read as a whole page; HTML is reduced to text first.
    Page(PathBuf),
    ListVoices,
}

fn run(reload_handle: &ReloadHandle) -> Result<()> {
    let input = parse_args(env::args().skip(1))?;
    let config = load_config(Path::new("conf/config.toml"));
    set_log_level(reload_handle, config.log_level.as_filter_str());
    info!(
        level = %config.log_level,
        worker_mode = ?config.worker_mode,
        settings = %config.settings_path,
        "Starting reader"
    );

    if config.worker_mode == WorkerMode::InProcess {
        tts_worker::prepare_model_env(PathBuf::from(&config.espeak_path));
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Building async runtime")?;
    runtime.block_on(read_aloud(config, input))
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Input> {
    let mut args = args.peekable();
    match args.peek().map(String::as_str) {
        None => Err(anyhow!(
            "Usage: read-aloud <text...> | --file <page.html> | --voices"
        )),
        Some("--voices") => Ok(Input::ListVoices),
        Some("--file") => {
            args.next();
            let path = args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("--file needs a path"))?;
            if !path.exists() {
                return Err(anyhow!("File not found: {}", path.display()));
            }
            Ok(Input::Page(path))
        }
        Some(_) => Ok(Input::Selection(args.collect::<Vec<_>>().join(" "))),
    }
}

fn worker_host(config: &RuntimeConfig) -> Arc<dyn WorkerHost> {
    let model = PathBuf::from(&config.model_path);
    let espeak = PathBuf::from(&config.espeak_path);
    match config.worker_mode {
        WorkerMode::Process => Arc::new(ProcessWorkerHost::new(
            model,
            espeak,
            config.streaming_threshold_chars,
        )),
        WorkerMode::InProcess => Arc::new(InProcessWorkerHost::new(
            tts_worker::model_loader(model, espeak),
            config.streaming_threshold_chars,
        )),
    }
}

async fn read_aloud(config: RuntimeConfig, input: Input) -> Result<()> {
    let store: Arc<dyn SettingsStore> = Arc::new(JsonFileStore::new(&config.settings_path));
    let remote = Arc::new(ElevenLabsClient::new(&config.api_base_url)?);
    let pages = PageRegistry::new();
    let inbox = pages.open(PAGE);
    let (coordinator, handle) = Coordinator::new(
        Collaborators {
            store: Arc::clone(&store),
            remote,
            worker_host: worker_host(&config),
            pages,
        },
        &config,
    );
    coordinator.spawn();
    if let Err(err) = handle.installed().await {
        warn!("Failed to write default settings: {err:#}");
    }

    let (text, whole_page) = match input {
        Input::ListVoices => return list_voices(&handle).await,
        Input::Page(path) => (page_text(&path)?, true),
        Input::Selection(text) => (text, false),
    };

    let settings = load_settings(store.as_ref()).await;
    let mut options = PageOptions::new(&config, &settings);
    options.auto_read = false;
    let output = tokio::task::spawn_blocking(RodioOutput::open)
        .await
        .context("Audio device task failed")??;
    let (agent, page, mut events) = PageAgent::new(
        PAGE,
        handle.clone(),
        inbox,
        output,
        CommandSpeech::new(&config.native_speech_program),
        options,
    );
    agent.spawn();

    let (interrupt_tx, mut interrupted) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })
    .context("Installing Ctrl-C handler")?;

    if whole_page {
        page.set_content(text);
        page.send(PageCommand::ReadPage);
    } else {
        page.set_selection(text);
        page.send(PageCommand::ReadSelection);
    }

    let mut started = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = interrupted.recv() => {
                info!("Interrupted; stopping playback");
                page.close();
                shutdown(&handle).await;
                std::process::exit(130);
            }
        };
        let Some(event) = event else {
            break;
        };
        match event {
            PageEvent::StatusChanged(UiStatus::Loading { message, .. }) => info!("{message}"),
            PageEvent::StatusChanged(UiStatus::Playing) => started = true,
            PageEvent::StatusChanged(UiStatus::Idle) if started => break,
            PageEvent::StatusChanged(_) => {}
            PageEvent::Notification {
                level: NotificationLevel::Error,
                message,
            } => {
                page.close();
                return Err(anyhow!(message));
            }
            PageEvent::Notification { message, .. } => info!("{message}"),
            PageEvent::EngineSelected(engine) => info!(%engine, "Reading"),
            PageEvent::AutoReadChanged(_) => {}
        }
    }
    page.close();
    Ok(())
}

/// Let the coordinator stop every page and shut the worker down before exit.
async fn shutdown(handle: &CoordinatorHandle) {
    if tokio::time::timeout(Duration::from_secs(3), handle.shutdown())
        .await
        .is_err()
    {
        warn!("Worker did not shut down before exit");
    }
}

fn page_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    let is_html = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "html" | "htm" | "xhtml"));
    if is_html {
        return html2text::from_read(bytes.as_slice(), 10_000)
            .with_context(|| format!("Extracting text from {}", path.display()));
    }
    String::from_utf8(bytes).with_context(|| format!("{} is not UTF-8 text", path.display()))
}

async fn list_voices(handle: &CoordinatorHandle) -> Result<()> {
    match handle.remote_voices().await {
        Ok(voices) => {
            for voice in voices {
                println!("remote\t{}\t{}", voice.voice_id, voice.name);
            }
        }
        Err(err) => warn!("Remote voices unavailable: {}", err.user_message()),
    }
    match handle.local_voices().await {
        Ok(voices) => {
            for voice in voices {
                println!("local\t{}\t{}", voice.id, voice.name);
            }
        }
        Err(err) => warn!("Local voices unavailable: {}", err.user_message()),
    }
    Ok(())
}

fn init_tracing() -> ReloadHandle {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter_layer),
        )
        .init();
    handle
}

fn set_log_level(handle: &ReloadHandle, level: &str) {
    if env::var_os("RUST_LOG").is_some() {
        return;
    }
    let parsed = EnvFilter::builder()
        .parse(level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) = handle.modify(|filter| *filter = parsed) {
        warn!(%level, "Failed to update log level from config: {err}");
    }
}
