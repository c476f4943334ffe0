//! The `--tts-worker` child process.
//!
//! Requests arrive as `WorkerEnvelope` JSON lines on stdin; responses and
//! unsolicited events leave as `WorkerOutput` lines on stdout. Logs go to
//! stderr so they never interleave with the protocol.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use read_aloud_core::messages::{WorkerEnvelope, WorkerOutput, WorkerRequest};
use read_aloud_core::worker::runtime::call;
use read_aloud_core::worker::{ModelLoader, ProgressReporter, SpeechModel, WorkerRuntime};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

pub const WORKER_FLAG: &str = "--tts-worker";

pub fn maybe_run_worker() -> bool {
    if env::args().any(|arg| arg == WORKER_FLAG) {
        init_worker_tracing();
        if let Err(err) = run_worker() {
            error!("tts-worker error: {err:?}");
        }
        return true;
    }
    false
}

fn init_worker_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

#[derive(Debug, Clone, PartialEq)]
struct WorkerArgs {
    model_path: PathBuf,
    espeak_root: PathBuf,
    streaming_threshold: usize,
}

fn parse_worker_args(args: impl Iterator<Item = String>) -> Result<WorkerArgs> {
    let mut args = args.skip_while(|arg| arg != WORKER_FLAG);
    let _ = args.next();

    let mut model_path: Option<PathBuf> = None;
    let mut espeak_root: Option<PathBuf> = None;
    let mut streaming_threshold = 100;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--model" => model_path = args.next().map(PathBuf::from),
            "--espeak" => espeak_root = args.next().map(PathBuf::from),
            "--threshold" => {
                if let Some(value) = args.next() {
                    streaming_threshold = value
                        .parse()
                        .with_context(|| format!("Invalid --threshold value {value:?}"))?;
                }
            }
            other => warn!(arg = other, "Ignoring unknown worker argument"),
        }
    }

    Ok(WorkerArgs {
        model_path: model_path.ok_or_else(|| anyhow!("Missing --model argument"))?,
        espeak_root: espeak_root.ok_or_else(|| anyhow!("Missing --espeak argument"))?,
        streaming_threshold,
    })
}

fn run_worker() -> Result<()> {
    let args = parse_worker_args(env::args())?;
    prepare_model_env(args.espeak_root.clone());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Building worker runtime")?;
    runtime.block_on(serve(args))
}

/// The model loader this build supports.
#[cfg(feature = "piper")]
pub fn model_loader(model_path: PathBuf, espeak_root: PathBuf) -> Arc<dyn ModelLoader> {
    Arc::new(crate::piper::PiperLoader::new(model_path, espeak_root))
}

#[cfg(not(feature = "piper"))]
pub fn model_loader(_model_path: PathBuf, _espeak_root: PathBuf) -> Arc<dyn ModelLoader> {
    Arc::new(MissingModel)
}

/// Export the environment the model reads at load time. Call before any
/// thread or async runtime exists.
#[cfg(feature = "piper")]
pub fn prepare_model_env(espeak_root: PathBuf) {
    crate::piper::export_espeak_root(espeak_root);
}

#[cfg(not(feature = "piper"))]
pub fn prepare_model_env(_espeak_root: PathBuf) {}

/// Stands in for the model when the binary was built without one.
#[cfg_attr(feature = "piper", allow(dead_code))]
struct MissingModel;

#[async_trait]
impl ModelLoader for MissingModel {
    async fn load(&self, _progress: ProgressReporter) -> Result<Arc<dyn SpeechModel>> {
        Err(anyhow!(
            "this build has no local model; rebuild with `--features piper`"
        ))
    }
}

async fn serve(args: WorkerArgs) -> Result<()> {
    info!(
        model = %args.model_path.display(),
        threshold = args.streaming_threshold,
        "Worker process starting"
    );
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (calls, runtime) = WorkerRuntime::new(
        model_loader(args.model_path.clone(), args.espeak_root.clone()),
        events_tx,
        args.streaming_threshold,
    )
    .spawn();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerOutput>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(output) = out_rx.recv().await {
            let mut payload = match serde_json::to_string(&output) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("Failed to encode worker output: {err}");
                    continue;
                }
            };
            payload.push('\n');
            if let Err(err) = stdout.write_all(payload.as_bytes()).await {
                warn!("Coordinator pipe closed: {err}");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let event_out = out_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event_out.send(WorkerOutput::Event { event }).is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Reading worker stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let envelope: WorkerEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Ignoring malformed request: {err}");
                continue;
            }
        };
        let shutdown = matches!(envelope.request, WorkerRequest::Shutdown);
        debug!(id = envelope.id, action = envelope.request.action(), "Worker request");
        let response = call(&calls, envelope.request).await?;
        let _ = out_tx.send(WorkerOutput::Response {
            id: envelope.id,
            response,
        });
        if shutdown {
            break;
        }
    }

    drop(calls);
    drop(out_tx);
    let _ = runtime.await;
    let _ = writer.await;
    info!("Worker process exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|arg| arg.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn worker_args_follow_the_flag() {
        let parsed = parse_worker_args(args(&[
            "read-aloud",
            "--tts-worker",
            "--model",
            "/m/voice.onnx",
            "--espeak",
            "/usr/share",
            "--threshold",
            "40",
        ]))
        .expect("valid args");
        assert_eq!(parsed.model_path, PathBuf::from("/m/voice.onnx"));
        assert_eq!(parsed.espeak_root, PathBuf::from("/usr/share"));
        assert_eq!(parsed.streaming_threshold, 40);
    }

    #[test]
    fn model_is_required() {
        let err = parse_worker_args(args(&["read-aloud", "--tts-worker", "--espeak", "/e"]))
            .expect_err("missing model");
        assert!(err.to_string().contains("--model"));
    }
}
