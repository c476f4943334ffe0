//! Workers as child processes of this binary.
//!
//! Each worker is `current_exe --tts-worker ...` speaking JSON lines: requests
//! carry an id that the matching response echoes, and events arrive
//! interleaved with responses on the same stdout.

use crate::tts_worker::WORKER_FLAG;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use read_aloud_core::messages::{WorkerEnvelope, WorkerOutput, WorkerRequest, WorkerResponse};
use read_aloud_core::worker::{WorkerEventSender, WorkerHost, WorkerId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_GRACE: Duration = Duration::from_secs(2);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<WorkerResponse>>>>;

struct ChildWorker {
    lines: mpsc::UnboundedSender<String>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
}

impl ChildWorker {
    fn running(&self) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        let Ok(mut child) = self.child.lock() else {
            return false;
        };
        match child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!(%status, "Worker process exited");
                false
            }
            Some(Err(err)) => {
                warn!("Failed to poll worker process: {err}");
                false
            }
            None => false,
        }
    }
}

pub struct ProcessWorkerHost {
    model_path: PathBuf,
    espeak_path: PathBuf,
    streaming_threshold: usize,
    workers: Mutex<HashMap<WorkerId, Arc<ChildWorker>>>,
    next_id: AtomicU64,
    next_request: AtomicU64,
}

impl ProcessWorkerHost {
    pub fn new(model_path: PathBuf, espeak_path: PathBuf, streaming_threshold: usize) -> Self {
        Self {
            model_path,
            espeak_path,
            streaming_threshold,
            workers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
        }
    }

    fn worker(&self, id: WorkerId) -> Option<Arc<ChildWorker>> {
        self.workers.lock().ok()?.get(&id).cloned()
    }

    fn command(&self) -> Result<Command> {
        let exe = std::env::current_exe().context("Locating current executable")?;
        let mut cmd = Command::new(exe);
        cmd.arg(WORKER_FLAG)
            .arg("--model")
            .arg(&self.model_path)
            .arg("--espeak")
            .arg(&self.espeak_path)
            .arg("--threshold")
            .arg(self.streaming_threshold.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

fn spawn_reader(
    id: WorkerId,
    stdout: ChildStdout,
    events: WorkerEventSender,
    pending: Pending,
    alive: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!(worker = %id, "Failed to read worker output: {err}");
                    break;
                }
            };
            match serde_json::from_str::<WorkerOutput>(&line) {
                Ok(WorkerOutput::Response { id: call, response }) => {
                    let waiter = pending.lock().ok().and_then(|mut p| p.remove(&call));
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(response);
                        }
                        None => debug!(worker = %id, call, "Response for an abandoned request"),
                    }
                }
                Ok(WorkerOutput::Event { event }) => {
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(err) => warn!(worker = %id, "Unparseable worker output: {err}"),
            }
        }
        alive.store(false, Ordering::Release);
        // Waiters see their sender dropped.
        if let Ok(mut pending) = pending.lock() {
            pending.clear();
        }
        debug!(worker = %id, "Worker output closed");
    });
}

#[async_trait]
impl WorkerHost for ProcessWorkerHost {
    async fn create(&self, events: WorkerEventSender) -> Result<WorkerId> {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut child = self.command()?.spawn().context("Spawning worker process")?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout unavailable"))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("worker stdin unavailable"))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        spawn_reader(id, stdout, events, Arc::clone(&pending), Arc::clone(&alive));

        let (lines, mut outgoing) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = outgoing.recv().await {
                if let Err(err) = stdin.write_all(line.as_bytes()).await {
                    warn!(worker = %id, "Worker stdin closed: {err}");
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        info!(worker = %id, pid = child.id(), "Spawned worker process");
        let worker = ChildWorker {
            lines,
            pending,
            alive,
            child: Mutex::new(Some(child)),
        };
        self.workers
            .lock()
            .map_err(|_| anyhow!("worker table lock poisoned"))?
            .insert(id, Arc::new(worker));
        Ok(id)
    }

    async fn exists(&self, id: WorkerId) -> bool {
        self.worker(id).is_some_and(|worker| worker.running())
    }

    async fn request(&self, id: WorkerId, request: WorkerRequest) -> Result<WorkerResponse> {
        let worker = self
            .worker(id)
            .ok_or_else(|| anyhow!("{id} does not exist"))?;
        let call = self.next_request.fetch_add(1, Ordering::Relaxed);
        let action = request.action();
        let mut line = serde_json::to_string(&WorkerEnvelope { id: call, request })
            .context("Encoding worker request")?;
        line.push('\n');

        let (reply, response) = oneshot::channel();
        worker
            .pending
            .lock()
            .map_err(|_| anyhow!("pending table lock poisoned"))?
            .insert(call, reply);
        if worker.lines.send(line).is_err() {
            if let Ok(mut pending) = worker.pending.lock() {
                pending.remove(&call);
            }
            anyhow::bail!("{id} is not accepting requests");
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(anyhow!("{id} exited before answering {action}")),
            Err(_) => {
                if let Ok(mut pending) = worker.pending.lock() {
                    pending.remove(&call);
                }
                Err(anyhow!("{id} did not answer {action} within {REQUEST_TIMEOUT:?}"))
            }
        }
    }

    async fn destroy(&self, id: WorkerId) {
        let removed = self.workers.lock().ok().and_then(|mut w| w.remove(&id));
        let Some(worker) = removed else {
            return;
        };
        if worker.alive.load(Ordering::Acquire) {
            let line = serde_json::to_string(&WorkerEnvelope {
                id: self.next_request.fetch_add(1, Ordering::Relaxed),
                request: WorkerRequest::Shutdown,
            });
            if let Ok(mut line) = line {
                line.push('\n');
                let _ = worker.lines.send(line);
            }
        }
        let child = worker.child.lock().ok().and_then(|mut child| child.take());
        if let Some(mut child) = child {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(worker = %id, %status, "Worker process exited"),
                _ => {
                    warn!(worker = %id, "Worker did not exit; killing it");
                    let _ = child.kill().await;
                }
            }
        }
        info!(worker = %id, "Destroyed worker process");
    }
}
