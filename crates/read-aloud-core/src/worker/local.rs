use super::runtime::{CallSender, ModelLoader, WorkerRuntime, call};
use super::{WorkerEventSender, WorkerHost, WorkerId};
use crate::messages::{WorkerRequest, WorkerResponse};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Runs each worker as a task on the caller's tokio runtime.
pub struct InProcessWorkerHost {
    loader: Arc<dyn ModelLoader>,
    streaming_threshold: usize,
    workers: Mutex<HashMap<WorkerId, CallSender>>,
    next_id: AtomicU64,
}

impl InProcessWorkerHost {
    pub fn new(loader: Arc<dyn ModelLoader>, streaming_threshold: usize) -> Self {
        Self {
            loader,
            streaming_threshold,
            workers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn sender(&self, id: WorkerId) -> Option<CallSender> {
        self.workers.lock().ok()?.get(&id).cloned()
    }
}

#[async_trait]
impl WorkerHost for InProcessWorkerHost {
    async fn create(&self, events: WorkerEventSender) -> Result<WorkerId> {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let runtime = WorkerRuntime::new(Arc::clone(&self.loader), events, self.streaming_threshold);
        let (sender, _handle) = runtime.spawn();
        self.workers
            .lock()
            .map_err(|_| anyhow!("worker table lock poisoned"))?
            .insert(id, sender);
        info!(worker = %id, "Spawned in-process worker");
        Ok(id)
    }

    async fn exists(&self, id: WorkerId) -> bool {
        self.sender(id).is_some_and(|sender| !sender.is_closed())
    }

    async fn request(&self, id: WorkerId, request: WorkerRequest) -> Result<WorkerResponse> {
        let sender = self
            .sender(id)
            .ok_or_else(|| anyhow!("{id} does not exist"))?;
        call(&sender, request).await
    }

    async fn destroy(&self, id: WorkerId) {
        let removed = self.workers.lock().ok().and_then(|mut workers| workers.remove(&id));
        if let Some(sender) = removed {
            let _ = call(&sender, WorkerRequest::Shutdown).await;
            debug!(worker = %id, "Destroyed in-process worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ModelState;
    use crate::worker::runtime::tests::StaticLoader;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn destroyed_workers_no_longer_exist() {
        let loader = Arc::new(StaticLoader {
            fail: false,
            delay: Duration::ZERO,
        });
        let host = InProcessWorkerHost::new(loader, 100);
        let (events, _rx) = mpsc::unbounded_channel();

        let id = host.create(events).await.expect("create");
        assert!(host.exists(id).await);
        assert!(matches!(
            host.request(id, WorkerRequest::Status).await,
            Ok(WorkerResponse::Status { state: ModelState::Loading | ModelState::Ready, .. })
        ));

        host.destroy(id).await;
        assert!(!host.exists(id).await);
        assert!(host.request(id, WorkerRequest::Status).await.is_err());
    }
}
