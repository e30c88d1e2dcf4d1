use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use warden_common::{Error, Result};

use crate::backend::IsolationBackend;
use crate::worker::{
    PluginWorker, PluginWorkerStats, WorkerConfig, WorkerFailure, WorkerSettings,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A worker failed and is being run through the restart policy.
    WorkerError { plugin_name: String, error: String },
}

/// Worker names split by health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
}

struct PoolInner {
    backend: Arc<dyn IsolationBackend>,
    settings: WorkerSettings,
    workers: RwLock<HashMap<String, Arc<PluginWorker>>>,
    events: broadcast::Sender<PoolEvent>,
}

/// The set of live workers, at most one per plugin name.
///
/// Cheap to clone; clones share the same table. Each host builds its own.
#[derive(Clone)]
pub struct PluginWorkerPool {
    inner: Arc<PoolInner>,
}

impl PluginWorkerPool {
    pub fn new(backend: Arc<dyn IsolationBackend>, settings: WorkerSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(PoolInner {
                backend,
                settings,
                workers: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Create and start a worker. The plugin name must not be in use; a
    /// worker that fails to start is not kept.
    pub async fn spawn(&self, config: WorkerConfig) -> Result<Arc<PluginWorker>> {
        let name = config.plugin_name.clone();
        let (sink, failures) = mpsc::unbounded_channel();
        let worker = Arc::new(PluginWorker::new(
            config,
            Arc::clone(&self.inner.backend),
            self.inner.settings.clone(),
        ));
        worker.set_failure_sink(sink);

        {
            let mut workers = self.write();
            if workers.contains_key(&name) {
                return Err(Error::DuplicateWorker(name));
            }
            workers.insert(name.clone(), Arc::clone(&worker));
        }

        if let Err(e) = worker.start().await {
            let mut workers = self.write();
            if workers
                .get(&name)
                .is_some_and(|current| Arc::ptr_eq(current, &worker))
            {
                workers.remove(&name);
            }
            return Err(e);
        }

        tokio::spawn(supervise(Arc::downgrade(&self.inner), failures));
        info!(plugin = %name, "worker spawned");
        Ok(worker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginWorker>> {
        self.read().get(name).cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<PluginWorker>> {
        let mut workers: Vec<_> = self.read().values().cloned().collect();
        workers.sort_by(|a, b| a.name().cmp(b.name()));
        workers
    }

    pub fn stats(&self) -> HashMap<String, PluginWorkerStats> {
        self.read()
            .iter()
            .map(|(name, worker)| (name.clone(), worker.stats()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Stop and forget one worker. No-op for unknown names.
    pub async fn stop(&self, name: &str) {
        let worker = self.write().remove(name);
        if let Some(worker) = worker {
            worker.retire().await;
            info!(plugin = %name, "worker removed");
        }
    }

    /// Stop every worker concurrently and empty the pool.
    pub async fn stop_all(&self) {
        let workers: Vec<_> = self.write().drain().map(|(_, worker)| worker).collect();
        if workers.is_empty() {
            return;
        }
        info!("stopping {} workers", workers.len());
        futures::future::join_all(workers.iter().map(|worker| worker.retire())).await;
    }

    /// Report a worker failure and run the worker through its restart
    /// policy, retrying failed starts until it is up or out of attempts.
    pub async fn handle_worker_error(&self, name: &str, error: &str) {
        handle_worker_error(&self.inner, name, error).await;
    }

    pub fn health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();
        for worker in self.get_all() {
            if worker.is_healthy() {
                report.healthy.push(worker.name().to_string());
            } else {
                report.unhealthy.push(worker.name().to_string());
            }
        }
        report
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<PluginWorker>>> {
        match self.inner.workers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<PluginWorker>>> {
        write_workers(&self.inner)
    }
}

fn write_workers(
    inner: &PoolInner,
) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<PluginWorker>>> {
    match inner.workers.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn current_worker(inner: &PoolInner, name: &str) -> Option<Arc<PluginWorker>> {
    match inner.workers.read() {
        Ok(workers) => workers.get(name).cloned(),
        Err(poisoned) => poisoned.into_inner().get(name).cloned(),
    }
}

async fn handle_worker_error(inner: &PoolInner, name: &str, error: &str) {
    error!(plugin = %name, "worker error: {error}");
    let _ = inner.events.send(PoolEvent::WorkerError {
        plugin_name: name.to_string(),
        error: error.to_string(),
    });

    let Some(worker) = current_worker(inner, name) else {
        return;
    };
    loop {
        match worker.restart().await {
            Ok(()) => return,
            Err(Error::MaxRestarts { .. }) => return,
            Err(e) => {
                warn!(plugin = %name, "restart failed: {e}");
                let still_pooled = current_worker(inner, name)
                    .is_some_and(|current| Arc::ptr_eq(&current, &worker));
                if !still_pooled {
                    return;
                }
            }
        }
    }
}

/// Feeds one worker's failures into the pool's recovery policy. Ends when the
/// worker is dropped or the pool is gone.
async fn supervise(pool: Weak<PoolInner>, mut failures: mpsc::UnboundedReceiver<WorkerFailure>) {
    while let Some(failure) = failures.recv().await {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        handle_worker_error(&inner, &failure.plugin_name, &failure.error).await;
    }
}
