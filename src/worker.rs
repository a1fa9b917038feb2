//! Job queue and worker pool
//!
//! Submissions enqueue a request id and return immediately. A fixed number of worker
//! tasks pull jobs and drive each request through the pipeline, one request per worker
//! at a time.

use crate::error::{Result, VendorError};
use crate::pipeline::PipelineOrchestrator;
use crate::tools::{CancelSignal, CancellationRegistry};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct Job {
    pub request_id: u64,
    pub cancel: CancelSignal,
}

/// Sending half of the queue, shared by everything that submits work
#[derive(Clone)]
pub struct JobQueue {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<Job>>>>,
    registry: CancellationRegistry,
}

impl JobQueue {
    /// A queue and the receiving end its consumer drains
    pub fn channel() -> (JobQueue, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = JobQueue {
            sender: Arc::new(Mutex::new(Some(tx))),
            registry: CancellationRegistry::new(),
        };
        (queue, rx)
    }

    /// Queues a request; its cancellation signal is live from this point on
    pub fn enqueue(&self, request_id: u64) -> Result<()> {
        let cancel = self.registry.register(request_id);
        let sender = self
            .sender
            .lock()
            .map_err(|_| VendorError::Internal("The job queue lock is poisoned".into()))?;
        let Some(sender) = sender.as_ref() else {
            self.registry.release(request_id);
            return Err(VendorError::Internal("The job queue is closed".into()));
        };
        sender.send(Job { request_id, cancel }).map_err(|_| {
            self.registry.release(request_id);
            VendorError::Internal("The job queue is closed".into())
        })?;
        debug!(request_id, "Request queued");
        Ok(())
    }

    /// Signals a queued or running request; false if it is neither
    pub fn cancel(&self, request_id: u64) -> bool {
        self.registry.cancel(request_id)
    }

    pub fn is_active(&self, request_id: u64) -> bool {
        self.registry.is_running(request_id)
    }

    /// Forgets the request's cancellation signal once its job is done
    pub fn release(&self, request_id: u64) {
        self.registry.release(request_id);
    }

    /// Stops accepting jobs; already queued jobs still run
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

pub struct WorkerPool {
    queue: JobQueue,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks on the current runtime
    pub fn start(orchestrator: Arc<PipelineOrchestrator>, workers: usize) -> (JobQueue, WorkerPool) {
        let (queue, rx) = JobQueue::channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let orchestrator = orchestrator.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        let request_id = job.request_id;
                        debug!(worker, request_id, "Worker picked up request");
                        match orchestrator.process(request_id, job.cancel).await {
                            Ok(request) => {
                                debug!(worker, request_id, state = %request.state(), "Worker finished request")
                            }
                            Err(e) => error!(worker, request_id, error = %e, "Worker could not process request"),
                        }
                        queue.release(request_id);
                    }
                    debug!(worker, "Worker stopped");
                })
            })
            .collect();

        info!(workers = workers.max(1), "Worker pool started");
        (queue.clone(), WorkerPool { queue, handles })
    }

    /// Closes the queue and waits for every queued job to finish
    pub async fn shutdown(self) {
        self.queue.close();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::config::VendorboxConfig;
    use crate::models::{Ecosystem, NewRequest};
    use crate::pipeline::PipelineContext;
    use crate::resolvers::ResolverToolkit;
    use crate::scm::SourceFetcher;
    use crate::state::RequestState;
    use crate::store::{InMemoryRequestStore, RequestStore};
    use crate::tools::{MockFetcher, MockRunner};
    use std::time::Duration;
    use tempfile::TempDir;

    fn orchestrator(
        dir: &TempDir,
        runner: MockRunner,
    ) -> (Arc<InMemoryRequestStore>, Arc<MockRunner>, Arc<PipelineOrchestrator>) {
        let config = Arc::new(VendorboxConfig::rooted_at(dir.path()));
        let store = Arc::new(InMemoryRequestStore::new());
        let runner = Arc::new(runner);
        let context = PipelineContext::new(
            store.clone(),
            SourceFetcher::new(SourceCache::new(&config.sources_dir), runner.clone(), &config),
            ResolverToolkit {
                runner: runner.clone(),
                fetcher: Arc::new(MockFetcher::new()),
                config: config.clone(),
            },
            config,
        );
        (store, runner, Arc::new(PipelineOrchestrator::new(context)))
    }

    fn pip_request(repo: &str) -> NewRequest {
        NewRequest {
            repo: repo.into(),
            git_ref: "f".repeat(40),
            pkg_managers: [Ecosystem::Pip].into_iter().collect(),
            flags: Default::default(),
            dependency_replacements: vec![],
            submitted_by: None,
            user: None,
        }
    }

    const TREE: &[(&str, &str)] = &[
        ("pyproject.toml", "[project]\nname = \"tool\"\nversion = \"1.0\"\n"),
        ("requirements.txt", ""),
    ];

    #[tokio::test]
    async fn test_pool_drains_queue_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let (store, _, orchestrator) = orchestrator(&dir, MockRunner::serving_git_tree(TREE));
        let (queue, pool) = WorkerPool::start(orchestrator, 2);

        let mut ids = Vec::new();
        for n in 0..3 {
            let request = store
                .insert(pip_request(&format!("https://github.com/org/tool{}", n)))
                .await
                .unwrap();
            queue.enqueue(request.id).unwrap();
            ids.push(request.id);
        }
        pool.shutdown().await;

        for id in ids {
            let request = store.get(id).await.unwrap().unwrap();
            assert_eq!(request.state(), RequestState::Complete, "{}", request.state_reason());
            assert!(!queue.is_active(id));
        }
        assert!(queue.enqueue(99).is_err());
    }

    #[tokio::test]
    async fn test_cancel_running_request() {
        let dir = TempDir::new().unwrap();
        let runner = MockRunner::serving_git_tree(TREE).with_delay(Duration::from_millis(200));
        let (store, _, orchestrator) = orchestrator(&dir, runner);
        let (queue, pool) = WorkerPool::start(orchestrator, 1);

        let request = store
            .insert(pip_request("https://github.com/org/slow"))
            .await
            .unwrap();
        queue.enqueue(request.id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.cancel(request.id));
        pool.shutdown().await;

        let request = store.get(request.id).await.unwrap().unwrap();
        assert_eq!(request.state(), RequestState::Failed);
        assert_eq!(request.state_reason(), "Cancelled by an administrator");
        assert!(!queue.cancel(request.id));
    }

    #[tokio::test]
    async fn test_same_source_fetched_once() {
        let dir = TempDir::new().unwrap();
        let runner = MockRunner::serving_git_tree(TREE).with_delay(Duration::from_millis(20));
        let (store, runner, orchestrator) = orchestrator(&dir, runner);
        let (queue, pool) = WorkerPool::start(orchestrator, 4);

        for _ in 0..4 {
            let request = store
                .insert(pip_request("https://github.com/org/shared"))
                .await
                .unwrap();
            queue.enqueue(request.id).unwrap();
        }
        pool.shutdown().await;

        assert_eq!(runner.count("git", "checkout"), 1);
        let (all, _) = store
            .list(Default::default(), 0, 10)
            .await
            .unwrap();
        assert!(all.iter().all(|r| r.state() == RequestState::Complete));
    }
}
