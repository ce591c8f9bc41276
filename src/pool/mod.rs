// Dispatch pool: a fixed number of worker slots, fed with fresh mirrors by a
// provider, consumed by anyone holding a handle via `do_request`.

pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::UpstreamClient;
use crate::config::UpstreamConfig;
use crate::names;
use crate::provider::traits::MirrorProvider;
use crate::stats::ThroughputRegistry;

pub use worker::{ProxyRequest, ProxyResponse, Worker, WorkerError};

/// Wait before asking the provider again after it failed.
const FEED_BACKOFF: Duration = Duration::from_secs(10);

/// One queued request together with its reply slot.
pub struct Job {
    pub request: ProxyRequest,
    pub reply: oneshot::Sender<Result<ProxyResponse, WorkerError>>,
}

pub type JobSender = mpsc::Sender<Job>;

/// The dispatch queue end shared by all workers. Whichever idle worker takes
/// the lock first receives the next job.
pub type SharedJobs = Arc<Mutex<mpsc::Receiver<Job>>>;

pub struct Pool {
    workers: usize,
    upstream: UpstreamConfig,
    registry: Arc<ThroughputRegistry>,
    provider: Arc<dyn MirrorProvider>,
    job_tx: JobSender,
    jobs: SharedJobs,
}

impl Pool {
    pub fn new(
        workers: usize,
        upstream: UpstreamConfig,
        provider: Arc<dyn MirrorProvider>,
        registry: Arc<ThroughputRegistry>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(1);
        Self {
            workers,
            upstream,
            registry,
            provider,
            job_tx,
            jobs: Arc::new(Mutex::new(job_rx)),
        }
    }

    pub fn registry(&self) -> &Arc<ThroughputRegistry> {
        &self.registry
    }

    /// Queue one request and await whichever worker picks it up. Safe to call
    /// from any number of tasks at once.
    pub async fn do_request(&self, request: ProxyRequest) -> Result<ProxyResponse, WorkerError> {
        let (reply, response) = oneshot::channel();
        if self.job_tx.send(Job { request, reply }).await.is_err() {
            return Err(WorkerError::ChannelClosed);
        }
        match response.await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::ChannelClosed),
        }
    }

    /// Run the worker managers and the mirror feeder until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) {
        let (client_tx, client_rx) = mpsc::channel::<UpstreamClient>(1);
        let client_rx = Arc::new(Mutex::new(client_rx));

        let mut tasks = JoinSet::new();

        for _ in 0..self.workers {
            tasks.spawn(manage_worker(
                Arc::clone(&self.jobs),
                self.job_tx.clone(),
                Arc::clone(&client_rx),
                Arc::clone(&self.registry),
                cancel.clone(),
            ));
        }

        tasks.spawn(feed(
            Arc::clone(&self.provider),
            self.upstream.clone(),
            client_tx,
            cancel.clone(),
        ));

        cancel.cancelled().await;
        tasks.shutdown().await;
    }
}

/// Owns one worker slot. Receives a fresh upstream client, runs a worker on
/// it until the worker gives up, cleans up its registry entry, repeats. This
/// is the only place a slot is refilled, which bounds live workers to the
/// configured count.
async fn manage_worker(
    jobs: SharedJobs,
    requeue: JobSender,
    clients: Arc<Mutex<mpsc::Receiver<UpstreamClient>>>,
    registry: Arc<ThroughputRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let client = tokio::select! {
            _ = cancel.cancelled() => return,
            client = async { clients.lock().await.recv().await } => {
                match client {
                    Some(client) => client,
                    None => return,
                }
            }
        };

        let worker = Worker::new(names::haiku(), client, Arc::clone(&registry));
        let id = worker.id();

        tokio::select! {
            _ = cancel.cancelled() => {
                registry.remove(&id);
                return;
            }
            err = worker.run(Arc::clone(&jobs), requeue.clone()) => {
                warn!("worker {id} terminated: {err}");
                registry.remove(&id);
            }
        }
    }
}

/// Keeps the client channel stocked: one upstream client per provider answer.
/// Provider failures back off and retry; only cancellation stops the loop.
async fn feed(
    provider: Arc<dyn MirrorProvider>,
    upstream: UpstreamConfig,
    client_tx: mpsc::Sender<UpstreamClient>,
    cancel: CancellationToken,
) {
    loop {
        let mirror = tokio::select! {
            _ = cancel.cancelled() => return,
            result = provider.next_mirror() => match result {
                Ok(mirror) => mirror,
                Err(err) => {
                    warn!("provider failed to produce a mirror: {err:#}");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(FEED_BACKOFF) => continue,
                    }
                }
            },
        };

        let client = match UpstreamClient::new(&upstream, mirror) {
            Ok(client) => client,
            Err(err) => {
                warn!("skipping mirror: {err:#}");
                continue;
            }
        };

        debug!("feeding client for {}", client.base_url());
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = client_tx.send(client) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
