// A worker is a task pinned to one mirror. It serves dispatch jobs until the
// first sign the mirror cannot be trusted, then dies and frees its slot.

use std::sync::Arc;
use std::time::Instant;

use http::header::CONTENT_LENGTH;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::client::UpstreamClient;
use crate::stats::body::CountingBody;
use crate::stats::{Sample, ThroughputRegistry};

use super::{Job, JobSender, SharedJobs};

/// Why a worker stopped serving.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("mirror ranked too slow: {mib_per_sec:.2} MiB/s")]
    SlowMirror { mib_per_sec: f64 },

    #[error("{mirror} returned status {status} for {path}")]
    Status {
        mirror: String,
        path: String,
        status: StatusCode,
    },

    #[error("{method} {path} via {mirror} failed: {source}")]
    Transport {
        mirror: String,
        path: String,
        method: Method,
        #[source]
        source: reqwest::Error,
    },

    #[error("dispatch channel closed")]
    ChannelClosed,
}

/// A request as the dispatch queue carries it. The mirror supplies the host,
/// so only the path (with query) travels, plus the verbatim headers.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

/// What a worker hands back: upstream status and headers, a counting body,
/// and the identity of the worker that served it.
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub body: CountingBody,
    pub worker: String,
}

pub struct Worker {
    name: String,
    client: UpstreamClient,
    registry: Arc<ThroughputRegistry>,
}

impl Worker {
    pub fn new(name: String, client: UpstreamClient, registry: Arc<ThroughputRegistry>) -> Self {
        Self {
            name,
            client,
            registry,
        }
    }

    /// The registry key: name plus mirror.
    pub fn id(&self) -> String {
        format!("{}:{}", self.name, self.client.base_url())
    }

    /// Serve jobs until a terminal error. Always returns the reason; the
    /// manager owning this slot logs it and removes the registry entry.
    pub async fn run(self, jobs: SharedJobs, requeue: JobSender) -> WorkerError {
        debug!("starting worker {}", self.id());

        loop {
            let job = {
                let mut rx = jobs.lock().await;
                rx.recv().await
            };
            let Some(job) = job else {
                return WorkerError::ChannelClosed;
            };

            match self.serve(&job.request).await {
                Ok(response) => {
                    // The caller may have timed out and dropped its receiver;
                    // the unsent response then drops here, closing the body.
                    let _ = job.reply.send(Ok(response));
                }
                Err(err) => return self.terminate(job, err, &requeue),
            }
        }
    }

    /// Wind down with an in-flight job. Status errors are the caller's
    /// problem and are replied; anything else means the mirror failed us and
    /// the job goes back into the queue for another worker. The hand-back is
    /// detached so a full queue never blocks this worker from exiting.
    fn terminate(&self, job: Job, err: WorkerError, requeue: &JobSender) -> WorkerError {
        match err {
            WorkerError::Status {
                ref mirror,
                ref path,
                status,
            } => {
                let reason = WorkerError::Status {
                    mirror: mirror.clone(),
                    path: path.clone(),
                    status,
                };
                let _ = job.reply.send(Err(err));
                reason
            }
            err => {
                let requeue = requeue.clone();
                tokio::spawn(async move {
                    if let Err(send_err) = requeue.send(job).await {
                        // Shutdown: nobody will ever serve this, tell the caller.
                        let _ = send_err.0.reply.send(Err(WorkerError::ChannelClosed));
                    }
                });
                err
            }
        }
    }

    async fn serve(&self, request: &ProxyRequest) -> Result<ProxyResponse, WorkerError> {
        let id = self.id();

        let (throughput, allowed) = self.registry.classify(&id);
        if !allowed {
            return Err(WorkerError::SlowMirror {
                mib_per_sec: throughput / 1024.0 / 1024.0,
            });
        }

        debug!("{} {} {}", self.name, request.method, self.client.url_for(&request.path));

        let start = Instant::now();
        let response = self
            .client
            .send(request.method.clone(), &request.path, &request.headers)
            .await
            .map_err(|source| WorkerError::Transport {
                mirror: self.client.base_url().to_string(),
                path: request.path.clone(),
                method: request.method.clone(),
                source,
            })?;

        let status = response.status();
        if status.as_u16() >= 400 && !path_without_query(&request.path).ends_with(".sig") {
            return Err(WorkerError::Status {
                mirror: self.client.base_url().to_string(),
                path: request.path.clone(),
                status,
            });
        }

        let headers = response.headers().clone();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        let registry = Arc::clone(&self.registry);
        let name = self.name.clone();
        let body = CountingBody::upstream(
            response.bytes_stream(),
            Box::new(move |read| {
                let sample = Sample {
                    bytes: read,
                    duration: start.elapsed(),
                };
                debug!("{name}: {sample}");
                registry.update(&id, sample);
            }),
        );

        Ok(ProxyResponse {
            status,
            headers,
            content_length,
            body,
            worker: self.id(),
        })
    }
}

/// Suffix checks must not be fooled by query strings.
fn path_without_query(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}
