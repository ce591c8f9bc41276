// HTTP entry point. Splits a GET into a HEAD plus ranged chunk GETs, streams
// the chunks back in order, and hides mirror failures behind retries.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::config::RefractConfig;
use crate::pool::{Pool, ProxyRequest, ProxyResponse};
use crate::stats::body::CountingBody;

use super::buffer::BufferPool;

/// Headers that must not travel between the two sides of the proxy.
const HOP_HEADERS: [HeaderName; 2] = [header::CONNECTION, header::TRANSFER_ENCODING];

pub struct Refractor {
    chunk_size: u64,
    chunk_timeout: Duration,
    retries: u32,
    pool: Arc<Pool>,
    buffers: Arc<BufferPool>,
}

/// All paths fall through to the refractor; nothing else is routed.
pub fn router(refractor: Arc<Refractor>) -> Router {
    Router::new().fallback(handle).with_state(refractor)
}

async fn handle(State(refractor): State<Arc<Refractor>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let want_body = request.method() != Method::HEAD;

    let mut headers = request.headers().clone();
    headers.remove(header::HOST);
    for name in HOP_HEADERS {
        headers.remove(name);
    }

    // Mirrors answer 404 for .db.sig; don't even ask.
    if path.ends_with(".db.sig") {
        return StatusCode::NOT_FOUND.into_response();
    }

    // Database files drift between mirrors too quickly to stitch ranges from
    // several of them, so they go to a single mirror in one piece.
    if path.ends_with(".db") {
        return refractor.handle_plain(path_and_query, headers, want_body).await;
    }

    refractor.handle_refracted(path_and_query, headers, want_body).await
}

impl Refractor {
    pub fn new(config: &RefractConfig, pool: Arc<Pool>) -> Self {
        let config = config.clone().with_defaults();
        Self {
            chunk_size: config.chunk_size_bytes(),
            chunk_timeout: config.chunk_timeout(),
            retries: config.retries,
            pool,
            buffers: Arc::new(BufferPool::new()),
        }
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// One upstream, no splitting. Retry until a mirror produces usable
    /// headers, then stream the body straight through.
    async fn handle_plain(&self, path: String, headers: HeaderMap, want_body: bool) -> Response {
        let request = ProxyRequest {
            method: Method::GET,
            path,
            headers,
        };

        let response = match self.retry_streaming(&request).await {
            Ok(response) => response,
            Err(err) => {
                error!("GET {} failed: {err:#}", request.path);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let headers = forwarded_headers(&response.headers);
        if !want_body {
            return (response.status, headers).into_response();
        }
        (response.status, headers, Body::from_stream(response.body)).into_response()
    }

    /// The refracted path: HEAD for size and headers, then one task per
    /// ranged chunk, stitched back to the client in index order.
    async fn handle_refracted(
        self: Arc<Self>,
        path: String,
        client_headers: HeaderMap,
        want_body: bool,
    ) -> Response {
        let mut head_headers = client_headers.clone();
        head_headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        head_headers.remove(header::RANGE);

        let head_request = ProxyRequest {
            method: Method::HEAD,
            path: path.clone(),
            headers: head_headers,
        };

        let head = match self.retry_request(&head_request).await {
            Ok(head) => head,
            Err(err) => {
                error!("HEAD {path} failed: {err:#}");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let size = head.content_length.unwrap_or(0);
        let response_headers = forwarded_headers(&head.headers);

        if !want_body || size == 0 {
            return (head.status, response_headers).into_response();
        }

        // One task per chunk, each delivering into its own slot. Workers give
        // the actual upstream parallelism; completed chunks wait their turn.
        let mut replies = Vec::new();
        for (start, end) in split_ranges(size, self.chunk_size) {
            let (tx, rx) = oneshot::channel();
            replies.push(rx);

            let refractor = Arc::clone(&self);
            let mut headers = client_headers.clone();
            headers.insert(
                header::RANGE,
                HeaderValue::from_str(&format!("bytes={start}-{end}"))
                    .unwrap_or_else(|_| HeaderValue::from_static("")),
            );
            headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
            let request = ProxyRequest {
                method: Method::GET,
                path: path.clone(),
                headers,
            };

            tokio::spawn(async move {
                let mut tx = tx;
                tokio::select! {
                    // The consumer gave up on this chunk; stop retrying.
                    _ = tx.closed() => {}
                    result = refractor.retry_request(&request) => {
                        let _ = tx.send(result);
                    }
                }
            });
        }

        // The first chunk decides whether the client sees a status at all:
        // until its outcome is known, no bytes have been committed and a
        // terminal failure can still surface as 502.
        let mut replies = replies.into_iter();
        let Some(first_reply) = replies.next() else {
            return (head.status, response_headers).into_response();
        };
        let first = match first_reply.await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                error!("first chunk of {path} failed: {err:#}");
                return StatusCode::BAD_GATEWAY.into_response();
            }
            Err(_) => {
                error!("first chunk of {path} was abandoned");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        // Stitch bodies in order on a separate task so the client write of
        // one chunk overlaps with waiting for the next. Capacity 1 keeps the
        // read-ahead at a single chunk.
        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);
        tokio::spawn(async move {
            let mut current = first;
            loop {
                let worker = current.worker;
                let mut body = current.body;
                while let Some(piece) = body.next().await {
                    let piece = match piece {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            warn!("reading chunk served by {worker}: {err}");
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                    };
                    if tx.send(Ok(piece)).await.is_err() {
                        // Client went away. Dropping the remaining replies
                        // cancels their retries and releases their buffers.
                        return;
                    }
                }

                let Some(reply) = replies.next() else {
                    return;
                };
                current = match reply.await {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => {
                        error!("chunk of {path} failed, truncating response: {err:#}");
                        let _ = tx.send(Err(io::Error::other(err))).await;
                        return;
                    }
                    Err(_) => {
                        let _ = tx
                            .send(Err(io::Error::other("chunk task went away")))
                            .await;
                        return;
                    }
                };
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|piece| (piece, rx))
        });

        (head.status, response_headers, Body::from_stream(stream)).into_response()
    }

    /// Fetch with retries, buffering the whole body in memory before the
    /// response counts as successful. Buffering is what makes retries safe:
    /// no upstream byte reaches the client until its chunk is complete.
    async fn retry_request(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
        let range = request
            .headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut last_err = anyhow!("no attempts made");
        for attempt in 1..=self.retries {
            match timeout(self.chunk_timeout, self.attempt_buffered(request)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => {
                    warn!(
                        "[{attempt}/{}] {} {}[{range}]: {err:#}",
                        self.retries, request.method, request.path
                    );
                    last_err = err;
                }
                Err(_) => {
                    warn!(
                        "[{attempt}/{}] {} {}[{range}]: timed out",
                        self.retries, request.method, request.path
                    );
                    last_err = anyhow!("attempt timed out after {:?}", self.chunk_timeout);
                }
            }
        }

        Err(last_err.context(format!(
            "giving up on {}[{range}] after {} attempts",
            request.path, self.retries
        )))
    }

    async fn attempt_buffered(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
        let response = self.pool.do_request(request.clone()).await?;
        let content_length = check_response(request, &response)?;

        if request.method == Method::HEAD {
            return Ok(response);
        }

        let ProxyResponse {
            status,
            headers,
            mut body,
            worker,
            ..
        } = response;

        let mut buf = self.buffers.get();
        while let Some(piece) = body.next().await {
            let bytes = piece.context("reading chunk body")?;
            buf.extend_from_slice(&bytes);
        }

        if buf.len() as u64 != content_length {
            bail!("expected {} body bytes, read {}", content_length, buf.len());
        }

        debug!("buffered {} bytes from {worker}", buf.len());
        Ok(ProxyResponse {
            status,
            headers,
            content_length: Some(content_length),
            body: CountingBody::buffered(buf.freeze()),
            worker,
        })
    }

    /// Retry only the header phase, then hand the live body through. Used
    /// for plain requests, where the response is streamed, not buffered.
    async fn retry_streaming(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
        let mut last_err = anyhow!("no attempts made");
        for attempt in 1..=self.retries {
            match timeout(self.chunk_timeout, self.attempt_streaming(request)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => {
                    warn!("[{attempt}/{}] GET {}: {err:#}", self.retries, request.path);
                    last_err = err;
                }
                Err(_) => {
                    warn!("[{attempt}/{}] GET {}: timed out", self.retries, request.path);
                    last_err = anyhow!("attempt timed out after {:?}", self.chunk_timeout);
                }
            }
        }

        Err(last_err.context(format!(
            "giving up on {} after {} attempts",
            request.path, self.retries
        )))
    }

    async fn attempt_streaming(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
        let response = self.pool.do_request(request.clone()).await?;
        check_response(request, &response)?;
        Ok(response)
    }
}

/// Shared acceptance rules for an attempt: the status must match what the
/// request shape expects, and the length must be known so a short read is
/// distinguishable from success.
fn check_response(request: &ProxyRequest, response: &ProxyResponse) -> Result<u64> {
    let expected = if request.headers.contains_key(header::RANGE) {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    if response.status != expected {
        bail!("got status {}, expected {expected}", response.status);
    }

    let Some(content_length) = response.content_length else {
        bail!("response has no usable content length");
    };

    Ok(content_length)
}

/// Copy upstream headers for the client, all values of each name in order,
/// minus the hop-by-hop ones.
fn forwarded_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if HOP_HEADERS.contains(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Inclusive byte ranges of `chunk_size` covering `[0, size)`, the last one
/// clamped to the final byte.
fn split_ranges(size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < size {
        let end = (start + chunk_size - 1).min(size - 1);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_covers_exact_multiples() {
        let ranges = split_ranges(8 << 20, 4 << 20);
        assert_eq!(ranges, vec![(0, (4 << 20) - 1), (4 << 20, (8 << 20) - 1)]);
    }

    #[test]
    fn split_clamps_the_last_range() {
        let ranges = split_ranges(10, 4);
        assert_eq!(ranges, vec![(0, 3), (4, 7), (8, 9)]);
    }

    #[test]
    fn split_handles_single_small_file() {
        let ranges = split_ranges(3, 4 << 20);
        assert_eq!(ranges, vec![(0, 2)]);
    }

    #[test]
    fn split_ranges_are_contiguous_and_complete() {
        let size = 50 << 20;
        let chunk = 4 << 20;
        let ranges = split_ranges(size, chunk);
        assert_eq!(ranges.len(), 13);
        assert_eq!(ranges.first().unwrap().0, 0);
        assert_eq!(ranges.last().unwrap().1, size - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
    }

    #[test]
    fn forwarded_headers_keep_every_value_in_order() {
        let mut upstream = HeaderMap::new();
        upstream.append("x-cache", HeaderValue::from_static("miss"));
        upstream.append("x-cache", HeaderValue::from_static("hit"));
        upstream.insert(header::CONNECTION, HeaderValue::from_static("close"));

        let forwarded = forwarded_headers(&upstream);
        let values: Vec<&str> = forwarded
            .get_all("x-cache")
            .iter()
            .map(|value| value.to_str().unwrap())
            .collect();
        assert_eq!(values, ["miss", "hit"]);
        assert!(!forwarded.contains_key(header::CONNECTION));
    }
}
