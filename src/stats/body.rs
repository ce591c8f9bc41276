// Body stream that counts bytes and fires a completion hook exactly once.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

/// Called with the total number of bytes read once the body reaches EOF,
/// fails, or is dropped. Fired at most once.
pub type DoneHook = Box<dyn FnOnce(u64) + Send + 'static>;

enum Inner {
    Upstream(Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static>>),
    Buffered(Option<Bytes>),
}

/// Wraps a response body. Every yielded byte is counted; when the stream
/// finishes for any reason (EOF, error, drop) the hook observes the total.
pub struct CountingBody {
    inner: Inner,
    read: u64,
    on_done: Option<DoneHook>,
}

impl CountingBody {
    /// Wrap a live upstream body.
    pub fn upstream(
        stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        on_done: DoneHook,
    ) -> Self {
        Self {
            inner: Inner::Upstream(Box::pin(stream)),
            read: 0,
            on_done: Some(on_done),
        }
    }

    /// Wrap an already fully buffered body. Completion here is the drop of
    /// the final `Bytes` handle, so no hook is taken.
    pub fn buffered(bytes: Bytes) -> Self {
        Self {
            inner: Inner::Buffered(Some(bytes)),
            read: 0,
            on_done: None,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    fn finish(&mut self) {
        if let Some(hook) = self.on_done.take() {
            hook(self.read);
        }
    }
}

impl Stream for CountingBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::Upstream(stream) => match stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.read += bytes.len() as u64;
                    Poll::Ready(Some(Ok(bytes)))
                }
                Poll::Ready(Some(Err(err))) => {
                    this.finish();
                    Poll::Ready(Some(Err(io::Error::other(err))))
                }
                Poll::Ready(None) => {
                    this.finish();
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
            Inner::Buffered(slot) => match slot.take() {
                Some(bytes) => {
                    this.read += bytes.len() as u64;
                    Poll::Ready(Some(Ok(bytes)))
                }
                None => {
                    this.finish();
                    Poll::Ready(None)
                }
            },
        }
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn hook(calls: &Arc<AtomicUsize>, total: &Arc<AtomicU64>) -> DoneHook {
        let calls = Arc::clone(calls);
        let total = Arc::clone(total);
        Box::new(move |read| {
            calls.fetch_add(1, Ordering::SeqCst);
            total.store(read, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn hook_fires_once_on_eof() {
        let calls = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicU64::new(0));
        let pieces = vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let mut body = CountingBody::upstream(futures::stream::iter(pieces), hook(&calls, &total));

        let mut collected = Vec::new();
        while let Some(piece) = body.next().await {
            collected.extend_from_slice(&piece.unwrap());
        }

        assert_eq!(collected, b"hello world");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(total.load(Ordering::SeqCst), 11);

        // Dropping after EOF must not fire again.
        drop(body);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hook_fires_on_drop_with_partial_count() {
        let calls = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicU64::new(0));
        let pieces = vec![Ok(Bytes::from_static(b"abcd")), Ok(Bytes::from_static(b"efgh"))];
        let mut body = CountingBody::upstream(futures::stream::iter(pieces), hook(&calls, &total));

        let first = body.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 4);
        drop(body);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(total.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn buffered_body_yields_once() {
        let mut body = CountingBody::buffered(Bytes::from_static(b"chunk"));
        let piece = body.next().await.unwrap().unwrap();
        assert_eq!(&piece[..], b"chunk");
        assert!(body.next().await.is_none());
        assert_eq!(body.bytes_read(), 5);
    }
}
