//! HTTP body helpers shared by the server, backends and filters.
//!
//! All responses flowing through the gateway use one boxed body type so that
//! buffered cache hits and streamed backend bodies compose freely.

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use std::pin::Pin;
use std::task::{Context, Poll};

/// The single body type used across the gateway.
pub type Body = UnsyncBoxBody<Bytes, std::io::Error>;

/// A body carrying a full in-memory payload.
pub fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// An empty body.
pub fn empty() -> Body {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// Stream a reqwest response body through without buffering.
pub fn from_reqwest(resp: reqwest::Response) -> Body {
    let stream = resp
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(std::io::Error::other);
    StreamBody::new(stream).boxed_unsync()
}

/// Attach an owned guard (e.g. a semaphore permit) to a body so the guard is
/// released only when the body is dropped, i.e. after the client finished
/// reading the response.
pub fn with_guard<G: Send + Unpin + 'static>(inner: Body, guard: G) -> Body {
    UnsyncBoxBody::new(GuardedBody {
        inner,
        _guard: guard,
    })
}

struct GuardedBody<G> {
    inner: Body,
    _guard: G,
}

impl<G: Send + Unpin + 'static> http_body::Body for GuardedBody<G> {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

/// Buffer a body fully into memory.
pub async fn collect(body: Body) -> std::io::Result<Bytes> {
    Ok(body.collect().await?.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_round_trip() {
        let body = full("hello world");
        let bytes = collect(body).await.unwrap();
        assert_eq!(bytes, Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_empty_body() {
        let bytes = collect(empty()).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_guard_released_on_drop() {
        let sem = std::sync::Arc::new(tokio::sync::Semaphore::new(1));
        let permit = sem.clone().acquire_owned().await.unwrap();
        let body = with_guard(full("x"), permit);
        assert_eq!(sem.available_permits(), 0);
        let _ = collect(body).await.unwrap();
        assert_eq!(sem.available_permits(), 1);
    }
}
