use anyhow::Result;
use async_trait::async_trait;
use futures::future::AbortHandle;
use futures::Stream;
use shared::agent_api::{ChatMessage, StreamChunk};
use shared::settings::BackendKind;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Capability interface shared by every backend.
///
/// The chat controller only ever talks to this trait, never to a concrete
/// client type.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn model_name(&self) -> String;

    /// Whether the backend can accept a chat call right now.
    fn is_ready(&self) -> bool;

    /// Open a streaming chat request.
    ///
    /// `Err` is returned only when the request cannot even be started (no
    /// model, no credentials). Failures after that arrive on the stream as a
    /// single `StreamChunk::Error`.
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<ChatStream>;

    /// One lightweight request to check the backend is reachable.
    async fn test_connection(&self) -> bool;
}

/// Stops the work behind a [`ChatStream`]. Cloneable and idempotent.
#[derive(Clone)]
pub struct CancelHandle {
    cancel: Arc<dyn Fn() + Send + Sync>,
}

impl CancelHandle {
    pub fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Arc::new(cancel),
        }
    }

    /// Cancel by dropping the spawned transport future (and with it the
    /// HTTP connection).
    pub fn from_abort(handle: AbortHandle) -> Self {
        Self::new(move || handle.abort())
    }

    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn cancel(&self) {
        (self.cancel)()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancelHandle")
    }
}

/// Producer side of a chat stream.
///
/// `done` and `error` consume the sink, so a producer cannot emit anything
/// after its terminal item.
pub struct StreamSink {
    tx: UnboundedSender<StreamChunk>,
}

impl StreamSink {
    /// Returns false once the consumer has gone away.
    pub fn token(&self, text: impl Into<String>) -> bool {
        self.tx.send(StreamChunk::Token(text.into())).is_ok()
    }

    pub fn done(self) {
        let _ = self.tx.send(StreamChunk::Done);
    }

    pub fn error(self, message: impl Into<String>) {
        let _ = self.tx.send(StreamChunk::Error(message.into()));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Lazy, finite, non-restartable sequence of chunks from one chat call.
///
/// Nothing is yielded after the first terminal chunk. A stream that ends
/// without a terminal chunk was cancelled at the producer side.
pub struct ChatStream {
    rx: UnboundedReceiver<StreamChunk>,
    cancel: CancelHandle,
    finished: bool,
}

impl ChatStream {
    pub fn channel(cancel: CancelHandle) -> (StreamSink, ChatStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            StreamSink { tx },
            ChatStream {
                rx,
                cancel,
                finished: false,
            },
        )
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for ChatStream {
    type Item = StreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamChunk>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.is_terminal() {
                    this.finished = true;
                    this.rx.close();
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_stream_stops_after_terminal() {
        let (sink, mut stream) = ChatStream::channel(CancelHandle::noop());
        assert!(sink.token("a"));
        assert!(sink.token("b"));
        sink.error("boom");

        let mut seen = Vec::new();
        while let Some(chunk) = stream.next().await {
            seen.push(chunk);
        }
        assert_eq!(
            seen,
            vec![
                StreamChunk::Token("a".into()),
                StreamChunk::Token("b".into()),
                StreamChunk::Error("boom".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_sink_ends_stream_without_terminal() {
        let (sink, mut stream) = ChatStream::channel(CancelHandle::noop());
        sink.token("partial");
        drop(sink);

        assert_eq!(stream.next().await, Some(StreamChunk::Token("partial".into())));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_cancel_handle_invokes_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (_sink, stream) = ChatStream::channel(CancelHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        stream.cancel();
        stream.cancel_handle().cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sink_reports_closed_consumer() {
        let (sink, stream) = ChatStream::channel(CancelHandle::noop());
        drop(stream);
        assert!(sink.is_closed());
        assert!(!sink.token("late"));
    }
}
