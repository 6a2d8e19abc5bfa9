use std::fmt;
use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tidechat_storage::SessionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Number of one request/response cycle.
///
/// Every send and retry gets a fresh one so late events of an earlier stream are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Routing key carried by every stream event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub session_id: SessionId,
    pub stream_id: StreamId,
}

impl StreamTarget {
    pub fn new(session_id: SessionId, stream_id: StreamId) -> Self {
        Self {
            session_id,
            stream_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub target: StreamTarget,
    pub message: String,
}

impl ChatRequest {
    pub fn new(target: StreamTarget, message: impl Into<String>) -> Self {
        Self {
            target,
            message: message.into(),
        }
    }
}

/// Stream payload after framing and interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    /// `error` frame sent by the server, already in display form.
    Error(String),
    /// Connect, status, read or deadline failure, already in display form.
    TransportError(String),
    /// Body ended without a terminal frame.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

pub type BackendWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("chat request for {target:?} has an empty message"))]
    EmptyMessage {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("invalid backend url '{url}': {details}"))]
    InvalidBaseUrl {
        stage: &'static str,
        url: String,
        details: String,
    },
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status} on `{stage}`: {body}"))]
    UnexpectedStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode backend response on `{stage}`, {source}"))]
    DecodeResponse {
        stage: &'static str,
        source: reqwest::Error,
    },
}

/// Receiving half of one chat stream.
///
/// Dropping it cancels the worker.
pub struct ChatEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel: CancellationToken,
}

pub struct BackendStreamHandle {
    pub stream: ChatEventStream,
    pub worker: BackendWorker,
}

impl ChatEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target,
            events,
            cancel,
        }
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    /// Token observed by the worker; cancelling it from anywhere stops the read loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns `false` when the stream was already cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        self.events.close();
        true
    }
}

impl Drop for ChatEventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;
    /// Opens a stream for one prompt. The returned worker must be spawned by the caller.
    fn stream_chat(&self, request: ChatRequest) -> BackendResult<BackendStreamHandle>;
}

/// Creates the event channel shared by a worker and its [`ChatEventStream`].
pub fn event_channel(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ChatEventStream,
    CancellationToken,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    (
        event_tx,
        ChatEventStream::new(target, event_rx, cancel.clone()),
        cancel,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> StreamTarget {
        StreamTarget::new(SessionId::generate(), StreamId::new(1))
    }

    #[tokio::test]
    async fn events_flow_until_cancel() {
        let (event_tx, mut stream, cancel) = event_channel(target());
        let stream_target = stream.target().clone();

        event_tx
            .send(StreamEventMapped {
                target: stream_target.clone(),
                payload: StreamEventPayload::Delta("hi".to_string()),
            })
            .unwrap();
        assert_eq!(
            stream.recv().await.map(|event| event.payload),
            Some(StreamEventPayload::Delta("hi".to_string()))
        );

        assert!(stream.cancel());
        assert!(!stream.cancel());
        assert!(cancel.is_cancelled());
        assert!(
            event_tx
                .send(StreamEventMapped {
                    target: stream_target,
                    payload: StreamEventPayload::Done,
                })
                .is_err()
        );
    }

    #[test]
    fn dropping_stream_cancels_worker_token() {
        let (_event_tx, stream, cancel) = event_channel(target());
        drop(stream);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn stream_ids_increase() {
        let first = StreamId::new(7);
        assert!(first.next() > first);
        assert_eq!(first.next().to_string(), "stream-8");
    }
}
