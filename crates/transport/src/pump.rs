use std::fmt;
use std::pin::pin;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{StreamEventMapped, StreamEventPayload, StreamTarget};
use crate::event::{Interpreted, interpret, preview};
use crate::failure::{FailureKind, server_failure_message, transport_failure_message};
use crate::frame::{Frame, FrameDecoder};

/// How a read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    Completed,
    ServerFailed,
    TransportFailed,
    TimedOut,
    Closed,
    Cancelled,
    /// The consumer went away; nothing left to deliver to.
    Detached,
}

/// Reads a chunked body until a terminal frame, end of body, deadline or cancellation.
///
/// Every event sent through `event_tx` is already interpreted and carries `target`.
/// Cancellation is silent: no event is sent for it.
pub async fn pump_byte_stream<S, B, E>(
    target: StreamTarget,
    bytes: S,
    event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> PumpOutcome
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut bytes = pin!(bytes);
    let mut sink = EventSink {
        target,
        event_tx,
        frames_seen: 0,
    };
    let mut decoder = FrameDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(stream = ?sink.target, "chat stream read cancelled");
                return PumpOutcome::Cancelled;
            }
            _ = wait_for_deadline(deadline) => {
                tracing::error!(stream = ?sink.target, "chat stream exceeded its deadline");
                let message = FailureKind::Timeout.user_message().to_string();
                sink.emit(StreamEventPayload::TransportError(message));
                return PumpOutcome::TimedOut;
            }
            next = bytes.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                for frame in decoder.push_bytes(chunk.as_ref()) {
                    if let Some(outcome) = sink.dispatch(frame) {
                        return outcome;
                    }
                }
            }
            Some(Err(error)) => {
                let raw = error.to_string();
                tracing::error!(stream = ?sink.target, error = %raw, "chat stream read failed");
                sink.emit(StreamEventPayload::TransportError(
                    transport_failure_message(&raw, None),
                ));
                return PumpOutcome::TransportFailed;
            }
            None => {
                for frame in decoder.finish() {
                    if let Some(outcome) = sink.dispatch(frame) {
                        return outcome;
                    }
                }
                tracing::debug!(
                    stream = ?sink.target,
                    frames_seen = sink.frames_seen,
                    "chat stream closed without terminal frame"
                );
                return if sink.emit(StreamEventPayload::Closed) {
                    PumpOutcome::Closed
                } else {
                    PumpOutcome::Detached
                };
            }
        }
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct EventSink<'a> {
    target: StreamTarget,
    event_tx: &'a mpsc::UnboundedSender<StreamEventMapped>,
    frames_seen: usize,
}

impl EventSink<'_> {
    fn emit(&self, payload: StreamEventPayload) -> bool {
        self.event_tx
            .send(StreamEventMapped {
                target: self.target.clone(),
                payload,
            })
            .is_ok()
    }

    /// Returns the outcome once the frame ends the stream.
    fn dispatch(&mut self, frame: Frame) -> Option<PumpOutcome> {
        self.frames_seen += 1;

        let payload = match frame {
            Frame::Event(name) => {
                tracing::debug!(stream = ?self.target, event = %name, "stream event line");
                return None;
            }
            Frame::Data(payload) => payload,
        };

        let (payload, outcome) = match interpret(&payload) {
            Interpreted::Delta(text) => (StreamEventPayload::Delta(text), None),
            Interpreted::Completion => (StreamEventPayload::Done, Some(PumpOutcome::Completed)),
            Interpreted::Failure(raw) => {
                tracing::warn!(stream = ?self.target, error = %raw, "server reported stream error");
                (
                    StreamEventPayload::Error(server_failure_message(&raw)),
                    Some(PumpOutcome::ServerFailed),
                )
            }
            Interpreted::Ignored => {
                tracing::trace!(stream = ?self.target, payload = %preview(&payload), "ignored stream payload");
                return None;
            }
            Interpreted::Unparseable => return None,
        };

        if !self.emit(payload) {
            return Some(PumpOutcome::Detached);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use futures::stream;
    use tidechat_storage::SessionId;

    use super::*;
    use crate::backend::StreamId;

    fn target() -> StreamTarget {
        StreamTarget::new(SessionId::generate(), StreamId::new(1))
    }

    async fn run(chunks: Vec<&'static str>) -> (PumpOutcome, Vec<StreamEventPayload>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let body = stream::iter(chunks.into_iter().map(Ok::<_, Infallible>));

        let outcome = pump_byte_stream(target(), body, &event_tx, &cancel, None).await;
        drop(event_tx);

        let mut payloads = Vec::new();
        while let Some(event) = event_rx.recv().await {
            payloads.push(event.payload);
        }
        (outcome, payloads)
    }

    fn delta(text: &str) -> StreamEventPayload {
        StreamEventPayload::Delta(text.to_string())
    }

    #[tokio::test]
    async fn json_split_across_reads_yields_ordered_deltas() {
        let (outcome, payloads) = run(vec![
            "data: {\"content\":\"He",
            "llo\"}\ndata: {\"content\":\" world\"}\n",
            "data: {\"done\":true}\n",
        ])
        .await;

        assert_eq!(outcome, PumpOutcome::Completed);
        assert_eq!(
            payloads,
            vec![delta("Hello"), delta(" world"), StreamEventPayload::Done]
        );
    }

    #[tokio::test]
    async fn chunk_boundaries_do_not_change_events() {
        let body = "event: message\ndata:data: {\"content\":\"A\"}\n\ndata: {\"content\":\"B\"}\ndata: [DONE]\n";
        let (_, whole) = run(vec![body]).await;

        for split in 1..body.len() {
            let (first, second) = body.split_at(split);
            let (outcome, payloads) = run(vec![first, second]).await;
            assert_eq!(outcome, PumpOutcome::Completed, "split at {split}");
            assert_eq!(payloads, whole, "split at {split}");
        }
        assert_eq!(whole, vec![delta("A"), delta("B"), StreamEventPayload::Done]);
    }

    #[tokio::test]
    async fn nothing_is_read_after_terminal_frame() {
        let (outcome, payloads) = run(vec![
            "data: {\"content\":\"partial\"}\n",
            "data: {\"error\":\"quota exceeded\"}\n",
            "data: {\"content\":\"late\"}\n",
        ])
        .await;

        assert_eq!(outcome, PumpOutcome::ServerFailed);
        assert_eq!(
            payloads,
            vec![
                delta("partial"),
                StreamEventPayload::Error(FailureKind::QuotaExhausted.user_message().to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn garbage_is_skipped_and_body_end_is_reported() {
        let (outcome, payloads) = run(vec!["data: {oops\n", "data: {\"content\":\"ok\"}"]).await;

        assert_eq!(outcome, PumpOutcome::Closed);
        assert_eq!(payloads, vec![delta("ok"), StreamEventPayload::Closed]);
    }

    #[tokio::test]
    async fn read_error_becomes_transport_error() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let body = stream::iter(vec![
            Ok("data: {\"content\":\"a\"}\n"),
            Err("connection reset by peer"),
        ]);

        let outcome = pump_byte_stream(target(), body, &event_tx, &cancel, None).await;

        assert_eq!(outcome, PumpOutcome::TransportFailed);
        assert_eq!(event_rx.recv().await.map(|event| event.payload), Some(delta("a")));
        assert_eq!(
            event_rx.recv().await.map(|event| event.payload),
            Some(StreamEventPayload::TransportError(
                FailureKind::NetworkUnreachable.user_message().to_string()
            ))
        );
    }

    #[tokio::test]
    async fn cancellation_stops_silently() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let body = stream::pending::<Result<&'static str, Infallible>>();

        let outcome = pump_byte_stream(target(), body, &event_tx, &cancel, None).await;
        drop(event_tx);

        assert_eq!(outcome, PumpOutcome::Cancelled);
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_turns_into_timeout_error() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let body = stream::pending::<Result<&'static str, Infallible>>();
        let deadline = Instant::now() + Duration::from_secs(300);

        let outcome = pump_byte_stream(target(), body, &event_tx, &cancel, Some(deadline)).await;

        assert_eq!(outcome, PumpOutcome::TimedOut);
        assert_eq!(
            event_rx.recv().await.map(|event| event.payload),
            Some(StreamEventPayload::TransportError(
                FailureKind::Timeout.user_message().to_string()
            ))
        );
    }
}
