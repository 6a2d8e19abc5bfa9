//! Turns stream events into message updates for one request/response cycle.

use tidechat_storage::MessageId;
use tidechat_transport::{StreamEventMapped, StreamEventPayload, StreamTarget};

use crate::chat::MessageStatus;

pub const CANCELLED_PLACEHOLDER: &str = "Generation cancelled.";
pub const EMPTY_RESPONSE_MESSAGE: &str = "The server closed the stream without a reply.";

/// Content and status to write into the target message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageUpdate {
    pub content: String,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStep {
    /// Event belongs to another stream.
    Stale,
    Progress(MessageUpdate),
    Finished {
        update: MessageUpdate,
        /// Completion was explicit, so stored session metadata is worth reloading.
        refresh_sessions: bool,
    },
}

/// Controller state of the active stream.
///
/// It never holds the message itself, only its id; callers apply updates through the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    target: StreamTarget,
    message_id: MessageId,
    buffer: String,
}

impl StreamSession {
    pub fn new(target: StreamTarget, message_id: MessageId) -> Self {
        Self {
            target,
            message_id,
            buffer: String::new(),
        }
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn accepts(&self, target: &StreamTarget) -> bool {
        &self.target == target
    }

    pub fn apply(&mut self, event: StreamEventMapped) -> StreamStep {
        if !self.accepts(&event.target) {
            return StreamStep::Stale;
        }

        match event.payload {
            StreamEventPayload::Delta(text) => {
                self.buffer.push_str(&text);
                StreamStep::Progress(MessageUpdate {
                    content: self.buffer.clone(),
                    status: MessageStatus::Streaming,
                })
            }
            StreamEventPayload::Done => StreamStep::Finished {
                update: MessageUpdate {
                    content: self.buffer.clone(),
                    status: MessageStatus::Success,
                },
                refresh_sessions: true,
            },
            StreamEventPayload::Error(message) | StreamEventPayload::TransportError(message) => {
                self.fail(message)
            }
            StreamEventPayload::Closed => self.close(),
        }
    }

    /// Stream ended without a terminal event.
    pub fn close(&mut self) -> StreamStep {
        if self.buffer.is_empty() {
            return self.fail(EMPTY_RESPONSE_MESSAGE.to_string());
        }

        StreamStep::Finished {
            update: MessageUpdate {
                content: self.buffer.clone(),
                status: MessageStatus::Success,
            },
            refresh_sessions: false,
        }
    }

    pub fn fail(&mut self, message: String) -> StreamStep {
        StreamStep::Finished {
            update: MessageUpdate {
                content: message,
                status: MessageStatus::Error,
            },
            refresh_sessions: false,
        }
    }

    pub fn cancel(&mut self) -> MessageUpdate {
        let content = if self.buffer.is_empty() {
            CANCELLED_PLACEHOLDER.to_string()
        } else {
            self.buffer.clone()
        };

        MessageUpdate {
            content,
            status: MessageStatus::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use tidechat_storage::SessionId;
    use tidechat_transport::StreamId;

    use super::*;

    fn session() -> StreamSession {
        StreamSession::new(
            StreamTarget::new(SessionId::generate(), StreamId::new(3)),
            MessageId::generate(),
        )
    }

    fn event(session: &StreamSession, payload: StreamEventPayload) -> StreamEventMapped {
        StreamEventMapped {
            target: session.target().clone(),
            payload,
        }
    }

    fn delta(text: &str) -> StreamEventPayload {
        StreamEventPayload::Delta(text.to_string())
    }

    #[test]
    fn deltas_accumulate_and_completion_keeps_content() {
        let mut session = session();

        let first = session.apply(event(&session, delta("Hel")));
        assert_eq!(
            first,
            StreamStep::Progress(MessageUpdate {
                content: "Hel".to_string(),
                status: MessageStatus::Streaming,
            })
        );
        session.apply(event(&session, delta("lo")));

        assert_eq!(
            session.apply(event(&session, StreamEventPayload::Done)),
            StreamStep::Finished {
                update: MessageUpdate {
                    content: "Hello".to_string(),
                    status: MessageStatus::Success,
                },
                refresh_sessions: true,
            }
        );
    }

    #[test]
    fn failure_replaces_partial_content() {
        let mut session = session();
        session.apply(event(&session, delta("partial")));

        let step = session.apply(event(
            &session,
            StreamEventPayload::Error("quota exceeded".to_string()),
        ));

        assert_eq!(
            step,
            StreamStep::Finished {
                update: MessageUpdate {
                    content: "quota exceeded".to_string(),
                    status: MessageStatus::Error,
                },
                refresh_sessions: false,
            }
        );
    }

    #[test]
    fn events_for_other_streams_are_stale() {
        let mut session = session();
        let other = StreamEventMapped {
            target: StreamTarget::new(session.target().session_id.clone(), StreamId::new(2)),
            payload: delta("late"),
        };

        assert_eq!(session.apply(other), StreamStep::Stale);
        assert_eq!(
            session.cancel().content,
            CANCELLED_PLACEHOLDER,
            "stale delta must not reach the buffer"
        );
    }

    #[test]
    fn silent_close_depends_on_received_content() {
        let mut empty = session();
        assert!(matches!(
            empty.apply(event(&empty, StreamEventPayload::Closed)),
            StreamStep::Finished { update, .. }
                if update.status == MessageStatus::Error && update.content == EMPTY_RESPONSE_MESSAGE
        ));

        let mut partial = session();
        partial.apply(event(&partial, delta("Hi")));
        assert_eq!(
            partial.apply(event(&partial, StreamEventPayload::Closed)),
            StreamStep::Finished {
                update: MessageUpdate {
                    content: "Hi".to_string(),
                    status: MessageStatus::Success,
                },
                refresh_sessions: false,
            }
        );
    }

    #[test]
    fn cancel_keeps_partial_or_uses_placeholder() {
        let mut empty = session();
        assert_eq!(
            empty.cancel(),
            MessageUpdate {
                content: CANCELLED_PLACEHOLDER.to_string(),
                status: MessageStatus::Cancelled,
            }
        );

        let mut partial = session();
        partial.apply(event(&partial, delta("Hi")));
        assert_eq!(partial.cancel().content, "Hi");
    }
}
