use tidechat_storage::SessionId;

use crate::chat::{Message, Session};

/// Render boundary. The client calls it after every state change it makes.
///
/// Message callbacks only fire for the current session; a stream that keeps writing into
/// a session the user switched away from stays silent until that session is shown again.
pub trait ChatObserver: Send + Sync {
    fn messages_changed(&self, _session_id: &SessionId, _messages: &[Message]) {}

    fn sessions_changed(&self, _sessions: &[Session], _current: &SessionId) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ChatObserver for NoopObserver {}
