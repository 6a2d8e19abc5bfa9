//! In-memory session/message state.
//!
//! Every mutation here is synchronous and side-effect free; persistence, rendering and
//! streaming are layered on top by [`crate::app::ChatClient`].

use tidechat_storage::{MessageId, SessionId, SessionRecord};

use crate::chat::{Message, Session};

/// Result of removing a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedSession {
    pub removed: Session,
    /// Set when the removed session was the last one and a fresh one took its place.
    pub replacement: Option<SessionId>,
    pub was_current: bool,
}

#[derive(Debug, Clone)]
pub struct ChatStore {
    sessions: Vec<Session>,
    current: SessionId,
    default_session_name: String,
}

impl ChatStore {
    /// Starts with one empty session so there is always a current one.
    pub fn new(default_session_name: impl Into<String>) -> Self {
        let default_session_name = default_session_name.into();
        let session = Session::new(default_session_name.clone());
        Self {
            current: session.id.clone(),
            sessions: vec![session],
            default_session_name,
        }
    }

    pub fn current_session_id(&self) -> &SessionId {
        &self.current
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.session(&self.current)
    }

    pub fn current_messages(&self) -> &[Message] {
        self.current_session()
            .map(|session| session.messages.as_slice())
            .unwrap_or_default()
    }

    /// Sessions, most recently created or merged first.
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, session_id: &SessionId) -> Option<&Session> {
        self.sessions.iter().find(|session| &session.id == session_id)
    }

    pub fn session_mut(&mut self, session_id: &SessionId) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|session| &session.id == session_id)
    }

    pub fn message(&self, session_id: &SessionId, message_id: &MessageId) -> Option<&Message> {
        self.session(session_id)?.message(message_id)
    }

    /// Creates a session, makes it current and returns its id.
    pub fn create_session(&mut self, name: Option<&str>) -> SessionId {
        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.default_session_name)
            .to_string();
        let session = Session::new(name);
        let session_id = session.id.clone();

        self.sessions.insert(0, session);
        self.current = session_id.clone();
        session_id
    }

    pub fn switch_session(&mut self, session_id: &SessionId) -> bool {
        if self.session(session_id).is_none() {
            return false;
        }
        self.current = session_id.clone();
        true
    }

    /// Removes a session. The store never ends up empty: removing the last session
    /// creates a fresh default one, and removing the current one moves to another.
    pub fn delete_session(&mut self, session_id: &SessionId) -> Option<DeletedSession> {
        let index = self
            .sessions
            .iter()
            .position(|session| &session.id == session_id)?;
        let removed = self.sessions.remove(index);
        let was_current = &self.current == session_id;

        let mut replacement = None;
        if self.sessions.is_empty() {
            replacement = Some(self.create_session(None));
        } else if was_current {
            self.current = self.sessions[0].id.clone();
        }

        Some(DeletedSession {
            removed,
            replacement,
            was_current,
        })
    }

    pub fn rename_session(&mut self, session_id: &SessionId, name: &str) -> bool {
        let name = name.trim();
        let default_name = self.default_session_name.clone();
        let Some(session) = self.session_mut(session_id) else {
            return false;
        };

        session.name = if name.is_empty() {
            default_name
        } else {
            name.to_string()
        };
        session.touch();
        true
    }

    pub fn clear_history(&mut self, session_id: &SessionId) -> bool {
        let Some(session) = self.session_mut(session_id) else {
            return false;
        };
        session.messages.clear();
        session.touch();
        true
    }

    /// Replaces a session's messages with what persistence returned.
    pub fn load_messages(&mut self, session_id: &SessionId, messages: Vec<Message>) -> bool {
        let Some(session) = self.session_mut(session_id) else {
            return false;
        };
        session.messages = messages;
        session.messages_loaded = true;
        true
    }

    pub fn append_message(&mut self, session_id: &SessionId, message: Message) -> bool {
        let Some(session) = self.session_mut(session_id) else {
            return false;
        };
        session.messages.push(message);
        session.touch();
        true
    }

    /// Replaces the message with the same id. No-op when it is gone.
    pub fn update_message(&mut self, session_id: &SessionId, message: Message) -> bool {
        self.modify_message(session_id, &message.id.clone(), |existing| {
            *existing = message;
        })
    }

    pub fn modify_message<F>(&mut self, session_id: &SessionId, message_id: &MessageId, modify: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        let Some(session) = self.session_mut(session_id) else {
            return false;
        };
        let Some(message) = session.message_mut(message_id) else {
            return false;
        };

        modify(message);
        session.touch();
        true
    }

    /// Folds authoritative session metadata into the local list.
    ///
    /// Known sessions take the stored name and timestamps; unknown ones are added with
    /// their messages still unloaded. Local sessions missing from `records` are kept.
    pub fn merge_session_records(&mut self, records: Vec<SessionRecord>) {
        for record in records {
            match self.session_mut(&record.id) {
                Some(session) => {
                    session.name = record.title;
                    session.created_at_unix_millis = record.created_at_unix_millis;
                    session.updated_at_unix_millis = session
                        .updated_at_unix_millis
                        .max(record.updated_at_unix_millis);
                    session.persisted = true;
                }
                None => self.sessions.push(Session::from_record(record)),
            }
        }

        self.sessions.sort_by(|left, right| {
            right
                .updated_at_unix_millis
                .cmp(&left.updated_at_unix_millis)
        });
    }

    /// Drops the current session when it is an unused local placeholder and stored
    /// sessions exist; the most recent stored session becomes current.
    pub(crate) fn replace_placeholder_with_stored(&mut self) -> Option<SessionId> {
        let current = self.current_session()?;
        if current.persisted || !current.messages.is_empty() {
            return None;
        }

        let stored = self
            .sessions
            .iter()
            .find(|session| session.persisted)?
            .id
            .clone();
        let placeholder = self.current.clone();
        self.sessions.retain(|session| session.id != placeholder);
        self.current = stored.clone();
        Some(stored)
    }
}
