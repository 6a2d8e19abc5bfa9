use std::collections::HashMap;

use snafu::{OptionExt, ensure};
use tokio::sync::RwLock;

use super::error::{ConflictSnafu, NotFoundSnafu, StorageResult};
use super::ids::{MessageId, SessionId};
use super::types::{
    MessagePatch, MessageRecord, NewMessage, NewSession, SessionPatch, SessionRecord,
    normalized_title, unix_timestamp_millis,
};
use super::{BoxFuture, MessageStore, SessionStore};

#[derive(Debug, Default)]
struct MemoryState {
    sessions: Vec<SessionRecord>,
    messages: HashMap<SessionId, Vec<MessageRecord>>,
}

impl MemoryState {
    fn session_mut(
        &mut self,
        session_id: &SessionId,
        stage: &'static str,
    ) -> StorageResult<&mut SessionRecord> {
        self.sessions
            .iter_mut()
            .find(|session| &session.id == session_id)
            .context(NotFoundSnafu {
                stage,
                entity: "session",
                id: session_id.to_string(),
            })
    }

    fn touch(&mut self, session_id: &SessionId, now: u64) {
        if let Some(session) = self
            .sessions
            .iter_mut()
            .find(|session| &session.id == session_id)
        {
            session.updated_at_unix_millis = session.updated_at_unix_millis.max(now);
        }
    }
}

/// Process-local persistence; nothing outlives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStorage {
    fn create_session<'a>(
        &'a self,
        input: NewSession,
    ) -> BoxFuture<'a, StorageResult<SessionRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            ensure!(
                !state.sessions.iter().any(|session| session.id == input.id),
                ConflictSnafu {
                    stage: "memory-session-create",
                    entity: "session",
                    details: format!("session '{}' already exists", input.id),
                }
            );

            let now = unix_timestamp_millis();
            let record = SessionRecord {
                id: input.id,
                title: normalized_title(&input.title),
                created_at_unix_millis: now,
                updated_at_unix_millis: now,
            };
            state.messages.insert(record.id.clone(), Vec::new());
            state.sessions.push(record.clone());
            Ok(record)
        })
    }

    fn list_sessions<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<SessionRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut sessions = state.sessions.clone();
            sessions.sort_by(|left, right| {
                right
                    .updated_at_unix_millis
                    .cmp(&left.updated_at_unix_millis)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(sessions)
        })
    }

    fn update_session<'a>(
        &'a self,
        session_id: &'a SessionId,
        patch: SessionPatch,
    ) -> BoxFuture<'a, StorageResult<SessionRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let session = state.session_mut(session_id, "memory-session-update")?;
            if let Some(title) = patch.title {
                session.title = normalized_title(&title);
            }
            session.updated_at_unix_millis = unix_timestamp_millis();
            Ok(session.clone())
        })
    }

    fn delete_session<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let before = state.sessions.len();
            state.sessions.retain(|session| &session.id != session_id);
            ensure!(
                state.sessions.len() != before,
                NotFoundSnafu {
                    stage: "memory-session-delete",
                    entity: "session",
                    id: session_id.to_string(),
                }
            );
            state.messages.remove(session_id);
            Ok(())
        })
    }
}

impl MessageStore for MemoryStorage {
    fn append_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.session_mut(session_id, "memory-message-append-session")?;

            let messages = state.messages.entry(session_id.clone()).or_default();
            ensure!(
                !messages.iter().any(|message| message.id == input.id),
                ConflictSnafu {
                    stage: "memory-message-append",
                    entity: "message",
                    details: format!("message '{}' already exists", input.id),
                }
            );

            let record = MessageRecord {
                id: input.id,
                session_id: session_id.clone(),
                seq: messages.last().map_or(1, |message| message.seq + 1),
                role: input.role,
                content: input.content,
                status: input.status,
                timestamp_unix_millis: input.timestamp_unix_millis,
            };
            messages.push(record.clone());
            state.touch(session_id, record.timestamp_unix_millis);
            Ok(record)
        })
    }

    fn list_messages<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            ensure!(
                state.sessions.iter().any(|session| &session.id == session_id),
                NotFoundSnafu {
                    stage: "memory-message-list",
                    entity: "session",
                    id: session_id.to_string(),
                }
            );
            Ok(state.messages.get(session_id).cloned().unwrap_or_default())
        })
    }

    fn update_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        message_id: &'a MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let message = state
                .messages
                .get_mut(session_id)
                .and_then(|messages| messages.iter_mut().find(|message| &message.id == message_id))
                .context(NotFoundSnafu {
                    stage: "memory-message-update",
                    entity: "message",
                    id: message_id.to_string(),
                })?;

            if let Some(content) = patch.content {
                message.content = content;
            }
            if let Some(status) = patch.status {
                message.status = status;
            }
            state.touch(session_id, unix_timestamp_millis());
            Ok(())
        })
    }

    fn clear_messages<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.session_mut(session_id, "memory-message-clear")?;
            state.messages.insert(session_id.clone(), Vec::new());
            state.touch(session_id, unix_timestamp_millis());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::types::{DEFAULT_SESSION_TITLE, MessageRole, MessageStatus};

    fn new_message(role: MessageRole, content: &str, status: MessageStatus) -> NewMessage {
        NewMessage {
            id: MessageId::generate(),
            role,
            content: content.to_string(),
            status,
            timestamp_unix_millis: unix_timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn session_crud_roundtrip() {
        let storage = MemoryStorage::new();
        let session_id = SessionId::generate();

        let created = storage
            .create_session(NewSession {
                id: session_id.clone(),
                title: "   ".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(created.title, DEFAULT_SESSION_TITLE);

        let renamed = storage
            .update_session(
                &session_id,
                SessionPatch {
                    title: Some("Rust questions".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.title, "Rust questions");

        storage.delete_session(&session_id).await.unwrap();
        assert!(storage.list_sessions().await.unwrap().is_empty());
        assert!(matches!(
            storage.delete_session(&session_id).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_session_id_is_a_conflict() {
        let storage = MemoryStorage::new();
        let session_id = SessionId::generate();
        let input = NewSession {
            id: session_id,
            title: "one".to_string(),
        };

        storage.create_session(input.clone()).await.unwrap();
        assert!(matches!(
            storage.create_session(input).await,
            Err(StorageError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn messages_keep_order_and_accept_patches() {
        let storage = MemoryStorage::new();
        let session_id = SessionId::generate();
        storage
            .create_session(NewSession {
                id: session_id.clone(),
                title: "chat".to_string(),
            })
            .await
            .unwrap();

        let user = storage
            .append_message(
                &session_id,
                new_message(MessageRole::User, "hi", MessageStatus::Success),
            )
            .await
            .unwrap();
        let assistant = storage
            .append_message(
                &session_id,
                new_message(MessageRole::Assistant, "", MessageStatus::Loading),
            )
            .await
            .unwrap();
        assert_eq!((user.seq, assistant.seq), (1, 2));

        storage
            .update_message(
                &session_id,
                &assistant.id,
                MessagePatch {
                    content: Some("hello there".to_string()),
                    status: Some(MessageStatus::Success),
                },
            )
            .await
            .unwrap();

        let messages = storage.list_messages(&session_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, user.id);
        assert_eq!(messages[1].content, "hello there");
        assert_eq!(messages[1].status, MessageStatus::Success);

        storage.clear_messages(&session_id).await.unwrap();
        assert!(storage.list_messages(&session_id).await.unwrap().is_empty());
        assert_eq!(storage.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_to_unknown_session_is_rejected() {
        let storage = MemoryStorage::new();
        let result = storage
            .append_message(
                &SessionId::generate(),
                new_message(MessageRole::User, "hi", MessageStatus::Success),
            )
            .await;

        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }
}
