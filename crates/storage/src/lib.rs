use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    DEFAULT_SESSION_TITLE, MessagePatch, MessageRecord, MessageRole, MessageStatus, NewMessage,
    NewSession, SessionPatch, SessionRecord, normalized_title, unix_timestamp_millis,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait SessionStore: Send + Sync {
    fn create_session<'a>(&'a self, input: NewSession)
    -> BoxFuture<'a, StorageResult<SessionRecord>>;
    /// Lists sessions most recently updated first.
    fn list_sessions<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<SessionRecord>>>;
    fn update_session<'a>(
        &'a self,
        session_id: &'a SessionId,
        patch: SessionPatch,
    ) -> BoxFuture<'a, StorageResult<SessionRecord>>;
    /// Removes the session together with its messages.
    fn delete_session<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, StorageResult<()>>;
}

pub trait MessageStore: Send + Sync {
    fn append_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;
    /// Lists messages in conversation order.
    fn list_messages<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;
    fn update_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        message_id: &'a MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<()>>;
    /// Drops every message of the session but keeps the session itself.
    fn clear_messages<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, StorageResult<()>>;
}

pub trait Storage: SessionStore + MessageStore {}

impl<T> Storage for T where T: SessionStore + MessageStore {}
