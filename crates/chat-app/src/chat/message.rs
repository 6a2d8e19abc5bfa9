use tidechat_storage::{
    MessageId, MessageRecord, MessageRole, MessageStatus as StoredStatus, NewMessage,
    SessionId, SessionRecord, unix_timestamp_millis,
};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl From<MessageRole> for Role {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::System => Self::System,
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System => Self::System,
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// Lifecycle status for one message.
///
/// `Loading` and `Streaming` are transient; the rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Loading,
    Streaming,
    Success,
    Error,
    Cancelled,
}

/// Rejection reason for a status change that would move a message backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRejection {
    AlreadyTerminal {
        current: MessageStatus,
        attempted: MessageStatus,
    },
    Backwards {
        current: MessageStatus,
        attempted: MessageStatus,
    },
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Loading => 0,
            Self::Streaming => 1,
            Self::Success | Self::Error | Self::Cancelled => 2,
        }
    }

    /// Validates a forward move. Repeating a transient status is allowed.
    pub fn advance(self, next: MessageStatus) -> Result<MessageStatus, StatusRejection> {
        if self.is_terminal() {
            return Err(StatusRejection::AlreadyTerminal {
                current: self,
                attempted: next,
            });
        }

        if next.rank() < self.rank() {
            return Err(StatusRejection::Backwards {
                current: self,
                attempted: next,
            });
        }

        Ok(next)
    }
}

impl From<StoredStatus> for MessageStatus {
    fn from(status: StoredStatus) -> Self {
        match status {
            StoredStatus::Loading => Self::Loading,
            StoredStatus::Streaming => Self::Streaming,
            StoredStatus::Success => Self::Success,
            StoredStatus::Error => Self::Error,
            StoredStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<MessageStatus> for StoredStatus {
    fn from(status: MessageStatus) -> Self {
        match status {
            MessageStatus::Loading => Self::Loading,
            MessageStatus::Streaming => Self::Streaming,
            MessageStatus::Success => Self::Success,
            MessageStatus::Error => Self::Error,
            MessageStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub timestamp_unix_millis: u64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            id: MessageId::generate(),
            role,
            content: content.into(),
            status,
            timestamp_unix_millis: unix_timestamp_millis(),
        }
    }

    /// User prompts are final the moment they are created.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, MessageStatus::Success)
    }

    /// Empty assistant message waiting for the first delta.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, String::new(), MessageStatus::Loading)
    }

    pub fn to_new_message(&self) -> NewMessage {
        NewMessage {
            id: self.id.clone(),
            role: self.role.into(),
            content: self.content.clone(),
            status: self.status.into(),
            timestamp_unix_millis: self.timestamp_unix_millis,
        }
    }
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        let status = MessageStatus::from(record.status);
        Self {
            id: record.id,
            role: record.role.into(),
            content: record.content,
            // A reload never resumes a stream; whatever was in flight is settled.
            status: if status.is_terminal() {
                status
            } else {
                MessageStatus::Success
            },
            timestamp_unix_millis: record.timestamp_unix_millis,
        }
    }
}

/// Conversation aggregate: metadata plus messages in conversation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub messages: Vec<Message>,
    pub created_at_unix_millis: u64,
    pub updated_at_unix_millis: u64,
    /// Messages were fetched from persistence (or the session was born locally).
    pub messages_loaded: bool,
    /// Persistence knows about this session.
    pub persisted: bool,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        let now = unix_timestamp_millis();
        Self {
            id: SessionId::generate(),
            name: name.into(),
            messages: Vec::new(),
            created_at_unix_millis: now,
            updated_at_unix_millis: now,
            messages_loaded: true,
            persisted: false,
        }
    }

    pub fn from_record(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            name: record.title,
            messages: Vec::new(),
            created_at_unix_millis: record.created_at_unix_millis,
            updated_at_unix_millis: record.updated_at_unix_millis,
            messages_loaded: false,
            persisted: true,
        }
    }

    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| &message.id == message_id)
    }

    pub fn has_user_messages(&self) -> bool {
        self.messages.iter().any(|message| message.role == Role::User)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at_unix_millis = self.updated_at_unix_millis.max(unix_timestamp_millis());
    }
}
