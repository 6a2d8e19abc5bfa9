use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tidechat_storage::{
    MemoryStorage, MessageId, MessagePatch, NewSession, SessionId, SessionPatch, SqliteStorage,
    Storage, StorageError,
};
use tidechat_transport::{
    BackendError, ChatBackend, ChatEventStream, ChatRequest, HttpChatBackend, StreamEventMapped,
    StreamId, StreamTarget, transport_failure_message,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::{Message, Role};
use crate::controller::{MessageUpdate, StreamSession, StreamStep};
use crate::observer::{ChatObserver, NoopObserver};
use crate::settings::{ChatSettings, DEFAULT_AUTO_TITLE_MAX_CHARS, PersistenceSettings};
use crate::store::ChatStore;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("session '{session_id}' does not exist"))]
    UnknownSession {
        stage: &'static str,
        session_id: String,
    },
    #[snafu(display("assistant message '{message_id}' does not exist in the current session"))]
    UnknownMessage {
        stage: &'static str,
        message_id: String,
    },
    #[snafu(display("message '{message_id}' has no user prompt before it"))]
    NoPrompt {
        stage: &'static str,
        message_id: String,
    },
    #[snafu(display("chat backend setup failed on `{stage}`, {source}"))]
    Backend {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("persistence failed on `{stage}`, {source}"))]
    Persistence {
        stage: &'static str,
        source: StorageError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRejection {
    EmptyPrompt,
    StreamActive { active: StreamTarget },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Started(StreamTarget),
    /// The prompt was recorded but the backend refused to open a stream; the reply is
    /// already settled as an error.
    Failed(StreamTarget),
    Rejected(SendRejection),
}

impl SendOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub default_session_name: String,
    pub auto_title_max_chars: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            default_session_name: tidechat_storage::DEFAULT_SESSION_TITLE.to_string(),
            auto_title_max_chars: DEFAULT_AUTO_TITLE_MAX_CHARS,
        }
    }
}

impl From<&ChatSettings> for ClientOptions {
    fn from(settings: &ChatSettings) -> Self {
        Self {
            default_session_name: settings.default_session_name.clone(),
            auto_title_max_chars: settings.auto_title_max_chars,
        }
    }
}

struct ActiveStream {
    session: StreamSession,
    events: ChatEventStream,
    worker: JoinHandle<()>,
}

/// Chat client: owns the store, runs at most one stream, and keeps persistence and the
/// observer in step with every change.
pub struct ChatClient {
    options: ClientOptions,
    backend: Arc<dyn ChatBackend>,
    persistence: Arc<dyn Storage>,
    observer: Arc<dyn ChatObserver>,
    store: ChatStore,
    active: Option<ActiveStream>,
    next_stream_id: StreamId,
}

impl ChatClient {
    pub fn new(
        options: ClientOptions,
        backend: Arc<dyn ChatBackend>,
        persistence: Arc<dyn Storage>,
    ) -> Self {
        Self {
            store: ChatStore::new(options.default_session_name.clone()),
            options,
            backend,
            persistence,
            observer: Arc::new(NoopObserver),
            active: None,
            next_stream_id: StreamId::new(1),
        }
    }

    /// Builds the HTTP backend and the configured persistence.
    pub async fn from_settings(settings: &ChatSettings) -> ClientResult<Self> {
        let http = Arc::new(
            HttpChatBackend::new(settings.backend_config()).context(BackendSnafu {
                stage: "client-from-settings",
            })?,
        );

        let persistence: Arc<dyn Storage> = match &settings.persistence {
            PersistenceSettings::Backend => http.clone(),
            PersistenceSettings::Sqlite { database_path } => Arc::new(
                SqliteStorage::open(&database_path.to_string_lossy())
                    .await
                    .context(PersistenceSnafu {
                        stage: "open-sqlite-persistence",
                    })?,
            ),
            PersistenceSettings::Memory => Arc::new(MemoryStorage::new()),
        };

        tracing::info!(
            base_url = %http.base_url(),
            persistence = ?settings.persistence,
            "chat client configured"
        );
        Ok(Self::new(ClientOptions::from(settings), http, persistence))
    }

    pub fn with_observer(mut self, observer: Arc<dyn ChatObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    /// Token that stops the active stream from another task, e.g. a signal handler.
    pub fn cancel_handle(&self) -> Option<CancellationToken> {
        self.active.as_ref().map(|active| active.events.cancel_token())
    }

    /// Merges stored sessions into the list. An untouched startup session gives way to
    /// the most recent stored one.
    pub async fn load_sessions(&mut self) -> ClientResult<()> {
        let records = self
            .persistence
            .list_sessions()
            .await
            .context(PersistenceSnafu {
                stage: "load-sessions",
            })?;
        tracing::info!(session_count = records.len(), "loaded stored sessions");

        self.store.merge_session_records(records);
        if let Some(session_id) = self.store.replace_placeholder_with_stored() {
            self.hydrate_messages(&session_id).await;
        }

        self.notify_sessions();
        let current = self.store.current_session_id().clone();
        self.notify_messages(&current);
        Ok(())
    }

    pub async fn create_session(&mut self, name: Option<&str>) -> SessionId {
        let session_id = self.store.create_session(name);
        self.ensure_persisted(&session_id).await;

        self.notify_sessions();
        self.notify_messages(&session_id);
        session_id
    }

    /// Makes a session current, loading its messages on first visit.
    pub async fn switch_session(&mut self, session_id: &SessionId) -> ClientResult<()> {
        ensure!(
            self.store.switch_session(session_id),
            UnknownSessionSnafu {
                stage: "switch-session",
                session_id: session_id.to_string(),
            }
        );
        self.hydrate_messages(session_id).await;

        self.notify_sessions();
        self.notify_messages(session_id);
        Ok(())
    }

    /// Deletes a session, stopping its stream first. Never leaves the client without one.
    pub async fn delete_session(&mut self, session_id: &SessionId) -> ClientResult<()> {
        ensure!(
            self.store.session(session_id).is_some(),
            UnknownSessionSnafu {
                stage: "delete-session",
                session_id: session_id.to_string(),
            }
        );
        self.abandon_stream_in(session_id);

        let deleted = self
            .store
            .delete_session(session_id)
            .context(UnknownSessionSnafu {
                stage: "delete-session",
                session_id: session_id.to_string(),
            })?;

        if deleted.removed.persisted
            && let Err(error) = self.persistence.delete_session(session_id).await
        {
            tracing::warn!(session_id = %session_id, error = %error, "failed to delete stored session");
        }

        let current = self.store.current_session_id().clone();
        match deleted.replacement {
            Some(replacement) => self.ensure_persisted(&replacement).await,
            None if deleted.was_current => self.hydrate_messages(&current).await,
            None => {}
        }

        self.notify_sessions();
        self.notify_messages(&current);
        Ok(())
    }

    pub async fn rename_session(&mut self, session_id: &SessionId, name: &str) -> ClientResult<()> {
        ensure!(
            self.store.rename_session(session_id, name),
            UnknownSessionSnafu {
                stage: "rename-session",
                session_id: session_id.to_string(),
            }
        );
        self.persist_session_name(session_id).await;
        self.notify_sessions();
        Ok(())
    }

    /// Drops every message of a session, stopping its stream first.
    pub async fn clear_history(&mut self, session_id: &SessionId) -> ClientResult<()> {
        ensure!(
            self.store.session(session_id).is_some(),
            UnknownSessionSnafu {
                stage: "clear-history",
                session_id: session_id.to_string(),
            }
        );
        self.abandon_stream_in(session_id);
        self.store.clear_history(session_id);

        let persisted = self
            .store
            .session(session_id)
            .is_some_and(|session| session.persisted);
        if persisted && let Err(error) = self.persistence.clear_messages(session_id).await {
            tracing::warn!(session_id = %session_id, error = %error, "failed to clear stored messages");
        }

        self.notify_sessions();
        self.notify_messages(session_id);
        Ok(())
    }

    /// Appends the prompt and an assistant placeholder to the current session and starts
    /// streaming the reply. Call [`Self::drive`] to apply the stream after
    /// [`SendOutcome::Started`].
    pub async fn send(&mut self, content: &str) -> SendOutcome {
        let prompt = content.trim();
        if prompt.is_empty() {
            return SendOutcome::Rejected(SendRejection::EmptyPrompt);
        }

        if let Some(active) = &self.active {
            // Single active stream: the new prompt is dropped, nothing is touched.
            tracing::debug!(active = ?active.session.target(), "send rejected while streaming");
            return SendOutcome::Rejected(SendRejection::StreamActive {
                active: active.session.target().clone(),
            });
        }

        let session_id = self.store.current_session_id().clone();
        self.hydrate_messages(&session_id).await;
        self.ensure_persisted(&session_id).await;
        self.apply_auto_title(&session_id, prompt).await;

        let user_message = Message::user(prompt);
        let placeholder = Message::assistant_placeholder();
        self.store.append_message(&session_id, user_message.clone());
        self.store.append_message(&session_id, placeholder.clone());
        self.notify_messages(&session_id);

        self.persist_appended(&session_id, &user_message).await;
        self.persist_appended(&session_id, &placeholder).await;

        let target = StreamTarget::new(session_id, self.next_stream_id);
        // Reserve the next id now so a retry never reuses this target.
        self.next_stream_id = self.next_stream_id.next();
        let mut session = StreamSession::new(target.clone(), placeholder.id);

        let request = ChatRequest::new(target.clone(), prompt);
        match self.backend.stream_chat(request) {
            Ok(handle) => {
                tracing::info!(stream = ?target, backend = %self.backend.id(), "chat stream started");
                let worker = tokio::spawn(handle.worker);
                self.active = Some(ActiveStream {
                    session,
                    events: handle.stream,
                    worker,
                });
                SendOutcome::Started(target)
            }
            Err(error) => {
                tracing::error!(stream = ?target, error = %error, "failed to start chat stream");
                let step = session.fail(transport_failure_message(&error.to_string(), None));
                self.settle(&session, step).await;
                SendOutcome::Failed(target)
            }
        }
    }

    /// Applies events of the active stream until it reaches a terminal state.
    pub async fn drive(&mut self) {
        while let Some(active) = self.active.as_mut() {
            let cancel = active.events.cancel_token();
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = active.events.recv() => Some(event),
            };

            match next {
                None => {
                    self.stop_generation().await;
                }
                Some(Some(event)) => self.handle_stream_event(event).await,
                Some(None) => self.handle_stream_closed().await,
            }
        }
    }

    pub async fn send_and_wait(&mut self, content: &str) -> SendOutcome {
        let outcome = self.send(content).await;
        if outcome.is_started() {
            self.drive().await;
        }
        outcome
    }

    /// Cancels the active stream. Returns `false` when nothing was streaming.
    pub async fn stop_generation(&mut self) -> bool {
        let Some(ActiveStream {
            mut session,
            mut events,
            worker,
        }) = self.active.take()
        else {
            return false;
        };

        events.cancel();
        worker.abort();
        tracing::info!(stream = ?session.target(), "chat stream cancelled");

        let update = session.cancel();
        self.settle(
            &session,
            StreamStep::Finished {
                update,
                refresh_sessions: false,
            },
        )
        .await;
        true
    }

    /// Re-sends the user prompt that precedes an assistant message of the current session.
    pub async fn regenerate(&mut self, message_id: &MessageId) -> ClientResult<SendOutcome> {
        let messages = self.store.current_messages();
        let index = messages
            .iter()
            .position(|message| &message.id == message_id && message.role == Role::Assistant)
            .context(UnknownMessageSnafu {
                stage: "regenerate",
                message_id: message_id.to_string(),
            })?;

        let prompt = index
            .checked_sub(1)
            .and_then(|previous| messages.get(previous))
            .filter(|message| message.role == Role::User)
            .map(|message| message.content.clone())
            .context(NoPromptSnafu {
                stage: "regenerate",
                message_id: message_id.to_string(),
            })?;

        Ok(self.send(&prompt).await)
    }

    async fn handle_stream_event(&mut self, event: StreamEventMapped) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let event_target = event.target.clone();
        match active.session.apply(event) {
            StreamStep::Stale => {
                tracing::debug!(stream = ?event_target, "ignoring stale stream event");
            }
            StreamStep::Progress(update) => {
                let session_id = active.session.target().session_id.clone();
                let message_id = active.session.message_id().clone();
                self.apply_update(&session_id, &message_id, update);
            }
            step @ StreamStep::Finished { .. } => {
                if let Some(active) = self.active.take() {
                    self.settle(&active.session, step).await;
                }
            }
        }
    }

    async fn handle_stream_closed(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        tracing::debug!(stream = ?active.session.target(), "stream worker ended without terminal event");
        let step = active.session.close();
        self.settle(&active.session, step).await;
    }

    async fn settle(&mut self, session: &StreamSession, step: StreamStep) {
        let StreamStep::Finished {
            update,
            refresh_sessions,
        } = step
        else {
            return;
        };

        let session_id = &session.target().session_id;
        tracing::info!(stream = ?session.target(), status = ?update.status, "chat stream settled");

        if self.apply_update(session_id, session.message_id(), update.clone()) {
            let patch = MessagePatch {
                content: Some(update.content),
                status: Some(update.status.into()),
            };
            if let Err(error) = self
                .persistence
                .update_message(session_id, session.message_id(), patch)
                .await
            {
                tracing::warn!(
                    session_id = %session_id,
                    message_id = %session.message_id(),
                    error = %error,
                    "failed to persist final assistant message"
                );
            }
        }

        if refresh_sessions {
            self.refresh_sessions().await;
        }
    }

    fn apply_update(
        &mut self,
        session_id: &SessionId,
        message_id: &MessageId,
        update: MessageUpdate,
    ) -> bool {
        let mut rejection = None;
        let applied = self
            .store
            .modify_message(session_id, message_id, |message| {
                match message.status.advance(update.status) {
                    Ok(status) => {
                        message.status = status;
                        message.content = update.content;
                    }
                    Err(error) => rejection = Some(error),
                }
            });

        if let Some(rejection) = rejection {
            tracing::warn!(message_id = %message_id, rejection = ?rejection, "dropping out-of-order message update");
            return false;
        }
        if applied {
            self.notify_messages(session_id);
        }
        applied
    }

    fn abandon_stream_in(&mut self, session_id: &SessionId) {
        if self
            .active
            .as_ref()
            .is_none_or(|active| &active.session.target().session_id != session_id)
        {
            return;
        }

        if let Some(mut active) = self.active.take() {
            active.events.cancel();
            active.worker.abort();
            tracing::info!(stream = ?active.session.target(), "chat stream abandoned with its session");
        }
    }

    async fn refresh_sessions(&mut self) {
        match self.persistence.list_sessions().await {
            Ok(records) => {
                self.store.merge_session_records(records);
                self.notify_sessions();
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to refresh session list");
            }
        }
    }

    async fn hydrate_messages(&mut self, session_id: &SessionId) {
        let needs_load = self
            .store
            .session(session_id)
            .is_some_and(|session| session.persisted && !session.messages_loaded);
        if !needs_load {
            return;
        }

        let messages = match self.persistence.list_messages(session_id).await {
            Ok(records) => records.into_iter().map(Message::from).collect(),
            Err(error) => {
                // Nothing to show; later sends start from an empty local history.
                tracing::warn!(session_id = %session_id, error = %error, "failed to load stored messages");
                Vec::new()
            }
        };
        tracing::debug!(session_id = %session_id, message_count = messages.len(), "hydrated session");
        self.store.load_messages(session_id, messages);
    }

    async fn ensure_persisted(&mut self, session_id: &SessionId) {
        let Some(session) = self.store.session(session_id) else {
            return;
        };
        if session.persisted {
            return;
        }

        let input = NewSession {
            id: session_id.clone(),
            title: session.name.clone(),
        };
        match self.persistence.create_session(input).await {
            Ok(_) => {
                if let Some(session) = self.store.session_mut(session_id) {
                    session.persisted = true;
                }
            }
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "failed to store session");
            }
        }
    }

    async fn apply_auto_title(&mut self, session_id: &SessionId, prompt: &str) {
        let Some(session) = self.store.session(session_id) else {
            return;
        };
        if session.has_user_messages() || session.name != self.options.default_session_name {
            return;
        }

        let title = auto_title(prompt, self.options.auto_title_max_chars);
        self.store.rename_session(session_id, &title);
        self.persist_session_name(session_id).await;
        self.notify_sessions();
    }

    async fn persist_session_name(&mut self, session_id: &SessionId) {
        let Some(session) = self.store.session(session_id).filter(|session| session.persisted)
        else {
            return;
        };

        let patch = SessionPatch {
            title: Some(session.name.clone()),
        };
        if let Err(error) = self.persistence.update_session(session_id, patch).await {
            tracing::warn!(session_id = %session_id, error = %error, "failed to rename stored session");
        }
    }

    async fn persist_appended(&self, session_id: &SessionId, message: &Message) {
        if let Err(error) = self
            .persistence
            .append_message(session_id, message.to_new_message())
            .await
        {
            tracing::warn!(
                session_id = %session_id,
                message_id = %message.id,
                error = %error,
                "failed to persist message"
            );
        }
    }

    fn notify_messages(&self, session_id: &SessionId) {
        if self.store.current_session_id() == session_id {
            self.observer
                .messages_changed(session_id, self.store.current_messages());
        }
    }

    fn notify_sessions(&self) {
        self.observer
            .sessions_changed(self.store.sessions(), self.store.current_session_id());
    }
}

/// Session name derived from the first prompt, suffixed with `...` when cut.
pub fn auto_title(prompt: &str, max_chars: usize) -> String {
    let mut chars = prompt.trim().chars();
    let title: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{title}...")
    } else {
        title
    }
}
