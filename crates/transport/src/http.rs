use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tidechat_storage::{
    BoxFuture, MessageId, MessagePatch, MessageRecord, MessageRole, MessageStatus, MessageStore,
    NewMessage, NewSession, SessionId, SessionPatch, SessionRecord, SessionStore, StorageError,
    StorageResult, normalized_title,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BackendError, BackendResult, BackendStreamHandle, BackendWorker, BuildHttpClientSnafu,
    ChatBackend, ChatRequest, DecodeResponseSnafu, EmptyMessageSnafu, InvalidBaseUrlSnafu,
    RequestSnafu, StreamEventMapped, StreamEventPayload, event_channel,
};
use crate::event::preview;
use crate::failure::{FailureKind, transport_failure_message};
use crate::pump::pump_byte_stream;

pub const HTTP_BACKEND_ID: &str = "http";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api/ai";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
/// Upper bound for `request_timeout`; longer values are clamped.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    /// Bounds connecting plus the whole read of one chat stream.
    pub request_timeout: Duration,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim().to_string(),
            request_timeout,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequestBody<'a> {
    message: &'a str,
    session_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody<'a> {
    session_id: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct RenameSessionBody<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDto {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    created_at: Option<u64>,
    #[serde(default)]
    updated_at: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessageDto {
    #[serde(default)]
    id: Option<String>,
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    status: Option<String>,
}

impl SessionDto {
    fn into_record(self) -> StorageResult<SessionRecord> {
        let created_at = self.created_at.unwrap_or_default();
        Ok(SessionRecord {
            id: SessionId::parse(&self.id)?,
            title: normalized_title(self.name.as_deref().unwrap_or_default()),
            created_at_unix_millis: created_at,
            updated_at_unix_millis: self.updated_at.unwrap_or(created_at),
        })
    }
}

impl MessageDto {
    fn into_record(self, session_id: &SessionId, seq: u64) -> Option<MessageRecord> {
        let Some(role) = MessageRole::parse(&self.role) else {
            tracing::warn!(session_id = %session_id, role = %self.role, "skipping message with unknown role");
            return None;
        };

        let id = match self.id.as_deref().map(MessageId::parse) {
            Some(Ok(id)) => id,
            _ => MessageId::generate(),
        };

        Some(MessageRecord {
            id,
            session_id: session_id.clone(),
            seq,
            role,
            content: self.content.unwrap_or_default(),
            // Stored turns are finished; anything left mid-flight is shown as done.
            status: self
                .status
                .as_deref()
                .and_then(MessageStatus::parse)
                .filter(|status| !matches!(status, MessageStatus::Loading | MessageStatus::Streaming))
                .unwrap_or(MessageStatus::Success),
            timestamp_unix_millis: self.timestamp.unwrap_or_default(),
        })
    }
}

/// Chat backend over HTTP: streams `/chat` and manages sessions through the REST endpoints.
#[derive(Debug, Clone)]
pub struct HttpChatBackend {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl HttpChatBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|error| {
            InvalidBaseUrlSnafu {
                stage: "http-backend-new",
                url: config.base_url.clone(),
                details: error.to_string(),
            }
            .build()
        })?;
        ensure!(
            !base_url.cannot_be_a_base(),
            InvalidBaseUrlSnafu {
                stage: "http-backend-new",
                url: config.base_url.clone(),
                details: "url cannot carry a path",
            }
        );

        let client = Client::builder().build().context(BuildHttpClientSnafu {
            stage: "http-backend-new",
        })?;

        let request_timeout = if config.request_timeout.is_zero() {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            config.request_timeout.min(MAX_REQUEST_TIMEOUT)
        };

        Ok(Self {
            client,
            base_url,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn execute(&self, request: RequestBuilder, stage: &'static str) -> BackendResult<Response> {
        let response = request
            .timeout(self.request_timeout)
            .send()
            .await
            .context(RequestSnafu { stage })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(BackendError::UnexpectedStatus {
            stage,
            status: status.as_u16(),
            body: preview(&body),
        })
    }

    async fn execute_json<T>(&self, request: RequestBuilder, stage: &'static str) -> BackendResult<T>
    where
        T: DeserializeOwned,
    {
        self.execute(request, stage)
            .await?
            .json::<T>()
            .await
            .context(DecodeResponseSnafu { stage })
    }

    async fn run_stream_worker(
        client: Client,
        url: Url,
        request: ChatRequest,
        request_timeout: Duration,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        cancel: CancellationToken,
    ) {
        let target = request.target.clone();
        let started = Instant::now();
        let deadline = started
            .checked_add(request_timeout)
            .unwrap_or(started + DEFAULT_REQUEST_TIMEOUT);
        let emit_failure = |message: String| {
            let _ = event_tx.send(StreamEventMapped {
                target: target.clone(),
                payload: StreamEventPayload::TransportError(message),
            });
        };

        let send = client
            .post(url)
            .header(ACCEPT, "text/event-stream")
            .json(&ChatRequestBody {
                message: &request.message,
                session_id: request.target.session_id.as_str(),
            })
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(stream = ?target, "chat request cancelled before response");
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::error!(stream = ?target, "chat request timed out before response");
                emit_failure(FailureKind::Timeout.user_message().to_string());
                return;
            }
            response = send => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(stream = ?target, error = %error, "failed to open chat stream");
                emit_failure(request_failure_message(&error));
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::time::timeout_at(deadline, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            tracing::error!(
                stream = ?target,
                status = status.as_u16(),
                body = %preview(&body),
                "chat stream rejected by backend"
            );
            emit_failure(transport_failure_message(
                &format!("HTTP {}: {body}", status.as_u16()),
                Some(status.as_u16()),
            ));
            return;
        }

        tracing::debug!(stream = ?target, "chat stream opened");
        let outcome = pump_byte_stream(
            target.clone(),
            response.bytes_stream(),
            &event_tx,
            &cancel,
            Some(deadline),
        )
        .await;
        tracing::info!(stream = ?target, outcome = ?outcome, "chat stream finished");
    }
}

fn request_failure_message(error: &reqwest::Error) -> String {
    let kind = if error.is_timeout() {
        FailureKind::Timeout
    } else if error.is_connect() {
        FailureKind::NetworkUnreachable
    } else {
        FailureKind::classify(
            &error.to_string(),
            error.status().map(|status| status.as_u16()),
        )
    };
    kind.user_message().to_string()
}

fn remote_error(stage: &'static str) -> impl FnOnce(BackendError) -> StorageError {
    move |error| StorageError::Remote {
        stage,
        details: error.to_string(),
    }
}

impl ChatBackend for HttpChatBackend {
    fn id(&self) -> &str {
        HTTP_BACKEND_ID
    }

    fn stream_chat(&self, request: ChatRequest) -> BackendResult<BackendStreamHandle> {
        ensure!(
            !request.message.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "stream-chat",
                target: request.target.clone(),
            }
        );

        let (event_tx, stream, cancel) = event_channel(request.target.clone());
        let worker: BackendWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.endpoint(&["chat"]),
            request,
            self.request_timeout,
            event_tx,
            cancel,
        ));

        Ok(BackendStreamHandle { stream, worker })
    }
}

impl SessionStore for HttpChatBackend {
    fn create_session<'a>(
        &'a self,
        input: NewSession,
    ) -> BoxFuture<'a, StorageResult<SessionRecord>> {
        Box::pin(async move {
            let title = normalized_title(&input.title);
            let request = self
                .client
                .post(self.endpoint(&["sessions"]))
                .json(&CreateSessionBody {
                    session_id: input.id.as_str(),
                    name: &title,
                });
            let session: SessionDto = self
                .execute_json(request, "http-session-create")
                .await
                .map_err(remote_error("http-session-create"))?;
            session.into_record()
        })
    }

    fn list_sessions<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<SessionRecord>>> {
        Box::pin(async move {
            let request = self.client.get(self.endpoint(&["sessions"]));
            let sessions: Vec<SessionDto> = self
                .execute_json(request, "http-session-list")
                .await
                .map_err(remote_error("http-session-list"))?;

            let mut records = Vec::with_capacity(sessions.len());
            for session in sessions {
                match session.into_record() {
                    Ok(record) => records.push(record),
                    Err(error) => {
                        tracing::warn!(error = %error, "skipping session with invalid id");
                    }
                }
            }
            records.sort_by(|left, right| {
                right
                    .updated_at_unix_millis
                    .cmp(&left.updated_at_unix_millis)
            });
            Ok(records)
        })
    }

    fn update_session<'a>(
        &'a self,
        session_id: &'a SessionId,
        patch: SessionPatch,
    ) -> BoxFuture<'a, StorageResult<SessionRecord>> {
        Box::pin(async move {
            if let Some(title) = patch.title {
                let title = normalized_title(&title);
                let request = self
                    .client
                    .put(self.endpoint(&["sessions", session_id.as_str(), "rename"]))
                    .json(&RenameSessionBody { name: &title });
                self.execute(request, "http-session-rename")
                    .await
                    .map_err(remote_error("http-session-rename"))?;
            }

            // The rename endpoint answers with plain text; read the record back.
            self.list_sessions()
                .await?
                .into_iter()
                .find(|session| &session.id == session_id)
                .ok_or_else(|| StorageError::NotFound {
                    stage: "http-session-update",
                    entity: "session",
                    id: session_id.to_string(),
                })
        })
    }

    fn delete_session<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let request = self
                .client
                .delete(self.endpoint(&["sessions", session_id.as_str()]));
            self.execute(request, "http-session-delete")
                .await
                .map_err(remote_error("http-session-delete"))?;
            Ok(())
        })
    }
}

impl MessageStore for HttpChatBackend {
    fn append_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            tracing::trace!(
                session_id = %session_id,
                message_id = %input.id,
                "chat turns are stored by the backend; acknowledging locally"
            );
            Ok(MessageRecord {
                id: input.id,
                session_id: session_id.clone(),
                seq: 0,
                role: input.role,
                content: input.content,
                status: input.status,
                timestamp_unix_millis: input.timestamp_unix_millis,
            })
        })
    }

    fn list_messages<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.endpoint(&["sessions", session_id.as_str(), "messages"]));
            let messages: Vec<MessageDto> = self
                .execute_json(request, "http-message-list")
                .await
                .map_err(remote_error("http-message-list"))?;

            Ok(messages
                .into_iter()
                .enumerate()
                .filter_map(|(index, message)| message.into_record(session_id, index as u64 + 1))
                .collect())
        })
    }

    fn update_message<'a>(
        &'a self,
        _session_id: &'a SessionId,
        _message_id: &'a MessageId,
        _patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn clear_messages<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let request = self
                .client
                .delete(self.endpoint(&["history", session_id.as_str()]));
            self.execute(request, "http-message-clear")
                .await
                .map_err(remote_error("http-message-clear"))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::backend::{StreamId, StreamTarget};

    const SPRING_STREAM_RESPONSE: &str = concat!(
        "HTTP/1.1 200 OK\r\n",
        "Content-Type: text/event-stream\r\n",
        "Connection: close\r\n\r\n",
        "event:message\ndata:data:{\"content\":\"He\"}\n\n",
        "event:message\ndata:{\"content\":\"llo\",\"done\":false}\n\n",
        "event:message\ndata:{\"done\":true}\n\n",
    );

    const SERVER_ERROR_RESPONSE: &str = concat!(
        "HTTP/1.1 500 Internal Server Error\r\n",
        "Content-Type: text/plain\r\n",
        "Content-Length: 4\r\n",
        "Connection: close\r\n\r\n",
        "boom",
    );

    const RATE_LIMITED_RESPONSE: &str = concat!(
        "HTTP/1.1 429 Too Many Requests\r\n",
        "Content-Type: text/plain\r\n",
        "Content-Length: 9\r\n",
        "Connection: close\r\n\r\n",
        "slow down",
    );

    fn backend(base_url: &str) -> HttpChatBackend {
        HttpChatBackend::new(BackendConfig::new(base_url, Duration::from_secs(5))).unwrap()
    }

    /// Reads one request, headers plus a `Content-Length` body.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 1024];
        loop {
            let read = socket.read(&mut chunk).await.unwrap();
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);

            let text = String::from_utf8_lossy(&buffer);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let body_len = text[..header_end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buffer.len() >= header_end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Answers a single connection with `reply` and returns the raw request it received.
    async fn serve_once(reply: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/api/ai", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            request
        });
        (base_url, server)
    }

    /// Runs the stream worker to completion and returns every payload it emitted.
    async fn stream_payloads(backend: &HttpChatBackend, message: &str) -> Vec<StreamEventPayload> {
        let target = StreamTarget::new(SessionId::generate(), StreamId::new(1));
        let BackendStreamHandle { mut stream, worker } = backend
            .stream_chat(ChatRequest::new(target.clone(), message))
            .unwrap();
        worker.await;

        let mut payloads = Vec::new();
        while let Some(event) = stream.recv().await {
            assert_eq!(event.target, target);
            payloads.push(event.payload);
        }
        payloads
    }

    #[tokio::test]
    async fn spring_event_stream_is_decoded() {
        let (base_url, server) = serve_once(SPRING_STREAM_RESPONSE).await;

        let payloads = stream_payloads(&backend(&base_url), "hello").await;

        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::Delta("He".to_string()),
                StreamEventPayload::Delta("llo".to_string()),
                StreamEventPayload::Done,
            ]
        );
        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("post /api/ai/chat http/1.1"));
        assert!(request.contains("accept: text/event-stream"));
        assert!(request.contains(r#""message":"hello""#));
        assert!(request.contains(r#""sessionid":"session_"#));
    }

    #[tokio::test]
    async fn server_fault_status_becomes_transport_error() {
        let (base_url, _server) = serve_once(SERVER_ERROR_RESPONSE).await;

        let payloads = stream_payloads(&backend(&base_url), "hello").await;

        assert_eq!(
            payloads,
            vec![StreamEventPayload::TransportError(
                FailureKind::ServerFault.user_message().to_string()
            )]
        );
    }

    #[tokio::test]
    async fn rate_limited_status_becomes_transport_error() {
        let (base_url, _server) = serve_once(RATE_LIMITED_RESPONSE).await;

        let payloads = stream_payloads(&backend(&base_url), "hello").await;

        assert_eq!(
            payloads,
            vec![StreamEventPayload::TransportError(
                FailureKind::RateLimited.user_message().to_string()
            )]
        );
    }

    #[tokio::test]
    async fn refused_connection_is_reported_as_network_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let payloads = stream_payloads(&backend(&format!("http://{address}/api/ai")), "hello").await;

        assert_eq!(
            payloads,
            vec![StreamEventPayload::TransportError(
                FailureKind::NetworkUnreachable.user_message().to_string()
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_hits_request_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/api/ai", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            std::future::pending::<()>().await;
        });
        let backend =
            HttpChatBackend::new(BackendConfig::new(base_url, Duration::from_secs(2))).unwrap();

        let payloads = stream_payloads(&backend, "hello").await;

        assert_eq!(
            payloads,
            vec![StreamEventPayload::TransportError(
                FailureKind::Timeout.user_message().to_string()
            )]
        );
    }

    #[test]
    fn oversized_timeout_is_clamped() {
        let backend =
            HttpChatBackend::new(BackendConfig::new(DEFAULT_BASE_URL, Duration::MAX)).unwrap();
        assert_eq!(backend.request_timeout, MAX_REQUEST_TIMEOUT);
    }

    #[test]
    fn endpoints_extend_base_path() {
        let backend = backend("http://localhost:8080/api/ai/");

        assert_eq!(
            backend.endpoint(&["chat"]).as_str(),
            "http://localhost:8080/api/ai/chat"
        );
        assert_eq!(
            backend
                .endpoint(&["sessions", "session_01", "rename"])
                .as_str(),
            "http://localhost:8080/api/ai/sessions/session_01/rename"
        );
    }

    #[test]
    fn rejects_unusable_base_url() {
        assert!(matches!(
            HttpChatBackend::new(BackendConfig::new("not a url", DEFAULT_REQUEST_TIMEOUT)),
            Err(BackendError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            HttpChatBackend::new(BackendConfig::new("mailto:ops@example.com", DEFAULT_REQUEST_TIMEOUT)),
            Err(BackendError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        let backend = HttpChatBackend::new(BackendConfig::new(DEFAULT_BASE_URL, Duration::ZERO)).unwrap();
        assert_eq!(backend.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn chat_body_uses_camel_case() {
        let body = serde_json::to_value(ChatRequestBody {
            message: "hi",
            session_id: "session_1",
        })
        .unwrap();

        assert_eq!(body, serde_json::json!({"message": "hi", "sessionId": "session_1"}));
    }

    #[test]
    fn empty_prompt_is_rejected_before_any_request() {
        let backend = backend(DEFAULT_BASE_URL);
        let target = StreamTarget::new(SessionId::generate(), StreamId::new(1));

        assert!(matches!(
            backend.stream_chat(ChatRequest::new(target, "   ")),
            Err(BackendError::EmptyMessage { .. })
        ));
    }

    #[test]
    fn session_listing_maps_server_records() {
        let sessions: Vec<SessionDto> = serde_json::from_str(
            r#"[{"id":"session_a","name":"","createdAt":10,"updatedAt":20,"messageCount":2,"preview":"hi"}]"#,
        )
        .unwrap();
        let record = sessions.into_iter().next().unwrap().into_record().unwrap();

        assert_eq!(record.id.as_str(), "session_a");
        assert_eq!(record.title, "New Chat");
        assert_eq!(record.updated_at_unix_millis, 20);
    }

    #[test]
    fn message_listing_settles_in_flight_statuses() {
        let session_id = SessionId::parse("session_a").unwrap();
        let messages: Vec<MessageDto> = serde_json::from_str(
            r#"[
                {"id":"m1","role":"user","content":"hi","timestamp":1,"status":"success"},
                {"id":"m2","role":"assistant","content":"partial","timestamp":2,"status":"streaming"},
                {"id":"m3","role":"tool","content":"?","timestamp":3}
            ]"#,
        )
        .unwrap();

        let records: Vec<_> = messages
            .into_iter()
            .enumerate()
            .filter_map(|(index, message)| message.into_record(&session_id, index as u64 + 1))
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, MessageStatus::Success);
        assert_eq!(records[1].content, "partial");
    }
}
