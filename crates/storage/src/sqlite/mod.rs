use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{MessageId, SessionId};
use super::types::{
    MessagePatch, MessageRecord, MessageRole, MessageStatus, NewMessage, NewSession,
    SessionPatch, SessionRecord, normalized_title, unix_timestamp_millis,
};
use super::{BoxFuture, MessageStore, SessionStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single connection keeps `sqlite::memory:` databases shared across calls.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "opened sqlite chat storage");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_session(
        &self,
        session_id: &SessionId,
        stage: &'static str,
    ) -> StorageResult<SessionRecord> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?",
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu { stage })?
        .context(NotFoundSnafu {
            stage,
            entity: "session",
            id: session_id.to_string(),
        })?;

        session_row_to_record(row)
    }
}

impl SessionStore for SqliteStorage {
    fn create_session<'a>(
        &'a self,
        input: NewSession,
    ) -> BoxFuture<'a, StorageResult<SessionRecord>> {
        Box::pin(async move {
            let now = u64_to_i64(unix_timestamp_millis(), "session-create-now")?;
            let title = normalized_title(&input.title);

            sqlx::query(
                "INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(input.id.as_str())
            .bind(title.as_str())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-create-insert",
            })?;

            Ok(SessionRecord {
                id: input.id,
                title,
                created_at_unix_millis: i64_to_u64(now, "session-create-created-at")?,
                updated_at_unix_millis: i64_to_u64(now, "session-create-updated-at")?,
            })
        })
    }

    fn list_sessions<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<SessionRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, SessionRow>(
                "SELECT id, title, created_at, updated_at FROM sessions ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-list-query",
            })?;

            rows.into_iter().map(session_row_to_record).collect()
        })
    }

    fn update_session<'a>(
        &'a self,
        session_id: &'a SessionId,
        patch: SessionPatch,
    ) -> BoxFuture<'a, StorageResult<SessionRecord>> {
        Box::pin(async move {
            let now = u64_to_i64(unix_timestamp_millis(), "session-update-now")?;
            let update_result = sqlx::query(
                "UPDATE sessions SET title = COALESCE(?, title), updated_at = ? WHERE id = ?",
            )
            .bind(patch.title.as_deref().map(normalized_title))
            .bind(now)
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-update-apply",
            })?;

            ensure!(
                update_result.rows_affected() > 0,
                NotFoundSnafu {
                    stage: "session-update-missing",
                    entity: "session",
                    id: session_id.to_string(),
                }
            );

            self.load_session(session_id, "session-update-load").await
        })
    }

    fn delete_session<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            // Messages go with the session through ON DELETE CASCADE.
            let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(session_id.as_str())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "session-delete-apply",
                })?;

            ensure!(
                result.rows_affected() > 0,
                NotFoundSnafu {
                    stage: "session-delete-missing",
                    entity: "session",
                    id: session_id.to_string(),
                }
            );
            Ok(())
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            self.load_session(session_id, "message-append-load-session")
                .await?;

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            let next_seq = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?",
            )
            .bind(session_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-next-seq",
            })?;

            let timestamp = u64_to_i64(input.timestamp_unix_millis, "message-append-timestamp")?;
            sqlx::query(
                "INSERT INTO messages (id, session_id, seq, role, content, status, timestamp, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(input.id.as_str())
            .bind(session_id.as_str())
            .bind(next_seq)
            .bind(input.role.as_str())
            .bind(input.content.as_str())
            .bind(input.status.as_str())
            .bind(timestamp)
            .bind(timestamp)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            sqlx::query("UPDATE sessions SET updated_at = MAX(updated_at, ?) WHERE id = ?")
                .bind(timestamp)
                .bind(session_id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-append-touch-session",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            Ok(MessageRecord {
                id: input.id,
                session_id: session_id.clone(),
                seq: i64_to_u64(next_seq, "message-append-seq")?,
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
            self.load_session(session_id, "message-list-load-session")
                .await?;

            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, session_id, seq, role, content, status, timestamp FROM messages WHERE session_id = ? ORDER BY seq ASC, id ASC",
            )
            .bind(session_id.as_str())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn update_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        message_id: &'a MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let now = u64_to_i64(unix_timestamp_millis(), "message-update-now")?;
            let update_result = sqlx::query(
                "UPDATE messages SET content = COALESCE(?, content), status = COALESCE(?, status), updated_at = ? WHERE session_id = ? AND id = ?",
            )
            .bind(patch.content)
            .bind(patch.status.map(|status| status.as_str()))
            .bind(now)
            .bind(session_id.as_str())
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-update-apply",
            })?;

            ensure!(
                update_result.rows_affected() > 0,
                NotFoundSnafu {
                    stage: "message-update-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
            );
            Ok(())
        })
    }

    fn clear_messages<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.load_session(session_id, "message-clear-load-session")
                .await?;

            sqlx::query("DELETE FROM messages WHERE session_id = ?")
                .bind(session_id.as_str())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-clear-apply",
                })?;
            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    seq: i64,
    role: String,
    content: String,
    status: String,
    timestamp: i64,
}

fn session_row_to_record(row: SessionRow) -> StorageResult<SessionRecord> {
    Ok(SessionRecord {
        id: SessionId::parse(&row.id)?,
        title: row.title,
        created_at_unix_millis: i64_to_u64(row.created_at, "session-row-created-at")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "session-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        session_id: SessionId::parse(&row.session_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: MessageRole::parse(&row.role).context(InvariantViolationSnafu {
            stage: "message-row-role",
            details: format!("unknown message role '{}'", row.role),
        })?,
        content: row.content,
        status: MessageStatus::parse(&row.status).context(InvariantViolationSnafu {
            stage: "message-row-status",
            details: format!("unknown message status '{}'", row.status),
        })?,
        timestamp_unix_millis: i64_to_u64(row.timestamp, "message-row-timestamp")?,
    })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_SESSION_TITLE;

    async fn open_temp_storage() -> (tempfile::TempDir, SqliteStorage) {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join("chat.sqlite3");
        let storage = SqliteStorage::open(path.to_str().unwrap()).await.unwrap();
        (directory, storage)
    }

    fn new_message(role: MessageRole, content: &str, status: MessageStatus) -> NewMessage {
        NewMessage {
            id: MessageId::generate(),
            role,
            content: content.to_string(),
            status,
            timestamp_unix_millis: unix_timestamp_millis(),
        }
    }

    #[test]
    fn database_urls_are_normalized() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
        assert_eq!(normalize_database_url("data/chat.db"), "sqlite://data/chat.db");
    }

    #[tokio::test]
    async fn sessions_survive_reopen() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("chat.sqlite3");
        let location = path.to_str().unwrap().to_string();
        let session_id = SessionId::generate();

        {
            let storage = SqliteStorage::open(&location).await.unwrap();
            storage
                .create_session(NewSession {
                    id: session_id.clone(),
                    title: String::new(),
                })
                .await
                .unwrap();
            storage.pool().close().await;
        }

        let reopened = SqliteStorage::open(&location).await.unwrap();
        let sessions = reopened.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session_id);
        assert_eq!(sessions[0].title, DEFAULT_SESSION_TITLE);
    }

    #[tokio::test]
    async fn message_lifecycle_is_persisted() {
        let (_directory, storage) = open_temp_storage().await;
        let session_id = SessionId::generate();
        storage
            .create_session(NewSession {
                id: session_id.clone(),
                title: "Streaming".to_string(),
            })
            .await
            .unwrap();

        storage
            .append_message(
                &session_id,
                new_message(MessageRole::User, "Hello?", MessageStatus::Success),
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
        assert_eq!(assistant.seq, 2);

        storage
            .update_message(
                &session_id,
                &assistant.id,
                MessagePatch {
                    content: Some("Hi!".to_string()),
                    status: Some(MessageStatus::Success),
                },
            )
            .await
            .unwrap();

        let messages = storage.list_messages(&session_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].content, "Hi!");
        assert_eq!(messages[1].status, MessageStatus::Success);

        storage.clear_messages(&session_id).await.unwrap();
        assert!(storage.list_messages(&session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_session_cascades_to_messages() {
        let storage = SqliteStorage::open(":memory:").await.unwrap();
        let session_id = SessionId::generate();
        storage
            .create_session(NewSession {
                id: session_id.clone(),
                title: "gone soon".to_string(),
            })
            .await
            .unwrap();
        storage
            .append_message(
                &session_id,
                new_message(MessageRole::User, "bye", MessageStatus::Success),
            )
            .await
            .unwrap();

        storage.delete_session(&session_id).await.unwrap();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        assert!(matches!(
            storage.list_messages(&session_id).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn renaming_unknown_session_is_not_found() {
        let storage = SqliteStorage::open(":memory:").await.unwrap();
        let result = storage
            .update_session(
                &SessionId::generate(),
                SessionPatch {
                    title: Some("nope".to_string()),
                },
            )
            .await;

        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }
}
