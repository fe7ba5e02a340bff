use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CorruptRowSnafu, CreateDatabaseDirectorySnafu, MigrateSnafu, OpenDatabaseSnafu, QuerySnafu,
    StorageResult,
};
use super::ids::{MessageId, SessionId};
use super::types::{MessageRecord, MessageRole, NewMessage, now_unix_millis};
use super::{BoxFuture, MessageStore};

const MEMORY_LOCATION: &str = ":memory:";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the message database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    Memory,
    File(PathBuf),
    /// A full `sqlite:` URL, used as given.
    Url(String),
}

impl DatabaseLocation {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == MEMORY_LOCATION {
            Self::Memory
        } else if raw.starts_with("sqlite:") {
            Self::Url(raw.to_string())
        } else {
            Self::File(PathBuf::from(raw))
        }
    }

    fn display_url(&self) -> String {
        match self {
            Self::Memory => "sqlite::memory:".to_string(),
            Self::File(path) => format!("sqlite://{}", path.display()),
            Self::Url(url) => url.clone(),
        }
    }

    fn connect_options(&self) -> StorageResult<SqliteConnectOptions> {
        let options = match self {
            Self::File(path) => {
                create_parent_directory(path)?;
                SqliteConnectOptions::new().filename(path)
            }
            Self::Memory | Self::Url(_) => {
                let url = self.display_url();
                SqliteConnectOptions::from_str(&url).context(OpenDatabaseSnafu {
                    stage: "sqlite-parse-url",
                    database_url: url,
                })?
            }
        };
        Ok(options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT))
    }
}

/// SQLite-backed message log.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    /// Opens (creating when missing) and migrates the database at `location`,
    /// which is a file path, `:memory:` or a `sqlite:` URL.
    pub async fn open(location: &str) -> StorageResult<Self> {
        let location = DatabaseLocation::parse(location);
        let database_url = location.display_url();
        let options = location.connect_options()?;

        // One connection serializes seq allocation and keeps `:memory:` alive.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context(OpenDatabaseSnafu {
                stage: "sqlite-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(MigrateSnafu {
                stage: "sqlite-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "message database ready");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn append(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let session_key = session_id.to_string();
        let mut tx = self.pool.begin().await.context(QuerySnafu {
            stage: "append-begin",
        })?;

        let seq = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?",
        )
        .bind(&session_key)
        .fetch_one(&mut *tx)
        .await
        .context(QuerySnafu {
            stage: "append-allocate-seq",
        })?;

        let record = MessageRecord {
            id: MessageId::new_v7(),
            session_id,
            seq: stored_u64(seq, "append-seq")?,
            role: input.role,
            content: input.content,
            origin_tag: input.origin_tag,
            created_at_unix_ms: now_unix_millis(),
        };

        sqlx::query(
            "INSERT INTO messages (id, session_id, seq, role, content, origin_tag, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&session_key)
        .bind(seq)
        .bind(record.role.as_str())
        .bind(&record.content)
        .bind(&record.origin_tag)
        .bind(i64::try_from(record.created_at_unix_ms).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await
        .context(QuerySnafu {
            stage: "append-insert",
        })?;

        tx.commit().await.context(QuerySnafu {
            stage: "append-commit",
        })?;
        Ok(record)
    }

    async fn recent(
        &self,
        session_id: SessionId,
        limit: usize,
    ) -> StorageResult<Vec<MessageRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, session_id, seq, role, content, origin_tag, created_at FROM messages WHERE session_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(session_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context(QuerySnafu {
            stage: "recent-select",
        })?;

        let mut records = rows
            .into_iter()
            .map(MessageRow::into_record)
            .collect::<StorageResult<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    async fn delete_session(&self, session_id: SessionId) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .context(QuerySnafu {
                stage: "delete-session",
            })?;

        Ok(result.rows_affected())
    }
}

impl MessageStore for SqliteStorage {
    fn append_message<'a>(
        &'a self,
        session_id: SessionId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(self.append(session_id, input))
    }

    fn recent_messages<'a>(
        &'a self,
        session_id: SessionId,
        limit: usize,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(self.recent(session_id, limit))
    }

    fn delete_session_messages<'a>(
        &'a self,
        session_id: SessionId,
    ) -> BoxFuture<'a, StorageResult<u64>> {
        Box::pin(self.delete_session(session_id))
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    seq: i64,
    role: String,
    content: String,
    origin_tag: Option<String>,
    created_at: i64,
}

impl MessageRow {
    fn into_record(self) -> StorageResult<MessageRecord> {
        let role = MessageRole::from_stored(&self.role).context(CorruptRowSnafu {
            stage: "row-role",
            details: format!("unknown role `{}`", self.role),
        })?;
        Ok(MessageRecord {
            id: MessageId::parse(&self.id)?,
            session_id: SessionId::parse(&self.session_id)?,
            seq: stored_u64(self.seq, "row-seq")?,
            role,
            content: self.content,
            origin_tag: self.origin_tag,
            created_at_unix_ms: stored_u64(self.created_at, "row-created-at")?,
        })
    }
}

fn stored_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    u64::try_from(value).ok().context(CorruptRowSnafu {
        stage,
        details: format!("negative value {value}"),
    })
}

fn create_parent_directory(path: &Path) -> StorageResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).context(CreateDatabaseDirectorySnafu {
                stage: "sqlite-create-directory",
                path: parent.display().to_string(),
            })
        }
        _ => Ok(()),
    }
}
