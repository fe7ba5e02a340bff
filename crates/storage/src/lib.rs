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
pub use sqlite::{DatabaseLocation, SqliteStorage};
pub use types::{MessageRecord, MessageRole, NewMessage};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Append-only durable message log, scoped by session.
///
/// Implementations must be read-after-write consistent: a `recent_messages` call issued
/// after `append_message` resolves includes the appended record.
pub trait MessageStore: Send + Sync {
    fn append_message<'a>(
        &'a self,
        session_id: SessionId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;

    /// Returns the most recent `limit` records, oldest first.
    fn recent_messages<'a>(
        &'a self,
        session_id: SessionId,
        limit: usize,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;

    /// Deletes every record of the session and returns how many were removed.
    fn delete_session_messages<'a>(
        &'a self,
        session_id: SessionId,
    ) -> BoxFuture<'a, StorageResult<u64>>;
}
