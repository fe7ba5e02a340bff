//! Process-local message store used by tests and `:memory:`-style ephemeral sessions.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use snafu::OptionExt;

use super::error::{StorageResult, UnavailableSnafu};
use super::ids::{MessageId, SessionId};
use super::types::{MessageRecord, NewMessage, now_unix_millis};
use super::{BoxFuture, MessageStore};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    sessions: Mutex<HashMap<SessionId, Vec<MessageRecord>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(
        &self,
        stage: &'static str,
    ) -> StorageResult<MutexGuard<'_, HashMap<SessionId, Vec<MessageRecord>>>> {
        self.sessions.lock().ok().context(UnavailableSnafu {
            stage,
            details: "memory store mutex poisoned".to_string(),
        })
    }

    fn append(&self, session_id: SessionId, input: NewMessage) -> StorageResult<MessageRecord> {
        let mut sessions = self.sessions("memory-append-lock")?;
        let records = sessions.entry(session_id).or_default();
        let seq = records.last().map_or(1, |record| record.seq + 1);
        let record = MessageRecord {
            id: MessageId::new_v7(),
            session_id,
            seq,
            role: input.role,
            content: input.content,
            origin_tag: input.origin_tag,
            created_at_unix_ms: now_unix_millis(),
        };
        records.push(record.clone());
        Ok(record)
    }

    fn recent(&self, session_id: SessionId, limit: usize) -> StorageResult<Vec<MessageRecord>> {
        let sessions = self.sessions("memory-recent-lock")?;
        let Some(records) = sessions.get(&session_id) else {
            return Ok(Vec::new());
        };
        let start = records.len().saturating_sub(limit);
        Ok(records[start..].to_vec())
    }

    fn delete_session(&self, session_id: SessionId) -> StorageResult<u64> {
        let mut sessions = self.sessions("memory-delete-lock")?;
        Ok(sessions
            .remove(&session_id)
            .map_or(0, |records| records.len() as u64))
    }
}

impl MessageStore for MemoryStorage {
    fn append_message<'a>(
        &'a self,
        session_id: SessionId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move { self.append(session_id, input) })
    }

    fn recent_messages<'a>(
        &'a self,
        session_id: SessionId,
        limit: usize,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move { self.recent(session_id, limit) })
    }

    fn delete_session_messages<'a>(
        &'a self,
        session_id: SessionId,
    ) -> BoxFuture<'a, StorageResult<u64>> {
        Box::pin(async move { self.delete_session(session_id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageRole;

    #[tokio::test]
    async fn sequences_are_per_session() {
        let storage = MemoryStorage::new();
        let a = SessionId::new_v7();
        let b = SessionId::new_v7();

        storage.append_message(a, NewMessage::user("one")).await.unwrap();
        let second = storage.append_message(a, NewMessage::user("two")).await.unwrap();
        let other = storage.append_message(b, NewMessage::user("x")).await.unwrap();

        assert_eq!(second.seq, 2);
        assert_eq!(other.seq, 1);
    }

    #[tokio::test]
    async fn recent_window_and_delete() {
        let storage = MemoryStorage::new();
        let session = SessionId::new_v7();
        for index in 0..4 {
            storage
                .append_message(session, NewMessage::assistant(format!("r{index}"), None))
                .await
                .unwrap();
        }

        let window = storage.recent_messages(session, 3).await.unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].content, "r1");
        assert!(window.iter().all(|record| record.role == MessageRole::Assistant));

        assert_eq!(storage.delete_session_messages(session).await.unwrap(), 4);
        assert!(storage.recent_messages(session, 3).await.unwrap().is_empty());
    }
}
