//! Single-flight send pipeline: persist, fetch context, stream, finalize.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use hilo_llm::{
    ChatBackend, ChatRequest, HistoryMessage, ProviderError, ResponseOrigin, Role as WireRole,
    SseDecoder, SseEvent,
};
use hilo_storage::{
    MessageId, MessageRecord, MessageRole, MessageStore, NewMessage, SessionId, StorageError,
    StorageResult,
};
use tokio::sync::oneshot;

use crate::lock::{SendLock, SendPermit};
use crate::message::Message;

pub const DEFAULT_HISTORY_WINDOW: usize = 20;
pub const DEFAULT_DISPLAY_LIMIT: usize = 200;

const USER_MESSAGE_NOT_SAVED: &str = "Your message could not be saved. Please try again.";
const REPLY_NOT_SAVED: &str = "The assistant's reply could not be saved.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Prior messages sent along with each request.
    pub history_window: usize,
    /// Durable messages loaded into the conversation view.
    pub display_limit: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            history_window: DEFAULT_HISTORY_WINDOW,
            display_limit: DEFAULT_DISPLAY_LIMIT,
        }
    }
}

/// Where a dispatch currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPhase {
    #[default]
    Idle,
    LockCheck,
    Persisting,
    HistoryFetch,
    StreamOpen,
    Streaming,
    Finalizing,
    Aborted,
    Failed,
}

impl DispatchPhase {
    /// Returns whether `next` is a legal successor of this phase.
    pub fn allows(self, next: DispatchPhase) -> bool {
        use DispatchPhase::*;

        match (self, next) {
            (Idle | Aborted | Failed | Finalizing, LockCheck) => true,
            (LockCheck, Idle | Persisting) => true,
            (Persisting, HistoryFetch | Failed) => true,
            (HistoryFetch, StreamOpen) => true,
            (StreamOpen, Streaming | Aborted | Failed) => true,
            (Streaming, Finalizing | Aborted | Failed) => true,
            (Finalizing, Idle | Failed) => true,
            (Aborted | Failed, Idle) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Aborted | Self::Failed)
    }
}

/// How one dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed { assistant_persisted: bool },
    Cancelled,
    Failed { message: String },
}

/// Receives progress from a running dispatch.
///
/// Callbacks arrive in pipeline order on the dispatching task.
pub trait DispatchListener: Send + Sync {
    fn dispatch_started(&self);
    fn user_message_persisted(&self, message: Message);
    /// `content` is everything received so far, not just the newest delta.
    fn stream_content(&self, origin: &ResponseOrigin, content: &str);
    fn dispatch_failed(&self, user_message: &str);
    /// `history` is `None` when the durable re-read itself failed.
    fn dispatch_settled(&self, history: Option<Vec<Message>>);
}

struct ActiveStream {
    id: u64,
    cancel: oneshot::Sender<()>,
}

enum StreamEnd {
    Finished,
    Cancelled,
    Failed(ProviderError),
}

pub struct Dispatcher {
    session_id: SessionId,
    lock: Arc<SendLock>,
    storage: Arc<dyn MessageStore>,
    backend: Arc<dyn ChatBackend>,
    config: DispatcherConfig,
    phase: Mutex<DispatchPhase>,
    active_stream: Mutex<Option<ActiveStream>>,
    next_stream_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        session_id: SessionId,
        lock: Arc<SendLock>,
        storage: Arc<dyn MessageStore>,
        backend: Arc<dyn ChatBackend>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            session_id,
            lock,
            storage,
            backend,
            config,
            phase: Mutex::new(DispatchPhase::Idle),
            active_stream: Mutex::new(None),
            next_stream_id: AtomicU64::new(1),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn config(&self) -> DispatcherConfig {
        self.config
    }

    pub fn phase(&self) -> DispatchPhase {
        *lock_unpoisoned(&self.phase)
    }

    pub fn is_streaming(&self) -> bool {
        lock_unpoisoned(&self.active_stream).is_some()
    }

    /// Runs the lock check. `None` means another send is in flight and
    /// nothing was started.
    pub fn begin(&self) -> Option<SendPermit> {
        let Some(permit) = self.lock.try_permit() else {
            tracing::debug!(session_id = %self.session_id, "send rejected, dispatch in flight");
            return None;
        };
        self.enter(DispatchPhase::LockCheck);
        Some(permit)
    }

    /// Cancels the active stream, if any. Returns whether one was cancelled.
    pub fn abort(&self) -> bool {
        let Some(active) = lock_unpoisoned(&self.active_stream).take() else {
            return false;
        };
        tracing::info!(session_id = %self.session_id, stream_id = active.id, "aborting stream");
        let _ = active.cancel.send(());
        true
    }

    pub async fn load_history(&self) -> StorageResult<Vec<Message>> {
        let records = self
            .storage
            .recent_messages(self.session_id, self.config.display_limit)
            .await?;
        Ok(records.into_iter().map(Message::from_record).collect())
    }

    pub async fn clear_history(&self) -> StorageResult<u64> {
        self.abort();
        self.storage.delete_session_messages(self.session_id).await
    }

    /// Drives one dispatch to completion. The permit is held until this returns.
    pub async fn run(
        &self,
        permit: SendPermit,
        text: String,
        listener: &dyn DispatchListener,
    ) -> DispatchOutcome {
        listener.dispatch_started();

        let outcome = self.drive(&permit, &text, listener).await;
        let current = permit.is_current();
        match &outcome {
            DispatchOutcome::Completed {
                assistant_persisted,
            } => {
                tracing::info!(
                    session_id = %self.session_id,
                    assistant_persisted,
                    "dispatch completed"
                );
            }
            DispatchOutcome::Cancelled => {
                tracing::info!(session_id = %self.session_id, "dispatch cancelled");
            }
            DispatchOutcome::Failed { message } if current => listener.dispatch_failed(message),
            DispatchOutcome::Failed { message } => {
                tracing::info!(
                    session_id = %self.session_id,
                    reason = %message,
                    "superseded dispatch failed"
                );
            }
        }
        if !current {
            // The dispatch that reclaimed the lock reconciles for both.
            tracing::debug!(session_id = %self.session_id, "superseded dispatch finished");
            return outcome;
        }

        let history = match self.load_history().await {
            Ok(history) => Some(history),
            Err(error) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    stage = error.stage(),
                    error = %error,
                    "failed to reload history after dispatch"
                );
                None
            }
        };
        listener.dispatch_settled(history);
        self.enter(DispatchPhase::Idle);
        drop(permit);
        outcome
    }

    async fn drive(
        &self,
        permit: &SendPermit,
        text: &str,
        listener: &dyn DispatchListener,
    ) -> DispatchOutcome {
        self.enter(DispatchPhase::Persisting);
        let user_record = match self
            .storage
            .append_message(self.session_id, NewMessage::user(text))
            .await
        {
            Ok(record) => record,
            Err(error) => {
                log_storage_error(self.session_id, &error, "failed to persist user message");
                self.enter(DispatchPhase::Failed);
                return DispatchOutcome::Failed {
                    message: USER_MESSAGE_NOT_SAVED.to_string(),
                };
            }
        };
        let user_message_id = user_record.id;
        listener.user_message_persisted(Message::from_record(user_record));

        self.enter(DispatchPhase::HistoryFetch);
        let history = self.conversation_history(user_message_id).await;

        if !permit.is_current() {
            // The phase and the active stream belong to the new holder.
            tracing::info!(
                session_id = %self.session_id,
                generation = permit.generation(),
                "lock reclaimed before the stream opened"
            );
            return DispatchOutcome::Cancelled;
        }
        self.enter(DispatchPhase::StreamOpen);
        let (stream_id, mut cancel) = self.register_stream();
        let request = ChatRequest::new(text, history);
        let opened = tokio::select! {
            biased;
            _ = &mut cancel => None,
            opened = self.backend.open_stream(request) => Some(opened),
        };
        let response = match opened {
            None => {
                self.finish_stream(stream_id);
                self.enter(DispatchPhase::Aborted);
                return DispatchOutcome::Cancelled;
            }
            Some(Err(error)) => {
                self.finish_stream(stream_id);
                return self.fail_stream(&error);
            }
            Some(Ok(response)) => response,
        };

        self.enter(DispatchPhase::Streaming);
        tracing::debug!(
            session_id = %self.session_id,
            backend = self.backend.id(),
            origin_tag = response.origin.tag.as_deref(),
            "stream opened"
        );
        let origin = response.origin;
        let mut body = response.body;
        let mut decoder = SseDecoder::new();
        let mut content = String::new();

        let end = loop {
            tokio::select! {
                biased;
                _ = &mut cancel => break StreamEnd::Cancelled,
                next = body.next() => match next {
                    Some(Ok(chunk)) => {
                        let events = decoder.push(&chunk);
                        if let Err(error) = apply_events(events, &mut content, &origin, listener) {
                            break StreamEnd::Failed(error);
                        }
                        if decoder.is_finished() {
                            break StreamEnd::Finished;
                        }
                    }
                    Some(Err(error)) => break StreamEnd::Failed(error),
                    None => {
                        let events = decoder.finish();
                        if let Err(error) = apply_events(events, &mut content, &origin, listener) {
                            break StreamEnd::Failed(error);
                        }
                        break StreamEnd::Finished;
                    }
                },
            }
        };
        drop(body);
        self.finish_stream(stream_id);

        match end {
            StreamEnd::Cancelled => {
                self.enter(DispatchPhase::Aborted);
                DispatchOutcome::Cancelled
            }
            StreamEnd::Failed(error) => self.fail_stream(&error),
            StreamEnd::Finished => self.finalize(content, origin).await,
        }
    }

    async fn finalize(&self, content: String, origin: ResponseOrigin) -> DispatchOutcome {
        self.enter(DispatchPhase::Finalizing);
        if content.trim().is_empty() {
            tracing::warn!(session_id = %self.session_id, "stream ended without content");
            return DispatchOutcome::Completed {
                assistant_persisted: false,
            };
        }

        let input = NewMessage::assistant(content, origin.tag);
        match self.storage.append_message(self.session_id, input).await {
            Ok(_) => DispatchOutcome::Completed {
                assistant_persisted: true,
            },
            Err(error) => {
                log_storage_error(self.session_id, &error, "failed to persist assistant reply");
                self.enter(DispatchPhase::Failed);
                DispatchOutcome::Failed {
                    message: REPLY_NOT_SAVED.to_string(),
                }
            }
        }
    }

    /// Prior durable messages, excluding the one just sent.
    async fn conversation_history(&self, sent: MessageId) -> Vec<HistoryMessage> {
        let window = self.config.history_window;
        if window == 0 {
            return Vec::new();
        }

        match self
            .storage
            .recent_messages(self.session_id, window.saturating_add(1))
            .await
        {
            Ok(records) => history_window(records, sent, window),
            Err(error) => {
                log_storage_error(
                    self.session_id,
                    &error,
                    "history fetch failed, sending without context",
                );
                Vec::new()
            }
        }
    }

    fn fail_stream(&self, error: &ProviderError) -> DispatchOutcome {
        tracing::error!(
            session_id = %self.session_id,
            backend = self.backend.id(),
            stage = error.stage(),
            error = %error,
            "chat stream failed"
        );
        self.enter(DispatchPhase::Failed);
        DispatchOutcome::Failed {
            message: error.user_message(),
        }
    }

    fn register_stream(&self) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = oneshot::channel();
        let previous = lock_unpoisoned(&self.active_stream).replace(ActiveStream { id, cancel });
        if let Some(previous) = previous {
            tracing::info!(
                session_id = %self.session_id,
                stream_id = previous.id,
                "cancelling superseded stream"
            );
            let _ = previous.cancel.send(());
        }
        (id, cancelled)
    }

    fn finish_stream(&self, id: u64) {
        let mut active = lock_unpoisoned(&self.active_stream);
        if active.as_ref().is_some_and(|stream| stream.id == id) {
            *active = None;
        }
    }

    fn enter(&self, next: DispatchPhase) {
        let mut phase = lock_unpoisoned(&self.phase);
        let previous = *phase;
        if !previous.allows(next) {
            // Superseded dispatches race on the shared phase.
            tracing::debug!(from = ?previous, to = ?next, "out-of-order dispatch phase");
        }
        *phase = next;
        tracing::trace!(
            session_id = %self.session_id,
            from = ?previous,
            to = ?next,
            "dispatch phase"
        );
    }
}

fn apply_events(
    events: Vec<SseEvent>,
    content: &mut String,
    origin: &ResponseOrigin,
    listener: &dyn DispatchListener,
) -> Result<(), ProviderError> {
    let mut changed = false;
    for event in events {
        match event {
            SseEvent::Delta(delta) => {
                content.push_str(&delta);
                changed = true;
            }
            SseEvent::Error(message) => {
                return Err(ProviderError::Backend {
                    stage: "stream-event",
                    message,
                });
            }
            SseEvent::Done => break,
        }
    }
    if changed {
        listener.stream_content(origin, content);
    }
    Ok(())
}

fn history_window(
    records: Vec<MessageRecord>,
    sent: MessageId,
    window: usize,
) -> Vec<HistoryMessage> {
    let prior: Vec<_> = records
        .into_iter()
        .filter(|record| record.id != sent)
        .collect();
    let skip = prior.len().saturating_sub(window);
    prior
        .into_iter()
        .skip(skip)
        .map(|record| {
            let role = match record.role {
                MessageRole::User => WireRole::User,
                MessageRole::Assistant => WireRole::Assistant,
            };
            HistoryMessage::new(role, record.content)
        })
        .collect()
}

fn log_storage_error(session_id: SessionId, error: &StorageError, what: &'static str) {
    tracing::error!(
        session_id = %session_id,
        stage = error.stage(),
        error = %error,
        "{}",
        what
    );
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, role: MessageRole, content: &str) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            session_id: SessionId::new_v7(),
            seq,
            role,
            content: content.to_string(),
            origin_tag: None,
            created_at_unix_ms: seq,
        }
    }

    #[test]
    fn happy_path_phases_are_legal() {
        use DispatchPhase::*;
        let path = [
            Idle,
            LockCheck,
            Persisting,
            HistoryFetch,
            StreamOpen,
            Streaming,
            Finalizing,
            Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].allows(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn streaming_cannot_skip_back_to_persisting() {
        assert!(!DispatchPhase::Streaming.allows(DispatchPhase::Persisting));
        assert!(!DispatchPhase::Idle.allows(DispatchPhase::Streaming));
        assert!(DispatchPhase::Streaming.allows(DispatchPhase::Aborted));
        assert!(DispatchPhase::Aborted.is_terminal());
    }

    #[test]
    fn history_window_excludes_sent_message_and_keeps_latest() {
        let mut records: Vec<_> = (1..=4)
            .map(|seq| record(seq, MessageRole::User, &format!("m{seq}")))
            .collect();
        let sent = record(5, MessageRole::User, "now");
        let sent_id = sent.id;
        records.push(sent);

        let history = history_window(records, sent_id, 3);
        let contents: Vec<_> = history.iter().map(|item| item.content.as_str()).collect();
        assert_eq!(contents, ["m2", "m3", "m4"]);
    }

    #[test]
    fn history_window_maps_roles() {
        let records = vec![
            record(1, MessageRole::User, "q"),
            record(2, MessageRole::Assistant, "a"),
        ];
        let history = history_window(records, MessageId::new_v7(), 20);
        assert_eq!(history[0].role, WireRole::User);
        assert_eq!(history[1].role, WireRole::Assistant);
    }
}
