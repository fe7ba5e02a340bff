//! Reactive conversation state for one chat session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use arc_swap::ArcSwap;
use hilo_llm::{ChatBackend, ResponseOrigin};
use hilo_storage::{MessageStore, SessionId};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::dispatcher::{DispatchListener, DispatchOutcome, Dispatcher, DispatcherConfig};
use crate::lock::SendLock;
use crate::message::{ConversationSnapshot, Message};

pub type SnapshotListener = Arc<dyn Fn(&Arc<ConversationSnapshot>) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

const DISPATCH_TASK_LOST: &str = "The message could not be sent.";

/// Result of a send attempt. Only `Dispatched` started any work.
#[derive(Debug)]
pub enum SendStatus {
    Dispatched(SendHandle),
    /// Input was empty after trimming.
    Empty,
    /// Another send holds the lock.
    Busy,
    /// No tokio runtime was available to run the dispatch.
    NoRuntime,
}

impl SendStatus {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Self::Dispatched(_))
    }

    /// Waits for the dispatch when one was started.
    pub async fn wait(self) -> Option<DispatchOutcome> {
        match self {
            Self::Dispatched(handle) => Some(handle.wait().await),
            Self::Empty | Self::Busy | Self::NoRuntime => None,
        }
    }
}

#[derive(Debug)]
pub struct SendHandle {
    task: JoinHandle<DispatchOutcome>,
}

impl SendHandle {
    pub async fn wait(self) -> DispatchOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(error) if error.is_cancelled() => DispatchOutcome::Cancelled,
            Err(error) => {
                tracing::error!(error = %error, "dispatch task panicked");
                DispatchOutcome::Failed {
                    message: DISPATCH_TASK_LOST.to_string(),
                }
            }
        }
    }
}

pub struct ChatStoreBuilder {
    session_id: SessionId,
    storage: Arc<dyn MessageStore>,
    backend: Arc<dyn ChatBackend>,
    lock: Option<Arc<SendLock>>,
    config: DispatcherConfig,
    on_error: Option<ErrorCallback>,
}

impl ChatStoreBuilder {
    pub fn new(
        session_id: SessionId,
        storage: Arc<dyn MessageStore>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        Self {
            session_id,
            storage,
            backend,
            lock: None,
            config: DispatcherConfig::default(),
            on_error: None,
        }
    }

    /// Shares a send lock with other stores. Without it the store gets its own.
    pub fn lock(mut self, lock: Arc<SendLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Called with a user-presentable message for every failure except cancellation.
    pub fn on_error(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> ChatStore {
        let lock = self.lock.unwrap_or_else(|| Arc::new(SendLock::new()));
        let dispatcher = Dispatcher::new(
            self.session_id,
            lock,
            self.storage,
            self.backend,
            self.config,
        );
        ChatStore {
            inner: Arc::new(StoreInner {
                dispatcher,
                snapshot: ArcSwap::from_pointee(ConversationSnapshot::empty()),
                write_guard: Mutex::new(()),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(1),
                load_requested: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                on_error: self.on_error,
            }),
        }
    }
}

/// Cheap to clone. Clones share state.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    dispatcher: Dispatcher,
    snapshot: ArcSwap<ConversationSnapshot>,
    write_guard: Mutex<()>,
    subscribers: Mutex<Vec<(u64, SnapshotListener)>>,
    next_subscriber_id: AtomicU64,
    load_requested: AtomicBool,
    /// Bumped under the write guard whenever a dispatch or clear rewrites the view.
    epoch: AtomicU64,
    on_error: Option<ErrorCallback>,
}

impl ChatStore {
    pub fn builder(
        session_id: SessionId,
        storage: Arc<dyn MessageStore>,
        backend: Arc<dyn ChatBackend>,
    ) -> ChatStoreBuilder {
        ChatStoreBuilder::new(session_id, storage, backend)
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.dispatcher.session_id()
    }

    /// Returns the same `Arc` until the state actually changes.
    pub fn snapshot(&self) -> Arc<ConversationSnapshot> {
        self.inner.snapshot.load_full()
    }

    /// Registers a listener for every published snapshot.
    ///
    /// The first subscription triggers the initial history load when called
    /// inside a tokio runtime.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe(
        &self,
        listener: impl Fn(&Arc<ConversationSnapshot>) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        lock_unpoisoned(&self.inner.subscribers).push((id, Arc::new(listener)));

        if let Ok(runtime) = Handle::try_current() {
            if !self.inner.load_requested.swap(true, Ordering::AcqRel) {
                let store = self.clone();
                runtime.spawn(async move { store.load().await });
            }
        }

        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Loads durable history into the snapshot.
    ///
    /// Dropped when a dispatch or clear touched the view while storage was
    /// being read. Their own reconciliation is newer.
    pub async fn load(&self) {
        self.inner.load_requested.store(true, Ordering::Release);
        let epoch = self.inner.epoch.load(Ordering::Acquire);
        let messages = match self.inner.dispatcher.load_history().await {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(
                    session_id = %self.session_id(),
                    stage = error.stage(),
                    error = %error,
                    "failed to load conversation history"
                );
                return;
            }
        };

        self.inner.update(|current| {
            if self.inner.epoch.load(Ordering::Acquire) != epoch
                || current.is_loading
                || current.streaming_message().is_some()
            {
                tracing::debug!(session_id = %self.session_id(), "history load superseded");
                return None;
            }
            Some(ConversationSnapshot::from_history(messages, false))
        });
    }

    /// Starts a dispatch unless the input is empty or a send is in flight.
    ///
    /// The lock check completes before this returns.
    pub fn send(&self, text: &str) -> SendStatus {
        let text = text.trim();
        if text.is_empty() {
            return SendStatus::Empty;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::error!("send called outside a tokio runtime");
            return SendStatus::NoRuntime;
        };
        let Some(permit) = self.inner.dispatcher.begin() else {
            return SendStatus::Busy;
        };

        let inner = Arc::clone(&self.inner);
        let text = text.to_string();
        let task = runtime.spawn(async move {
            let listener: &StoreInner = &inner;
            inner.dispatcher.run(permit, text, listener).await
        });
        SendStatus::Dispatched(SendHandle { task })
    }

    /// Cancels an active stream without reporting an error.
    pub fn abort(&self) -> bool {
        self.inner.dispatcher.abort()
    }

    /// Aborts any stream, deletes the session history and resets the view.
    ///
    /// Storage failures are logged and leave the view reset.
    pub async fn clear(&self) {
        let session_id = self.session_id();
        match self.inner.dispatcher.clear_history().await {
            Ok(deleted) => {
                tracing::info!(session_id = %session_id, deleted, "conversation cleared");
            }
            Err(error) => tracing::warn!(
                session_id = %session_id,
                stage = error.stage(),
                error = %error,
                "failed to delete conversation history"
            ),
        }
        self.inner.update(|_| {
            self.inner.bump_epoch();
            Some(ConversationSnapshot::empty())
        });
    }
}

impl StoreInner {
    /// Applies `change` under the write guard and notifies outside it.
    fn update(&self, change: impl FnOnce(&ConversationSnapshot) -> Option<ConversationSnapshot>) {
        let published = {
            let _guard = lock_unpoisoned(&self.write_guard);
            let current = self.snapshot.load();
            let Some(next) = change(&current) else {
                return;
            };
            if next == **current {
                return;
            }
            let next = Arc::new(next);
            self.snapshot.store(Arc::clone(&next));
            next
        };
        self.notify(&published);
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn notify(&self, snapshot: &Arc<ConversationSnapshot>) {
        let listeners: Vec<SnapshotListener> = lock_unpoisoned(&self.subscribers)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }

    fn unsubscribe(&self, id: u64) {
        lock_unpoisoned(&self.subscribers).retain(|(existing, _)| *existing != id);
    }
}

impl DispatchListener for StoreInner {
    fn dispatch_started(&self) {
        self.update(|current| {
            self.bump_epoch();
            Some(current.with_loading(true))
        });
    }

    fn user_message_persisted(&self, message: Message) {
        self.update(|current| Some(current.with_durable(message)));
    }

    fn stream_content(&self, origin: &ResponseOrigin, content: &str) {
        self.update(|current| Some(current.with_streaming(origin, content)));
    }

    fn dispatch_failed(&self, user_message: &str) {
        self.update(|current| Some(current.without_streaming()));
        if let Some(on_error) = &self.on_error {
            on_error(user_message);
        }
    }

    fn dispatch_settled(&self, history: Option<Vec<Message>>) {
        self.update(|current| {
            self.bump_epoch();
            match history {
                Some(history) => Some(ConversationSnapshot::from_history(history, false)),
                None => Some(current.without_streaming().with_loading(false)),
            }
        });
    }
}

/// Listener registration. Unsubscribes on drop.
pub struct Subscription {
    store: Weak<StoreInner>,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Safe to call more than once, including from inside a listener.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
