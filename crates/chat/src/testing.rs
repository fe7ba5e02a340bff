//! Scripted collaborators for dispatcher and store tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use hilo_llm::{
    BackendResponse, BoxFuture, ChatBackend, ChatRequest, ProviderError, ProviderResult,
    ResponseOrigin,
};
use hilo_storage::{
    MemoryStorage, MessageRecord, MessageRole, MessageStore, NewMessage, SessionId, StorageError,
    StorageResult,
};
use tokio::sync::{mpsc, oneshot};

use crate::message::ConversationSnapshot;
use crate::store::ChatStore;

pub(crate) const DONE: &str = "data: [DONE]\n\n";

pub(crate) fn delta(text: &str) -> String {
    let payload = serde_json::json!({ "choices": [{ "delta": { "content": text } }] });
    format!("data: {payload}\n\n")
}

pub(crate) fn chunk(text: impl Into<String>) -> ProviderResult<Bytes> {
    Ok(Bytes::from(text.into()))
}

pub(crate) type BodySender = mpsc::UnboundedSender<ProviderResult<Bytes>>;

enum Reply {
    Open(BackendResponse),
    Fail(ProviderError),
}

#[derive(Default)]
pub(crate) struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a reply whose body yields `chunks` and then ends.
    pub(crate) fn push_chunks(&self, origin: ResponseOrigin, chunks: Vec<String>) {
        let body = futures::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok(Bytes::from(chunk)))
                .collect::<Vec<_>>(),
        )
        .boxed();
        self.push(Reply::Open(BackendResponse::new(origin, body)));
    }

    /// Queues a reply whose body is fed by the returned sender.
    pub(crate) fn push_channel(&self, origin: ResponseOrigin) -> BodySender {
        let (sender, receiver) = mpsc::unbounded_channel();
        let body = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed();
        self.push(Reply::Open(BackendResponse::new(origin, body)));
        sender
    }

    pub(crate) fn push_failure(&self, error: ProviderError) {
        self.push(Reply::Fail(error));
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }
}

impl ChatBackend for ScriptedBackend {
    fn id(&self) -> &str {
        "scripted"
    }

    fn open_stream<'a>(
        &'a self,
        request: ChatRequest,
    ) -> BoxFuture<'a, ProviderResult<BackendResponse>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Open(response)) => Ok(response),
                Some(Reply::Fail(error)) => Err(error),
                None => Err(ProviderError::Transport {
                    stage: "scripted-open",
                    message: "no scripted reply".to_string(),
                }),
            }
        })
    }
}

/// Storage side of a held call.
struct Hold {
    parked: oneshot::Sender<()>,
    verdict: oneshot::Receiver<bool>,
}

impl Hold {
    /// Parks until the test decides. `true` lets the call through.
    async fn decide(self) -> bool {
        let _ = self.parked.send(());
        self.verdict.await.unwrap_or(true)
    }
}

/// Test side of a held call.
pub(crate) struct HeldCall {
    parked: Option<oneshot::Receiver<()>>,
    verdict: oneshot::Sender<bool>,
}

impl HeldCall {
    fn pair() -> (Hold, Self) {
        let (parked_tx, parked_rx) = oneshot::channel();
        let (verdict_tx, verdict_rx) = oneshot::channel();
        let hold = Hold {
            parked: parked_tx,
            verdict: verdict_rx,
        };
        let held = Self {
            parked: Some(parked_rx),
            verdict: verdict_tx,
        };
        (hold, held)
    }

    /// Resolves once the held call has reached storage.
    pub(crate) async fn parked(&mut self) {
        if let Some(parked) = self.parked.take() {
            parked.await.unwrap();
        }
    }

    pub(crate) fn release(self) {
        let _ = self.verdict.send(true);
    }

    pub(crate) fn reject(self) {
        let _ = self.verdict.send(false);
    }
}

fn unavailable<T>() -> StorageResult<T> {
    Err(StorageError::Unavailable {
        stage: "flaky-storage",
        details: "call rejected".to_string(),
    })
}

/// Memory storage that can reject appends of one role or hold the next call.
#[derive(Default)]
pub(crate) struct FlakyStorage {
    inner: MemoryStorage,
    reject_role: Mutex<Option<MessageRole>>,
    next_append: Mutex<Option<Hold>>,
    next_recent: Mutex<Option<Hold>>,
}

impl FlakyStorage {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn reject_appends(&self, role: MessageRole) {
        *self.reject_role.lock().unwrap() = Some(role);
    }

    /// Holds the next append before it is written.
    pub(crate) fn hold_next_append(&self) -> HeldCall {
        let (hold, held) = HeldCall::pair();
        *self.next_append.lock().unwrap() = Some(hold);
        held
    }

    /// Holds the next history read after it has read.
    pub(crate) fn hold_next_recent(&self) -> HeldCall {
        let (hold, held) = HeldCall::pair();
        *self.next_recent.lock().unwrap() = Some(hold);
        held
    }
}

impl MessageStore for FlakyStorage {
    fn append_message<'a>(
        &'a self,
        session_id: SessionId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        let rejected = *self.reject_role.lock().unwrap() == Some(input.role);
        let hold = self.next_append.lock().unwrap().take();
        Box::pin(async move {
            if let Some(hold) = hold {
                if !hold.decide().await {
                    return unavailable();
                }
            }
            if rejected {
                return unavailable();
            }
            self.inner.append_message(session_id, input).await
        })
    }

    fn recent_messages<'a>(
        &'a self,
        session_id: SessionId,
        limit: usize,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        let hold = self.next_recent.lock().unwrap().take();
        Box::pin(async move {
            let read = self.inner.recent_messages(session_id, limit).await;
            match hold {
                Some(hold) => {
                    if hold.decide().await {
                        read
                    } else {
                        unavailable()
                    }
                }
                None => read,
            }
        })
    }

    fn delete_session_messages<'a>(
        &'a self,
        session_id: SessionId,
    ) -> BoxFuture<'a, StorageResult<u64>> {
        self.inner.delete_session_messages(session_id)
    }
}

/// Polls the store until `predicate` holds, panicking after a few seconds.
pub(crate) async fn wait_until(
    store: &ChatStore,
    predicate: impl Fn(&ConversationSnapshot) -> bool,
) -> Arc<ConversationSnapshot> {
    let poll = async {
        loop {
            let snapshot = store.snapshot();
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    match tokio::time::timeout(Duration::from_secs(5), poll).await {
        Ok(snapshot) => snapshot,
        Err(_) => panic!("condition not reached, last snapshot {:?}", store.snapshot()),
    }
}

/// Collects every published snapshot.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    seen: Arc<Mutex<Vec<Arc<ConversationSnapshot>>>>,
}

impl Recorder {
    pub(crate) fn listener(&self) -> impl Fn(&Arc<ConversationSnapshot>) + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |snapshot| seen.lock().unwrap().push(Arc::clone(snapshot))
    }

    pub(crate) fn snapshots(&self) -> Vec<Arc<ConversationSnapshot>> {
        self.seen.lock().unwrap().clone()
    }
}
