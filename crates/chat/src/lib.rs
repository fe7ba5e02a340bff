mod dispatcher;
mod lock;
mod message;
mod store;

pub use dispatcher::{
    DEFAULT_DISPLAY_LIMIT, DEFAULT_HISTORY_WINDOW, DispatchListener, DispatchOutcome,
    DispatchPhase, Dispatcher, DispatcherConfig,
};
pub use lock::{DEFAULT_STALE_AFTER, SendLock, SendPermit};
pub use message::{ConversationSnapshot, Message, MessageKey, Role, STREAMING_MESSAGE_KEY};
pub use store::{
    ChatStore, ChatStoreBuilder, ErrorCallback, SendHandle, SendStatus, SnapshotListener,
    Subscription,
};

#[cfg(test)]
mod testing;
