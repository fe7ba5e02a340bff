use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use hilo_llm::ResponseOrigin;
use hilo_storage::{MessageId, MessageRecord, MessageRole};

/// Key shown to renderers for the in-flight assistant message.
pub const STREAMING_MESSAGE_KEY: &str = "streaming";

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl From<MessageRole> for Role {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

/// Identity of one displayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Durable(MessageId),
    Streaming,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Durable(id) => id.fmt(formatter),
            Self::Streaming => formatter.write_str(STREAMING_MESSAGE_KEY),
        }
    }
}

/// One message as rendered by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub role: Role,
    pub content: String,
    pub origin_tag: Option<String>,
    pub origin_label: Option<String>,
    pub created_at_unix_ms: u64,
    pub is_streaming: bool,
}

impl Message {
    /// Creates a display message from a durable record.
    pub fn from_record(record: MessageRecord) -> Self {
        Self {
            key: MessageKey::Durable(record.id),
            role: record.role.into(),
            content: record.content,
            origin_tag: record.origin_tag,
            origin_label: None,
            created_at_unix_ms: record.created_at_unix_ms,
            is_streaming: false,
        }
    }

    /// Creates the transient assistant message for an open stream.
    pub fn streaming(origin: &ResponseOrigin, content: impl Into<String>) -> Self {
        Self {
            key: MessageKey::Streaming,
            role: Role::Assistant,
            content: content.into(),
            origin_tag: origin.tag.clone(),
            origin_label: origin.label.clone(),
            created_at_unix_ms: now_unix_millis(),
            is_streaming: true,
        }
    }
}

/// Immutable view published to subscribers.
///
/// Holds durable messages in creation order, followed by at most one
/// streaming message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationSnapshot {
    pub messages: Vec<Message>,
    pub is_loading: bool,
}

impl ConversationSnapshot {
    /// Creates an empty, idle snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a snapshot from durable history.
    pub fn from_history(messages: Vec<Message>, is_loading: bool) -> Self {
        let messages = messages
            .into_iter()
            .filter(|message| !message.is_streaming)
            .collect();
        Self {
            messages,
            is_loading,
        }
    }

    /// Returns the in-flight assistant message, if any.
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().find(|message| message.is_streaming)
    }

    /// Returns messages that are already persisted.
    pub fn durable_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|message| !message.is_streaming)
    }

    pub(crate) fn with_loading(&self, is_loading: bool) -> Self {
        Self {
            messages: self.messages.clone(),
            is_loading,
        }
    }

    pub(crate) fn with_durable(&self, message: Message) -> Self {
        let mut next = self.without_streaming();
        if !next.messages.iter().any(|existing| existing.key == message.key) {
            next.messages.push(message);
        }
        if let Some(streaming) = self.streaming_message() {
            next.messages.push(streaming.clone());
        }
        next
    }

    pub(crate) fn with_streaming(&self, origin: &ResponseOrigin, content: &str) -> Self {
        let mut next = self.clone();
        match next.messages.iter_mut().find(|message| message.is_streaming) {
            Some(streaming) => {
                streaming.content.clear();
                streaming.content.push_str(content);
            }
            None => next.messages.push(Message::streaming(origin, content)),
        }
        next
    }

    pub(crate) fn without_streaming(&self) -> Self {
        Self {
            messages: self.durable_messages().cloned().collect(),
            is_loading: self.is_loading,
        }
    }
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
