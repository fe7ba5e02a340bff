use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use snafu::Snafu;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = ProviderResult<Bytes>> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Request body accepted by the streaming chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub conversation_history: Vec<HistoryMessage>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, conversation_history: Vec<HistoryMessage>) -> Self {
        Self {
            message: message.into(),
            conversation_history,
        }
    }
}

/// Which persona or mode answered, as reported by response metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseOrigin {
    pub tag: Option<String>,
    pub label: Option<String>,
}

impl ResponseOrigin {
    pub fn new(tag: Option<String>, label: Option<String>) -> Self {
        Self { tag, label }
    }

    pub fn is_empty(&self) -> bool {
        self.tag.is_none() && self.label.is_none()
    }
}

/// An opened response: metadata is known, the body is still streaming.
pub struct BackendResponse {
    pub origin: ResponseOrigin,
    pub body: ByteStream,
}

impl BackendResponse {
    pub fn new(origin: ResponseOrigin, body: ByteStream) -> Self {
        Self { origin, body }
    }
}

pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;
    /// Sends the request and resolves once response headers arrive.
    fn open_stream<'a>(
        &'a self,
        request: ChatRequest,
    ) -> BoxFuture<'a, ProviderResult<BackendResponse>>;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("chat backend endpoint is not configured"))]
    MissingEndpoint { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("chat backend returned status {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to read response body on `{stage}`, {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("transport failed on `{stage}`: {message}"))]
    Transport {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("chat backend reported an error: {message}"))]
    Backend {
        stage: &'static str,
        message: String,
    },
}

impl ProviderError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::MissingEndpoint { stage }
            | Self::HttpClient { stage, .. }
            | Self::Status { stage, .. }
            | Self::ReadBody { stage, .. }
            | Self::Transport { stage, .. }
            | Self::Backend { stage, .. } => stage,
        }
    }

    /// Message suitable for showing to the person who sent the chat message.
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingEndpoint { .. } => "The assistant is not configured yet.".to_string(),
            Self::HttpClient { .. } | Self::ReadBody { .. } | Self::Transport { .. } => {
                "Could not reach the assistant. Check your connection and try again.".to_string()
            }
            Self::Status { status: 429, .. } => {
                "The assistant is receiving too many requests. Please wait a moment and try again."
                    .to_string()
            }
            Self::Status { status: 402, .. } => {
                "The assistant's usage quota is exhausted.".to_string()
            }
            Self::Status { status, .. } if *status >= 500 => {
                "The assistant is temporarily unavailable. Please try again.".to_string()
            }
            Self::Status { status, .. } => {
                format!("The assistant rejected the message (status {status}).")
            }
            Self::Backend { message, .. } => format!("The assistant reported an error: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case_wire_names() {
        let request = ChatRequest::new(
            "Hola",
            vec![
                HistoryMessage::new(Role::User, "hi"),
                HistoryMessage::new(Role::Assistant, "hello"),
            ],
        );

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "message": "Hola",
                "conversationHistory": [
                    { "role": "user", "content": "hi" },
                    { "role": "assistant", "content": "hello" }
                ]
            })
        );
    }

    #[test]
    fn user_messages_distinguish_failure_classes() {
        let limited = ProviderError::Status {
            stage: "test",
            status: 429,
            body: String::new(),
        };
        let down = ProviderError::Status {
            stage: "test",
            status: 503,
            body: String::new(),
        };
        let offline = ProviderError::Transport {
            stage: "test",
            message: "connection reset".to_string(),
        };

        assert!(limited.user_message().contains("too many requests"));
        assert!(down.user_message().contains("temporarily unavailable"));
        assert!(offline.user_message().contains("Could not reach"));
        assert_eq!(offline.stage(), "test");
    }
}
