use std::sync::Arc;

mod http;
mod provider;
pub mod sse;

pub use http::{
    HTTP_BACKEND_ID, HttpBackendConfig, HttpChatBackend, ORIGIN_LABEL_HEADER, ORIGIN_TAG_HEADER,
};
pub use provider::{
    BackendResponse, BoxFuture, ByteStream, ChatBackend, ChatRequest, HistoryMessage,
    ProviderError, ProviderResult, ResponseOrigin, Role,
};
pub use sse::{SseDecoder, SseEvent};

pub fn create_backend(config: HttpBackendConfig) -> ProviderResult<Arc<dyn ChatBackend>> {
    Ok(Arc::new(HttpChatBackend::new(config)?))
}
