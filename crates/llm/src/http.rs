use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap};
use snafu::{ResultExt, ensure};

use super::provider::{
    BackendResponse, BoxFuture, ChatBackend, ChatRequest, HttpClientSnafu, MissingEndpointSnafu,
    ProviderError, ProviderResult, ReadBodySnafu, ResponseOrigin,
};

pub const HTTP_BACKEND_ID: &str = "http";
pub const ORIGIN_TAG_HEADER: &str = "x-origin-tag";
pub const ORIGIN_LABEL_HEADER: &str = "x-origin-label";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpBackendConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl HttpBackendConfig {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().to_string(),
            api_key: api_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
        }
    }
}

/// Streaming chat endpoint reached over HTTP(S).
pub struct HttpChatBackend {
    client: Client,
    config: HttpBackendConfig,
}

impl HttpChatBackend {
    pub fn new(config: HttpBackendConfig) -> ProviderResult<Self> {
        ensure!(
            !config.endpoint.is_empty(),
            MissingEndpointSnafu {
                stage: "http-backend-new",
            }
        );

        let client = Client::builder().build().context(HttpClientSnafu {
            stage: "build-client",
        })?;

        Ok(Self { client, config })
    }

    async fn send(&self, request: ChatRequest) -> ProviderResult<BackendResponse> {
        let mut builder = self
            .client
            .post(&self.config.endpoint)
            .header(ACCEPT, "text/event-stream")
            .json(&request);

        if let Some(api_key) = &self.config.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {api_key}"));
        }

        tracing::debug!(
            endpoint = %self.config.endpoint,
            history_len = request.conversation_history.len(),
            "opening chat stream"
        );

        let response = builder.send().await.context(HttpClientSnafu {
            stage: "send-chat-request",
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                stage: "chat-http-status",
                status: status.as_u16(),
                body,
            });
        }

        let origin = origin_from_headers(response.headers());
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.context(ReadBodySnafu {
                    stage: "read-chat-chunk",
                })
            })
            .boxed();

        Ok(BackendResponse::new(origin, body))
    }
}

impl ChatBackend for HttpChatBackend {
    fn id(&self) -> &str {
        HTTP_BACKEND_ID
    }

    fn open_stream<'a>(
        &'a self,
        request: ChatRequest,
    ) -> BoxFuture<'a, ProviderResult<BackendResponse>> {
        Box::pin(self.send(request))
    }
}

pub(crate) fn origin_from_headers(headers: &HeaderMap) -> ResponseOrigin {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    ResponseOrigin::new(read(ORIGIN_TAG_HEADER), read(ORIGIN_LABEL_HEADER))
}
