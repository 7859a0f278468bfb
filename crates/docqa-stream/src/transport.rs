use std::pin::Pin;

use futures::StreamExt as _;
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::{ClientError, StreamFailure};
use crate::request::{Method, StreamRequest};

/// Body of an opened streaming response, read chunk by chunk.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, StreamFailure>> + Send + 'static>>;

/// Opens streaming requests against the backend.
///
/// Implementations return the response body only for successful statuses;
/// anything else is reported as a `StreamFailure`.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, StreamFailure>;
}

/// `reqwest`-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport using the config's timeout.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, StreamFailure> {
        debug!(url = %request.url, authenticated = request.bearer_token.is_some(), "opening chat stream");
        let mut http_req = match request.method {
            Method::Post => self.client.post(&request.url).json(&request.body),
            Method::Get => self.client.get(&request.url),
        };
        if let Some(token) = request.bearer_token.as_deref() {
            http_req = http_req.bearer_auth(token);
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| StreamFailure::transport(format!("chat request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(StreamFailure::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| StreamFailure::transport(format!("chat stream read failed: {e}")))
        });
        Ok(Box::pin(stream))
    }
}
