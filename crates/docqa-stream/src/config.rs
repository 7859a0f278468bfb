use std::time::Duration;

use crate::buffer::TrailingPolicy;
use crate::errors::ClientError;

const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Configuration for the HTTP client talking to the QA backend.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// API root, e.g. `https://qa.example.com/api/v1`.
    pub base_url: String,
    /// Bearer credential; requests go out unauthenticated when absent.
    pub token: Option<String>,
    /// Default HTTP timeout for requests.
    pub timeout: Duration,
}

impl ClientConfig {
    /// Creates a config for the given API root with default timeout and no token.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Builds a config from the environment.
    ///
    /// - `DOCQA_API_BASE_URL`: API root (default `http://localhost:8000/api/v1`).
    /// - `DOCQA_API_TOKEN`: optional bearer token.
    /// - `DOCQA_HTTP_TIMEOUT_SECS`: optional timeout in seconds (default 120).
    pub fn from_env() -> Result<Self, ClientError> {
        let base_url = std::env::var("DOCQA_API_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(base_url);
        if let Ok(token) = std::env::var("DOCQA_API_TOKEN")
            && !token.trim().is_empty()
        {
            config.token = Some(token.trim().to_string());
        }
        if let Ok(raw) = std::env::var("DOCQA_HTTP_TIMEOUT_SECS") {
            let secs = raw.trim().parse::<u64>().map_err(|e| {
                ClientError::Config(format!("invalid DOCQA_HTTP_TIMEOUT_SECS {raw:?}: {e}"))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    /// Sets the bearer token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Overrides the default HTTP timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "base_url must be an http(s) URL, got {:?}",
                self.base_url
            )));
        }
        if self.timeout.is_zero() {
            return Err(ClientError::Config("timeout must be greater than 0".into()));
        }
        Ok(())
    }

    pub(crate) fn chat_stream_url(&self, conversation_id: &str) -> String {
        format!(
            "{}/qa/conversations/{}/chat/stream",
            self.base_url.trim().trim_end_matches('/'),
            conversation_id
        )
    }
}

/// Per-session settings.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Bounded buffer between the session task and a `SessionStream` reader.
    pub channel_capacity: usize,
    /// Handling of an event left without its trailing delimiter at end of data.
    pub trailing_policy: TrailingPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            trailing_policy: TrailingPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Sets the channel capacity used by `StreamSession::start`.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Sets the trailing-event policy.
    pub fn trailing_policy(mut self, policy: TrailingPolicy) -> Self {
        self.trailing_policy = policy;
        self
    }
}
