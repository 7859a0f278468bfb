/// Terminal session failure delivered through `StreamListener::on_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum StreamFailure {
    /// The backend answered with a non-success HTTP status.
    #[error("HTTP error! status: {status}, {body}")]
    Status { status: u16, body: String },
    /// The request could not be sent or the body read failed mid-stream.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The response body was not valid UTF-8.
    #[error("decode failure: {0}")]
    Decode(String),
}

impl StreamFailure {
    /// Creates a transport-level failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Creates a decode failure.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Returns the HTTP status for status failures.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(_) | Self::Decode(_) => None,
        }
    }
}

/// Top-level error type for the public client API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid request input.
    #[error("validation error: {0}")]
    Validation(String),
    /// A session object was driven a second time.
    #[error("stream session already started")]
    AlreadyStarted,
    /// The session was abandoned before reaching a terminal state.
    #[error("cancelled")]
    Cancelled,
    /// The session ended in failure.
    #[error(transparent)]
    Stream(StreamFailure),
    /// Internal misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<StreamFailure> for ClientError {
    fn from(value: StreamFailure) -> Self {
        ClientError::Stream(value)
    }
}

/// Errors raised while interpreting an answer payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Payload was not valid JSON.
    #[error("invalid payload JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Payload JSON had an unexpected shape.
    #[error("unexpected payload shape: {0}")]
    Shape(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_failure_renders_status_and_body() {
        let failure = StreamFailure::Status {
            status: 401,
            body: "{\"detail\":\"Not authenticated\"}".into(),
        };
        assert_eq!(failure.status_code(), Some(401));
        assert_eq!(
            failure.to_string(),
            "HTTP error! status: 401, {\"detail\":\"Not authenticated\"}"
        );
    }

    #[test]
    fn stream_failure_converts_into_client_error() {
        let err: ClientError = StreamFailure::transport("connection reset").into();
        assert!(matches!(err, ClientError::Stream(StreamFailure::Transport(_))));
        assert_eq!(err.to_string(), "transport failure: connection reset");
    }
}
