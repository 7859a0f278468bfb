use crate::errors::{ClientError, StreamFailure};

/// Events yielded by `SessionStream`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Raw payload of one `data:` event, in stream order.
    Payload(String),
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed(StreamFailure),
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// How a session ended. Produced at most once per session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed(StreamFailure),
}

impl StreamOutcome {
    /// Converts the outcome into a plain `Result`.
    pub fn into_result(self) -> Result<(), ClientError> {
        match self {
            Self::Completed => Ok(()),
            Self::Failed(failure) => Err(ClientError::Stream(failure)),
        }
    }
}

/// Callbacks driven by `StreamSession::run`.
///
/// `on_payload` may fire many times. `on_complete` and `on_error` fire at most
/// once per session and never both; neither fires after the session was
/// aborted.
pub trait StreamListener: Send {
    fn on_payload(&mut self, payload: &str);

    fn on_complete(&mut self) {}

    fn on_error(&mut self, _failure: &StreamFailure) {}
}

/// Destination of session events: a listener or a channel.
#[async_trait::async_trait]
pub(crate) trait EventSink: Send {
    /// Returns `false` once the receiving side is gone.
    async fn emit(&mut self, event: SessionEvent) -> bool;
}

pub(crate) struct ListenerSink<'a, L: StreamListener>(pub &'a mut L);

#[async_trait::async_trait]
impl<'a, L: StreamListener> EventSink for ListenerSink<'a, L> {
    async fn emit(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Payload(payload) => self.0.on_payload(&payload),
            SessionEvent::Completed => self.0.on_complete(),
            SessionEvent::Failed(failure) => self.0.on_error(&failure),
        }
        true
    }
}

pub(crate) struct ChannelSink(pub tokio::sync::mpsc::Sender<SessionEvent>);

#[async_trait::async_trait]
impl EventSink for ChannelSink {
    async fn emit(&mut self, event: SessionEvent) -> bool {
        self.0.send(event).await.is_ok()
    }
}
