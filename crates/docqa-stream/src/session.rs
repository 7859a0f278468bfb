use std::sync::Arc;

use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::buffer::ChunkBuffer;
use crate::config::SessionConfig;
use crate::decoder::TextDecoder;
use crate::errors::{ClientError, StreamFailure};
use crate::event::{ParsedEvent, parse_unit};
use crate::payload::{Answer, AnswerAccumulator};
use crate::request::StreamRequest;
use crate::stream::{
    ChannelSink, EventSink, ListenerSink, SessionEvent, StreamListener, StreamOutcome,
};
use crate::transport::ChatTransport;

/// Lifecycle of a `StreamSession`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
    /// Abandoned by the caller; no terminal callback was delivered.
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Handle used to abandon a running session.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// The session stops reading, releases the response body and invokes no
    /// further callbacks.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// One streaming request/response interaction with the answer service.
///
/// A session is single-use: once it left `Idle` it cannot be driven again.
pub struct StreamSession {
    session_id: uuid::Uuid,
    transport: Arc<dyn ChatTransport>,
    request: StreamRequest,
    config: SessionConfig,
    state: SessionState,
    abort_tx: watch::Sender<bool>,
    abort_rx: watch::Receiver<bool>,
}

impl StreamSession {
    pub fn new(transport: Arc<dyn ChatTransport>, request: StreamRequest) -> Self {
        let (abort_tx, abort_rx) = watch::channel(false);
        Self {
            session_id: uuid::Uuid::new_v4(),
            transport,
            request,
            config: SessionConfig::default(),
            state: SessionState::Idle,
            abort_tx,
            abort_rx,
        }
    }

    /// Replaces the session settings.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns a handle that can cancel the session from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            tx: self.abort_tx.clone(),
        }
    }

    /// Drives the session to its end, reporting through `listener`.
    ///
    /// Returns the outcome that was also delivered to the listener, or
    /// `ClientError::Cancelled` when the session was aborted.
    pub async fn run<L: StreamListener>(
        &mut self,
        listener: &mut L,
    ) -> Result<StreamOutcome, ClientError> {
        self.drive(&mut ListenerSink(listener)).await
    }

    /// Spawns the session on the current tokio runtime.
    ///
    /// Events are delivered through the returned `SessionStream`; dropping it
    /// abandons the session.
    pub fn start(self) -> Result<SessionStream, ClientError> {
        if self.state != SessionState::Idle {
            return Err(ClientError::AlreadyStarted);
        }
        if self.config.channel_capacity == 0 {
            return Err(ClientError::Validation(
                "channel_capacity must be greater than 0".into(),
            ));
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let (final_tx, final_rx) = oneshot::channel();
        let session_id = self.session_id;
        let abort_handle = self.abort_handle();
        let mut session = self;
        tokio::spawn(async move {
            let result = session.drive(&mut ChannelSink(tx)).await;
            let _ = final_tx.send(result);
        });

        Ok(SessionStream {
            session_id,
            rx,
            final_rx,
            abort_handle,
            saw_terminal: false,
        })
    }

    /// Runs to completion and folds the payloads into an `Answer`.
    pub async fn collect_answer(mut self) -> Result<Answer, ClientError> {
        let mut accumulator = AnswerAccumulator::new();
        self.run(&mut accumulator).await?.into_result()?;
        Ok(accumulator.into_answer())
    }

    async fn drive<S: EventSink>(&mut self, sink: &mut S) -> Result<StreamOutcome, ClientError> {
        if self.state != SessionState::Idle {
            return Err(ClientError::AlreadyStarted);
        }
        let mut abort_rx = self.abort_rx.clone();
        if is_aborted(&abort_rx) {
            return Err(self.cancelled());
        }

        self.transition(SessionState::Connecting);
        let opened = tokio::select! {
            biased;
            _ = wait_for_abort(&mut abort_rx) => None,
            opened = self.transport.open(&self.request) => Some(opened),
        };
        let mut body = match opened {
            None => return Err(self.cancelled()),
            Some(Ok(body)) => body,
            Some(Err(failure)) => return self.fail(sink, failure).await,
        };

        self.transition(SessionState::Streaming);
        let mut decoder = TextDecoder::default();
        let mut buffer = ChunkBuffer::new(self.config.trailing_policy);
        let mut payloads = 0_u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_abort(&mut abort_rx) => None,
                next = body.next() => Some(next),
            };
            let Some(next) = next else {
                return Err(self.cancelled());
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(failure)) => {
                    drop(body);
                    return self.fail(sink, failure).await;
                }
                None => break,
            };
            let text = match decoder.decode(&chunk) {
                Ok(text) => text,
                Err(failure) => {
                    drop(body);
                    return self.fail(sink, failure).await;
                }
            };
            for unit in buffer.append(&text) {
                match parse_unit(&unit) {
                    ParsedEvent::Payload(payload) => {
                        if !deliver(sink, &abort_rx, SessionEvent::Payload(payload)).await {
                            return Err(self.cancelled());
                        }
                        payloads += 1;
                    }
                    ParsedEvent::SentinelEnd => {
                        debug!(
                            session_id = %self.session_id,
                            payloads,
                            pending = buffer.pending().len(),
                            "end sentinel received"
                        );
                        drop(body);
                        return self.complete(sink).await;
                    }
                    ParsedEvent::Ignored => {}
                }
            }
        }
        drop(body);

        if let Err(failure) = decoder.finish() {
            return self.fail(sink, failure).await;
        }
        if let Some(unit) = buffer.flush()
            && let ParsedEvent::Payload(payload) = parse_unit(&unit)
        {
            if !deliver(sink, &abort_rx, SessionEvent::Payload(payload)).await {
                return Err(self.cancelled());
            }
            payloads += 1;
        }
        debug!(session_id = %self.session_id, payloads, "stream ended without sentinel");
        self.complete(sink).await
    }

    async fn complete<S: EventSink>(&mut self, sink: &mut S) -> Result<StreamOutcome, ClientError> {
        if !deliver(sink, &self.abort_rx, SessionEvent::Completed).await {
            return Err(self.cancelled());
        }
        self.transition(SessionState::Completed);
        Ok(StreamOutcome::Completed)
    }

    async fn fail<S: EventSink>(
        &mut self,
        sink: &mut S,
        failure: StreamFailure,
    ) -> Result<StreamOutcome, ClientError> {
        if !deliver(sink, &self.abort_rx, SessionEvent::Failed(failure.clone())).await {
            debug!(session_id = %self.session_id, error = %failure, "failure after abort not reported");
            return Err(self.cancelled());
        }
        warn!(session_id = %self.session_id, status = ?failure.status_code(), error = %failure, "chat stream failed");
        self.transition(SessionState::Failed);
        Ok(StreamOutcome::Failed(failure))
    }

    fn cancelled(&mut self) -> ClientError {
        self.transition(SessionState::Cancelled);
        ClientError::Cancelled
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session_id = %self.session_id, from = ?self.state, to = ?next, "session state transition");
        self.state = next;
    }
}

fn is_aborted(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Hands `event` to the sink unless the session is aborted first.
///
/// A send blocked on a full channel is abandoned as soon as the abort lands.
/// Returns `false` when the event was not delivered.
async fn deliver<S: EventSink>(
    sink: &mut S,
    abort_rx: &watch::Receiver<bool>,
    event: SessionEvent,
) -> bool {
    let mut abort_rx = abort_rx.clone();
    tokio::select! {
        biased;
        _ = wait_for_abort(&mut abort_rx) => false,
        sent = sink.emit(event) => sent,
    }
}

async fn wait_for_abort(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Handle returned by `StreamSession::start`.
///
/// Use `next_event()` to consume events as they arrive and `finish()` to
/// obtain the outcome. Dropping the handle aborts the session.
pub struct SessionStream {
    session_id: uuid::Uuid,
    rx: mpsc::Receiver<SessionEvent>,
    final_rx: oneshot::Receiver<Result<StreamOutcome, ClientError>>,
    abort_handle: AbortHandle,
    saw_terminal: bool,
}

impl SessionStream {
    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Returns a handle that can cancel the session.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Waits for the next event. Returns `None` once the session is over.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = self.rx.recv().await;
        if event.as_ref().is_some_and(SessionEvent::is_terminal) {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains remaining events (if any) and returns the outcome.
    pub async fn finish(mut self) -> Result<StreamOutcome, ClientError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(event) if event.is_terminal() => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }

        match (&mut self.final_rx).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::protocol_msg(format!(
                "session task {} ended without an outcome",
                self.session_id
            ))),
        }
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.abort_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TrailingPolicy;
    use crate::request::{ChatRequest, Method};
    use crate::transport::ByteStream;
    use futures::StreamExt as _;
    use futures::stream;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;

    enum FakeBehavior {
        Chunks(Vec<Result<bytes::Bytes, StreamFailure>>),
        ChunksThenPending(Vec<Result<bytes::Bytes, StreamFailure>>),
        OpenError(StreamFailure),
        PendingOpen,
    }

    struct FakeTransport {
        behavior: FakeBehavior,
        calls: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    /// Body wrapper that records when the session lets go of it.
    struct TrackedBody {
        inner: ByteStream,
        released: Arc<AtomicBool>,
    }

    impl futures::Stream for TrackedBody {
        type Item = Result<bytes::Bytes, StreamFailure>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.inner.poll_next_unpin(cx)
        }
    }

    impl Drop for TrackedBody {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl ChatTransport for FakeTransport {
        async fn open(&self, _request: &StreamRequest) -> Result<ByteStream, StreamFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let inner: ByteStream = match &self.behavior {
                FakeBehavior::Chunks(chunks) => Box::pin(stream::iter(chunks.clone())),
                FakeBehavior::ChunksThenPending(chunks) => {
                    Box::pin(stream::iter(chunks.clone()).chain(stream::pending()))
                }
                FakeBehavior::OpenError(failure) => return Err(failure.clone()),
                FakeBehavior::PendingOpen => futures::future::pending().await,
            };
            Ok(Box::pin(TrackedBody {
                inner,
                released: self.released.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct Recorder {
        payloads: Vec<String>,
        completed: usize,
        errors: Vec<StreamFailure>,
    }

    impl StreamListener for Recorder {
        fn on_payload(&mut self, payload: &str) {
            self.payloads.push(payload.to_string());
        }

        fn on_complete(&mut self) {
            self.completed += 1;
        }

        fn on_error(&mut self, failure: &StreamFailure) {
            self.errors.push(failure.clone());
        }
    }

    fn text_chunks(parts: &[&str]) -> Vec<Result<bytes::Bytes, StreamFailure>> {
        parts
            .iter()
            .map(|p| Ok(bytes::Bytes::copy_from_slice(p.as_bytes())))
            .collect()
    }

    fn request() -> StreamRequest {
        StreamRequest {
            method: Method::Post,
            url: "http://localhost/api/v1/qa/conversations/c/chat/stream".into(),
            bearer_token: None,
            body: serde_json::to_value(ChatRequest::new("q")).expect("body"),
        }
    }

    fn session(behavior: FakeBehavior) -> StreamSession {
        tracked_session(behavior).0
    }

    fn tracked_session(behavior: FakeBehavior) -> (StreamSession, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let session = StreamSession::new(
            Arc::new(FakeTransport {
                behavior,
                calls: Arc::new(AtomicUsize::new(0)),
                released: released.clone(),
            }),
            request(),
        );
        (session, released)
    }

    async fn wait_until_released(released: &AtomicBool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !released.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("response body must be released");
    }

    #[tokio::test]
    async fn delivers_payloads_split_across_chunks_then_completes() {
        let mut session = session(FakeBehavior::Chunks(text_chunks(&[
            "data: hel",
            "lo\n\ndata: wor",
            "ld\n\ndata: [DONE]\n\n",
        ])));
        let mut recorder = Recorder::default();
        let outcome = session.run(&mut recorder).await.expect("run");

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(recorder.payloads, vec!["hello", "world"]);
        assert_eq!(recorder.completed, 1);
        assert!(recorder.errors.is_empty());
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn trailing_event_without_delimiter_is_delivered_by_default() {
        let mut session = session(FakeBehavior::Chunks(text_chunks(&["data: partial"])));
        let mut recorder = Recorder::default();
        session.run(&mut recorder).await.expect("run");
        assert_eq!(recorder.payloads, vec!["partial"]);
        assert_eq!(recorder.completed, 1);
    }

    #[tokio::test]
    async fn trailing_event_without_delimiter_is_dropped_under_strict_framing() {
        let mut session = session(FakeBehavior::Chunks(text_chunks(&["data: partial"])))
            .with_config(SessionConfig::default().trailing_policy(TrailingPolicy::Discard));
        let mut recorder = Recorder::default();
        let outcome = session.run(&mut recorder).await.expect("run");
        assert_eq!(outcome, StreamOutcome::Completed);
        assert!(recorder.payloads.is_empty());
        assert_eq!(recorder.completed, 1);
        assert!(recorder.errors.is_empty());
    }

    #[tokio::test]
    async fn mid_stream_fault_reports_single_error_after_delivered_payload() {
        let mut chunks = text_chunks(&["data: one\n\ndata: tw"]);
        chunks.push(Err(StreamFailure::transport("connection reset by peer")));
        chunks.extend(text_chunks(&["o\n\n"]));
        let mut session = session(FakeBehavior::Chunks(chunks));
        let mut recorder = Recorder::default();
        let outcome = session.run(&mut recorder).await.expect("run");

        assert!(matches!(outcome, StreamOutcome::Failed(StreamFailure::Transport(_))));
        assert_eq!(recorder.payloads, vec!["one"]);
        assert_eq!(recorder.errors.len(), 1);
        assert_eq!(recorder.completed, 0);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn stops_reading_after_sentinel() {
        let mut session = session(FakeBehavior::ChunksThenPending(text_chunks(&[
            "data: a\n\ndata: [DONE]\n\ndata: b\n\n",
            "data: c\n\n",
        ])));
        let mut recorder = Recorder::default();
        let outcome = tokio::time::timeout(Duration::from_secs(5), session.run(&mut recorder))
            .await
            .expect("session must not wait for more input")
            .expect("run");

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(recorder.payloads, vec!["a"]);
        assert_eq!(recorder.completed, 1);
    }

    #[tokio::test]
    async fn ignores_noise_and_completes_on_end_of_data() {
        let mut session = session(FakeBehavior::Chunks(text_chunks(&[
            ": keep-alive\n\nevent: ping\n\ndata: \n\ndata: a\n\n",
        ])));
        let mut recorder = Recorder::default();
        session.run(&mut recorder).await.expect("run");
        assert_eq!(recorder.payloads, vec!["a"]);
        assert_eq!(recorder.completed, 1);
    }

    #[tokio::test]
    async fn non_success_status_fails_before_streaming() {
        let failure = StreamFailure::Status {
            status: 500,
            body: "{\"detail\":\"boom\"}".into(),
        };
        let mut session = session(FakeBehavior::OpenError(failure.clone()));
        let mut recorder = Recorder::default();
        let outcome = session.run(&mut recorder).await.expect("run");

        assert_eq!(outcome, StreamOutcome::Failed(failure.clone()));
        assert_eq!(recorder.errors, vec![failure]);
        assert_eq!(recorder.completed, 0);
        assert!(recorder.payloads.is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_decode_failure() {
        let mut chunks = text_chunks(&["data: ok\n\n"]);
        chunks.push(Ok(bytes::Bytes::from_static(b"data: \xc3\x28\n\n")));
        let mut session = session(FakeBehavior::Chunks(chunks));
        let mut recorder = Recorder::default();
        let outcome = session.run(&mut recorder).await.expect("run");

        assert!(matches!(outcome, StreamOutcome::Failed(StreamFailure::Decode(_))));
        assert_eq!(recorder.payloads, vec!["ok"]);
        assert_eq!(recorder.errors.len(), 1);
        assert_eq!(recorder.completed, 0);
    }

    #[tokio::test]
    async fn multibyte_character_split_between_reads_survives() {
        let bytes = "data: 多租户\n\n".as_bytes();
        let chunks = vec![
            Ok(bytes::Bytes::copy_from_slice(&bytes[..8])),
            Ok(bytes::Bytes::copy_from_slice(&bytes[8..])),
        ];
        let mut session = session(FakeBehavior::Chunks(chunks));
        let mut recorder = Recorder::default();
        session.run(&mut recorder).await.expect("run");
        assert_eq!(recorder.payloads, vec!["多租户"]);
    }

    #[tokio::test]
    async fn session_is_single_use() {
        let mut session = session(FakeBehavior::Chunks(text_chunks(&["data: [DONE]\n\n"])));
        let mut recorder = Recorder::default();
        session.run(&mut recorder).await.expect("first run");
        let second = session.run(&mut recorder).await;
        assert!(matches!(second, Err(ClientError::AlreadyStarted)));
        assert_eq!(recorder.completed, 1);
    }

    #[tokio::test]
    async fn abort_before_run_skips_transport_and_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut session = StreamSession::new(
            Arc::new(FakeTransport {
                behavior: FakeBehavior::Chunks(text_chunks(&["data: a\n\n"])),
                calls: calls.clone(),
                released: Arc::new(AtomicBool::new(false)),
            }),
            request(),
        );
        session.abort_handle().abort();
        let mut recorder = Recorder::default();
        assert!(matches!(
            session.run(&mut recorder).await,
            Err(ClientError::Cancelled)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(recorder.payloads.is_empty());
        assert_eq!((recorder.completed, recorder.errors.len()), (0, 0));
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn abort_while_connecting_cancels_without_callbacks() {
        let mut session = session(FakeBehavior::PendingOpen);
        let abort = session.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            abort.abort();
        });
        let mut recorder = Recorder::default();
        let result = tokio::time::timeout(Duration::from_secs(5), session.run(&mut recorder))
            .await
            .expect("abort must end the session");
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!((recorder.completed, recorder.errors.len()), (0, 0));
    }

    #[tokio::test]
    async fn spawned_session_streams_events_then_outcome() {
        let mut stream = session(FakeBehavior::Chunks(text_chunks(&[
            "data: hel",
            "lo\n\ndata: wor",
            "ld\n\ndata: [DONE]\n\n",
        ])))
        .start()
        .expect("start");

        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        assert_eq!(
            events,
            vec![
                SessionEvent::Payload("hello".into()),
                SessionEvent::Payload("world".into()),
                SessionEvent::Completed,
            ]
        );
        assert_eq!(stream.finish().await.expect("finish"), StreamOutcome::Completed);
    }

    #[tokio::test]
    async fn aborting_spawned_session_stops_events() {
        let mut stream = session(FakeBehavior::ChunksThenPending(text_chunks(&["data: a\n\n"])))
            .start()
            .expect("start");
        assert_eq!(
            stream.next_event().await,
            Some(SessionEvent::Payload("a".into()))
        );

        stream.abort_handle().abort();
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next_event())
            .await
            .expect("abort must close the stream");
        assert_eq!(next, None);
        assert!(matches!(stream.finish().await, Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn finish_drains_unread_events() {
        let stream = session(FakeBehavior::Chunks(text_chunks(&["data: x\n\n", "data: y\n\n"])))
            .with_config(SessionConfig::default().channel_capacity(1))
            .start()
            .expect("start");
        assert_eq!(stream.finish().await.expect("finish"), StreamOutcome::Completed);
    }

    #[tokio::test]
    async fn zero_capacity_channel_is_rejected() {
        let result = session(FakeBehavior::Chunks(Vec::new()))
            .with_config(SessionConfig::default().channel_capacity(0))
            .start();
        assert!(matches!(result, Err(ClientError::Validation(_))));
    }

    #[tokio::test]
    async fn collect_answer_folds_references_and_deltas() {
        let session = session(FakeBehavior::Chunks(text_chunks(&[
            "data: {\"type\":\"references\",\"references\":[]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\ndata: [DONE]\n\n",
        ])));
        let answer = session.collect_answer().await.expect("answer");
        assert_eq!(answer.content, "Hi there");
        assert!(answer.references.is_empty());
    }

    #[tokio::test]
    async fn collect_answer_surfaces_stream_failure() {
        let session = session(FakeBehavior::OpenError(StreamFailure::Status {
            status: 401,
            body: "unauthorized".into(),
        }));
        assert!(matches!(
            session.collect_answer().await,
            Err(ClientError::Stream(StreamFailure::Status { status: 401, .. }))
        ));
    }

    /// Listener that notes whether the body was already released when each
    /// terminal callback fired.
    struct ReleaseCheck {
        released: Arc<AtomicBool>,
        at_terminal: Vec<bool>,
    }

    impl StreamListener for ReleaseCheck {
        fn on_payload(&mut self, _payload: &str) {}

        fn on_complete(&mut self) {
            self.at_terminal.push(self.released.load(Ordering::SeqCst));
        }

        fn on_error(&mut self, _failure: &StreamFailure) {
            self.at_terminal.push(self.released.load(Ordering::SeqCst));
        }
    }

    async fn terminal_release(behavior: FakeBehavior) -> Vec<bool> {
        let (mut session, released) = tracked_session(behavior);
        let mut check = ReleaseCheck {
            released: released.clone(),
            at_terminal: Vec::new(),
        };
        tokio::time::timeout(Duration::from_secs(5), session.run(&mut check))
            .await
            .expect("session must end")
            .expect("run");
        assert!(released.load(Ordering::SeqCst));
        check.at_terminal
    }

    #[tokio::test]
    async fn body_is_released_before_terminal_callback_on_every_exit() {
        let sentinel =
            FakeBehavior::ChunksThenPending(text_chunks(&["data: a\n\ndata: [DONE]\n\n"]));
        assert_eq!(terminal_release(sentinel).await, vec![true]);

        let end_of_data = FakeBehavior::Chunks(text_chunks(&["data: a\n\n", "data: tail"]));
        assert_eq!(terminal_release(end_of_data).await, vec![true]);

        let mut chunks = text_chunks(&["data: a\n\n"]);
        chunks.push(Err(StreamFailure::transport("reset")));
        assert_eq!(terminal_release(FakeBehavior::Chunks(chunks)).await, vec![true]);

        let mut chunks = text_chunks(&["data: a\n\n"]);
        chunks.push(Ok(bytes::Bytes::from_static(b"\xff")));
        assert_eq!(terminal_release(FakeBehavior::Chunks(chunks)).await, vec![true]);
    }

    #[tokio::test]
    async fn abort_while_blocked_on_full_channel_suppresses_completion() {
        let (session, released) = tracked_session(FakeBehavior::Chunks(text_chunks(&[
            "data: a\n\ndata: b\n\ndata: [DONE]\n\n",
        ])));
        let mut stream = session
            .with_config(SessionConfig::default().channel_capacity(1))
            .start()
            .expect("start");

        // "a" fills the channel; the session is now parked sending "b".
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.abort_handle().abort();

        let mut events = Vec::new();
        while let Some(event) =
            tokio::time::timeout(Duration::from_secs(5), stream.next_event())
                .await
                .expect("abort must close the stream")
        {
            events.push(event);
        }
        assert_eq!(events, vec![SessionEvent::Payload("a".into())]);
        assert!(matches!(stream.finish().await, Err(ClientError::Cancelled)));
        assert!(released.load(Ordering::SeqCst));
    }

    /// Records like `Recorder` but aborts the session from its first payload.
    struct AbortingRecorder {
        abort: AbortHandle,
        inner: Recorder,
    }

    impl StreamListener for AbortingRecorder {
        fn on_payload(&mut self, payload: &str) {
            self.inner.on_payload(payload);
            self.abort.abort();
        }

        fn on_complete(&mut self) {
            self.inner.on_complete();
        }

        fn on_error(&mut self, failure: &StreamFailure) {
            self.inner.on_error(failure);
        }
    }

    async fn run_aborting(
        behavior: FakeBehavior,
    ) -> (Result<StreamOutcome, ClientError>, Recorder, StreamSession) {
        let mut session = session(behavior);
        let mut listener = AbortingRecorder {
            abort: session.abort_handle(),
            inner: Recorder::default(),
        };
        let result = session.run(&mut listener).await;
        (result, listener.inner, session)
    }

    #[tokio::test]
    async fn abort_from_payload_callback_suppresses_completion() {
        let (result, recorder, session) = run_aborting(FakeBehavior::Chunks(text_chunks(&[
            "data: a\n\ndata: b\n\ndata: [DONE]\n\n",
        ])))
        .await;

        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(recorder.payloads, vec!["a"]);
        assert_eq!((recorder.completed, recorder.errors.len()), (0, 0));
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn abort_from_payload_callback_suppresses_later_failure() {
        let mut chunks = text_chunks(&["data: a\n\n"]);
        chunks.push(Err(StreamFailure::transport("reset")));
        let (result, recorder, _) = run_aborting(FakeBehavior::Chunks(chunks)).await;

        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(recorder.payloads, vec!["a"]);
        assert_eq!((recorder.completed, recorder.errors.len()), (0, 0));
    }

    #[tokio::test]
    async fn dropping_session_stream_releases_idle_body() {
        let (session, released) =
            tracked_session(FakeBehavior::ChunksThenPending(text_chunks(&["data: a\n\n"])));
        let mut stream = session.start().expect("start");
        assert_eq!(
            stream.next_event().await,
            Some(SessionEvent::Payload("a".into()))
        );
        assert!(!released.load(Ordering::SeqCst));

        drop(stream);
        wait_until_released(&released).await;
    }
}
