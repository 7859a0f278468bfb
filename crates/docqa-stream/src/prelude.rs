pub use crate::{
    AbortHandle, Answer, AnswerAccumulator, AnswerChunk, ChatRequest, ChatTransport,
    ClientConfig, ClientError, HttpTransport, SessionConfig, SessionEvent, SessionStream,
    StreamFailure, StreamListener, StreamOutcome, StreamRequest, StreamSession, TrailingPolicy,
};
