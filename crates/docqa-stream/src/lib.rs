//! Streaming chat client for the document question-answering backend.
//!
//! The backend answers `POST /qa/conversations/{id}/chat/stream` with a chunked
//! body of `data: ...` events separated by blank lines and terminated by
//! `data: [DONE]`. This crate turns that body back into discrete payloads.
//!
//! # Listener usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docqa_stream::prelude::*;
//!
//! struct Printer;
//!
//! impl StreamListener for Printer {
//!     fn on_payload(&mut self, payload: &str) {
//!         println!("{payload}");
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let config = ClientConfig::from_env()?;
//! let transport = Arc::new(HttpTransport::new(&config)?);
//! let request = StreamRequest::chat(&config, "conversation-id", &ChatRequest::new("What is RAG?"))?;
//!
//! let mut session = StreamSession::new(transport, request);
//! let outcome = session.run(&mut Printer).await?;
//! outcome.into_result()?;
//! # Ok(())
//! # }
//! ```

/// Chunk buffer splitting decoded text into event units.
pub mod buffer;
/// Client and session configuration.
pub mod config;
/// Streaming UTF-8 decoder.
pub mod decoder;
/// Public error types.
pub mod errors;
/// Event unit classification.
pub mod event;
/// Logging setup.
pub mod observability;
/// Optional typed view of answer payloads.
pub mod payload;
/// Common imports for typical usage.
pub mod prelude;
/// Chat request body and streaming request description.
pub mod request;
/// Stream session state machine, abort handle and spawned stream handle.
pub mod session;
/// Session events, outcome and listener trait.
pub mod stream;
/// Transport seam and the HTTP implementation.
pub mod transport;

pub use buffer::{ChunkBuffer, TrailingPolicy};
pub use config::{ClientConfig, SessionConfig};
pub use decoder::TextDecoder;
pub use errors::{ClientError, PayloadError, StreamFailure};
pub use event::{ParsedEvent, parse_unit};
pub use payload::{Answer, AnswerAccumulator, AnswerChunk, Reference};
pub use request::{ChatRequest, Method, StreamRequest};
pub use session::{AbortHandle, SessionState, SessionStream, StreamSession};
pub use stream::{SessionEvent, StreamListener, StreamOutcome};
pub use transport::{ByteStream, ChatTransport, HttpTransport};
