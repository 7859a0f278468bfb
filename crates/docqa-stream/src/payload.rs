//! Caller-side interpretation of chat payloads.
//!
//! The session never looks inside payloads. These helpers decode the shapes
//! the QA backend emits: a `references` event before generation starts,
//! OpenAI-style `choices[0].delta.content` tokens, and `{"error": ...}`
//! events when the model call fails.

use tracing::debug;

use crate::errors::{PayloadError, StreamFailure};
use crate::stream::StreamListener;

/// A retrieved document chunk the answer is grounded on.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Reference {
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// One decoded payload.
#[derive(Clone, Debug, PartialEq)]
pub enum AnswerChunk {
    References(Vec<Reference>),
    /// Incremental answer text.
    Delta(String),
    /// Error reported in-band by the generation service.
    Error(String),
    /// Any other JSON object (role headers, finish markers, usage...).
    Other(serde_json::Value),
}

impl AnswerChunk {
    /// Decodes a raw payload string.
    pub fn parse(payload: &str) -> Result<Self, PayloadError> {
        let value: serde_json::Value = serde_json::from_str(payload)?;

        if value.get("type").and_then(|v| v.as_str()) == Some("references") {
            let Some(refs) = value.get("references") else {
                return Err(PayloadError::Shape("references event without references".into()));
            };
            let refs = if refs.is_null() {
                Vec::new()
            } else {
                serde_json::from_value(refs.clone())
                    .map_err(|e| PayloadError::Shape(format!("invalid references: {e}")))?
            };
            return Ok(Self::References(refs));
        }

        if let Some(content) = value
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            return Ok(Self::Delta(content.to_string()));
        }

        if let Some(error) = value.get("error") {
            let message = match error {
                serde_json::Value::String(s) => s.clone(),
                other => other
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(ToOwned::to_owned)
                    .unwrap_or_else(|| other.to_string()),
            };
            return Ok(Self::Error(message));
        }

        Ok(Self::Other(value))
    }
}

/// Answer assembled from a full chat stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Answer {
    pub content: String,
    pub references: Vec<Reference>,
    /// In-band errors reported by the generation service.
    pub errors: Vec<String>,
}

/// Folds payloads into an `Answer`.
///
/// Used as a `StreamListener`, undecodable payloads are skipped and counted.
#[derive(Debug, Default)]
pub struct AnswerAccumulator {
    answer: Answer,
    skipped: usize,
    completed: bool,
    failure: Option<StreamFailure>,
}

impl AnswerAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one payload and merges it into the answer.
    pub fn absorb(&mut self, payload: &str) -> Result<(), PayloadError> {
        match AnswerChunk::parse(payload)? {
            AnswerChunk::References(refs) => self.answer.references = refs,
            AnswerChunk::Delta(text) => self.answer.content.push_str(&text),
            AnswerChunk::Error(message) => self.answer.errors.push(message),
            AnswerChunk::Other(_) => {}
        }
        Ok(())
    }

    /// Answer text received so far.
    pub fn content(&self) -> &str {
        &self.answer.content
    }

    /// Number of payloads that could not be decoded.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn failure(&self) -> Option<&StreamFailure> {
        self.failure.as_ref()
    }

    pub fn into_answer(self) -> Answer {
        self.answer
    }
}

impl StreamListener for AnswerAccumulator {
    fn on_payload(&mut self, payload: &str) {
        if let Err(err) = self.absorb(payload) {
            self.skipped += 1;
            debug!(error = %err, "skipping undecodable chat payload");
        }
    }

    fn on_complete(&mut self) {
        self.completed = true;
    }

    fn on_error(&mut self, failure: &StreamFailure) {
        self.failure = Some(failure.clone());
    }
}
