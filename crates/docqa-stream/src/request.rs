use crate::config::ClientConfig;
use crate::errors::ClientError;

/// Body of a chat request sent to `/qa/conversations/{id}/chat/stream`.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatRequest {
    /// The user's question.
    pub query: String,
    /// Folder ids scoping retrieval; the conversation's defaults apply when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_base_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_rerank: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_top_n: Option<u32>,
}

impl ChatRequest {
    /// Creates a request carrying only the question.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Restricts retrieval to the given knowledge bases.
    pub fn knowledge_bases<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        self.knowledge_base_ids = (!ids.is_empty()).then_some(ids);
        self
    }

    pub fn top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    /// Enables reranking, optionally keeping only the best `top_n` results.
    pub fn rerank(mut self, top_n: Option<u32>) -> Self {
        self.use_rerank = Some(true);
        self.rerank_top_n = top_n;
        self
    }

    /// Checks the same bounds the backend enforces.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.query.trim().is_empty() {
            return Err(ClientError::Validation("query must not be empty".into()));
        }
        if let Some(top_k) = self.top_k
            && !(1..=200).contains(&top_k)
        {
            return Err(ClientError::Validation(format!(
                "top_k must be within 1..=200, got {top_k}"
            )));
        }
        if let Some(threshold) = self.similarity_threshold
            && !(0.0..=1.0).contains(&threshold)
        {
            return Err(ClientError::Validation(format!(
                "similarity_threshold must be within 0..=1, got {threshold}"
            )));
        }
        if let Some(top_n) = self.rerank_top_n
            && !(1..=50).contains(&top_n)
        {
            return Err(ClientError::Validation(format!(
                "rerank_top_n must be within 1..=50, got {top_n}"
            )));
        }
        Ok(())
    }
}

/// HTTP method of a streaming request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Method {
    #[default]
    Post,
    Get,
}

/// Everything needed to open one streaming HTTP request.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRequest {
    pub method: Method,
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` when present.
    pub bearer_token: Option<String>,
    pub body: serde_json::Value,
}

impl StreamRequest {
    /// Builds the chat stream request for a conversation.
    pub fn chat(
        config: &ClientConfig,
        conversation_id: &str,
        chat: &ChatRequest,
    ) -> Result<Self, ClientError> {
        if conversation_id.trim().is_empty() {
            return Err(ClientError::Validation(
                "conversation_id must not be empty".into(),
            ));
        }
        chat.validate()?;
        let body = serde_json::to_value(chat)
            .map_err(|e| ClientError::Validation(format!("failed to serialize chat request: {e}")))?;
        Ok(Self {
            method: Method::Post,
            url: config.chat_stream_url(conversation_id.trim()),
            bearer_token: config.token.clone().filter(|t| !t.trim().is_empty()),
            body,
        })
    }
}
