//! Ask the QA backend one question and stream the answer to stdout.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use docqa_stream::observability::init_observability;
use docqa_stream::prelude::*;
use docqa_stream::Reference;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "docqa-chat", about = "Stream an answer from the document QA backend")]
struct Cli {
    /// Conversation to post the question to.
    #[arg(short, long)]
    conversation: String,
    /// Knowledge base (folder) ids to search; repeatable.
    #[arg(long = "kb")]
    knowledge_bases: Vec<String>,
    #[arg(long)]
    top_k: Option<u32>,
    #[arg(long)]
    similarity_threshold: Option<f64>,
    /// Rerank retrieved chunks before answering.
    #[arg(long)]
    rerank: bool,
    #[arg(long, requires = "rerank")]
    rerank_top_n: Option<u32>,
    /// API root; falls back to DOCQA_API_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,
    /// Bearer token; falls back to DOCQA_API_TOKEN.
    #[arg(long, env = "DOCQA_API_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Print raw payloads instead of the rendered answer.
    #[arg(long)]
    raw: bool,
    /// Drop a final event that arrives without its blank-line terminator.
    #[arg(long)]
    strict_framing: bool,
    /// The question.
    query: String,
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig, ClientError> {
        let mut config = ClientConfig::from_env()?;
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(token) = self.token.as_deref().filter(|t| !t.trim().is_empty()) {
            config = config.token(token.trim());
        }
        Ok(config)
    }

    fn chat_request(&self) -> ChatRequest {
        let mut request = ChatRequest::new(self.query.clone())
            .knowledge_bases(self.knowledge_bases.iter().cloned());
        request.top_k = self.top_k;
        request.similarity_threshold = self.similarity_threshold;
        if self.rerank {
            request = request.rerank(self.rerank_top_n);
        }
        request
    }

    fn session_config(&self) -> SessionConfig {
        let policy = if self.strict_framing {
            TrailingPolicy::Discard
        } else {
            TrailingPolicy::Deliver
        };
        SessionConfig::default().trailing_policy(policy)
    }
}

/// Terminal rendering of a streamed answer.
#[derive(Default)]
struct Renderer {
    raw: bool,
    references: Vec<Reference>,
    wrote_text: bool,
}

impl Renderer {
    fn payload(&mut self, out: &mut impl std::io::Write, payload: &str) -> std::io::Result<()> {
        if self.raw {
            return writeln!(out, "{payload}");
        }
        match AnswerChunk::parse(payload) {
            Ok(AnswerChunk::Delta(text)) => {
                self.wrote_text |= !text.is_empty();
                write!(out, "{text}")?;
                out.flush()
            }
            Ok(AnswerChunk::References(refs)) => {
                self.references = refs;
                Ok(())
            }
            Ok(AnswerChunk::Error(message)) => {
                eprintln!("answer service error: {message}");
                Ok(())
            }
            Ok(AnswerChunk::Other(_)) => Ok(()),
            Err(err) => {
                debug!(error = %err, "skipping undecodable payload");
                Ok(())
            }
        }
    }

    fn completed(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        if self.wrote_text {
            writeln!(out)?;
        }
        if self.raw || self.references.is_empty() {
            return Ok(());
        }
        writeln!(out, "\nReferences:")?;
        for (i, reference) in self.references.iter().enumerate() {
            let snippet: String = reference.content.chars().take(80).collect();
            writeln!(
                out,
                "  [{}] {} #{} ({:.2}) {}",
                i + 1,
                reference.document_id,
                reference.chunk_index,
                reference.similarity,
                snippet.replace('\n', " ")
            )?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_observability("warn");

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, ClientError> {
    let config = cli.client_config()?;
    let request = StreamRequest::chat(&config, &cli.conversation, &cli.chat_request())?;
    let transport = Arc::new(HttpTransport::new(&config)?);
    let mut stream = StreamSession::new(transport, request)
        .with_config(cli.session_config())
        .start()?;
    let abort = stream.abort_handle();

    let mut renderer = Renderer {
        raw: cli.raw,
        ..Renderer::default()
    };
    let mut stdout = std::io::stdout().lock();
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                abort.abort();
                eprintln!("\ninterrupted");
                return Ok(ExitCode::from(130));
            }
            event = stream.next_event() => event,
        };
        match event {
            Some(SessionEvent::Payload(payload)) => {
                if let Err(err) = renderer.payload(&mut stdout, &payload) {
                    abort.abort();
                    return Err(ClientError::Protocol(format!("failed to write answer: {err}")));
                }
            }
            Some(SessionEvent::Completed) => {
                renderer
                    .completed(&mut stdout)
                    .map_err(|e| ClientError::Protocol(format!("failed to write answer: {e}")))?;
                break;
            }
            Some(SessionEvent::Failed(failure)) => {
                eprintln!("stream failed: {failure}");
                return Ok(ExitCode::FAILURE);
            }
            None => break,
        }
    }

    stream.finish().await?.into_result()?;
    Ok(ExitCode::SUCCESS)
}
