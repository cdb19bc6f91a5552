//! Serialized request queue in front of a session
//!
//! [`SessionHandle::spawn`] moves a [`Session`] into a tokio task that
//! serves requests one at a time over an [`rpc`](crate::rpc) channel. The
//! handle is cheap to clone and can be shared across tasks; concurrent
//! callers are queued in arrival order.

use futures::Stream;
use skein::{Conversation, Error, GenerationConfig, ModelRuntime, Result, Tokenizer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::completion::{Completion, ResponseChunk};
use crate::rpc::{self, Envelope, RpcClient, RpcServer};
use crate::session::{InterruptHandle, Session};

/// Chunks buffered between the session task and a slow stream consumer.
const STREAM_BUFFER: usize = 16;

enum SessionRequest {
    Complete {
        conversation: Conversation,
        config: GenerationConfig,
    },
    Stream {
        conversation: Conversation,
        config: GenerationConfig,
        chunks: mpsc::Sender<Result<ResponseChunk>>,
    },
    ResetChat {
        keep_stats: bool,
    },
    Stats,
}

enum SessionResponse {
    Completion(Result<Completion>),
    /// Prefill finished (or failed); chunks follow on the stream channel.
    StreamStarted(Result<()>),
    Reset(Result<()>),
    Stats(String),
}

/// Client side of a session task.
#[derive(Clone)]
pub struct SessionHandle {
    client: RpcClient<SessionRequest, SessionResponse>,
    interrupt: InterruptHandle,
}

impl SessionHandle {
    /// Move `session` into a new task. `queue_depth` bounds how many
    /// requests may wait before callers block.
    ///
    /// Returns the handle and the task, which ends once every handle is
    /// dropped.
    pub fn spawn<R, T>(session: Session<R, T>, queue_depth: usize) -> (Self, JoinHandle<()>)
    where
        R: ModelRuntime + 'static,
        T: Tokenizer + 'static,
    {
        let interrupt = session.interrupt_handle();
        let (client, server) = rpc::channel(queue_depth.max(1));
        let task = tokio::spawn(serve(session, server));
        (Self { client, interrupt }, task)
    }

    /// Run a request to completion.
    ///
    /// # Errors
    /// Any session error, or [`Error::Channel`] if the task is gone.
    pub async fn complete(
        &self,
        conversation: Conversation,
        config: GenerationConfig,
    ) -> Result<Completion> {
        match self
            .client
            .call(SessionRequest::Complete {
                conversation,
                config,
            })
            .await?
        {
            SessionResponse::Completion(result) => result,
            _ => Err(unexpected_response()),
        }
    }

    /// Start a streamed request. Prefill errors are returned here; errors
    /// during decoding arrive as stream items. Dropping the stream aborts
    /// generation.
    ///
    /// # Errors
    /// Any prefill error, or [`Error::Channel`] if the task is gone.
    pub async fn stream(
        &self,
        conversation: Conversation,
        config: GenerationConfig,
    ) -> Result<impl Stream<Item = Result<ResponseChunk>> + Send + 'static> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        match self
            .client
            .call(SessionRequest::Stream {
                conversation,
                config,
                chunks: tx,
            })
            .await?
        {
            SessionResponse::StreamStarted(result) => result?,
            _ => return Err(unexpected_response()),
        }
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        }))
    }

    /// Clear the session's cache and conversation.
    ///
    /// # Errors
    /// Any cache error, or [`Error::Channel`] if the task is gone.
    pub async fn reset_chat(&self, keep_stats: bool) -> Result<()> {
        match self
            .client
            .call(SessionRequest::ResetChat { keep_stats })
            .await?
        {
            SessionResponse::Reset(result) => result,
            _ => Err(unexpected_response()),
        }
    }

    /// One-line throughput summary.
    ///
    /// # Errors
    /// Returns [`Error::Channel`] if the task is gone.
    pub async fn stats_text(&self) -> Result<String> {
        match self.client.call(SessionRequest::Stats).await? {
            SessionResponse::Stats(text) => Ok(text),
            _ => Err(unexpected_response()),
        }
    }

    /// Abort the request currently being generated, if any.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }
}

fn unexpected_response() -> Error {
    Error::Invariant("session task answered with the wrong response kind".into())
}

async fn serve<R: ModelRuntime, T: Tokenizer>(
    mut session: Session<R, T>,
    mut server: RpcServer<SessionRequest, SessionResponse>,
) {
    while let Some(Envelope { id, request }) = server.next_request().await {
        let response = match request {
            SessionRequest::Complete {
                conversation,
                config,
            } => SessionResponse::Completion(
                session.generate(conversation, &config, 1, |_, _| {}).await,
            ),
            SessionRequest::Stream {
                conversation,
                config,
                chunks,
            } => {
                if let Err(e) = pump_stream(&mut session, &server, id, conversation, &config, chunks).await {
                    tracing::warn!(%id, error = %e, "stream ended with an error");
                }
                continue;
            }
            SessionRequest::ResetChat { keep_stats } => {
                SessionResponse::Reset(session.reset_chat(keep_stats))
            }
            SessionRequest::Stats => SessionResponse::Stats(session.stats_text()),
        };
        if server.respond(id, response).await.is_err() {
            break;
        }
    }
    tracing::debug!("session task finished");
}

/// Prefill, acknowledge, then forward chunks until the request ends.
async fn pump_stream<R: ModelRuntime, T: Tokenizer>(
    session: &mut Session<R, T>,
    server: &RpcServer<SessionRequest, SessionResponse>,
    id: uuid::Uuid,
    conversation: Conversation,
    config: &GenerationConfig,
    chunks: mpsc::Sender<Result<ResponseChunk>>,
) -> Result<()> {
    let mut stream = match session.stream(conversation, config).await {
        Ok(stream) => stream,
        Err(e) => {
            return server
                .respond(id, SessionResponse::StreamStarted(Err(e)))
                .await;
        }
    };
    server
        .respond(id, SessionResponse::StreamStarted(Ok(())))
        .await?;

    loop {
        let item = match stream.next_chunk().await {
            Ok(Some(chunk)) => Ok(chunk),
            Ok(None) => return Ok(()),
            Err(e) => Err(e),
        };
        let failed = item.is_err();
        if chunks.send(item).await.is_err() {
            tracing::debug!(%id, "stream receiver dropped, aborting");
            return stream.close().await;
        }
        if failed {
            return Ok(());
        }
    }
}
