//! Chat engine: wire requests in, session calls, wire responses out
//!
//! [`ChatEngine`] owns a [`SessionHandle`] for one model. Requests are
//! validated and converted to a [`Conversation`] plus a
//! [`GenerationConfig`] before anything reaches the session, so malformed
//! input never touches the cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{Stream, StreamExt};
use skein::{
    ContentPart, Conversation, ConversationTemplate, Error, GenerationConfig, MessageContent,
    ModelRuntime, Result, Role, TokenLogprob, Tokenizer,
};
use skein_runtime::{Completion, FunctionCall, ResponseChunk, Session, SessionHandle};
use tokio::task::JoinHandle;

use crate::types::{
    AssistantMessage, ChatChoice, ChatChunkChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChatContent, ChatContentPart, ChatDelta, ChatMessage, ChoiceLogprobs,
    CompletionChoice, CompletionRequest, CompletionResponse, ErrorResponse, LogprobEntry,
    ModelListResponse, ModelObject, StopSequences, ToolCall, ToolCallFunction, TopLogprob, Usage,
    UsageExtra,
};

/// Serves `OpenAI`-style requests against one session.
#[derive(Clone)]
pub struct ChatEngine {
    model: String,
    created: u64,
    template: Arc<ConversationTemplate>,
    tokenizer: Arc<dyn Tokenizer>,
    handle: SessionHandle,
}

impl ChatEngine {
    /// Move `session` into a background task and serve it under `model`.
    ///
    /// The tokenizer is cloned to render log-probability tokens as text.
    pub fn spawn<R, T>(
        model: impl Into<String>,
        session: Session<R, T>,
        queue_depth: usize,
    ) -> (Self, JoinHandle<()>)
    where
        R: ModelRuntime + 'static,
        T: Tokenizer + Clone + 'static,
    {
        let template = Arc::clone(session.template());
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(session.tokenizer().clone());
        let (handle, task) = SessionHandle::spawn(session, queue_depth);
        let engine = Self {
            model: model.into(),
            created: unix_now(),
            template,
            tokenizer,
            handle,
        };
        tracing::info!(model = %engine.model, "chat engine started");
        (engine, task)
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// `GET /v1/models`
    #[must_use]
    pub fn models(&self) -> ModelListResponse {
        ModelListResponse {
            object: "list".to_string(),
            data: vec![ModelObject {
                id: self.model.clone(),
                object: "model".to_string(),
                created: self.created,
                owned_by: "skein".to_string(),
            }],
        }
    }

    /// Non-streaming chat completion. Each of the `n` choices is a full
    /// prefill and decode.
    ///
    /// # Errors
    /// An error body for invalid requests and session failures.
    pub async fn chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> std::result::Result<ChatCompletionResponse, ErrorResponse> {
        validate_chat_request(&request)?;
        if request.stream == Some(true) {
            return Err(Error::InvalidInput(
                "use chat_completion_stream for streaming requests".into(),
            )
            .into());
        }
        let conversation = build_conversation(&self.template, &request)?;
        let config = chat_generation_config(&request)?;
        let n = request.n.unwrap_or(1);

        let mut choices = Vec::with_capacity(n);
        let mut usage = Usage::default();
        for index in 0..n {
            let completion = self
                .handle
                .complete(conversation.clone(), config.clone())
                .await?;
            accumulate_usage(&mut usage, &completion.usage);
            choices.push(self.chat_choice(index, completion));
        }
        tracing::debug!(
            model = %self.model,
            n,
            completion_tokens = usage.completion_tokens,
            "chat completion served"
        );

        Ok(ChatCompletionResponse {
            id: new_id("chatcmpl"),
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: self.model.clone(),
            choices,
            usage,
        })
    }

    /// Streaming chat completion. The first chunk carries the assistant
    /// role, the last one the finish reason. With
    /// `stream_options.include_usage`, a trailing chunk with no choices
    /// carries usage.
    ///
    /// Dropping the stream aborts generation.
    ///
    /// # Errors
    /// An error body for invalid requests and prefill failures. Errors
    /// during decoding arrive as stream items.
    pub async fn chat_completion_stream(
        &self,
        request: ChatCompletionRequest,
    ) -> std::result::Result<
        impl Stream<Item = std::result::Result<ChatCompletionChunk, ErrorResponse>> + Send + 'static,
        ErrorResponse,
    > {
        validate_chat_request(&request)?;
        if request.n.unwrap_or(1) != 1 {
            return Err(Error::InvalidInput("streaming supports only n = 1".into()).into());
        }
        let conversation = build_conversation(&self.template, &request)?;
        let config = chat_generation_config(&request)?;
        let include_usage = request
            .stream_options
            .as_ref()
            .is_some_and(|o| o.include_usage);

        let chunks = self.handle.stream(conversation, config).await?;

        let id = new_id("chatcmpl");
        let created = unix_now();
        let model = self.model.clone();
        let tokenizer = Arc::clone(&self.tokenizer);
        Ok(chunks.enumerate().flat_map(move |(i, item)| {
            let out = match item {
                Ok(chunk) => {
                    let wire = WireChunk {
                        id: &id,
                        created,
                        model: &model,
                    };
                    wire.convert(i == 0, chunk, include_usage, tokenizer.as_ref())
                }
                Err(e) => vec![Err(ErrorResponse::from(e))],
            };
            futures::stream::iter(out)
        }))
    }

    /// Plain text completion. The prompt is fed as-is, without the chat
    /// template, and always starts from an empty cache.
    ///
    /// # Errors
    /// An error body for invalid requests and session failures.
    pub async fn completion(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<CompletionResponse, ErrorResponse> {
        if request.prompt.is_empty() {
            return Err(Error::InvalidInput("prompt must not be empty".into()).into());
        }
        let config = GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            repetition_penalty: request.repetition_penalty,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            logit_bias: parse_logit_bias(request.logit_bias.as_ref())?,
            stop: request.stop.map(StopSequences::into_vec),
            max_tokens: request.max_tokens,
            ignore_eos: request.ignore_eos.unwrap_or(false),
            seed: request.seed,
            ..GenerationConfig::default()
        };
        let conversation = Conversation::plain(Arc::clone(&self.template), request.prompt);
        let completion = self.handle.complete(conversation, config).await?;

        let mut usage = Usage::default();
        accumulate_usage(&mut usage, &completion.usage);
        Ok(CompletionResponse {
            id: new_id("cmpl"),
            object: "text_completion".to_string(),
            created: unix_now(),
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                text: completion.text,
                finish_reason: completion.finish_reason.to_string(),
            }],
            usage,
        })
    }

    /// Clear the session's cache.
    ///
    /// # Errors
    /// An error body if the session task is gone.
    pub async fn reset(&self, keep_stats: bool) -> std::result::Result<(), ErrorResponse> {
        Ok(self.handle.reset_chat(keep_stats).await?)
    }

    /// One-line throughput summary of the session.
    ///
    /// # Errors
    /// An error body if the session task is gone.
    pub async fn stats(&self) -> std::result::Result<String, ErrorResponse> {
        Ok(self.handle.stats_text().await?)
    }

    /// Abort the request currently being generated.
    pub fn interrupt(&self) {
        self.handle.interrupt();
    }

    fn chat_choice(&self, index: usize, completion: Completion) -> ChatChoice {
        let tool_calls = completion.tool_calls.as_deref().map(wire_tool_calls);
        let content = if tool_calls.is_some() {
            None
        } else {
            Some(completion.text)
        };
        ChatChoice {
            index,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content,
                tool_calls,
            },
            finish_reason: completion.finish_reason.to_string(),
            logprobs: completion
                .logprobs
                .as_deref()
                .map(|lp| wire_logprobs(lp, self.tokenizer.as_ref())),
        }
    }
}

/// Fields shared by every chunk of one streamed response.
struct WireChunk<'a> {
    id: &'a str,
    created: u64,
    model: &'a str,
}

impl WireChunk<'_> {
    fn chunk(&self, choices: Vec<ChatChunkChoice>, usage: Option<Usage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.to_string(),
            choices,
            usage,
        }
    }

    fn convert(
        &self,
        first: bool,
        chunk: ResponseChunk,
        include_usage: bool,
        tokenizer: &dyn Tokenizer,
    ) -> Vec<std::result::Result<ChatCompletionChunk, ErrorResponse>> {
        let tool_calls = chunk.tool_calls.as_deref().map(wire_tool_calls);
        let content = (tool_calls.is_none() && (first || !chunk.delta.is_empty()))
            .then_some(chunk.delta);
        let choice = ChatChunkChoice {
            index: 0,
            delta: ChatDelta {
                role: first.then(|| "assistant".to_string()),
                content,
                tool_calls,
            },
            finish_reason: chunk.finish_reason.map(|r| r.to_string()),
            logprobs: chunk
                .logprobs
                .as_deref()
                .filter(|lp| !lp.is_empty())
                .map(|lp| wire_logprobs(lp, tokenizer)),
        };

        let mut out = vec![Ok(self.chunk(vec![choice], None))];
        if let (true, Some(session_usage)) = (include_usage, chunk.usage.as_ref()) {
            let mut usage = Usage::default();
            accumulate_usage(&mut usage, session_usage);
            out.push(Ok(self.chunk(Vec::new(), Some(usage))));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Request conversion
// ---------------------------------------------------------------------------

fn parse_role(role: &str) -> Result<Role> {
    match role {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" => Ok(Role::Tool),
        other => Err(Error::InvalidInput(format!("unknown message role {other:?}"))),
    }
}

/// Check the message list before any conversion.
///
/// # Errors
/// Returns [`Error::InvalidInput`] for an empty list, a misplaced system
/// message, a last message that is not user or tool input, multi-part
/// content outside user messages, or a bad `n`.
pub fn validate_chat_request(request: &ChatCompletionRequest) -> Result<()> {
    let Some(last) = request.messages.last() else {
        return Err(Error::InvalidInput("messages must not be empty".into()));
    };
    for (i, msg) in request.messages.iter().enumerate() {
        let role = parse_role(&msg.role)?;
        if role == Role::System && i != 0 {
            return Err(Error::InvalidInput(format!(
                "system message must be the first message, found at index {i}"
            )));
        }
        if matches!(msg.content, Some(ChatContent::Parts(_))) && role != Role::User {
            return Err(Error::InvalidInput(format!(
                "only user messages may have multi-part content, message {i} is {}",
                msg.role
            )));
        }
        if role != Role::Assistant && msg.content.is_none() {
            return Err(Error::InvalidInput(format!("message {i} has no content")));
        }
    }
    if !matches!(parse_role(&last.role)?, Role::User | Role::Tool) {
        return Err(Error::InvalidInput(
            "last message must be from user or tool".into(),
        ));
    }
    match request.n {
        Some(0) => Err(Error::InvalidInput("n must be at least 1".into())),
        Some(n) if n > 1 && request.stream == Some(true) => Err(Error::InvalidInput(
            "streaming supports only n = 1".into(),
        )),
        _ => Ok(()),
    }
}

fn message_content(content: &ChatContent) -> MessageContent {
    match content {
        ChatContent::Text(text) => MessageContent::Text(text.clone()),
        ChatContent::Parts(parts) => MessageContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    ChatContentPart::Text { text } => ContentPart::Text(text.clone()),
                    ChatContentPart::ImageUrl { image_url } => {
                        ContentPart::ImageUrl(image_url.url.clone())
                    }
                })
                .collect(),
        ),
    }
}

/// Text the model would have produced for an assistant turn.
fn assistant_text(msg: &ChatMessage) -> Result<String> {
    if let Some(calls) = msg.tool_calls.as_ref().filter(|c| !c.is_empty()) {
        let calls = calls
            .iter()
            .map(|call| -> Result<FunctionCall> {
                Ok(FunctionCall {
                    name: call.function.name.clone(),
                    arguments: serde_json::from_str(&call.function.arguments)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(serde_json::to_string(&calls)?);
    }
    match &msg.content {
        Some(ChatContent::Text(text)) => Ok(text.clone()),
        _ => Ok(String::new()),
    }
}

/// Turn a validated request into a conversation ending with the new input.
///
/// # Errors
/// Returns [`Error::InvalidInput`] if a message cannot be appended or the
/// request has tools the template cannot render, and [`Error::Json`] for
/// malformed tool-call arguments.
pub fn build_conversation(
    template: &Arc<ConversationTemplate>,
    request: &ChatCompletionRequest,
) -> Result<Conversation> {
    let mut conversation = Conversation::new(Arc::clone(template));
    if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
        if !template.supports_function_calling() {
            return Err(Error::InvalidInput(format!(
                "template '{}' does not support function calling",
                template.name
            )));
        }
        let functions: Vec<_> = tools.iter().map(|t| &t.function).collect();
        conversation.set_function_calling(serde_json::to_string(&functions)?)?;
    }
    for msg in &request.messages {
        match parse_role(&msg.role)? {
            Role::System => {
                if let Some(ChatContent::Text(text)) = &msg.content {
                    conversation.set_system_message(text.clone())?;
                }
            }
            Role::Assistant => {
                conversation.append_message(Role::Assistant, assistant_text(msg)?)?;
            }
            role => {
                let content = msg.content.as_ref().ok_or_else(|| {
                    Error::InvalidInput(format!("{} message has no content", msg.role))
                })?;
                conversation.append_message(role, message_content(content))?;
            }
        }
    }
    if request.enable_thinking == Some(false) {
        // Earlier replies were generated with the empty thinking block.
        conversation.mark_thinking_suppressed();
    }
    Ok(conversation)
}

fn parse_logit_bias(bias: Option<&HashMap<String, f32>>) -> Result<Option<HashMap<u32, f32>>> {
    bias.map(|bias| {
        bias.iter()
            .map(|(token, &value)| {
                token
                    .parse::<u32>()
                    .map(|id| (id, value))
                    .map_err(|_| {
                        Error::InvalidInput(format!("logit_bias key {token:?} is not a token id"))
                    })
            })
            .collect::<Result<HashMap<u32, f32>>>()
    })
    .transpose()
}

/// Map the sampling fields of a chat request.
///
/// # Errors
/// Returns [`Error::InvalidInput`] for a non-numeric `logit_bias` key.
pub fn chat_generation_config(request: &ChatCompletionRequest) -> Result<GenerationConfig> {
    Ok(GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        repetition_penalty: request.repetition_penalty,
        frequency_penalty: request.frequency_penalty,
        presence_penalty: request.presence_penalty,
        logit_bias: parse_logit_bias(request.logit_bias.as_ref())?,
        stop: request.stop.clone().map(StopSequences::into_vec),
        max_tokens: request.max_tokens,
        ignore_eos: request.ignore_eos.unwrap_or(false),
        logprobs: request.logprobs.unwrap_or(false),
        top_logprobs: request.top_logprobs,
        response_format: request.response_format.clone(),
        suppress_thinking: request.enable_thinking == Some(false),
        seed: request.seed,
        latency_breakdown: request.latency_breakdown.unwrap_or(false),
    })
}

// ---------------------------------------------------------------------------
// Response conversion
// ---------------------------------------------------------------------------

fn accumulate_usage(total: &mut Usage, usage: &skein_runtime::Usage) {
    total.prompt_tokens += usage.prompt_tokens;
    total.completion_tokens += usage.completion_tokens;
    total.total_tokens += usage.total_tokens;
    total.extra = Some(UsageExtra {
        time_to_first_token_s: usage.time_to_first_token_s,
        prefill_tokens_per_s: usage.prefill_tokens_per_s,
        decode_tokens_per_s: usage.decode_tokens_per_s,
        e2e_latency_s: usage.e2e_latency_s,
        latency_breakdown: usage.latency_breakdown,
    });
}

fn wire_tool_calls(calls: &[FunctionCall]) -> Vec<ToolCall> {
    calls
        .iter()
        .map(|call| ToolCall {
            id: new_id("call"),
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        })
        .collect()
}

fn token_text(tokenizer: &dyn Tokenizer, token: u32) -> String {
    tokenizer
        .decode(&[token])
        .unwrap_or_else(|_| format!("<token {token}>"))
}

fn wire_logprobs(logprobs: &[TokenLogprob], tokenizer: &dyn Tokenizer) -> ChoiceLogprobs {
    ChoiceLogprobs {
        content: logprobs
            .iter()
            .map(|lp| LogprobEntry {
                token: token_text(tokenizer, lp.token),
                logprob: lp.logprob,
                top_logprobs: lp
                    .top
                    .iter()
                    .map(|&(token, logprob)| TopLogprob {
                        token: token_text(tokenizer, token),
                        logprob,
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
