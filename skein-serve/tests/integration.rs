//! Integration tests for the skein-serve protocol layer.
//!
//! Uses a scripted mock model and the byte tokenizer to exercise the
//! request/response conversions without a real model.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use skein::{
    ByteTokenizer, ConversationTemplate, Error, KvCacheOps, ModelConfig, ModelRuntime,
    Result as SkeinResult, Role, Tokenizer,
};
use skein_runtime::{Session, SessionConfig};
use skein_serve::types::{ChatContent, ChatContentPart, ImageUrl, StreamOptions, Tool};
use skein_serve::{ChatCompletionRequest, ChatEngine, ChatMessage, CompletionRequest};

// ---------------------------------------------------------------------------
// MockModel: replays a token script, one token per synchronize
// ---------------------------------------------------------------------------

struct MockModel {
    script: Vec<u32>,
    cursor: usize,
    seq_len: usize,
    step_len: usize,
    clears: Arc<Mutex<usize>>,
}

impl MockModel {
    /// Replies `replies` in order, each followed by EOS.
    fn replying(replies: &[&str]) -> Self {
        let mut script = Vec::new();
        for reply in replies {
            script.extend(ByteTokenizer.encode(reply).unwrap());
            script.push(ByteTokenizer::EOS);
        }
        Self {
            script,
            cursor: 0,
            seq_len: 0,
            step_len: 0,
            clears: Arc::new(Mutex::new(0)),
        }
    }
}

impl KvCacheOps for MockModel {
    fn add_sequence(&mut self) -> SkeinResult<()> {
        Ok(())
    }

    fn begin_step(&mut self, len: usize) -> SkeinResult<()> {
        self.step_len = len;
        Ok(())
    }

    fn end_step(&mut self) -> SkeinResult<()> {
        self.seq_len += self.step_len;
        Ok(())
    }

    fn clear(&mut self) {
        self.seq_len = 0;
        *self.clears.lock().unwrap() += 1;
    }

    fn enable_sliding_window(&mut self, _window_size: usize, _sink_size: usize) -> SkeinResult<()> {
        Ok(())
    }

    fn total_sequence_length(&self) -> usize {
        self.seq_len
    }
}

#[async_trait]
impl ModelRuntime for MockModel {
    type Embedding = usize;

    fn config(&self) -> ModelConfig {
        ModelConfig {
            vocab_size: ByteTokenizer::VOCAB_SIZE,
            image_embed_size: None,
        }
    }

    async fn embed(&mut self, tokens: &[u32]) -> SkeinResult<usize> {
        Ok(tokens.len())
    }

    async fn embed_image(&mut self, _image_url: &str) -> SkeinResult<usize> {
        Err(Error::Runtime("text-only model".into()))
    }

    async fn forward(&mut self, _embeddings: Vec<usize>, _chunk_len: usize) -> SkeinResult<Vec<f32>> {
        let next = self.script.get(self.cursor).copied().unwrap_or(ByteTokenizer::EOS);
        let mut logits = vec![0.0_f32; ByteTokenizer::VOCAB_SIZE];
        logits[next as usize] = 100.0;
        Ok(logits)
    }

    async fn synchronize(&mut self) -> SkeinResult<()> {
        self.cursor += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine(model: MockModel) -> ChatEngine {
    engine_with_template(model, ConversationTemplate::vicuna_v1())
}

fn engine_with_template(model: MockModel, template: ConversationTemplate) -> ChatEngine {
    init_tracing();
    let config = SessionConfig::new(template).with_context_window(2048);
    let session = Session::create(model, ByteTokenizer, config).unwrap();
    ChatEngine::spawn("mock-model", session, 8).0
}

/// Vicuna with a user template that lists the available functions.
fn vicuna_with_functions() -> ConversationTemplate {
    let mut template = ConversationTemplate::vicuna_v1();
    template.role_templates = Some(
        [(Role::User, "{user_message}\nFunctions: {function_string}".to_string())]
            .into_iter()
            .collect(),
    );
    template
}

fn weather_tools() -> Vec<Tool> {
    serde_json::from_str(
        r#"[{"type": "function", "function": {"name": "get_weather",
            "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}}}]"#,
    )
    .unwrap()
}

fn chat_request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: "mock-model".into(),
        messages,
        ..ChatCompletionRequest::default()
    }
}

// ---------------------------------------------------------------------------
// Chat completions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chat_completion_returns_reply() {
    let engine = engine(MockModel::replying(&["Hello there"]));
    let response = engine
        .chat_completion(chat_request(vec![ChatMessage::text("user", "Hi")]))
        .await
        .unwrap();

    assert_eq!(response.object, "chat.completion");
    assert_eq!(response.model, "mock-model");
    assert!(response.id.starts_with("chatcmpl-"));
    assert_eq!(response.choices.len(), 1);
    let choice = &response.choices[0];
    assert_eq!(choice.message.role, "assistant");
    assert_eq!(choice.message.content.as_deref(), Some("Hello there"));
    assert_eq!(choice.finish_reason, "stop");
    assert_eq!(response.usage.completion_tokens, "Hello there".len());
    assert_eq!(
        response.usage.total_tokens,
        response.usage.prompt_tokens + response.usage.completion_tokens
    );
}

#[tokio::test]
async fn response_serializes_like_openai() {
    let engine = engine(MockModel::replying(&["ok"]));
    let response = engine
        .chat_completion(chat_request(vec![ChatMessage::text("user", "Hi")]))
        .await
        .unwrap();
    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["choices"][0]["message"]["content"], "ok");
    assert_eq!(json["choices"][0]["finish_reason"], "stop");
    assert!(json["choices"][0].get("logprobs").is_none());
    assert!(json["choices"][0]["message"].get("tool_calls").is_none());
    assert!(json["usage"]["prompt_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn follow_up_turn_reuses_the_cache() {
    let model = MockModel::replying(&["first", "second"]);
    let clears = Arc::clone(&model.clears);
    let engine = engine(model);

    let turn1 = engine
        .chat_completion(chat_request(vec![ChatMessage::text("user", "Hi")]))
        .await
        .unwrap();
    let clears_after_turn1 = *clears.lock().unwrap();

    let turn2 = engine
        .chat_completion(chat_request(vec![
            ChatMessage::text("user", "Hi"),
            ChatMessage::text("assistant", "first"),
            ChatMessage::text("user", "And?"),
        ]))
        .await
        .unwrap();

    assert_eq!(turn2.choices[0].message.content.as_deref(), Some("second"));
    assert_eq!(*clears.lock().unwrap(), clears_after_turn1);
    assert!(turn2.usage.prompt_tokens < turn1.usage.prompt_tokens);
}

#[tokio::test]
async fn n_choices_each_run_a_full_request() {
    let model = MockModel::replying(&["one", "two", "three"]);
    let clears = Arc::clone(&model.clears);
    let engine = engine(model);
    let clears_before = *clears.lock().unwrap();

    let mut request = chat_request(vec![ChatMessage::text("user", "Count")]);
    request.n = Some(3);
    let response = engine.chat_completion(request).await.unwrap();

    let texts: Vec<_> = response
        .choices
        .iter()
        .map(|c| c.message.content.clone().unwrap())
        .collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
    let indices: Vec<_> = response.choices.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    // Every choice starts from an empty cache.
    assert_eq!(*clears.lock().unwrap(), clears_before + 3);
    assert_eq!(response.usage.completion_tokens, 3 + 3 + 5);
}

#[tokio::test]
async fn tool_call_reply_is_reported_as_tool_calls() {
    let reply = r#"[{"name": "get_weather", "arguments": {"city": "Paris"}}]"#;
    let engine = engine_with_template(MockModel::replying(&[reply]), vicuna_with_functions());
    let mut request = chat_request(vec![ChatMessage::text("user", "Weather in Paris?")]);
    request.tools = Some(weather_tools());

    let response = engine.chat_completion(request).await.unwrap();
    let choice = &response.choices[0];
    assert_eq!(choice.finish_reason, "tool_calls");
    assert!(choice.message.content.is_none());
    let calls = choice.message.tool_calls.as_ref().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].call_type, "function");
    assert_eq!(calls[0].function.name, "get_weather");
    let args: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
    assert_eq!(args["city"], "Paris");
}

#[tokio::test]
async fn tools_rejected_when_template_cannot_show_them() {
    let engine = engine(MockModel::replying(&["sunny"]));
    let mut request = chat_request(vec![ChatMessage::text("user", "Weather in Paris?")]);
    request.tools = Some(weather_tools());

    let err = engine.chat_completion(request).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(err.error.error_type, "invalid_request_error");
    assert!(err.error.message.contains("function calling"));
}

#[tokio::test]
async fn logprobs_carry_token_text() {
    let engine = engine(MockModel::replying(&["ab"]));
    let mut request = chat_request(vec![ChatMessage::text("user", "Hi")]);
    request.logprobs = Some(true);
    request.top_logprobs = Some(1);

    let response = engine.chat_completion(request).await.unwrap();
    let logprobs = response.choices[0].logprobs.as_ref().unwrap();
    let tokens: Vec<_> = logprobs.content.iter().map(|e| e.token.as_str()).collect();
    assert_eq!(tokens, vec!["a", "b"]);
    assert_eq!(logprobs.content[0].top_logprobs[0].token, "a");
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_requests_get_client_errors() {
    let engine = engine(MockModel::replying(&["unused"]));

    let empty = engine.chat_completion(chat_request(vec![])).await.unwrap_err();
    assert_eq!(empty.error.error_type, "invalid_request_error");
    assert_eq!(empty.status_code(), 400);

    let ends_with_assistant = engine
        .chat_completion(chat_request(vec![
            ChatMessage::text("user", "Hi"),
            ChatMessage::text("assistant", "Hello"),
        ]))
        .await
        .unwrap_err();
    assert_eq!(ends_with_assistant.status_code(), 400);

    let mut bad_top_p = chat_request(vec![ChatMessage::text("user", "Hi")]);
    bad_top_p.top_p = Some(1.5);
    let err = engine.chat_completion(bad_top_p).await.unwrap_err();
    assert!(err.error.message.contains("top_p"));

    let mut image_for_text_model = chat_request(vec![ChatMessage {
        role: "user".into(),
        content: Some(ChatContent::Parts(vec![ChatContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "https://example.com/cat.png".into(),
            },
        }])),
        ..ChatMessage::default()
    }]);
    image_for_text_model.max_tokens = Some(4);
    let err = engine.chat_completion(image_for_text_model).await.unwrap_err();
    assert_eq!(err.status_code(), 400);

    // The session is still usable afterwards.
    let ok = engine
        .chat_completion(chat_request(vec![ChatMessage::text("user", "Hi")]))
        .await
        .unwrap();
    assert_eq!(ok.choices[0].message.content.as_deref(), Some("unused"));
}

#[tokio::test]
async fn prompt_over_the_window_is_context_length_exceeded() {
    init_tracing();
    let config = SessionConfig::new(ConversationTemplate::vicuna_v1()).with_context_window(16);
    let session = Session::create(MockModel::replying(&["x"]), ByteTokenizer, config).unwrap();
    let (engine, _task) = ChatEngine::spawn("tiny", session, 1);

    let err = engine
        .chat_completion(chat_request(vec![ChatMessage::text("user", "Hi")]))
        .await
        .unwrap_err();
    assert_eq!(err.error.code.as_deref(), Some("context_length_exceeded"));
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stream_yields_role_then_deltas_then_usage() {
    let engine = engine(MockModel::replying(&["Streamed!"]));
    let mut request = chat_request(vec![ChatMessage::text("user", "Hi")]);
    request.stream = Some(true);
    request.stream_options = Some(StreamOptions {
        include_usage: true,
    });

    let chunks: Vec<_> = engine
        .chat_completion_stream(request)
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;

    assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
    assert!(chunks[1..]
        .iter()
        .flat_map(|c| &c.choices)
        .all(|c| c.delta.role.is_none()));
    assert!(chunks.iter().all(|c| c.id == chunks[0].id));

    let text: String = chunks
        .iter()
        .flat_map(|c| &c.choices)
        .filter_map(|c| c.delta.content.as_deref())
        .collect();
    assert_eq!(text, "Streamed!");

    let (usage_chunk, rest) = chunks.split_last().unwrap();
    assert!(usage_chunk.choices.is_empty());
    assert_eq!(usage_chunk.usage.as_ref().unwrap().completion_tokens, 9);
    let finish = rest.last().unwrap();
    assert_eq!(finish.choices[0].finish_reason.as_deref(), Some("stop"));
    assert!(rest.iter().all(|c| c.usage.is_none()));
}

#[tokio::test]
async fn stream_rejects_multiple_choices() {
    let engine = engine(MockModel::replying(&["x"]));
    let mut request = chat_request(vec![ChatMessage::text("user", "Hi")]);
    request.stream = Some(true);
    request.n = Some(2);
    let err = engine.chat_completion_stream(request).await.err().unwrap();
    assert_eq!(err.status_code(), 400);
}

// ---------------------------------------------------------------------------
// Plain completions and misc
// ---------------------------------------------------------------------------

#[tokio::test]
async fn plain_completion_skips_the_template() {
    let engine = engine(MockModel::replying(&[" lived a fox"]));
    let response = engine
        .completion(CompletionRequest {
            prompt: "Once upon a time".into(),
            ..CompletionRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(response.object, "text_completion");
    assert_eq!(response.choices[0].text, " lived a fox");
    // BOS plus the raw prompt bytes.
    assert_eq!(response.usage.prompt_tokens, 1 + "Once upon a time".len());

    let err = engine
        .completion(CompletionRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn models_stats_and_reset() {
    let engine = engine(MockModel::replying(&["hey"]));
    let models = engine.models();
    assert_eq!(models.data[0].id, "mock-model");
    assert_eq!(engine.model(), "mock-model");

    engine
        .chat_completion(chat_request(vec![ChatMessage::text("user", "Hi")]))
        .await
        .unwrap();
    assert!(engine.stats().await.unwrap().starts_with("prefill: "));
    engine.reset(false).await.unwrap();
}
