//! OpenAI-compatible request/response types
//!
//! Hand-rolled serde structs matching the `OpenAI` Chat Completions and
//! Completions APIs, plus a few extensions used by skein sessions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use skein::ResponseFormat;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A chat message in the `OpenAI` messages format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, `assistant` or `tool`.
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ChatContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    /// A message with plain text content.
    #[must_use]
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(ChatContent::Text(content.into())),
            ..Self::default()
        }
    }
}

/// Message content: a bare string or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// `http(s)://` URL or `data:` URI.
    pub url: String,
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// A tool the model may call. Only `function` tools exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// A call the model made, in requests (assistant history) and responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON-encoded arguments object.
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// `POST /v1/chat/completions` request body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    /// Extension: repetition penalty factor (not in `OpenAI` spec).
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    /// Token id (as a decimal string) to additive bias.
    #[serde(default)]
    pub logit_bias: Option<HashMap<String, f32>>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub n: Option<usize>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stream_options: Option<StreamOptions>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub logprobs: Option<bool>,
    #[serde(default)]
    pub top_logprobs: Option<usize>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    #[serde(default)]
    pub tools: Option<Vec<Tool>>,
    /// Extension: keep generating past the stop tokens.
    #[serde(default)]
    pub ignore_eos: Option<bool>,
    /// Extension: `false` injects an empty thinking block for reasoning models.
    #[serde(default)]
    pub enable_thinking: Option<bool>,
    /// Extension: report per-stage sampling time in `usage`.
    #[serde(default)]
    pub latency_breakdown: Option<bool>,
}

/// `POST /v1/completions` request body (plain text, no chat template).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub logit_bias: Option<HashMap<String, f32>>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub ignore_eos: Option<bool>,
}

/// The `stop` field can be a single string or an array of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    Single(String),
    Multiple(Vec<String>),
}

impl StopSequences {
    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::Single(s) => vec![s],
            Self::Multiple(v) => v,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

// ---------------------------------------------------------------------------
// Non-streaming responses
// ---------------------------------------------------------------------------

/// `POST /v1/chat/completions` response (non-streaming).
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: AssistantMessage,
    pub finish_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<ChoiceLogprobs>,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// `POST /v1/completions` response.
#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    /// Extension: session performance figures of the last request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<UsageExtra>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageExtra {
    pub time_to_first_token_s: f64,
    pub prefill_tokens_per_s: f64,
    pub decode_tokens_per_s: f64,
    pub e2e_latency_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_breakdown: Option<skein_runtime::LatencyBreakdown>,
}

// ---------------------------------------------------------------------------
// Log-probabilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChoiceLogprobs {
    pub content: Vec<LogprobEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogprobEntry {
    pub token: String,
    pub logprob: f32,
    pub top_logprobs: Vec<TopLogprob>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopLogprob {
    pub token: String,
    pub logprob: f32,
}

// ---------------------------------------------------------------------------
// Streaming response (SSE chunks)
// ---------------------------------------------------------------------------

/// A single SSE chunk for streaming chat completions.
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChunkChoice>,
    /// Only on the trailing usage chunk, which has no choices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Serialize)]
pub struct ChatChunkChoice {
    pub index: usize,
    pub delta: ChatDelta,
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<ChoiceLogprobs>,
}

#[derive(Debug, Default, Serialize)]
pub struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

// ---------------------------------------------------------------------------
// Models list
// ---------------------------------------------------------------------------

/// `GET /v1/models` response.
#[derive(Debug, Serialize)]
pub struct ModelListResponse {
    pub object: String,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// OpenAI-style error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    /// HTTP status an HTTP front end should answer with.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        if self.error.error_type == "invalid_request_error" {
            400
        } else {
            500
        }
    }
}

impl From<skein::Error> for ErrorResponse {
    fn from(e: skein::Error) -> Self {
        let (error_type, code) = match &e {
            skein::Error::ContextWindowExceeded { .. } => {
                ("invalid_request_error", Some("context_length_exceeded"))
            }
            e if e.is_client_error() => ("invalid_request_error", None),
            _ => ("server_error", None),
        };
        Self {
            error: ErrorBody {
                message: e.to_string(),
                error_type: error_type.to_string(),
                param: None,
                code: code.map(str::to_string),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_part_content() {
        let request: ChatCompletionRequest = serde_json::from_str(
            r#"{
                "model": "m",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": [
                        {"type": "text", "text": "what is this?"},
                        {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA"}}
                    ]}
                ],
                "stop": "END",
                "logit_bias": {"42": -100},
                "stream_options": {"include_usage": true},
                "response_format": {"type": "json_object"}
            }"#,
        )
        .unwrap();

        assert_eq!(
            request.messages[0].content,
            Some(ChatContent::Text("be brief".into()))
        );
        let Some(ChatContent::Parts(parts)) = &request.messages[1].content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[1], ChatContentPart::ImageUrl { image_url } if image_url.url.starts_with("data:")));
        assert_eq!(request.stop.unwrap().into_vec(), vec!["END".to_string()]);
        assert_eq!(request.logit_bias.unwrap()["42"], -100.0);
        assert!(request.stream_options.unwrap().include_usage);
        assert_eq!(
            request.response_format,
            Some(ResponseFormat::JsonObject { schema: None })
        );
    }

    #[test]
    fn parses_assistant_tool_calls() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"role": "assistant", "tool_calls": [
                {"id": "call_1", "type": "function",
                 "function": {"name": "f", "arguments": "{\"x\": 1}"}}
            ]}"#,
        )
        .unwrap();
        assert!(msg.content.is_none());
        assert_eq!(msg.tool_calls.unwrap()[0].function.name, "f");
    }

    #[test]
    fn error_response_maps_kinds() {
        let client = ErrorResponse::from(skein::Error::InvalidInput("bad".into()));
        assert_eq!(client.error.error_type, "invalid_request_error");
        assert_eq!(client.status_code(), 400);

        let window = ErrorResponse::from(skein::Error::ContextWindowExceeded {
            prompt_tokens: 10,
            filled: 0,
            context_window_size: 5,
        });
        assert_eq!(window.error.code.as_deref(), Some("context_length_exceeded"));

        let server = ErrorResponse::from(skein::Error::Runtime("oom".into()));
        assert_eq!(server.status_code(), 500);
        let json = serde_json::to_value(&server).unwrap();
        assert_eq!(json["error"]["type"], "server_error");
        assert!(json["error"].get("code").is_none());
    }
}
