//! Skein Serve: `OpenAI`-compatible protocol layer over a skein session
//!
//! This crate converts `OpenAI` Chat Completions and Completions requests
//! into skein conversations and generation configs, runs them through a
//! [`skein_runtime::SessionHandle`], and converts the results back. It is a
//! **library** with no HTTP server of its own: an HTTP front end only needs
//! to deserialize the request, call [`ChatEngine`], and serialize the
//! response (or each chunk as an SSE event).
//!
//! # Example
//!
//! ```ignore
//! use skein_runtime::{Session, SessionConfig};
//! use skein_serve::{ChatEngine, ChatCompletionRequest};
//!
//! let session = Session::create(model, tokenizer, SessionConfig::from_file("config.json")?)?;
//! let (engine, _task) = ChatEngine::spawn("my-model", session, 32);
//!
//! let request: ChatCompletionRequest = serde_json::from_slice(&body)?;
//! let response = engine.chat_completion(request).await?;
//! ```

mod chat;
pub mod types;

pub use chat::{build_conversation, chat_generation_config, validate_chat_request, ChatEngine};
pub use types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    CompletionRequest, CompletionResponse, ErrorResponse, ModelListResponse,
};
