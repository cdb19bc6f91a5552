//! Skein: core types and traits for an LLM generation session pipeline
//!
//! This crate holds everything that does not need an async runtime:
//! conversation templates and rendering, generation parameters, the host-side
//! sampling pipeline, and the traits through which the pipeline talks to a
//! model runtime, a tokenizer and a grammar engine.
//! The session itself lives in `skein-runtime`.

pub mod chat_template;
pub mod conversation;
pub mod error;
pub mod grammar;
pub mod logits;
pub mod model;
pub mod sampler;
pub mod sampling;
pub mod tokenizer;

pub use chat_template::{ConversationTemplate, Role, RoleNames};
pub use conversation::{
    same_conversation, ContentPart, Conversation, Message, MessageContent, PromptSegment,
    RenderScope,
};
pub use error::{Error, Result};
pub use grammar::{GrammarEngine, GrammarMatcher, GrammarSpec, TokenBitmask};
pub use logits::{LogitProcessor, TokenSuppressor};
pub use model::{KvCacheOps, ModelConfig, ModelRuntime};
pub use sampler::{Sampled, Sampler, StageTimings, TokenLogprob};
pub use sampling::{resolve, GenerationConfig, ResolvedConfig, ResponseFormat, SamplingDefaults};
pub use tokenizer::{ByteTokenizer, Tokenizer};
