//! Skein Runtime: the generation session pipeline
//!
//! This crate turns a conversation into model input, drives the
//! prefill/decode loop against a [`skein::ModelRuntime`], and assembles the
//! output as a single [`Completion`] or a stream of [`ResponseChunk`]s.
//!
//! # Architecture
//!
//! ```text
//! SessionHandle        ← request queue, one task per session
//!   └── Session<R, T>  ← prefill/decode loop, reuse detection, stop engine
//!         ├── WindowManager   ← filled-cache length vs. window
//!         ├── plan_chunks     ← prefill chunking (images stay whole)
//!         ├── Sampler         ← bitmask, hook, bias, penalties, top-p
//!         └── R: ModelRuntime ← embed + forward + KV-cache primitives
//! ```

pub mod completion;
pub mod config;
mod handle;
pub mod prefill;
pub mod rpc;
mod session;
pub mod stats;
pub mod stop;
pub mod window;

pub use completion::{
    parse_function_calls, Completion, CompletionStream, FunctionCall, LatencyBreakdown,
    ResponseChunk, Usage,
};
pub use config::{SessionConfig, DEFAULT_PREFILL_CHUNK_SIZE};
pub use handle::SessionHandle;
pub use prefill::{plan_chunks, PrefillChunk, PrefillInput};
pub use session::{InterruptHandle, Session};
pub use stats::{RoundStats, RuntimeStats};
pub use stop::{FinishReason, StopCondition};
pub use window::{WindowConfig, WindowManager};
