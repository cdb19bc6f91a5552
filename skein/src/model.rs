//! Model runtime interface
//!
//! The session pipeline drives an opaque model runtime: it embeds token ids
//! and images, runs forward passes over prefill chunks and single decode
//! tokens, and manages one logical KV-cache sequence. Tensor execution lives
//! behind these traits.

use async_trait::async_trait;

use crate::Result;

/// Static facts about a loaded model that the pipeline needs for planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    /// Number of logits returned by each forward pass.
    pub vocab_size: usize,
    /// Fixed number of cache positions one image occupies, for multimodal models.
    pub image_embed_size: Option<usize>,
}

/// KV-cache lifecycle primitives for the single sequence a session owns.
pub trait KvCacheOps: Send {
    /// Register a fresh logical sequence. Called after every [`clear`](Self::clear).
    ///
    /// # Errors
    /// Returns an error if the cache cannot allocate the sequence.
    fn add_sequence(&mut self) -> Result<()>;

    /// Announce that the next forward pass appends `len` positions.
    ///
    /// # Errors
    /// Returns an error if the cache cannot grow by `len`.
    fn begin_step(&mut self, len: usize) -> Result<()>;

    /// Commit the positions announced by the last [`begin_step`](Self::begin_step).
    ///
    /// # Errors
    /// Returns an error if no step is in progress.
    fn end_step(&mut self) -> Result<()>;

    /// Drop every sequence and all cached positions.
    fn clear(&mut self);

    /// Switch the cache to ring-buffer mode: at most `window_size` positions
    /// are kept beyond an unevictable prefix of `sink_size`.
    ///
    /// # Errors
    /// Returns an error if the model does not support sliding windows.
    fn enable_sliding_window(&mut self, window_size: usize, sink_size: usize) -> Result<()>;

    /// Total positions appended to the current sequence, including evicted ones.
    fn total_sequence_length(&self) -> usize;
}

/// A loaded model that can embed inputs and compute next-token logits.
#[async_trait]
pub trait ModelRuntime: KvCacheOps {
    /// Device-resident embedding of a run of tokens or of one image.
    type Embedding: Send;

    fn config(&self) -> ModelConfig;

    /// Embed a run of token ids.
    ///
    /// # Errors
    /// Returns an error if an id is out of vocabulary or the device fails.
    async fn embed(&mut self, tokens: &[u32]) -> Result<Self::Embedding>;

    /// Embed one image into exactly `image_embed_size` positions.
    ///
    /// # Errors
    /// Returns an error if the image cannot be loaded or the model is text-only.
    async fn embed_image(&mut self, image_url: &str) -> Result<Self::Embedding>;

    /// Run one forward pass over the concatenated embeddings, which span
    /// `chunk_len` positions, and return the logits of the last position.
    ///
    /// # Errors
    /// Returns an error if the device fails.
    async fn forward(&mut self, embeddings: Vec<Self::Embedding>, chunk_len: usize)
        -> Result<Vec<f32>>;

    /// Wait for all queued device work to finish.
    ///
    /// # Errors
    /// Returns an error if the device reports a failure.
    async fn synchronize(&mut self) -> Result<()>;
}
