//! Chunked prefill planning
//!
//! A rendered prompt becomes a list of [`PrefillInput`]s: runs of token ids
//! and image placeholders. [`plan_chunks`] packs them into chunks of at most
//! `prefill_chunk_size` positions. Token runs may be split across chunks;
//! an image is atomic and always travels alone.

use skein::{Error, Result};

/// One piece of model input, before embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefillInput {
    Tokens(Vec<u32>),
    /// An image occupying a fixed number of cache positions.
    Image { url: String, embed_size: usize },
}

impl PrefillInput {
    /// Number of cache positions this input occupies.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Tokens(ids) => ids.len(),
            Self::Image { embed_size, .. } => *embed_size,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inputs submitted to the model in a single forward call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrefillChunk {
    pub inputs: Vec<PrefillInput>,
    /// Positions appended to the cache by this chunk.
    pub len: usize,
}

impl PrefillChunk {
    fn push_tokens(&mut self, ids: &[u32]) {
        if let Some(PrefillInput::Tokens(last)) = self.inputs.last_mut() {
            last.extend_from_slice(ids);
        } else {
            self.inputs.push(PrefillInput::Tokens(ids.to_vec()));
        }
        self.len += ids.len();
    }
}

/// Pack `inputs` into chunks of at most `chunk_size` positions.
///
/// Consecutive token runs are merged greedily and split at chunk
/// boundaries. Each image becomes a singleton chunk. Empty inputs are
/// dropped.
///
/// # Errors
/// Returns [`Error::Config`] if `chunk_size` is zero or an image is larger
/// than `chunk_size`.
pub fn plan_chunks(inputs: &[PrefillInput], chunk_size: usize) -> Result<Vec<PrefillChunk>> {
    if chunk_size == 0 {
        return Err(Error::Config("prefill chunk size must be positive".into()));
    }

    let mut chunks = Vec::new();
    let mut current = PrefillChunk::default();

    for input in inputs {
        match input {
            PrefillInput::Tokens(ids) => {
                let mut rest = ids.as_slice();
                while !rest.is_empty() {
                    if current.len == chunk_size {
                        chunks.push(std::mem::take(&mut current));
                    }
                    let take = rest.len().min(chunk_size - current.len);
                    current.push_tokens(&rest[..take]);
                    rest = &rest[take..];
                }
            }
            PrefillInput::Image { embed_size, .. } => {
                if *embed_size > chunk_size {
                    return Err(Error::Config(format!(
                        "image embedding of {embed_size} positions exceeds prefill chunk size {chunk_size}"
                    )));
                }
                if current.len > 0 {
                    chunks.push(std::mem::take(&mut current));
                }
                chunks.push(PrefillChunk {
                    inputs: vec![input.clone()],
                    len: *embed_size,
                });
            }
        }
    }
    if current.len > 0 {
        chunks.push(current);
    }
    Ok(chunks)
}
