//! Tokenizer integration
//!
//! Defines the [`Tokenizer`] trait. Concrete vocabularies are supplied by the
//! embedding application.

mod byte;

use crate::Result;

pub use byte::ByteTokenizer;

/// Trait for tokenizers that convert between text and token IDs.
///
/// The session uses this trait to turn rendered prompt text into ids and
/// sampled ids back into text.
pub trait Tokenizer: Send + Sync {
    /// Encode text to token IDs. No special tokens are added.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token IDs to text.
    ///
    /// Incomplete multi-byte sequences decode to U+FFFD.
    ///
    /// # Errors
    /// Returns an error if decoding fails.
    fn decode(&self, ids: &[u32]) -> Result<String>;
}
