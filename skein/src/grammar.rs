//! Structured-output grammar engine interface
//!
//! Grammar compilation and matching are provided by an external engine. The
//! sampler only needs two things from a matcher: a per-step bitmask of
//! allowed tokens, and an acceptance step for the token it sampled.

use async_trait::async_trait;

use crate::Result;

/// What the output must conform to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GrammarSpec {
    /// Any valid JSON value.
    Json,
    /// JSON conforming to a JSON schema (the schema source string).
    JsonSchema(String),
    /// A BNF/EBNF grammar source string.
    Ebnf(String),
}

impl GrammarSpec {
    /// Key identifying the compiled matcher. Identical keys may reuse a
    /// matcher across turns.
    #[must_use]
    pub fn cache_key(&self) -> String {
        match self {
            Self::Json => "json".to_string(),
            Self::JsonSchema(s) => format!("schema:{s}"),
            Self::Ebnf(s) => format!("grammar:{s}"),
        }
    }
}

/// Packed allow/deny mask over the vocabulary, one bit per token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBitmask {
    words: Vec<u32>,
    vocab_size: usize,
}

impl TokenBitmask {
    /// A mask that allows every token.
    #[must_use]
    pub fn allow_all(vocab_size: usize) -> Self {
        let mut words = vec![u32::MAX; vocab_size.div_ceil(32)];
        let tail = vocab_size % 32;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u32 << tail) - 1;
            }
        }
        Self { words, vocab_size }
    }

    /// A mask that allows exactly the given tokens. Out-of-range ids are ignored.
    #[must_use]
    pub fn from_allowed(vocab_size: usize, allowed: &[u32]) -> Self {
        let mut mask = Self {
            words: vec![0; vocab_size.div_ceil(32)],
            vocab_size,
        };
        for &id in allowed {
            mask.set(id, true);
        }
        mask
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    #[must_use]
    pub fn is_allowed(&self, token: u32) -> bool {
        let idx = token as usize;
        idx < self.vocab_size && (self.words[idx / 32] >> (idx % 32)) & 1 == 1
    }

    pub fn set(&mut self, token: u32, allowed: bool) {
        let idx = token as usize;
        if idx >= self.vocab_size {
            return;
        }
        if allowed {
            self.words[idx / 32] |= 1 << (idx % 32);
        } else {
            self.words[idx / 32] &= !(1 << (idx % 32));
        }
    }

    /// Set the logit of every disallowed token to negative infinity.
    pub fn apply(&self, logits: &mut [f32]) {
        for (i, l) in logits.iter_mut().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            if !self.is_allowed(i as u32) {
                *l = f32::NEG_INFINITY;
            }
        }
    }
}

/// A compiled grammar tracking the output produced so far.
pub trait GrammarMatcher: Send {
    /// Mask of tokens that keep the output a valid prefix of the grammar.
    ///
    /// # Errors
    /// Returns an error if the engine fails.
    fn next_token_bitmask(&mut self, vocab_size: usize) -> Result<TokenBitmask>;

    /// Advance the matcher by one token. Returns `false` if the token is rejected.
    fn accept_token(&mut self, token: u32) -> bool;

    /// Rewind to the start of the grammar.
    fn reset(&mut self);
}

/// Compiles grammar specifications into matchers.
#[async_trait]
pub trait GrammarEngine: Send + Sync {
    /// Compile a specification into a fresh matcher.
    ///
    /// # Errors
    /// Returns an error if the grammar or schema is invalid.
    async fn compile(&self, spec: &GrammarSpec) -> Result<Box<dyn GrammarMatcher>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_respects_vocab_size() {
        let mask = TokenBitmask::allow_all(40);
        assert!(mask.is_allowed(0));
        assert!(mask.is_allowed(39));
        assert!(!mask.is_allowed(40));
        assert!(!mask.is_allowed(63));
    }

    #[test]
    fn from_allowed_masks_logits() {
        let mask = TokenBitmask::from_allowed(5, &[1, 3, 99]);
        let mut logits = vec![1.0; 5];
        mask.apply(&mut logits);
        assert_eq!(logits[1], 1.0);
        assert_eq!(logits[3], 1.0);
        assert!(logits[0].is_infinite() && logits[0] < 0.0);
        assert!(logits[4].is_infinite());
    }

    #[test]
    fn set_toggles_bits() {
        let mut mask = TokenBitmask::from_allowed(64, &[]);
        mask.set(33, true);
        assert!(mask.is_allowed(33));
        mask.set(33, false);
        assert!(!mask.is_allowed(33));
    }

    #[test]
    fn cache_keys_distinguish_kinds() {
        let schema = GrammarSpec::JsonSchema("{}".into());
        let grammar = GrammarSpec::Ebnf("{}".into());
        assert_ne!(schema.cache_key(), grammar.cache_key());
        assert_eq!(GrammarSpec::Json.cache_key(), "json");
    }
}
