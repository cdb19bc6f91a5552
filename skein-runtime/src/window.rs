//! KV-cache window bookkeeping
//!
//! The [`WindowManager`] tracks how many positions the model runtime's cache
//! holds and decides when the context window is full. Under a sliding window
//! old positions are evicted by the runtime, so the window never fills.

use skein::{Error, KvCacheOps, Result};

/// How the cache is bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowConfig {
    /// Hard cap on total cache length.
    Context { context_window_size: usize },
    /// Ring buffer of `sliding_window_size` positions after an unevictable
    /// prefix of `attention_sink_size`.
    Sliding {
        sliding_window_size: usize,
        attention_sink_size: usize,
    },
}

impl std::fmt::Display for WindowConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Context {
                context_window_size,
            } => write!(f, "context({context_window_size})"),
            Self::Sliding {
                sliding_window_size,
                attention_sink_size,
            } => write!(f, "sliding({sliding_window_size}, sink {attention_sink_size})"),
        }
    }
}

/// Filled-length counter for the session's single cache sequence.
#[derive(Debug, Clone)]
pub struct WindowManager {
    config: WindowConfig,
    filled_len: usize,
}

impl WindowManager {
    #[must_use]
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            filled_len: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> WindowConfig {
        self.config
    }

    /// Positions appended since the last reset.
    #[must_use]
    pub fn filled_len(&self) -> usize {
        self.filled_len
    }

    /// Clear the cache and register one fresh sequence, re-enabling the
    /// sliding window if configured.
    ///
    /// # Errors
    /// Returns an error if the cache rejects the new sequence.
    pub fn reset<C: KvCacheOps + ?Sized>(&mut self, cache: &mut C) -> Result<()> {
        cache.clear();
        cache.add_sequence()?;
        if let WindowConfig::Sliding {
            sliding_window_size,
            attention_sink_size,
        } = self.config
        {
            cache.enable_sliding_window(sliding_window_size, attention_sink_size)?;
        }
        self.filled_len = 0;
        Ok(())
    }

    /// Fail if appending `new_tokens` to the current cache would overflow
    /// the context window.
    ///
    /// # Errors
    /// Returns [`Error::ContextWindowExceeded`].
    pub fn check_capacity(&self, new_tokens: usize) -> Result<()> {
        self.check_capacity_from(self.filled_len, new_tokens)
    }

    /// Like [`check_capacity`](Self::check_capacity), but as if the cache
    /// held `filled` positions. Lets callers validate a prompt before
    /// deciding to reset.
    ///
    /// # Errors
    /// Returns [`Error::ContextWindowExceeded`].
    pub fn check_capacity_from(&self, filled: usize, new_tokens: usize) -> Result<()> {
        match self.config {
            WindowConfig::Context {
                context_window_size,
            } if filled + new_tokens > context_window_size => Err(Error::ContextWindowExceeded {
                prompt_tokens: new_tokens,
                filled,
                context_window_size,
            }),
            _ => Ok(()),
        }
    }

    /// Record `n` positions appended by a successful forward call.
    pub fn advance(&mut self, n: usize) {
        self.filled_len += n;
    }

    /// Whether the next decode step would overflow the context window.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        match self.config {
            WindowConfig::Context {
                context_window_size,
            } => self.filled_len + 1 > context_window_size,
            WindowConfig::Sliding { .. } => false,
        }
    }
}
