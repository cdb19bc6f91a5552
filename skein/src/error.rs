//! Error types for Skein

use thiserror::Error;

/// Result type alias using Skein's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Skein operations.
///
/// Benign termination (stop strings, token limits, exhausted windows,
/// cancellation) is never an error; it is reported as a finish reason.
/// Everything here means the request could not be served or the pipeline
/// is broken.
#[derive(Error, Debug)]
pub enum Error {
    /// Conflicting or missing session settings. Fatal at construction.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The request is malformed. Raised before any model call.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(
        "Prompt of {prompt_tokens} tokens does not fit: {filled} already in cache, \
         context window is {context_window_size}"
    )]
    ContextWindowExceeded {
        prompt_tokens: usize,
        filled: usize,
        context_window_size: usize,
    },

    /// The operation is not valid in the session's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An internal invariant was violated. Never retried.
    #[error("Internal invariant violated: {0}")]
    Invariant(String),

    #[error("Model runtime error: {0}")]
    Runtime(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// The grammar engine could not compile the requested schema or grammar.
    #[error("Grammar error: {0}")]
    Grammar(String),

    #[error("Channel closed: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error was caused by the caller's request or settings
    /// rather than by the pipeline itself.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidInput(_)
                | Self::ContextWindowExceeded { .. }
                | Self::Grammar(_)
                | Self::Json(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_window_message_names_all_sizes() {
        let err = Error::ContextWindowExceeded {
            prompt_tokens: 10,
            filled: 4090,
            context_window_size: 4096,
        };
        let msg = err.to_string();
        assert!(msg.contains("10 tokens"));
        assert!(msg.contains("4090"));
        assert!(msg.contains("4096"));
        assert!(err.is_client_error());
    }

    #[test]
    fn invariant_is_not_client_error() {
        assert!(!Error::Invariant("mismatch".into()).is_client_error());
        assert!(!Error::Runtime("device lost".into()).is_client_error());
    }

    #[test]
    fn uncompilable_grammar_is_client_error() {
        assert!(Error::Grammar("unexpected end of schema".into()).is_client_error());
    }
}
