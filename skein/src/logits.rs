//! Stateful logit post-processing hook.
//!
//! A [`LogitProcessor`] runs inside the sampler right after the grammar
//! bitmask and before logit bias, and is told which token was finally
//! sampled. It lets callers plug in constrained-decoding variants that live
//! outside the grammar engine.

/// Stateful hook over raw logits.
pub trait LogitProcessor: Send {
    /// Rewrite the logits of the current step in place.
    fn process_logits(&mut self, logits: &mut [f32]);

    /// Observe the token sampled this step.
    fn process_sampled_token(&mut self, token: u32);

    /// Forget all per-request state. Called at the start of every request.
    fn reset_state(&mut self);
}

/// Suppresses a fixed set of tokens by setting their logits to negative infinity.
#[derive(Debug, Clone, Default)]
pub struct TokenSuppressor {
    tokens: Vec<u32>,
}

impl TokenSuppressor {
    #[must_use]
    pub fn new(tokens: Vec<u32>) -> Self {
        Self { tokens }
    }
}

impl LogitProcessor for TokenSuppressor {
    fn process_logits(&mut self, logits: &mut [f32]) {
        for &t in &self.tokens {
            if let Some(l) = logits.get_mut(t as usize) {
                *l = f32::NEG_INFINITY;
            }
        }
    }

    fn process_sampled_token(&mut self, _token: u32) {}

    fn reset_state(&mut self) {}
}
