//! Host-side token sampling pipeline.
//!
//! [`Sampler::sample`] turns the raw logits of one decode step into a single
//! token. Stages run in a fixed order, each skipped when not applicable:
//!
//! 1. grammar bitmask (disallowed tokens become `-inf`)
//! 2. stateful [`LogitProcessor`] hook
//! 3. logit bias
//! 4. repetition, frequency and presence penalties
//! 5. temperature-scaled softmax
//! 6. top-p (nucleus) sampling
//!
//! Afterwards the sampled token's log-probability is recorded (if requested),
//! the appeared-token counts are updated and the hook observes the token.
//! Grammar acceptance is the caller's job, since the matcher belongs to the
//! session.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::grammar::TokenBitmask;
use crate::logits::LogitProcessor;
use crate::sampling::ResolvedConfig;
use crate::{Error, Result};

/// Temperatures below this are clamped to avoid dividing by zero.
pub const MIN_TEMPERATURE: f32 = 1e-6;

/// Wall-clock time spent in each sampling stage during one request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
    pub grammar_bitmask: Duration,
    pub logit_processor: Duration,
    pub logit_bias: Duration,
    pub penalties: Duration,
    pub softmax: Duration,
    pub top_p: Duration,
    pub grammar_accept: Duration,
}

impl StageTimings {
    #[must_use]
    pub fn total(&self) -> Duration {
        self.grammar_bitmask
            + self.logit_processor
            + self.logit_bias
            + self.penalties
            + self.softmax
            + self.top_p
            + self.grammar_accept
    }
}

/// Log-probability of a sampled token and its most likely alternatives.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenLogprob {
    pub token: u32,
    pub logprob: f32,
    /// `(token, logprob)` pairs, most probable first.
    pub top: Vec<(u32, f32)>,
}

/// Result of one sampling step.
#[derive(Debug, Clone, PartialEq)]
pub struct Sampled {
    pub token: u32,
    pub logprob: Option<TokenLogprob>,
}

/// Per-session sampler state: RNG, appeared-token counts, hook, timings.
pub struct Sampler {
    rng: StdRng,
    appeared: HashMap<u32, u32>,
    processor: Option<Box<dyn LogitProcessor>>,
    timings: StageTimings,
}

impl Sampler {
    /// Create a sampler with a seeded RNG. Same seed + same logits → same tokens.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            appeared: HashMap::new(),
            processor: None,
            timings: StageTimings::default(),
        }
    }

    /// Install (or remove) the stateful logit hook.
    pub fn set_processor(&mut self, processor: Option<Box<dyn LogitProcessor>>) {
        self.processor = processor;
    }

    /// Reset per-request state. A `seed` reseeds the RNG; otherwise the
    /// stream of random numbers continues from the previous request.
    pub fn begin_request(&mut self, seed: Option<u64>) {
        self.appeared.clear();
        self.timings = StageTimings::default();
        if let Some(seed) = seed {
            self.rng = StdRng::seed_from_u64(seed);
        }
        if let Some(p) = self.processor.as_mut() {
            p.reset_state();
        }
    }

    /// Token id → number of times sampled during the current request.
    #[must_use]
    pub fn appeared(&self) -> &HashMap<u32, u32> {
        &self.appeared
    }

    #[must_use]
    pub fn timings(&self) -> &StageTimings {
        &self.timings
    }

    /// Account time the caller spent computing the grammar bitmask.
    pub fn record_grammar_bitmask(&mut self, elapsed: Duration) {
        self.timings.grammar_bitmask += elapsed;
    }

    /// Account time the caller spent in grammar acceptance.
    pub fn record_grammar_accept(&mut self, elapsed: Duration) {
        self.timings.grammar_accept += elapsed;
    }

    /// Sample one token from `logits`, which are modified in place.
    ///
    /// # Errors
    /// Returns [`Error::Invariant`] if every token has been masked out.
    pub fn sample(
        &mut self,
        logits: &mut [f32],
        config: &ResolvedConfig,
        mask: Option<&TokenBitmask>,
    ) -> Result<Sampled> {
        if let Some(mask) = mask {
            let start = Instant::now();
            mask.apply(logits);
            self.timings.grammar_bitmask += start.elapsed();
        }

        if let Some(p) = self.processor.as_mut() {
            let start = Instant::now();
            p.process_logits(logits);
            self.timings.logit_processor += start.elapsed();
        }

        if !config.logit_bias.is_empty() {
            let start = Instant::now();
            for (&token, &bias) in &config.logit_bias {
                if let Some(l) = logits.get_mut(token as usize) {
                    *l += bias;
                }
            }
            self.timings.logit_bias += start.elapsed();
        }

        #[allow(clippy::float_cmp)]
        let repetition = config.repetition_penalty != 1.0;
        if !self.appeared.is_empty() && (repetition || config.has_frequency_penalties()) {
            let start = Instant::now();
            self.apply_penalties(logits, config);
            self.timings.penalties += start.elapsed();
        }

        let start = Instant::now();
        let probs = softmax_with_temperature(logits, config.temperature)?;
        self.timings.softmax += start.elapsed();

        let start = Instant::now();
        let token = self.sample_top_p(&probs, config.top_p);
        self.timings.top_p += start.elapsed();

        let logprob = config.logprobs.map(|k| token_logprob(&probs, token, k));

        *self.appeared.entry(token).or_insert(0) += 1;
        if let Some(p) = self.processor.as_mut() {
            p.process_sampled_token(token);
        }

        Ok(Sampled { token, logprob })
    }

    fn apply_penalties(&self, logits: &mut [f32], config: &ResolvedConfig) {
        #[allow(clippy::float_cmp)]
        let repetition = config.repetition_penalty != 1.0;
        for (&token, &count) in &self.appeared {
            let Some(l) = logits.get_mut(token as usize) else {
                continue;
            };
            if repetition {
                if *l > 0.0 {
                    *l /= config.repetition_penalty;
                } else {
                    *l *= config.repetition_penalty;
                }
            }
            #[allow(clippy::cast_precision_loss)]
            {
                *l -= count as f32 * config.frequency_penalty + config.presence_penalty;
            }
        }
    }

    /// Sample from the smallest prefix of tokens (by descending probability)
    /// whose cumulative probability exceeds `top_p`. A prefix that lands
    /// exactly on `top_p` takes the next token too.
    #[allow(clippy::cast_possible_truncation)]
    fn sample_top_p(&mut self, probs: &[f32], top_p: f32) -> u32 {
        let r: f32 = self.rng.gen();

        if top_p >= 1.0 {
            let mut cumul = 0.0f32;
            let mut last_nonzero = 0;
            for (idx, &p) in probs.iter().enumerate() {
                if p > 0.0 {
                    last_nonzero = idx;
                }
                cumul += p;
                if cumul >= r && p > 0.0 {
                    return idx as u32;
                }
            }
            // Rounding left the sum just below r.
            return last_nonzero as u32;
        }

        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut cumulative = 0.0f32;
        let mut cutoff = indexed.len();
        for (i, &(_, p)) in indexed.iter().enumerate() {
            cumulative += p;
            if cumulative > top_p {
                cutoff = i + 1;
                break;
            }
        }
        let nucleus = &indexed[..cutoff];

        let nucleus_sum: f32 = nucleus.iter().map(|(_, p)| p).sum();
        let mut cumul = 0.0;
        for &(idx, p) in nucleus {
            cumul += p / nucleus_sum;
            if cumul >= r {
                return idx as u32;
            }
        }

        // Fallback: most probable
        nucleus[0].0 as u32
    }
}

/// Softmax of `logits / max(temperature, MIN_TEMPERATURE)`.
///
/// # Errors
/// Returns [`Error::Invariant`] if no logit is finite.
pub fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Result<Vec<f32>> {
    let temperature = temperature.max(MIN_TEMPERATURE);
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max_logit.is_finite() {
        return Err(Error::Invariant(
            "no token left to sample: every logit is masked".into(),
        ));
    }
    let mut probs: Vec<f32> = logits
        .iter()
        .map(|&l| ((l - max_logit) / temperature).exp())
        .collect();
    let sum: f32 = probs.iter().sum();
    for p in &mut probs {
        *p /= sum;
    }
    Ok(probs)
}

fn token_logprob(probs: &[f32], token: u32, k: usize) -> TokenLogprob {
    let logprob = probs.get(token as usize).map_or(f32::NEG_INFINITY, |p| p.ln());
    let mut top = Vec::new();
    if k > 0 {
        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
        #[allow(clippy::cast_possible_truncation)]
        top.extend(indexed.into_iter().take(k).map(|(i, p)| (i as u32, p.ln())));
    }
    TokenLogprob {
        token,
        logprob,
        top,
    }
}
