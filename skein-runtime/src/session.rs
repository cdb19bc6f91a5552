//! Generation session
//!
//! A [`Session`] exclusively owns a model runtime, a tokenizer and the KV
//! cache state for one logical chat. Each request is one call to
//! [`Session::prefill`] followed by [`Session::decode`] until
//! [`Session::is_stopped`]. The drivers in [`crate::completion`] wrap this
//! loop.
//!
//! Between requests the session remembers the conversation its cache holds.
//! When the next request's history matches it, only the newest round is
//! prefilled; otherwise the cache is reset and everything is prefilled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use skein::conversation::RenderScope;
use skein::{
    resolve, same_conversation, ContentPart, Conversation, ConversationTemplate, Error,
    GenerationConfig, GrammarEngine, GrammarMatcher, GrammarSpec, LogitProcessor, ModelConfig,
    ModelRuntime, PromptSegment, ResolvedConfig, Result, Sampled, Sampler, StageTimings,
    TokenLogprob, Tokenizer,
};

use crate::completion::{parse_function_calls, LatencyBreakdown, Usage};
use crate::config::{SessionConfig, DEFAULT_SEED};
use crate::prefill::{plan_chunks, PrefillChunk, PrefillInput};
use crate::stats::{RoundStats, RuntimeStats};
use crate::stop::{FinishReason, StopCondition};
use crate::window::WindowManager;

/// Cooperative cancellation flag, polled before each decode step.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    /// Ask the current request to stop with [`FinishReason::Abort`].
    pub fn interrupt(&self) {
        tracing::debug!("interrupt requested");
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct CachedGrammar {
    key: String,
    matcher: Box<dyn GrammarMatcher>,
}

enum GrammarPlan {
    None,
    Reuse,
    Compile {
        spec: GrammarSpec,
        engine: Arc<dyn GrammarEngine>,
    },
}

/// Per-request state, replaced by every prefill.
struct Request {
    config: ResolvedConfig,
    stop: StopCondition,
    grammar_active: bool,
    prompt_tokens: usize,
    output_ids: Vec<u32>,
    output_text: String,
    logprobs: Vec<TokenLogprob>,
    /// Sampled but not yet forwarded.
    pending_token: Option<u32>,
    finish_reason: Option<FinishReason>,
    started: Instant,
    time_to_first_token: Duration,
    prefill_time: Duration,
    decode_steps: usize,
    decode_time: Duration,
}

impl Request {
    fn round_stats(&self) -> RoundStats {
        RoundStats {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.output_ids.len(),
            decode_steps: self.decode_steps,
            time_to_first_token: self.time_to_first_token,
            prefill_time: self.prefill_time,
            decode_time: self.decode_time,
        }
    }
}

/// Single-flight generation pipeline over one model runtime.
pub struct Session<R: ModelRuntime, T: Tokenizer> {
    model: R,
    tokenizer: T,
    config: SessionConfig,
    model_config: ModelConfig,
    template: Arc<ConversationTemplate>,
    window: WindowManager,
    /// Conversation whose rendering the cache currently holds.
    conversation: Option<Conversation>,
    sampler: Sampler,
    grammar_engine: Option<Arc<dyn GrammarEngine>>,
    grammar: Option<CachedGrammar>,
    interrupt: InterruptHandle,
    request: Option<Request>,
    stats: RuntimeStats,
}

impl<R: ModelRuntime, T: Tokenizer> Session<R, T> {
    /// Validate `config` against the model and prepare an empty cache.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for conflicting or missing window settings,
    /// a zero chunk size or an image embedding larger than a chunk, and
    /// propagates cache errors.
    pub fn create(mut model: R, tokenizer: T, config: SessionConfig) -> Result<Self> {
        let model_config = model.config();
        let window_config = config.validate(&model_config)?;
        let mut window = WindowManager::new(window_config);
        window.reset(&mut model)?;

        tracing::info!(
            template = %config.conv_template.name,
            window = %window_config,
            prefill_chunk_size = config.prefill_chunk_size,
            vocab_size = model_config.vocab_size,
            "session created"
        );

        Ok(Self {
            model,
            tokenizer,
            template: Arc::new(config.conv_template.clone()),
            sampler: Sampler::new(config.seed.unwrap_or(DEFAULT_SEED)),
            config,
            model_config,
            window,
            conversation: None,
            grammar_engine: None,
            grammar: None,
            interrupt: InterruptHandle::default(),
            request: None,
            stats: RuntimeStats::default(),
        })
    }

    /// Attach the engine used to compile structured-output grammars.
    #[must_use]
    pub fn with_grammar_engine(mut self, engine: Arc<dyn GrammarEngine>) -> Self {
        self.grammar_engine = Some(engine);
        self
    }

    /// Install a stateful logit hook that runs on every sampling step.
    #[must_use]
    pub fn with_logit_processor(mut self, processor: Box<dyn LogitProcessor>) -> Self {
        self.sampler.set_processor(Some(processor));
        self
    }

    /// Release the cache and hand back the model runtime and tokenizer.
    pub fn dispose(mut self) -> (R, T) {
        self.model.clear();
        tracing::info!(template = %self.template.name, "session disposed");
        (self.model, self.tokenizer)
    }

    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    #[must_use]
    pub fn template(&self) -> &Arc<ConversationTemplate> {
        &self.template
    }

    /// An empty conversation using this session's template.
    #[must_use]
    pub fn new_conversation(&self) -> Conversation {
        Conversation::new(Arc::clone(&self.template))
    }

    /// A plain-completion conversation using this session's template.
    #[must_use]
    pub fn new_plain_conversation(&self, prompt: impl Into<String>) -> Conversation {
        Conversation::plain(Arc::clone(&self.template), prompt)
    }

    #[must_use]
    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    #[must_use]
    pub fn window(&self) -> &WindowManager {
        &self.window
    }

    /// The conversation the cache currently holds, including the reply of
    /// the last request.
    #[must_use]
    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    #[must_use]
    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    #[must_use]
    pub fn stats_text(&self) -> String {
        self.stats.text()
    }

    /// Clear the cache and forget the conversation. The compiled grammar is
    /// kept.
    ///
    /// # Errors
    /// Propagates cache errors.
    pub fn reset_chat(&mut self, keep_stats: bool) -> Result<()> {
        self.window.reset(&mut self.model)?;
        self.conversation = None;
        self.request = None;
        if !keep_stats {
            self.stats = RuntimeStats::default();
        }
        tracing::debug!(keep_stats, "chat reset");
        Ok(())
    }

    /// Start a request: render the conversation, prefill it and sample the
    /// first token.
    ///
    /// `conversation` is the full transcript ending with the new user or
    /// tool message, or a plain-completion prompt. All validation happens
    /// before the cache is touched.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] or [`Error::ContextWindowExceeded`]
    /// for a bad request, [`Error::Config`] for an image that cannot be
    /// prefilled, and [`Error::Invariant`] if the cache length drifts.
    pub async fn prefill(
        &mut self,
        conversation: Conversation,
        config: &GenerationConfig,
    ) -> Result<()> {
        let resolved = resolve(config, &self.config.sampling)?;
        let grammar_plan = self.plan_grammar(resolved.grammar.as_ref())?;
        let (conversation, inputs, reuse) =
            self.build_inputs(conversation, resolved.suppress_thinking)?;

        let total: usize = inputs.iter().map(PrefillInput::len).sum();
        if total == 0 {
            return Err(Error::InvalidInput("input is empty".into()));
        }
        let filled = if reuse { self.window.filled_len() } else { 0 };
        self.window.check_capacity_from(filled, total)?;
        let chunks = plan_chunks(&inputs, self.config.prefill_chunk_size)?;

        // Validation done. From here on the cache is mutated.
        let started = Instant::now();
        self.interrupt.clear();
        self.conversation = None;
        if !reuse {
            self.window.reset(&mut self.model)?;
        }
        self.sampler.begin_request(resolved.seed);

        let stop = StopCondition::new(
            &self.template.stop_token_ids,
            &self.template.stop_str,
            &resolved.stop,
            resolved.max_tokens,
            resolved.ignore_eos,
        );
        self.request = Some(Request {
            grammar_active: !matches!(grammar_plan, GrammarPlan::None),
            config: resolved,
            stop,
            prompt_tokens: total,
            output_ids: Vec::new(),
            output_text: String::new(),
            logprobs: Vec::new(),
            pending_token: None,
            finish_reason: None,
            started,
            time_to_first_token: Duration::ZERO,
            prefill_time: Duration::ZERO,
            decode_steps: 0,
            decode_time: Duration::ZERO,
        });

        tracing::debug!(
            reuse,
            prompt_tokens = total,
            chunks = chunks.len(),
            filled = self.window.filled_len(),
            "prefill planned"
        );

        let logits = match self.run_prefill(&chunks, grammar_plan).await {
            Ok(logits) => logits,
            Err(e) => {
                self.request = None;
                return Err(e);
            }
        };
        self.conversation = Some(conversation);

        let prefill_time = started.elapsed();
        if let Some(request) = self.request.as_mut() {
            request.prefill_time = prefill_time;
        }
        self.sample_next(logits)?;
        if let Some(request) = self.request.as_mut() {
            request.time_to_first_token = started.elapsed();
        }
        Ok(())
    }

    /// Run one decode step: forward the last sampled token and sample the
    /// next. An interrupt observed here finishes the request with
    /// [`FinishReason::Abort`] instead.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] before the first prefill or after the
    /// request has stopped.
    pub async fn decode(&mut self) -> Result<()> {
        let request = self
            .request
            .as_ref()
            .ok_or_else(|| Error::InvalidState("decode called before prefill".into()))?;
        if request.finish_reason.is_some() {
            return Err(Error::InvalidState(
                "decode called after generation stopped".into(),
            ));
        }
        if self.interrupt.is_interrupted() {
            return self.finish(FinishReason::Abort);
        }
        let token = request
            .pending_token
            .ok_or_else(|| Error::Invariant("running request has no pending token".into()))?;

        let start = Instant::now();
        let embedding = self.model.embed(&[token]).await?;
        let logits = self.forward(vec![embedding], 1).await?;
        self.model.synchronize().await?;
        if let Some(request) = self.request.as_mut() {
            request.decode_steps += 1;
            request.decode_time += start.elapsed();
        }
        self.sample_next(logits)
    }

    /// Whether the current request has finished. `false` before any prefill.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.finish_reason().is_some()
    }

    #[must_use]
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.request.as_ref().and_then(|r| r.finish_reason)
    }

    /// Full output text of the current request, with any stop string trimmed.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] before the first prefill.
    pub fn message(&self) -> Result<&str> {
        self.current().map(|r| r.output_text.as_str())
    }

    /// Tokens produced so far by the current request.
    #[must_use]
    pub fn output_token_count(&self) -> usize {
        self.request.as_ref().map_or(0, |r| r.output_ids.len())
    }

    /// Output text that can be shown while generation is still running.
    #[must_use]
    pub fn streamable_text(&self) -> &str {
        let Some(request) = self.request.as_ref() else {
            return "";
        };
        if request.finish_reason.is_some() {
            return &request.output_text;
        }
        let end = request.stop.safe_emit_len(&request.output_text);
        &request.output_text[..end]
    }

    /// Log-probabilities of the output tokens, if requested.
    #[must_use]
    pub fn logprobs(&self) -> Option<&[TokenLogprob]> {
        self.request
            .as_ref()
            .filter(|r| r.config.logprobs.is_some())
            .map(|r| r.logprobs.as_slice())
    }

    /// Token counts and timings of the current request.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] before the first prefill.
    pub fn usage(&self) -> Result<Usage> {
        let request = self.current()?;
        let round = request.round_stats();
        let latency_breakdown = request
            .config
            .latency_breakdown
            .then(|| LatencyBreakdown::from(self.sampler.timings()));
        Ok(Usage {
            prompt_tokens: round.prompt_tokens,
            completion_tokens: round.completion_tokens,
            total_tokens: round.prompt_tokens + round.completion_tokens,
            time_to_first_token_s: round.time_to_first_token.as_secs_f64(),
            prefill_tokens_per_s: round.prefill_tokens_per_s(),
            decode_tokens_per_s: round.decode_tokens_per_s(),
            e2e_latency_s: request.started.elapsed().as_secs_f64(),
            latency_breakdown,
        })
    }

    /// Time spent in each sampling stage during the current request.
    #[must_use]
    pub fn sampling_timings(&self) -> &StageTimings {
        self.sampler.timings()
    }

    fn current(&self) -> Result<&Request> {
        self.request
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no request has been prefilled".into()))
    }

    fn plan_grammar(&self, spec: Option<&GrammarSpec>) -> Result<GrammarPlan> {
        let Some(spec) = spec else {
            return Ok(GrammarPlan::None);
        };
        let key = spec.cache_key();
        if self.grammar.as_ref().is_some_and(|g| g.key == key) {
            return Ok(GrammarPlan::Reuse);
        }
        let engine = self.grammar_engine.clone().ok_or_else(|| {
            Error::InvalidInput("structured output requested but no grammar engine is attached".into())
        })?;
        Ok(GrammarPlan::Compile {
            spec: spec.clone(),
            engine,
        })
    }

    /// Decide reuse, extend the conversation with the reply placeholder and
    /// tokenize what must be prefilled.
    fn build_inputs(
        &self,
        conversation: Conversation,
        suppress_thinking: bool,
    ) -> Result<(Conversation, Vec<PrefillInput>, bool)> {
        if let Some(prompt) = conversation.plain_prompt() {
            if prompt.is_empty() {
                return Err(Error::InvalidInput("prompt is empty".into()));
            }
            let mut ids = conversation.system_prefix_token_ids().to_vec();
            ids.extend(self.tokenizer.encode(prompt)?);
            tracing::debug!(cause = "plain completion", "cache will be reset");
            return Ok((conversation, vec![PrefillInput::Tokens(ids)], false));
        }

        let (mut conversation, input) = conversation.split_last_input()?;
        let reuse = self.window.filled_len() > 0
            && self.conversation.as_ref().is_some_and(|cached| {
                cached.template() == conversation.template()
                    && same_conversation(cached, &conversation)
            });
        if !reuse {
            let cause = if self.conversation.is_some() {
                "history changed"
            } else {
                "empty cache"
            };
            tracing::debug!(cause, "cache will be reset");
        }

        conversation.push_input(input)?;
        conversation.append_reply_placeholder(suppress_thinking)?;
        let scope = if reuse {
            RenderScope::LastRound
        } else {
            RenderScope::Full
        };
        let segments = conversation.render(scope)?;

        let mut inputs = Vec::with_capacity(segments.len() + 1);
        let prefix = conversation.system_prefix_token_ids();
        if !reuse && !prefix.is_empty() {
            inputs.push(PrefillInput::Tokens(prefix.to_vec()));
        }
        for segment in &segments {
            match segment {
                PromptSegment::Text(text) => {
                    inputs.push(PrefillInput::Tokens(self.tokenizer.encode(text)?));
                }
                PromptSegment::Mixed(parts) => {
                    for part in parts {
                        inputs.push(self.part_input(part)?);
                    }
                }
            }
        }
        Ok((conversation, inputs, reuse))
    }

    fn part_input(&self, part: &ContentPart) -> Result<PrefillInput> {
        match part {
            ContentPart::Text(text) => Ok(PrefillInput::Tokens(self.tokenizer.encode(text)?)),
            ContentPart::ImageUrl(url) => {
                let embed_size = self.model_config.image_embed_size.ok_or_else(|| {
                    Error::InvalidInput("model does not accept image input".into())
                })?;
                Ok(PrefillInput::Image {
                    url: url.clone(),
                    embed_size,
                })
            }
        }
    }

    async fn run_prefill(
        &mut self,
        chunks: &[PrefillChunk],
        grammar_plan: GrammarPlan,
    ) -> Result<Vec<f32>> {
        let (last, rest) = chunks
            .split_last()
            .ok_or_else(|| Error::Invariant("prefill plan is empty".into()))?;
        for chunk in rest {
            self.forward_chunk(chunk).await?;
        }

        let logits = match grammar_plan {
            GrammarPlan::None => self.forward_chunk(last).await?,
            GrammarPlan::Reuse => {
                if let Some(grammar) = self.grammar.as_mut() {
                    grammar.matcher.reset();
                }
                tracing::debug!("reusing compiled grammar");
                self.forward_chunk(last).await?
            }
            GrammarPlan::Compile { spec, engine } => {
                self.grammar = None;
                let key = spec.cache_key();
                // Compilation overlaps the last chunk's forward pass.
                let (matcher, logits) =
                    futures::join!(engine.compile(&spec), self.forward_chunk(last));
                let matcher = matcher?;
                tracing::debug!(grammar = %key, "compiled grammar");
                self.grammar = Some(CachedGrammar { key, matcher });
                logits?
            }
        };
        self.model.synchronize().await?;
        Ok(logits)
    }

    async fn forward_chunk(&mut self, chunk: &PrefillChunk) -> Result<Vec<f32>> {
        let mut embeddings = Vec::with_capacity(chunk.inputs.len());
        for input in &chunk.inputs {
            let embedding = match input {
                PrefillInput::Tokens(ids) => self.model.embed(ids).await?,
                PrefillInput::Image { url, .. } => self.model.embed_image(url).await?,
            };
            embeddings.push(embedding);
        }
        self.forward(embeddings, chunk.len).await
    }

    /// Forward `len` positions and check that the cache grew by exactly that.
    async fn forward(&mut self, embeddings: Vec<R::Embedding>, len: usize) -> Result<Vec<f32>> {
        let before = self.model.total_sequence_length();
        self.model.begin_step(len)?;
        let logits = self.model.forward(embeddings, len).await?;
        self.model.end_step()?;
        let after = self.model.total_sequence_length();
        if after != before + len {
            return Err(Error::Invariant(format!(
                "cache length went from {before} to {after} after a {len}-position step"
            )));
        }
        if logits.len() != self.model_config.vocab_size {
            return Err(Error::Runtime(format!(
                "forward returned {} logits, vocab size is {}",
                logits.len(),
                self.model_config.vocab_size
            )));
        }
        self.window.advance(len);
        Ok(logits)
    }

    fn sample_next(&mut self, mut logits: Vec<f32>) -> Result<()> {
        let request = self
            .request
            .as_mut()
            .ok_or_else(|| Error::Invariant("sampling without a request".into()))?;

        let mut matcher = if request.grammar_active {
            let grammar = self
                .grammar
                .as_mut()
                .ok_or_else(|| Error::Invariant("structured output without a matcher".into()))?;
            Some(&mut grammar.matcher)
        } else {
            None
        };

        let mask = match matcher.as_mut() {
            Some(m) => {
                let start = Instant::now();
                let mask = m.next_token_bitmask(self.model_config.vocab_size)?;
                self.sampler.record_grammar_bitmask(start.elapsed());
                Some(mask)
            }
            None => None,
        };

        let sampled = self
            .sampler
            .sample(&mut logits, &request.config, mask.as_ref())?;

        if let Some(m) = matcher {
            let start = Instant::now();
            let accepted = m.accept_token(sampled.token);
            self.sampler.record_grammar_accept(start.elapsed());
            if !accepted {
                return Err(Error::Invariant(format!(
                    "grammar rejected token {} that its own bitmask allowed",
                    sampled.token
                )));
            }
        }

        self.process_token(sampled)
    }

    /// Apply the stop conditions to a freshly sampled token.
    fn process_token(&mut self, sampled: Sampled) -> Result<()> {
        let request = self
            .request
            .as_mut()
            .ok_or_else(|| Error::Invariant("token without a request".into()))?;

        if request.stop.is_stop_token(sampled.token) {
            return self.finish(FinishReason::Stop);
        }

        request.output_ids.push(sampled.token);
        if let Some(logprob) = sampled.logprob {
            request.logprobs.push(logprob);
        }
        let mut text = self.tokenizer.decode(&request.output_ids)?;
        if let Some(pos) = request.stop.find_stop_string(&text) {
            text.truncate(pos);
            request.output_text = text;
            return self.finish(FinishReason::Stop);
        }
        request.output_text = text;

        if request.stop.reached_max_tokens(request.output_ids.len()) || self.window.is_exhausted() {
            return self.finish(FinishReason::Length);
        }
        request.pending_token = Some(sampled.token);
        Ok(())
    }

    fn finish(&mut self, reason: FinishReason) -> Result<()> {
        let request = self
            .request
            .as_mut()
            .ok_or_else(|| Error::Invariant("finishing without a request".into()))?;

        let mut reason = reason;
        if let Some(conversation) = self.conversation.as_mut() {
            if reason == FinishReason::Stop
                && conversation.uses_function_calling()
                && parse_function_calls(&request.output_text).is_some()
            {
                reason = FinishReason::ToolCalls;
            }
            if !conversation.is_plain() {
                conversation.finish_reply(request.output_text.clone())?;
            }
        }
        request.pending_token = None;
        request.finish_reason = Some(reason);

        let round = request.round_stats();
        self.stats.record_round(round);
        tracing::info!(
            finish_reason = %reason,
            prompt_tokens = round.prompt_tokens,
            completion_tokens = round.completion_tokens,
            prefill_tok_s = round.prefill_tokens_per_s(),
            decode_tok_s = round.decode_tokens_per_s(),
            "generation finished"
        );
        Ok(())
    }
}
