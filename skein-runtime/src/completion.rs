//! Response assembly
//!
//! Two drivers over the same prefill-then-decode loop:
//!
//! - [`Session::generate`]: runs to completion, reporting progress through a
//!   callback every `k` decode steps, and returns a [`Completion`].
//! - [`Session::stream`]: returns a [`CompletionStream`] that yields one
//!   [`ResponseChunk`] per step with only the new text, and a final chunk
//!   carrying the finish reason and usage.
//!
//! Both prefill exactly once, before the first decode step.

use futures::Stream;
use serde::{Deserialize, Serialize};
use skein::{
    Conversation, Error, GenerationConfig, ModelRuntime, Result, StageTimings, TokenLogprob,
    Tokenizer,
};

use crate::session::Session;
use crate::stop::FinishReason;

/// Per-stage sampling time, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyBreakdown {
    pub grammar_bitmask_s: f64,
    pub logit_processor_s: f64,
    pub logit_bias_s: f64,
    pub penalties_s: f64,
    pub softmax_s: f64,
    pub top_p_s: f64,
    pub grammar_accept_s: f64,
    pub total_s: f64,
}

impl From<&StageTimings> for LatencyBreakdown {
    fn from(t: &StageTimings) -> Self {
        Self {
            grammar_bitmask_s: t.grammar_bitmask.as_secs_f64(),
            logit_processor_s: t.logit_processor.as_secs_f64(),
            logit_bias_s: t.logit_bias.as_secs_f64(),
            penalties_s: t.penalties.as_secs_f64(),
            softmax_s: t.softmax.as_secs_f64(),
            top_p_s: t.top_p.as_secs_f64(),
            grammar_accept_s: t.grammar_accept.as_secs_f64(),
            total_s: t.total().as_secs_f64(),
        }
    }
}

/// Token counts and timings of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens prefilled for this request. With cache reuse this is only the
    /// newest round.
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    pub time_to_first_token_s: f64,
    pub prefill_tokens_per_s: f64,
    pub decode_tokens_per_s: f64,
    pub e2e_latency_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_breakdown: Option<LatencyBreakdown>,
}

/// A function call emitted by the model in function-calling mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Parse a reply of the form `[{"name": ..., "arguments": {...}}, ...]`.
///
/// Returns `None` unless the whole text is a non-empty list of calls.
#[must_use]
pub fn parse_function_calls(text: &str) -> Option<Vec<FunctionCall>> {
    serde_json::from_str::<Vec<FunctionCall>>(text.trim())
        .ok()
        .filter(|calls| !calls.is_empty())
}

/// Final result of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub logprobs: Option<Vec<TokenLogprob>>,
    /// Set when `finish_reason` is [`FinishReason::ToolCalls`].
    pub tool_calls: Option<Vec<FunctionCall>>,
}

/// One increment of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseChunk {
    /// Text produced since the previous chunk.
    pub delta: String,
    /// Log-probabilities of the tokens produced since the previous chunk.
    pub logprobs: Option<Vec<TokenLogprob>>,
    /// Set on the last chunk only.
    pub finish_reason: Option<FinishReason>,
    /// Set on the last chunk only.
    pub usage: Option<Usage>,
    pub tool_calls: Option<Vec<FunctionCall>>,
}

impl<R: ModelRuntime, T: Tokenizer> Session<R, T> {
    /// Run a request to completion.
    ///
    /// `progress` is called with `(completion_tokens, text_so_far)` every
    /// `progress_every` decode steps, and once more with the final text.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] if `progress_every` is zero, and any
    /// error from [`Session::prefill`] or [`Session::decode`].
    pub async fn generate<F>(
        &mut self,
        conversation: Conversation,
        config: &GenerationConfig,
        progress_every: usize,
        mut progress: F,
    ) -> Result<Completion>
    where
        F: FnMut(usize, &str) + Send,
    {
        if progress_every == 0 {
            return Err(Error::InvalidInput(
                "progress callback interval must be positive".into(),
            ));
        }
        self.prefill(conversation, config).await?;

        let mut steps = 0;
        while !self.is_stopped() {
            self.decode().await?;
            steps += 1;
            if steps % progress_every == 0 && !self.is_stopped() {
                progress(self.output_token_count(), self.message()?);
            }
        }

        let completion = self.completion()?;
        progress(completion.usage.completion_tokens, &completion.text);
        Ok(completion)
    }

    /// Prefill a request and return a pull-based stream over its output.
    ///
    /// # Errors
    /// Any error from [`Session::prefill`]; nothing is streamed in that case.
    pub async fn stream(
        &mut self,
        conversation: Conversation,
        config: &GenerationConfig,
    ) -> Result<CompletionStream<'_, R, T>> {
        self.prefill(conversation, config).await?;
        Ok(CompletionStream {
            session: self,
            emitted: 0,
            emitted_logprobs: 0,
            started: false,
            done: false,
        })
    }

    /// Result of the finished request.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the request is still running.
    pub fn completion(&self) -> Result<Completion> {
        let finish_reason = self
            .finish_reason()
            .ok_or_else(|| Error::InvalidState("generation has not finished".into()))?;
        let text = self.message()?.to_string();
        let tool_calls = if finish_reason == FinishReason::ToolCalls {
            parse_function_calls(&text)
        } else {
            None
        };
        Ok(Completion {
            usage: self.usage()?,
            logprobs: self.logprobs().map(<[TokenLogprob]>::to_vec),
            finish_reason,
            text,
            tool_calls,
        })
    }
}

/// Incremental view of one request. Pull with [`next_chunk`](Self::next_chunk)
/// or adapt with [`into_stream`](Self::into_stream).
pub struct CompletionStream<'a, R: ModelRuntime, T: Tokenizer> {
    session: &'a mut Session<R, T>,
    emitted: usize,
    emitted_logprobs: usize,
    started: bool,
    done: bool,
}

impl<'a, R: ModelRuntime, T: Tokenizer> CompletionStream<'a, R, T> {
    /// Whether the final chunk has been returned.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Produce the next chunk, running one decode step if needed.
    /// Returns `Ok(None)` after the final chunk.
    ///
    /// # Errors
    /// Any error from [`Session::decode`]. The stream ends after an error.
    pub async fn next_chunk(&mut self) -> Result<Option<ResponseChunk>> {
        if self.done {
            return Ok(None);
        }
        if self.started && !self.session.is_stopped() {
            if let Err(e) = self.session.decode().await {
                self.done = true;
                return Err(e);
            }
        }
        self.started = true;

        let text = self.session.streamable_text();
        let delta = text.get(self.emitted..).unwrap_or_default().to_string();
        self.emitted = self.emitted.max(text.len());

        let logprobs = self.session.logprobs().map(|all| {
            let new = all.get(self.emitted_logprobs..).unwrap_or_default().to_vec();
            self.emitted_logprobs = all.len();
            new
        });

        let Some(finish_reason) = self.session.finish_reason() else {
            return Ok(Some(ResponseChunk {
                delta,
                logprobs,
                finish_reason: None,
                usage: None,
                tool_calls: None,
            }));
        };

        self.done = true;
        let completion = self.session.completion()?;
        Ok(Some(ResponseChunk {
            delta,
            logprobs,
            finish_reason: Some(finish_reason),
            usage: Some(completion.usage),
            tool_calls: completion.tool_calls,
        }))
    }

    /// Stop generation early. The request finishes with
    /// [`FinishReason::Abort`] unless it had already stopped.
    ///
    /// # Errors
    /// Any error from [`Session::decode`].
    pub async fn close(&mut self) -> Result<()> {
        if !self.session.is_stopped() {
            self.session.interrupt_handle().interrupt();
            self.session.decode().await?;
        }
        self.done = true;
        Ok(())
    }

    /// Adapt into a [`futures::Stream`] of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<ResponseChunk>> + 'a {
        futures::stream::unfold(self, |mut stream| async move {
            match stream.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), stream)),
                Ok(None) => None,
                Err(e) => Some((Err(e), stream)),
            }
        })
    }
}
