//! Generation parameters and their resolution against session defaults
//!
//! [`GenerationConfig`] carries per-request overrides, every field optional.
//! [`resolve`] merges it with the session's [`SamplingDefaults`] into a fully
//! populated, validated [`ResolvedConfig`] that the sampler and stop engine
//! consume.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::grammar::GrammarSpec;
use crate::{Error, Result};

/// Maximum number of alternatives reported per token when log-probabilities
/// are requested.
pub const MAX_TOP_LOGPROBS: usize = 5;

/// Structured-output request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject {
        #[serde(default)]
        schema: Option<String>,
    },
    Grammar {
        grammar: String,
    },
}

impl ResponseFormat {
    /// Grammar the output must follow, if any.
    #[must_use]
    pub fn grammar_spec(&self) -> Option<GrammarSpec> {
        match self {
            Self::Text => None,
            Self::JsonObject { schema: None } => Some(GrammarSpec::Json),
            Self::JsonObject { schema: Some(s) } => Some(GrammarSpec::JsonSchema(s.clone())),
            Self::Grammar { grammar } => Some(GrammarSpec::Ebnf(grammar.clone())),
        }
    }
}

/// Per-request generation overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    /// Additive offset per token id.
    #[serde(default)]
    pub logit_bias: Option<HashMap<u32, f32>>,
    /// Appended to the template's stop strings.
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Disable stop-token and stop-string termination.
    #[serde(default)]
    pub ignore_eos: bool,
    #[serde(default)]
    pub logprobs: bool,
    #[serde(default)]
    pub top_logprobs: Option<usize>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    /// Inject the template's empty thinking block instead of letting the model reason.
    #[serde(default)]
    pub suppress_thinking: bool,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Report time spent in each sampling stage with the final usage.
    #[serde(default)]
    pub latency_breakdown: bool,
}

/// Session-level sampling defaults, typically read from the model's chat config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingDefaults {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
}

/// Fully populated generation parameters for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub logit_bias: HashMap<u32, f32>,
    /// Request-level stop strings only; template strings are added by the stop engine.
    pub stop: Vec<String>,
    pub max_tokens: Option<usize>,
    pub ignore_eos: bool,
    /// `Some(k)` when log-probabilities are requested, with `k` alternatives.
    pub logprobs: Option<usize>,
    pub grammar: Option<GrammarSpec>,
    pub suppress_thinking: bool,
    pub seed: Option<u64>,
    pub latency_breakdown: bool,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            logit_bias: HashMap::new(),
            stop: Vec::new(),
            max_tokens: None,
            ignore_eos: false,
            logprobs: None,
            grammar: None,
            suppress_thinking: false,
            seed: None,
            latency_breakdown: false,
        }
    }
}

impl ResolvedConfig {
    /// Whether any frequency or presence penalty is active.
    #[must_use]
    pub fn has_frequency_penalties(&self) -> bool {
        self.frequency_penalty != 0.0 || self.presence_penalty != 0.0
    }
}

fn check_range(name: &str, value: f32, lo: f32, hi: f32) -> Result<()> {
    if value.is_nan() || value < lo || value > hi {
        return Err(Error::InvalidInput(format!(
            "{name} must be in [{lo}, {hi}], got {value}"
        )));
    }
    Ok(())
}

/// Merge request overrides with session defaults and validate the result.
///
/// # Errors
/// Returns [`Error::InvalidInput`] if any value is out of range.
pub fn resolve(request: &GenerationConfig, defaults: &SamplingDefaults) -> Result<ResolvedConfig> {
    let temperature = request.temperature.or(defaults.temperature).unwrap_or(1.0);
    let top_p = request.top_p.or(defaults.top_p).unwrap_or(1.0);
    let repetition_penalty = request
        .repetition_penalty
        .or(defaults.repetition_penalty)
        .unwrap_or(1.0);

    // A request that sets only one of the two penalties means "the other is off".
    let (frequency_penalty, presence_penalty) =
        match (request.frequency_penalty, request.presence_penalty) {
            (None, None) => (
                defaults.frequency_penalty.unwrap_or(0.0),
                defaults.presence_penalty.unwrap_or(0.0),
            ),
            (f, p) => (f.unwrap_or(0.0), p.unwrap_or(0.0)),
        };

    if temperature.is_nan() || temperature < 0.0 {
        return Err(Error::InvalidInput(format!(
            "temperature must be non-negative, got {temperature}"
        )));
    }
    if top_p.is_nan() || top_p <= 0.0 || top_p > 1.0 {
        return Err(Error::InvalidInput(format!(
            "top_p must be in (0, 1], got {top_p}"
        )));
    }
    if repetition_penalty.is_nan() || repetition_penalty <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "repetition_penalty must be positive, got {repetition_penalty}"
        )));
    }
    check_range("frequency_penalty", frequency_penalty, -2.0, 2.0)?;
    check_range("presence_penalty", presence_penalty, -2.0, 2.0)?;

    let logit_bias = request.logit_bias.clone().unwrap_or_default();
    for (&token, &bias) in &logit_bias {
        check_range(&format!("logit_bias[{token}]"), bias, -100.0, 100.0)?;
    }

    if request.max_tokens == Some(0) {
        return Err(Error::InvalidInput("max_tokens must be positive".into()));
    }

    let logprobs = match (request.logprobs, request.top_logprobs) {
        (false, Some(_)) => {
            return Err(Error::InvalidInput(
                "top_logprobs requires logprobs to be enabled".into(),
            ))
        }
        (true, Some(k)) if k > MAX_TOP_LOGPROBS => {
            return Err(Error::InvalidInput(format!(
                "top_logprobs must be at most {MAX_TOP_LOGPROBS}, got {k}"
            )))
        }
        (true, k) => Some(k.unwrap_or(0)),
        (false, None) => None,
    };

    Ok(ResolvedConfig {
        temperature,
        top_p,
        repetition_penalty,
        frequency_penalty,
        presence_penalty,
        logit_bias,
        stop: request.stop.clone().unwrap_or_default(),
        max_tokens: request.max_tokens,
        ignore_eos: request.ignore_eos,
        logprobs,
        grammar: request
            .response_format
            .as_ref()
            .and_then(ResponseFormat::grammar_spec),
        suppress_thinking: request.suppress_thinking,
        seed: request.seed,
        latency_breakdown: request.latency_breakdown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> SamplingDefaults {
        SamplingDefaults {
            temperature: Some(0.7),
            top_p: Some(0.95),
            repetition_penalty: Some(1.1),
            frequency_penalty: Some(0.5),
            presence_penalty: Some(0.3),
        }
    }

    #[test]
    fn request_overrides_fall_back_to_defaults() {
        let request = GenerationConfig {
            temperature: Some(0.2),
            ..Default::default()
        };
        let resolved = resolve(&request, &defaults()).unwrap();
        assert_eq!(resolved.temperature, 0.2);
        assert_eq!(resolved.top_p, 0.95);
        assert_eq!(resolved.repetition_penalty, 1.1);
        assert_eq!(resolved.frequency_penalty, 0.5);
        assert_eq!(resolved.presence_penalty, 0.3);
    }

    #[test]
    fn one_penalty_set_zeroes_the_other() {
        let request = GenerationConfig {
            frequency_penalty: Some(1.0),
            ..Default::default()
        };
        let resolved = resolve(&request, &defaults()).unwrap();
        assert_eq!(resolved.frequency_penalty, 1.0);
        assert_eq!(resolved.presence_penalty, 0.0);

        let request = GenerationConfig {
            presence_penalty: Some(-1.0),
            ..Default::default()
        };
        let resolved = resolve(&request, &defaults()).unwrap();
        assert_eq!(resolved.frequency_penalty, 0.0);
        assert_eq!(resolved.presence_penalty, -1.0);
    }

    #[test]
    fn top_p_defaults_to_one() {
        let resolved = resolve(&GenerationConfig::default(), &SamplingDefaults::default()).unwrap();
        assert_eq!(resolved.top_p, 1.0);
        assert_eq!(resolved.temperature, 1.0);
        assert!(!resolved.has_frequency_penalties());
        assert_eq!(resolved.logprobs, None);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = [
            GenerationConfig {
                temperature: Some(-0.1),
                ..Default::default()
            },
            GenerationConfig {
                top_p: Some(0.0),
                ..Default::default()
            },
            GenerationConfig {
                top_p: Some(1.5),
                ..Default::default()
            },
            GenerationConfig {
                frequency_penalty: Some(2.5),
                ..Default::default()
            },
            GenerationConfig {
                repetition_penalty: Some(0.0),
                ..Default::default()
            },
            GenerationConfig {
                logit_bias: Some([(7, 101.0)].into_iter().collect()),
                ..Default::default()
            },
            GenerationConfig {
                max_tokens: Some(0),
                ..Default::default()
            },
        ];
        for request in &bad {
            let err = resolve(request, &SamplingDefaults::default()).unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{request:?}");
        }
    }

    #[test]
    fn top_logprobs_requires_logprobs() {
        let request = GenerationConfig {
            top_logprobs: Some(2),
            ..Default::default()
        };
        assert!(resolve(&request, &SamplingDefaults::default()).is_err());

        let request = GenerationConfig {
            logprobs: true,
            top_logprobs: Some(6),
            ..Default::default()
        };
        assert!(resolve(&request, &SamplingDefaults::default()).is_err());

        let request = GenerationConfig {
            logprobs: true,
            top_logprobs: Some(3),
            ..Default::default()
        };
        let resolved = resolve(&request, &SamplingDefaults::default()).unwrap();
        assert_eq!(resolved.logprobs, Some(3));
    }

    #[test]
    fn response_format_maps_to_grammar() {
        let request = GenerationConfig {
            response_format: Some(ResponseFormat::JsonObject {
                schema: Some("{\"type\":\"object\"}".into()),
            }),
            ..Default::default()
        };
        let resolved = resolve(&request, &SamplingDefaults::default()).unwrap();
        assert_eq!(
            resolved.grammar,
            Some(GrammarSpec::JsonSchema("{\"type\":\"object\"}".into()))
        );

        let text: ResponseFormat = serde_json::from_str(r#"{"type":"text"}"#).unwrap();
        assert_eq!(text.grammar_spec(), None);
        let json: ResponseFormat = serde_json::from_str(r#"{"type":"json_object"}"#).unwrap();
        assert_eq!(json.grammar_spec(), Some(GrammarSpec::Json));
    }
}
