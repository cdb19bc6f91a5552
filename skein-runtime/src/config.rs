//! Session configuration
//!
//! [`SessionConfig`] mirrors a model's JSON chat config: conversation
//! template, window settings, prefill chunk size and sampling defaults.
//! Window sizes use `-1` (or absence) to mean "unset".

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use skein::{ConversationTemplate, Error, ModelConfig, Result, SamplingDefaults};

use crate::window::WindowConfig;

/// Default number of positions per prefill forward pass.
pub const DEFAULT_PREFILL_CHUNK_SIZE: usize = 2048;

/// Seed used when neither the config nor the request provides one.
pub const DEFAULT_SEED: u64 = 42;

fn default_prefill_chunk_size() -> usize {
    DEFAULT_PREFILL_CHUNK_SIZE
}

/// Accept an absent value, `null` or `-1` as unset; reject other negatives.
fn unset_sentinel<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<i64>::deserialize(deserializer)? {
        None | Some(-1) => Ok(None),
        Some(v) => usize::try_from(v)
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("expected -1 or a size, got {v}"))),
    }
}

/// Construction-time settings for one [`Session`](crate::Session).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub conv_template: ConversationTemplate,
    #[serde(default, deserialize_with = "unset_sentinel")]
    pub context_window_size: Option<usize>,
    #[serde(default, deserialize_with = "unset_sentinel")]
    pub sliding_window_size: Option<usize>,
    #[serde(default, deserialize_with = "unset_sentinel")]
    pub attention_sink_size: Option<usize>,
    #[serde(default = "default_prefill_chunk_size")]
    pub prefill_chunk_size: usize,
    #[serde(flatten)]
    pub sampling: SamplingDefaults,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl SessionConfig {
    /// A config with the given template and no window configured yet.
    #[must_use]
    pub fn new(conv_template: ConversationTemplate) -> Self {
        Self {
            conv_template,
            context_window_size: None,
            sliding_window_size: None,
            attention_sink_size: None,
            prefill_chunk_size: DEFAULT_PREFILL_CHUNK_SIZE,
            sampling: SamplingDefaults::default(),
            seed: None,
        }
    }

    #[must_use]
    pub fn with_context_window(mut self, size: usize) -> Self {
        self.context_window_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_sliding_window(mut self, size: usize, attention_sink_size: usize) -> Self {
        self.sliding_window_size = Some(size);
        self.attention_sink_size = Some(attention_sink_size);
        self
    }

    #[must_use]
    pub fn with_prefill_chunk_size(mut self, size: usize) -> Self {
        self.prefill_chunk_size = size;
        self
    }

    #[must_use]
    pub fn with_sampling(mut self, sampling: SamplingDefaults) -> Self {
        self.sampling = sampling;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Parse a JSON chat config.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or a window size is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON chat config file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Resolve the window settings. Exactly one of context window and
    /// sliding window must be set.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if both or neither are set, or a size is zero.
    pub fn window(&self) -> Result<WindowConfig> {
        match (self.context_window_size, self.sliding_window_size) {
            (Some(_), Some(_)) => Err(Error::Config(
                "only one of context_window_size and sliding_window_size can be set".into(),
            )),
            (None, None) => Err(Error::Config(
                "one of context_window_size and sliding_window_size must be set".into(),
            )),
            (Some(0), None) | (None, Some(0)) => {
                Err(Error::Config("window size must be positive".into()))
            }
            (Some(context_window_size), None) => Ok(WindowConfig::Context {
                context_window_size,
            }),
            (None, Some(sliding_window_size)) => Ok(WindowConfig::Sliding {
                sliding_window_size,
                attention_sink_size: self.attention_sink_size.unwrap_or(0),
            }),
        }
    }

    /// Check the config against the loaded model and resolve the window.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for an invalid window, a zero chunk size, or
    /// an image embedding that cannot fit in one prefill chunk.
    pub fn validate(&self, model: &ModelConfig) -> Result<WindowConfig> {
        let window = self.window()?;
        if self.prefill_chunk_size == 0 {
            return Err(Error::Config("prefill_chunk_size must be positive".into()));
        }
        if let Some(image) = model.image_embed_size {
            if image > self.prefill_chunk_size {
                return Err(Error::Config(format!(
                    "image embedding of {image} positions exceeds prefill_chunk_size {}",
                    self.prefill_chunk_size
                )));
            }
        }
        Ok(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHATML_JSON: &str = r#"{
        "conv_template": {
            "name": "chatml",
            "system_template": "<|im_start|>system\n{system_message}<|im_end|>\n",
            "roles": {"user": "<|im_start|>user", "assistant": "<|im_start|>assistant"},
            "seps": ["<|im_end|>\n"],
            "role_content_sep": "\n",
            "role_empty_sep": "\n",
            "stop_str": ["<|im_end|>"],
            "stop_token_ids": [2]
        },
        "context_window_size": 4096,
        "sliding_window_size": -1,
        "attention_sink_size": -1,
        "temperature": 0.6,
        "top_p": 0.9
    }"#;

    fn model(image_embed_size: Option<usize>) -> ModelConfig {
        ModelConfig {
            vocab_size: 100,
            image_embed_size,
        }
    }

    #[test]
    fn parses_chat_config_with_sentinels() {
        let config = SessionConfig::from_json(CHATML_JSON).unwrap();
        assert_eq!(config.context_window_size, Some(4096));
        assert_eq!(config.sliding_window_size, None);
        assert_eq!(config.attention_sink_size, None);
        assert_eq!(config.prefill_chunk_size, DEFAULT_PREFILL_CHUNK_SIZE);
        assert_eq!(config.sampling.temperature, Some(0.6));
        assert_eq!(config.sampling.top_p, Some(0.9));
        assert_eq!(config.conv_template.stop_token_ids, vec![2]);
        assert_eq!(
            config.window().unwrap(),
            WindowConfig::Context {
                context_window_size: 4096
            }
        );
    }

    #[test]
    fn rejects_other_negative_sizes() {
        let json = CHATML_JSON.replace("\"sliding_window_size\": -1", "\"sliding_window_size\": -2");
        assert!(matches!(SessionConfig::from_json(&json), Err(Error::Json(_))));
    }

    #[test]
    fn both_or_neither_window_is_fatal() {
        let base = SessionConfig::new(ConversationTemplate::chatml());
        assert!(matches!(base.window(), Err(Error::Config(_))));

        let both = base.clone().with_context_window(10).with_sliding_window(8, 2);
        assert!(matches!(both.window(), Err(Error::Config(_))));
    }

    #[test]
    fn sink_defaults_to_zero() {
        let mut config = SessionConfig::new(ConversationTemplate::chatml());
        config.sliding_window_size = Some(512);
        assert_eq!(
            config.window().unwrap(),
            WindowConfig::Sliding {
                sliding_window_size: 512,
                attention_sink_size: 0
            }
        );
    }

    #[test]
    fn validate_checks_chunk_size_and_images() {
        let config = SessionConfig::new(ConversationTemplate::chatml())
            .with_context_window(100)
            .with_prefill_chunk_size(0);
        assert!(matches!(config.validate(&model(None)), Err(Error::Config(_))));

        let config = config.with_prefill_chunk_size(16);
        assert!(config.validate(&model(Some(16))).is_ok());
        assert!(matches!(
            config.validate(&model(Some(17))),
            Err(Error::Config(_))
        ));
    }
}
