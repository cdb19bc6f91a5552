//! Stop conditions and finish reasons
//!
//! Checked once per sampled token, in priority order: stop token id, stop
//! string, token budget. Window exhaustion is checked last by the session,
//! which owns the [`WindowManager`](crate::WindowManager).

use serde::{Deserialize, Serialize};

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A stop token or stop string was produced.
    Stop,
    /// `max_tokens` was reached or the context window is full.
    Length,
    /// The reply is a list of function calls.
    ToolCalls,
    /// Generation was interrupted by the caller.
    Abort,
}

impl FinishReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::Abort => "abort",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request stop settings.
#[derive(Debug, Clone, Default)]
pub struct StopCondition {
    stop_token_ids: Vec<u32>,
    stop_strings: Vec<String>,
    max_tokens: Option<usize>,
}

impl StopCondition {
    /// Combine the template's stop settings with the request's.
    ///
    /// Request stop strings are appended to the template's. With
    /// `ignore_eos`, stop tokens and stop strings are disabled entirely.
    #[must_use]
    pub fn new(
        template_token_ids: &[u32],
        template_strings: &[String],
        request_strings: &[String],
        max_tokens: Option<usize>,
        ignore_eos: bool,
    ) -> Self {
        if ignore_eos {
            return Self {
                max_tokens,
                ..Self::default()
            };
        }
        let stop_strings = template_strings
            .iter()
            .chain(request_strings)
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        Self {
            stop_token_ids: template_token_ids.to_vec(),
            stop_strings,
            max_tokens,
        }
    }

    #[must_use]
    pub fn is_stop_token(&self, token: u32) -> bool {
        self.stop_token_ids.contains(&token)
    }

    /// Byte offset of the earliest stop string in `text`, if any.
    #[must_use]
    pub fn find_stop_string(&self, text: &str) -> Option<usize> {
        self.stop_strings.iter().filter_map(|s| text.find(s.as_str())).min()
    }

    #[must_use]
    pub fn reached_max_tokens(&self, generated: usize) -> bool {
        self.max_tokens.is_some_and(|max| generated >= max)
    }

    /// Length of the prefix of `text` that is safe to emit while streaming.
    ///
    /// Holds back any suffix that is a proper prefix of a stop string, and
    /// a trailing U+FFFD left by a partially decoded character.
    #[must_use]
    pub fn safe_emit_len(&self, text: &str) -> usize {
        let mut hold = 0;
        for stop in &self.stop_strings {
            // Proper prefixes, longest first.
            let longest = stop
                .char_indices()
                .rev()
                .map(|(k, _)| k)
                .take_while(|&k| k > hold)
                .find(|&k| text.ends_with(&stop[..k]));
            if let Some(k) = longest {
                hold = k;
            }
        }
        let mut end = text.len() - hold;
        if text[..end].ends_with(char::REPLACEMENT_CHARACTER) {
            end -= char::REPLACEMENT_CHARACTER.len_utf8();
        }
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(strings: &[&str]) -> StopCondition {
        let strings: Vec<String> = strings.iter().map(ToString::to_string).collect();
        StopCondition::new(&[2], &[], &strings, Some(5), false)
    }

    #[test]
    fn finds_earliest_stop_string() {
        let stop = condition(&["##", "END"]);
        assert_eq!(stop.find_stop_string("hello##"), Some(5));
        assert_eq!(stop.find_stop_string("aEND b##"), Some(1));
        assert_eq!(stop.find_stop_string("hello#"), None);
    }

    #[test]
    fn request_strings_extend_template_strings() {
        let template = vec!["<|im_end|>".to_string()];
        let request = vec!["##".to_string()];
        let stop = StopCondition::new(&[2], &template, &request, None, false);
        assert!(stop.find_stop_string("a<|im_end|>").is_some());
        assert!(stop.find_stop_string("a##").is_some());
        assert!(stop.is_stop_token(2));
        assert!(!stop.reached_max_tokens(1_000_000));
    }

    #[test]
    fn ignore_eos_disables_tokens_and_strings() {
        let request = vec!["##".to_string()];
        let stop = StopCondition::new(&[2], &[], &request, Some(3), true);
        assert!(!stop.is_stop_token(2));
        assert_eq!(stop.find_stop_string("a##"), None);
        assert!(stop.reached_max_tokens(3));
    }

    #[test]
    fn max_tokens_budget() {
        let stop = condition(&[]);
        assert!(!stop.reached_max_tokens(4));
        assert!(stop.reached_max_tokens(5));
    }

    #[test]
    fn holds_back_partial_stop_strings() {
        let stop = condition(&["###", "<end>"]);
        assert_eq!(stop.safe_emit_len("hello"), 5);
        assert_eq!(stop.safe_emit_len("hello#"), 5);
        assert_eq!(stop.safe_emit_len("hello##"), 5);
        assert_eq!(stop.safe_emit_len("hello<en"), 5);
        assert_eq!(stop.safe_emit_len("hello<x"), 7);
    }

    #[test]
    fn holds_back_replacement_character() {
        let stop = condition(&[]);
        assert_eq!(stop.safe_emit_len("ab\u{FFFD}"), 2);
        assert_eq!(stop.safe_emit_len("\u{FFFD}b"), 4);
    }

    #[test]
    fn finish_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&FinishReason::ToolCalls).unwrap(),
            "\"tool_calls\""
        );
        assert_eq!(FinishReason::Abort.to_string(), "abort");
    }
}
