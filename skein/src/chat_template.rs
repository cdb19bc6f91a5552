//! Conversation templates describing how messages become prompt text
//!
//! A [`ConversationTemplate`] is pure data: the system prompt template,
//! per-role prefixes and separators, and the stop criteria that belong to the
//! model family. It is usually loaded from a model's chat config JSON, or
//! built from one of the presets ([`ConversationTemplate::llama3`],
//! [`ConversationTemplate::chatml`], [`ConversationTemplate::vicuna_v1`]).
//!
//! Rendering lives in [`crate::conversation`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Placeholder substituted with the system message in `system_template`.
pub const SYSTEM_PLACEHOLDER: &str = "{system_message}";
/// Placeholder substituted with the function description string in role templates.
pub const FUNCTION_PLACEHOLDER: &str = "{function_string}";

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Wire name of the role (`"user"`, `"assistant"`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    /// Placeholder for the message body inside a per-role template.
    #[must_use]
    pub fn placeholder(self) -> &'static str {
        match self {
            Self::System => SYSTEM_PLACEHOLDER,
            Self::User => "{user_message}",
            Self::Assistant => "{assistant_message}",
            Self::Tool => "{tool_message}",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display prefixes for each role, e.g. `"<|im_start|>user"` or `"USER"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleNames {
    pub user: String,
    pub assistant: String,
    /// Falls back to the user prefix when a template has no dedicated tool role.
    #[serde(default)]
    pub tool: Option<String>,
}

impl RoleNames {
    /// Prefix string for `role`. `None` for [`Role::System`], which is
    /// rendered through the system template instead.
    #[must_use]
    pub fn get(&self, role: Role) -> Option<&str> {
        match role {
            Role::System => None,
            Role::User => Some(&self.user),
            Role::Assistant => Some(&self.assistant),
            Role::Tool => Some(self.tool.as_deref().unwrap_or(&self.user)),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Template configuration for one model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTemplate {
    /// Template name, for logging only.
    #[serde(default)]
    pub name: String,
    /// System prompt with a [`SYSTEM_PLACEHOLDER`].
    #[serde(default)]
    pub system_template: String,
    /// Default system message; replaced by a conversation-level override.
    #[serde(default)]
    pub system_message: String,
    /// Token ids injected once at the start of a fresh session (e.g. BOS).
    #[serde(default)]
    pub system_prefix_token_ids: Option<Vec<u32>>,
    /// When `false`, the first message after a non-empty system prompt is
    /// rendered without its role prefix.
    #[serde(default = "default_true")]
    pub add_role_after_system_message: bool,
    pub roles: RoleNames,
    /// Optional per-role body templates, e.g. `"{user_message}\n{function_string}"`.
    #[serde(default)]
    pub role_templates: Option<HashMap<Role, String>>,
    /// Turn separators, applied round-robin by message index.
    pub seps: Vec<String>,
    /// Between role prefix and content. Defaults to `": "`.
    #[serde(default)]
    pub role_content_sep: Option<String>,
    /// After the role prefix of an empty (pending) message. Defaults to `": "`.
    #[serde(default)]
    pub role_empty_sep: Option<String>,
    #[serde(default)]
    pub stop_str: Vec<String>,
    #[serde(default)]
    pub stop_token_ids: Vec<u32>,
    /// Canonical empty reasoning block injected when thinking is suppressed.
    #[serde(default)]
    pub empty_thinking_block: Option<String>,
}

impl ConversationTemplate {
    /// Rendered system prompt using `system_message`.
    #[must_use]
    pub fn system_prompt(&self, system_message: &str) -> String {
        self.system_template
            .replace(SYSTEM_PLACEHOLDER, system_message)
    }

    /// Whether some role template has a [`FUNCTION_PLACEHOLDER`], i.e.
    /// function descriptions can reach the prompt at all.
    #[must_use]
    pub fn supports_function_calling(&self) -> bool {
        self.role_templates
            .as_ref()
            .is_some_and(|t| t.values().any(|body| body.contains(FUNCTION_PLACEHOLDER)))
    }

    #[must_use]
    pub fn role_content_sep(&self) -> &str {
        self.role_content_sep.as_deref().unwrap_or(": ")
    }

    #[must_use]
    pub fn role_empty_sep(&self) -> &str {
        self.role_empty_sep.as_deref().unwrap_or(": ")
    }

    /// Llama 3.x instruct template.
    ///
    /// Format:
    /// ```text
    /// <|begin_of_text|><|start_header_id|>system<|end_header_id|>
    ///
    /// {content}<|eot_id|><|start_header_id|>user<|end_header_id|>
    ///
    /// {content}<|eot_id|><|start_header_id|>assistant<|end_header_id|>
    ///
    ///
    /// ```
    /// `<|begin_of_text|>` (id 128000) is injected as a prefix token id.
    #[must_use]
    pub fn llama3() -> Self {
        Self {
            name: "llama-3".into(),
            system_template: "<|start_header_id|>system<|end_header_id|>\n\n\
                              {system_message}<|eot_id|>"
                .into(),
            system_message: "You are a helpful, respectful and honest assistant.".into(),
            system_prefix_token_ids: Some(vec![128_000]),
            add_role_after_system_message: true,
            roles: RoleNames {
                user: "<|start_header_id|>user".into(),
                assistant: "<|start_header_id|>assistant".into(),
                tool: Some("<|start_header_id|>ipython".into()),
            },
            role_templates: None,
            seps: vec!["<|eot_id|>".into()],
            role_content_sep: Some("<|end_header_id|>\n\n".into()),
            role_empty_sep: Some("<|end_header_id|>\n\n".into()),
            stop_str: vec![],
            stop_token_ids: vec![128_001, 128_009],
            empty_thinking_block: None,
        }
    }

    /// `ChatML` template used by Qwen2/2.5/3 models.
    ///
    /// Format:
    /// ```text
    /// <|im_start|>system
    /// {content}<|im_end|>
    /// <|im_start|>user
    /// {content}<|im_end|>
    /// <|im_start|>assistant
    ///
    /// ```
    #[must_use]
    pub fn chatml() -> Self {
        Self {
            name: "chatml".into(),
            system_template: "<|im_start|>system\n{system_message}<|im_end|>\n".into(),
            system_message: "You are a helpful assistant.".into(),
            system_prefix_token_ids: None,
            add_role_after_system_message: true,
            roles: RoleNames {
                user: "<|im_start|>user".into(),
                assistant: "<|im_start|>assistant".into(),
                tool: None,
            },
            role_templates: None,
            seps: vec!["<|im_end|>\n".into()],
            role_content_sep: Some("\n".into()),
            role_empty_sep: Some("\n".into()),
            stop_str: vec!["<|im_end|>".into()],
            stop_token_ids: vec![151_643, 151_645],
            empty_thinking_block: Some("<think>\n\n</think>\n\n".into()),
        }
    }

    /// Vicuna v1.1 template: `USER: ... ASSISTANT: ...</s>`.
    #[must_use]
    pub fn vicuna_v1() -> Self {
        Self {
            name: "vicuna_v1.1".into(),
            system_template: "{system_message} ".into(),
            system_message: "A chat between a curious user and an artificial intelligence \
                             assistant. The assistant gives helpful, detailed, and polite \
                             answers to the user's questions."
                .into(),
            system_prefix_token_ids: Some(vec![1]),
            add_role_after_system_message: true,
            roles: RoleNames {
                user: "USER".into(),
                assistant: "ASSISTANT".into(),
                tool: None,
            },
            role_templates: None,
            seps: vec![" ".into(), "</s>".into()],
            role_content_sep: Some(": ".into()),
            role_empty_sep: Some(":".into()),
            stop_str: vec!["</s>".into()],
            stop_token_ids: vec![2],
            empty_thinking_block: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_substitutes_placeholder() {
        let t = ConversationTemplate::chatml();
        assert_eq!(
            t.system_prompt("Be brief."),
            "<|im_start|>system\nBe brief.<|im_end|>\n"
        );
    }

    #[test]
    fn tool_role_falls_back_to_user_prefix() {
        let t = ConversationTemplate::vicuna_v1();
        assert_eq!(t.roles.get(Role::Tool), Some("USER"));
        assert_eq!(t.roles.get(Role::System), None);
        let t = ConversationTemplate::llama3();
        assert_eq!(t.roles.get(Role::Tool), Some("<|start_header_id|>ipython"));
    }

    #[test]
    fn template_deserializes_with_defaults() {
        let json = r#"{
            "system_template": "{system_message}",
            "roles": {"user": "<user>", "assistant": "<bot>"},
            "seps": ["\n"],
            "role_templates": {"user": "{user_message} {function_string}"}
        }"#;
        let t: ConversationTemplate = serde_json::from_str(json).unwrap();
        assert!(t.add_role_after_system_message);
        assert_eq!(t.role_content_sep(), ": ");
        assert_eq!(t.role_empty_sep(), ": ");
        assert!(t.stop_token_ids.is_empty());
        assert!(t.supports_function_calling());
        let templates = t.role_templates.unwrap();
        assert_eq!(templates[&Role::User], "{user_message} {function_string}");
    }

    #[test]
    fn presets_have_no_function_slot() {
        assert!(!ConversationTemplate::llama3().supports_function_calling());
        assert!(!ConversationTemplate::chatml().supports_function_calling());
        assert!(!ConversationTemplate::vicuna_v1().supports_function_calling());

        let mut t = ConversationTemplate::chatml();
        t.role_templates = Some(
            [(Role::User, "{user_message}!".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(!t.supports_function_calling());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }
}
