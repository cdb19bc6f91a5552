//! Conversation state, prompt rendering and session-reuse detection
//!
//! A [`Conversation`] is the message history of one chat session plus the
//! per-session overrides (system message, function-calling string). It renders
//! into ordered [`PromptSegment`]s: either everything (when the KV cache is
//! empty) or only the newest round (when the cache already holds the rest).
//!
//! Invariant: at most one message is a *pending reply* (`content == None`)
//! and, if present, it is the last message.

use std::sync::Arc;

use crate::chat_template::{ConversationTemplate, Role, FUNCTION_PLACEHOLDER};
use crate::{Error, Result};

/// One piece of multi-part message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    /// An image reference (URL or data URL). Never flattened to text.
    ImageUrl(String),
}

/// Message body: plain text or a mix of text and images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }

    #[must_use]
    pub fn has_images(&self) -> bool {
        matches!(self, Self::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl(_))))
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    /// Display prefix taken from the template (e.g. `"USER"`).
    pub role_name: String,
    /// `None` exactly while the reply is being generated.
    pub content: Option<MessageContent>,
    /// The template's empty thinking block was injected before this reply.
    pub thinking_suppressed: bool,
}

impl Message {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.content.is_none()
    }
}

/// A rendered prompt segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSegment {
    Text(String),
    /// Text fragments interleaved with image placeholders.
    Mixed(Vec<ContentPart>),
}

impl PromptSegment {
    /// Text of the segment with images shown as `<image>`. For logging and tests.
    #[must_use]
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Mixed(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text(s) => s.as_str(),
                    ContentPart::ImageUrl(_) => "<image>",
                })
                .collect(),
        }
    }
}

/// Which part of the history to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderScope {
    /// System prompt and every message. Used when the cache is empty.
    Full,
    /// Only the two most recent messages (new input + pending reply).
    LastRound,
}

/// Message history and per-session overrides.
#[derive(Debug, Clone)]
pub struct Conversation {
    template: Arc<ConversationTemplate>,
    messages: Vec<Message>,
    system_message_override: Option<String>,
    function_string: String,
    use_function_calling: bool,
    plain_prompt: Option<String>,
}

impl Conversation {
    /// Create an empty chat conversation.
    #[must_use]
    pub fn new(template: Arc<ConversationTemplate>) -> Self {
        Self {
            template,
            messages: Vec::new(),
            system_message_override: None,
            function_string: String::new(),
            use_function_calling: false,
            plain_prompt: None,
        }
    }

    /// Create a plain-completion conversation: one opaque prompt, no templating.
    #[must_use]
    pub fn plain(template: Arc<ConversationTemplate>, prompt: impl Into<String>) -> Self {
        Self {
            plain_prompt: Some(prompt.into()),
            ..Self::new(template)
        }
    }

    #[must_use]
    pub fn template(&self) -> &Arc<ConversationTemplate> {
        &self.template
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.plain_prompt.is_some()
    }

    #[must_use]
    pub fn plain_prompt(&self) -> Option<&str> {
        self.plain_prompt.as_deref()
    }

    #[must_use]
    pub fn system_message_override(&self) -> Option<&str> {
        self.system_message_override.as_deref()
    }

    #[must_use]
    pub fn has_pending_reply(&self) -> bool {
        self.messages.last().is_some_and(Message::is_pending)
    }

    /// Stop strings declared by the template.
    #[must_use]
    pub fn stop_strings(&self) -> &[String] {
        &self.template.stop_str
    }

    /// Stop token ids declared by the template.
    #[must_use]
    pub fn stop_token_ids(&self) -> &[u32] {
        &self.template.stop_token_ids
    }

    /// Token ids injected once at the start of a fresh session.
    #[must_use]
    pub fn system_prefix_token_ids(&self) -> &[u32] {
        self.template.system_prefix_token_ids.as_deref().unwrap_or(&[])
    }

    fn ensure_chat(&self, op: &str) -> Result<()> {
        if self.is_plain() {
            return Err(Error::InvalidInput(format!(
                "{op} is not available in plain completion mode"
            )));
        }
        Ok(())
    }

    /// Override the template's system message. Only valid once, and only
    /// before any other message.
    ///
    /// # Errors
    /// Returns an error in plain completion mode, if messages already exist,
    /// or if the override was already set.
    pub fn set_system_message(&mut self, message: impl Into<String>) -> Result<()> {
        self.ensure_chat("setting a system message")?;
        if !self.messages.is_empty() {
            return Err(Error::InvalidInput(
                "system message must be the first message".into(),
            ));
        }
        if self.system_message_override.is_some() {
            return Err(Error::InvalidInput(
                "system message can only be set once per session".into(),
            ));
        }
        self.system_message_override = Some(message.into());
        Ok(())
    }

    /// Enable function calling with the given function description string.
    ///
    /// # Errors
    /// Returns an error in plain completion mode.
    pub fn set_function_calling(&mut self, function_string: impl Into<String>) -> Result<()> {
        self.ensure_chat("function calling")?;
        self.function_string = function_string.into();
        self.use_function_calling = true;
        Ok(())
    }

    #[must_use]
    pub fn uses_function_calling(&self) -> bool {
        self.use_function_calling
    }

    /// Append a completed user, assistant or tool message.
    ///
    /// # Errors
    /// Returns an error in plain completion mode, for system messages (use
    /// [`Self::set_system_message`]), or while a reply is pending.
    pub fn append_message(&mut self, role: Role, content: impl Into<MessageContent>) -> Result<()> {
        self.ensure_chat("appending messages")?;
        let Some(role_name) = self.template.roles.get(role) else {
            return Err(Error::InvalidInput(
                "system messages must use set_system_message".into(),
            ));
        };
        if self.has_pending_reply() {
            return Err(Error::InvalidInput(
                "cannot append a message while a reply is pending".into(),
            ));
        }
        self.messages.push(Message {
            role,
            role_name: role_name.to_string(),
            content: Some(content.into()),
            thinking_suppressed: false,
        });
        Ok(())
    }

    /// Append an empty assistant message to seed generation.
    ///
    /// With `suppress_thinking`, the template's empty thinking block is
    /// rendered right after the assistant prefix and kept with the reply.
    ///
    /// # Errors
    /// Returns an error in plain completion mode or if a reply is already pending.
    pub fn append_reply_placeholder(&mut self, suppress_thinking: bool) -> Result<()> {
        self.ensure_chat("appending a reply")?;
        if self.has_pending_reply() {
            return Err(Error::InvalidInput("a reply is already pending".into()));
        }
        let suppressed = suppress_thinking && self.template.empty_thinking_block.is_some();
        if suppress_thinking && !suppressed {
            tracing::debug!(
                template = %self.template.name,
                "thinking suppression requested but template has no empty thinking block"
            );
        }
        self.messages.push(Message {
            role: Role::Assistant,
            role_name: self.template.roles.assistant.clone(),
            content: None,
            thinking_suppressed: suppressed,
        });
        Ok(())
    }

    /// Write the generated text into the pending reply.
    ///
    /// # Errors
    /// Returns an error in plain completion mode or if no reply is pending.
    pub fn finish_reply(&mut self, text: impl Into<String>) -> Result<()> {
        self.ensure_chat("finishing a reply")?;
        match self.messages.last_mut() {
            Some(msg) if msg.is_pending() => {
                msg.content = Some(MessageContent::Text(text.into()));
                Ok(())
            }
            _ => Err(Error::InvalidState("no pending reply to finish".into())),
        }
    }

    /// Mark every assistant reply as generated with thinking suppressed.
    ///
    /// Used when a conversation is re-derived from a transcript that does not
    /// carry the injected block.
    pub fn mark_thinking_suppressed(&mut self) {
        if self.template.empty_thinking_block.is_none() {
            return;
        }
        for msg in &mut self.messages {
            if msg.role == Role::Assistant {
                msg.thinking_suppressed = true;
            }
        }
    }

    /// Split off the newest input message (user or tool), returning the
    /// history before it.
    ///
    /// # Errors
    /// Returns an error if the conversation is plain, empty, or does not end
    /// with a user or tool message.
    pub fn split_last_input(mut self) -> Result<(Self, Message)> {
        self.ensure_chat("splitting input")?;
        match self.messages.last() {
            Some(m) if matches!(m.role, Role::User | Role::Tool) && !m.is_pending() => {}
            Some(m) => {
                return Err(Error::InvalidInput(format!(
                    "last message must be from user or tool, got {}",
                    m.role
                )))
            }
            None => return Err(Error::InvalidInput("conversation has no messages".into())),
        }
        let last = self.messages.pop().ok_or_else(|| {
            Error::Invariant("message disappeared after check".into())
        })?;
        Ok((self, last))
    }

    /// Re-append a message produced by [`Self::split_last_input`].
    ///
    /// # Errors
    /// Same as [`Self::append_message`].
    pub fn push_input(&mut self, message: Message) -> Result<()> {
        let content = message
            .content
            .ok_or_else(|| Error::InvalidInput("input message has no content".into()))?;
        self.append_message(message.role, content)
    }

    /// Clear messages and overrides; the template is kept.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.system_message_override = None;
        self.function_string.clear();
        self.use_function_calling = false;
        self.plain_prompt = None;
    }

    /// Render the conversation into prompt segments.
    ///
    /// # Errors
    /// Returns an error in plain completion mode, when the template has no
    /// separators, or when a last-round render is requested on fewer than
    /// two messages.
    pub fn render(&self, scope: RenderScope) -> Result<Vec<PromptSegment>> {
        if self.is_plain() {
            return Err(Error::InvalidInput(
                "plain completion prompts cannot be rendered as messages".into(),
            ));
        }
        if self.template.seps.is_empty() {
            return Err(Error::Config(format!(
                "template '{}' has no turn separators",
                self.template.name
            )));
        }

        let system_message = self
            .system_message_override
            .as_deref()
            .unwrap_or(&self.template.system_message);
        let system_prompt = self.template.system_prompt(system_message);

        let mut segments = Vec::new();
        let start = match scope {
            RenderScope::Full => {
                if !system_prompt.is_empty() {
                    segments.push(PromptSegment::Text(system_prompt.clone()));
                }
                0
            }
            RenderScope::LastRound => {
                if self.messages.len() < 2 {
                    return Err(Error::InvalidState(
                        "last-round render needs a prior full render".into(),
                    ));
                }
                self.messages.len() - 2
            }
        };

        for (i, msg) in self.messages.iter().enumerate().skip(start) {
            segments.push(self.render_message(i, msg, !system_prompt.is_empty()));
        }
        Ok(segments)
    }

    fn render_message(&self, index: usize, msg: &Message, has_system_prompt: bool) -> PromptSegment {
        let template = &self.template;
        let thinking = if msg.thinking_suppressed {
            template.empty_thinking_block.as_deref().unwrap_or("")
        } else {
            ""
        };

        let content = match &msg.content {
            Some(c) if !c.is_empty() => c,
            _ => {
                return PromptSegment::Text(format!(
                    "{}{}{thinking}",
                    msg.role_name,
                    template.role_empty_sep()
                ));
            }
        };

        let role_prefix = if !template.add_role_after_system_message && has_system_prompt && index == 0 {
            String::new()
        } else {
            format!("{}{}", msg.role_name, template.role_content_sep())
        };
        let sep = &template.seps[index % template.seps.len()];

        let (before, after) = self.role_template_around(msg.role);
        match content {
            MessageContent::Text(text) => {
                PromptSegment::Text(format!("{role_prefix}{thinking}{before}{text}{after}{sep}"))
            }
            MessageContent::Parts(parts) => {
                let mut out = Vec::with_capacity(parts.len() + 2);
                out.push(ContentPart::Text(format!("{role_prefix}{thinking}{before}")));
                out.extend(parts.iter().cloned());
                out.push(ContentPart::Text(format!("{after}{sep}")));
                PromptSegment::Mixed(out)
            }
        }
    }

    /// Text the role template puts before and after the message body, with
    /// the function string substituted. Empty when the role has no template.
    fn role_template_around(&self, role: Role) -> (String, String) {
        let Some(template) = self
            .template
            .role_templates
            .as_ref()
            .and_then(|t| t.get(&role))
        else {
            return (String::new(), String::new());
        };
        let function = if self.use_function_calling {
            self.function_string.as_str()
        } else {
            ""
        };
        let (before, after) = template
            .split_once(role.placeholder())
            .unwrap_or((template.as_str(), ""));
        (
            before.replace(FUNCTION_PLACEHOLDER, function),
            after.replace(FUNCTION_PLACEHOLDER, function),
        )
    }
}

/// Whether two conversations render identically, so a cache built for one
/// can serve the other.
///
/// Both are assumed to share template configuration.
#[must_use]
pub fn same_conversation(a: &Conversation, b: &Conversation) -> bool {
    a.use_function_calling == b.use_function_calling
        && a.function_string == b.function_string
        && a.system_message_override == b.system_message_override
        && a.is_plain() == b.is_plain()
        && a.messages == b.messages
}
