use serde::{Deserialize, Serialize};

use mnemo_llm::tokens::count_tokens;
use mnemo_llm::Role;

/// Flat token cost charged for a non-text content part (image, file).
const NON_TEXT_PART_TOKENS: u32 = 8;

/// Structured session key: one session per user per channel.
///
/// Wire format: `user:{user_id}:channel:{channel_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub channel_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Canonical wire-format string (session map key, log field).
    pub fn format(&self) -> String {
        format!("user:{}:channel:{}", self.user_id, self.channel_id)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// One part of a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
}

/// Message content: a plain string or a list of multimodal parts. Both are
/// token-counted deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Deterministic token count: text is BPE-counted; non-text parts carry
    /// a flat cost.
    pub fn count_tokens(&self) -> u32 {
        match self {
            MessageContent::Text(text) => count_tokens(text) as u32,
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => count_tokens(text) as u32,
                    ContentPart::Image { .. } => NON_TEXT_PART_TOKENS,
                })
                .sum(),
        }
    }

    /// Concatenated text content (for prompts and summaries).
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One entry in a session's message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Strictly increasing per session.
    pub seq: u64,
    pub role: Role,
    pub content: MessageContent,
    /// Token count of `content` at insertion time.
    pub tokens: u32,
}

/// Algorithm used when a session exceeds its token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReductionMode {
    /// Keep the most recent messages that fit the budget, preserving order.
    Full,
    /// Keep every message but collapse whitespace in text parts.
    Compact,
    /// Preserve (trimmed) system messages plus the latest messages that fit.
    Summary,
}
