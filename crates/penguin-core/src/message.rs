// Message types
//
// Message is the single unit of conversation history: a role, a category
// used by the context window allocator, typed content, and a token count
// that is recomputed whenever content changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Fixed token charge for image references (content we cannot measure by bytes)
const IMAGE_TOKEN_ESTIMATE: usize = 768;

/// Message role in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// System message (instructions)
    System,
    /// User message
    User,
    /// Assistant response
    Assistant,
    /// Tool execution result
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Budget category for the context window allocator.
///
/// Categories are priority tiers: the allocator trims them in a fixed
/// order and the system prompt is never trimmed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    SystemPrompt,
    DeclarativeNotes,
    WorkingMemory,
    Conversation,
    ToolMemory,
}

impl MessageCategory {
    /// Default fraction of the available window allocated to this category
    pub fn default_fraction(self) -> f64 {
        match self {
            MessageCategory::SystemPrompt => 0.15,
            MessageCategory::DeclarativeNotes => 0.20,
            MessageCategory::WorkingMemory => 0.20,
            MessageCategory::Conversation => 0.30,
            MessageCategory::ToolMemory => 0.15,
        }
    }

    /// Trim order: first category here loses messages first
    pub const TRIM_ORDER: [MessageCategory; 4] = [
        MessageCategory::ToolMemory,
        MessageCategory::Conversation,
        MessageCategory::WorkingMemory,
        MessageCategory::DeclarativeNotes,
    ];
}

impl std::fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageCategory::SystemPrompt => write!(f, "system_prompt"),
            MessageCategory::DeclarativeNotes => write!(f, "declarative_notes"),
            MessageCategory::WorkingMemory => write!(f, "working_memory"),
            MessageCategory::Conversation => write!(f, "conversation"),
            MessageCategory::ToolMemory => write!(f, "tool_memory"),
        }
    }
}

/// One typed part of a structured message body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text
    Text { text: String },
    /// Reference to an image (path or URL; never inlined)
    ImageRef { reference: String },
    /// A tool invocation the assistant requested
    ToolUse {
        id: String,
        name: String,
        payload: String,
    },
    /// The outcome of a tool invocation
    ToolOutput {
        id: String,
        ok: bool,
        output: String,
    },
}

/// Message content: a plain string or a list of typed parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Get text content if this is a plain text message
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Flatten to a single string for providers that only take text
    pub fn to_provider_string(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        ContentPart::Text { text } => out.push_str(text),
                        ContentPart::ImageRef { reference } => {
                            out.push_str(&format!("[image: {}]", reference))
                        }
                        ContentPart::ToolUse { name, payload, .. } => {
                            out.push_str(&format!("Tool call: {} {}", name, payload))
                        }
                        ContentPart::ToolOutput { ok, output, .. } => {
                            if *ok {
                                out.push_str(output);
                            } else {
                                out.push_str(&format!("Tool error: {}", output));
                            }
                        }
                    }
                }
                out
            }
        }
    }

    /// Approximate token count: ceil(utf8 bytes / 4), images at a flat rate
    pub fn approx_tokens(&self) -> usize {
        match self {
            MessageContent::Text(s) => approx_token_count(s),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => approx_token_count(text),
                    ContentPart::ImageRef { .. } => IMAGE_TOKEN_ESTIMATE,
                    ContentPart::ToolUse { name, payload, .. } => {
                        approx_token_count(name) + approx_token_count(payload)
                    }
                    ContentPart::ToolOutput { output, .. } => approx_token_count(output),
                })
                .sum(),
        }
    }
}

/// Byte-based token approximation used when no exact tokenizer is bound
pub fn approx_token_count(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID (time-ordered)
    pub id: Uuid,

    /// Message role
    pub role: MessageRole,

    /// Message content
    pub content: MessageContent,

    /// Budget category; immutable after creation
    pub category: MessageCategory,

    /// Token count for the current content
    pub token_count: usize,

    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,

    /// Monotonic sequence within the owning conversation; breaks
    /// created_at ties so ordering stays strict
    pub seq: u64,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Message {
    /// Create a message with an arbitrary role and category
    pub fn new(role: MessageRole, content: MessageContent, category: MessageCategory) -> Self {
        let token_count = content.approx_tokens();
        Self {
            id: Uuid::now_v7(),
            role,
            content,
            category,
            token_count,
            created_at: Utc::now(),
            seq: 0,
            metadata: BTreeMap::new(),
        }
    }

    /// Create a new user message in the conversation category
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(
            MessageRole::User,
            MessageContent::Text(content.into()),
            MessageCategory::Conversation,
        )
    }

    /// Create a new assistant message in the conversation category
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(
            MessageRole::Assistant,
            MessageContent::Text(content.into()),
            MessageCategory::Conversation,
        )
    }

    /// Create a system prompt message (never trimmed)
    pub fn system_prompt(content: impl Into<String>) -> Self {
        let mut msg = Self::new(
            MessageRole::System,
            MessageContent::Text(content.into()),
            MessageCategory::SystemPrompt,
        );
        msg.metadata
            .insert("permanent".to_string(), Value::Bool(true));
        msg
    }

    /// Create a tool result message in the tool memory category
    pub fn tool_result(call_id: impl Into<String>, ok: bool, output: impl Into<String>) -> Self {
        Self::new(
            MessageRole::Tool,
            MessageContent::Parts(vec![ContentPart::ToolOutput {
                id: call_id.into(),
                ok,
                output: output.into(),
            }]),
            MessageCategory::ToolMemory,
        )
    }

    /// Replace the content and recompute the token count
    pub fn set_content(&mut self, content: MessageContent) {
        self.content = content;
        self.token_count = self.content.approx_tokens();
    }

    /// Get text content if this is a plain text message
    pub fn text(&self) -> Option<&str> {
        self.content.as_text()
    }

    /// Attach a metadata entry, returning self for chaining
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.category, MessageCategory::Conversation);
        assert_eq!(msg.text(), Some("Hello"));
        assert_eq!(msg.token_count, 2);
    }

    #[test]
    fn test_system_prompt_is_permanent() {
        let msg = Message::system_prompt("You are Penguin.");
        assert_eq!(msg.category, MessageCategory::SystemPrompt);
        assert_eq!(msg.metadata.get("permanent"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_token_count_tracks_mutation() {
        let mut msg = Message::user("abcd");
        assert_eq!(msg.token_count, 1);
        msg.set_content(MessageContent::Text("a".repeat(40)));
        assert_eq!(msg.token_count, 10);
    }

    #[test]
    fn test_tool_result_category() {
        let msg = Message::tool_result("call_1", false, "timed out");
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.category, MessageCategory::ToolMemory);
        assert!(msg.content.to_provider_string().contains("timed out"));
    }

    #[test]
    fn test_approx_tokens_rounds_up() {
        assert_eq!(approx_token_count(""), 0);
        assert_eq!(approx_token_count("abc"), 1);
        assert_eq!(approx_token_count("abcde"), 2);
    }
}
