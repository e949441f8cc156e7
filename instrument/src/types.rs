//! Data model for chat completion calls.

use serde::{Deserialize, Serialize};

use std::time::Duration;

/// Role of a [`ChatMessage`] author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Role {
    /// System / developer instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool call result.
    Tool,
}

impl Role {
    /// Returns the stable string presentation of this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// Single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the message.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Creates a message with the specified role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Immutable description of a chat completion call: the model to use, the conversation
/// so far and sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Requested model ID.
    pub model: String,
    /// Conversation messages, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Cap on the number of generated tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Creates a request for the specified model with no messages.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![],
            temperature: None,
            max_tokens: None,
        }
    }

    /// Appends a message to the conversation.
    #[must_use]
    pub fn with_message(mut self, role: Role, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::new(role, content));
        self
    }
}

/// Per-call options accompanying a [`ChatRequest`]. Unlike the request, options do not
/// describe content; they only tune how the call is performed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOptions {
    /// Overall call timeout delegated to the underlying client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Creates empty options (client defaults apply).
    pub fn none() -> Self {
        Self::default()
    }
}

/// Reason a completion choice stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FinishReason {
    /// Natural stop point or stop sequence.
    Stop,
    /// Token limit reached.
    Length,
    /// Content was flagged by a filter.
    ContentFilter,
    /// The model requested tool calls.
    ToolCalls,
}

impl FinishReason {
    /// Returns the stable string presentation of this reason.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::ToolCalls => "tool_calls",
        }
    }
}

/// Token usage reported for a completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the input.
    pub input_tokens: u64,
    /// Number of generated tokens.
    pub output_tokens: u64,
}

/// Single choice of a [`ChatResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    /// Zero-based index of the choice.
    pub index: u32,
    /// Generated message.
    pub message: ChatMessage,
    /// Reason the choice finished, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Result of a completed blocking call, or the response synthesized from a fully
/// observed stream of [`ChatChunk`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Server-assigned response ID.
    pub id: String,
    /// Model that actually served the call.
    pub model: String,
    /// Generated choices.
    pub choices: Vec<Choice>,
    /// Token usage, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Incremental update to a single choice carried by a [`ChatChunk`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDelta {
    /// Author role; usually present only in the first chunk of a choice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Appended content fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Per-choice part of a [`ChatChunk`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Zero-based index of the choice this delta belongs to.
    pub index: u32,
    /// Incremental message update.
    pub delta: MessageDelta,
    /// Set on the final chunk of the choice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// One element of a streamed response sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Server-assigned response ID (same for all chunks of a response).
    pub id: String,
    /// Model that actually serves the call.
    pub model: String,
    /// Updates to the response choices.
    pub choices: Vec<ChunkChoice>,
    /// Token usage; reported on the last chunk if at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}
