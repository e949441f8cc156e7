//! Log events emitted around chat completion calls.
//!
//! Two events are emitted per call: a *prompt* event before the delegate call begins
//! and a *completion* event once the genuine outcome is known (immediately for
//! blocking calls, after stream exhaustion for streaming ones). Whether message
//! content is included is governed by [`CapturePolicy`]; with capture disabled the
//! events still carry metadata (roles, finish reasons, usage), just no text.

use serde::Serialize;

use std::env;

use crate::{
    instrumenter::EventLogger,
    types::{ChatRequest, ChatResponse, FinishReason, Role, Usage},
};

/// Policy controlling whether request / response content is included in emitted log
/// events. The policy is fixed for the lifetime of an interceptor instance.
///
/// Content capture is off by default: prompts and completions routinely contain
/// private data, and capturing them multiplies telemetry volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapturePolicy {
    content: bool,
}

impl CapturePolicy {
    /// Environment variable read by [`Self::from_env()`].
    pub const ENV_VAR: &'static str = "CHAT_INSTRUMENT_CAPTURE_CONTENT";

    /// Creates a policy with the specified content-capture flag.
    pub fn new(capture_content: bool) -> Self {
        Self {
            content: capture_content,
        }
    }

    /// Reads the policy from the [`Self::ENV_VAR`] environment variable
    /// (`1` / `true` enable capture; anything else, including an unset variable,
    /// disables it).
    pub fn from_env() -> Self {
        let value = env::var(Self::ENV_VAR).unwrap_or_default();
        Self::new(matches!(value.as_str(), "1" | "true"))
    }

    /// Checks whether message content should be captured.
    pub fn captures_content(self) -> bool {
        self.content
    }
}

/// Kind of a [`LogEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Pre-call event describing the request.
    Prompt,
    /// Post-call event describing the response.
    Completion,
}

impl EventKind {
    /// Returns the stable string presentation of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Completion => "completion",
        }
    }
}

/// Single message of a [`PromptPayload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    /// Author of the message.
    pub role: Role,
    /// Message text; `None` if content capture is disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Payload of the pre-call event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptPayload {
    /// Requested model ID.
    pub model: String,
    /// Conversation messages, oldest first.
    pub messages: Vec<PromptMessage>,
}

/// Single choice of a [`CompletionPayload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionChoice {
    /// Zero-based index of the choice.
    pub index: u32,
    /// Reason the choice finished, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Generated text; `None` if content capture is disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Payload of the post-call event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionPayload {
    /// Server-assigned response ID.
    pub id: String,
    /// Model that served the call.
    pub model: String,
    /// Generated choices.
    pub choices: Vec<CompletionChoice>,
    /// Token usage, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Structured event handed to the [`EventLogger`] capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum LogEvent {
    /// Pre-call event describing the request.
    Prompt(PromptPayload),
    /// Post-call event describing the response.
    Completion(CompletionPayload),
}

impl LogEvent {
    /// Returns the kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Prompt(_) => EventKind::Prompt,
            Self::Completion(_) => EventKind::Completion,
        }
    }
}

pub(crate) fn emit_prompt(logger: &dyn EventLogger, request: &ChatRequest, policy: CapturePolicy) {
    let messages = request
        .messages
        .iter()
        .map(|message| PromptMessage {
            role: message.role,
            content: policy
                .captures_content()
                .then(|| message.content.clone()),
        })
        .collect();
    logger.emit(LogEvent::Prompt(PromptPayload {
        model: request.model.clone(),
        messages,
    }));
}

pub(crate) fn emit_completion(
    logger: &dyn EventLogger,
    response: &ChatResponse,
    policy: CapturePolicy,
) {
    let choices = response
        .choices
        .iter()
        .map(|choice| CompletionChoice {
            index: choice.index,
            finish_reason: choice.finish_reason,
            content: policy
                .captures_content()
                .then(|| choice.message.content.clone()),
        })
        .collect();
    logger.emit(LogEvent::Completion(CompletionPayload {
        id: response.id.clone(),
        model: response.model.clone(),
        choices,
        usage: response.usage,
    }));
}
