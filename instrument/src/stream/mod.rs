//! Stream completion tracker.
//!
//! [`TracedStream`] wraps the chunk stream returned by a streaming call and defers
//! span / log-event finalization until the stream's true outcome is observed. The
//! originating call frame returns as soon as the stream is acquired; the span stays
//! open while the caller pulls chunks and is closed exactly once, when the stream is
//! exhausted, errors out, or is closed / dropped early.

use std::{collections::BTreeMap, fmt, mem, sync::Arc};


use crate::{
    client::ChatStream,
    events,
    instrumenter::{EventLogger, Instrumenter, SpanHandle},
    types::{ChatChunk, ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, Role, Usage},
    CapturePolicy,
};

/// Response representation accumulated from observed chunks.
///
/// Message content is accumulated only when the capture policy allows it; metadata
/// (roles, finish reasons, usage, response ID) is always tracked.
#[derive(Debug, Default)]
pub(crate) struct ResponseAccumulator {
    id: Option<String>,
    model: Option<String>,
    choices: BTreeMap<u32, ChoiceState>,
    usage: Option<Usage>,
}

#[derive(Debug, Default)]
struct ChoiceState {
    role: Option<Role>,
    content: String,
    finish_reason: Option<FinishReason>,
}

impl ResponseAccumulator {
    pub(crate) fn observe(&mut self, chunk: &ChatChunk, policy: CapturePolicy) {
        if self.id.is_none() && !chunk.id.is_empty() {
            self.id = Some(chunk.id.clone());
        }
        if self.model.is_none() && !chunk.model.is_empty() {
            self.model = Some(chunk.model.clone());
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in &chunk.choices {
            let state = self.choices.entry(choice.index).or_default();
            if let Some(role) = choice.delta.role {
                state.role.get_or_insert(role);
            }
            if policy.captures_content() {
                if let Some(content) = &choice.delta.content {
                    state.content.push_str(content);
                }
            }
            if let Some(reason) = choice.finish_reason {
                state.finish_reason = Some(reason);
            }
        }
    }

    pub(crate) fn build(&mut self) -> ChatResponse {
        let choices = mem::take(&mut self.choices)
            .into_iter()
            .map(|(index, state)| Choice {
                index,
                message: ChatMessage::new(state.role.unwrap_or(Role::Assistant), state.content),
                finish_reason: state.finish_reason,
            })
            .collect();
        ChatResponse {
            id: self.id.take().unwrap_or_default(),
            model: self.model.take().unwrap_or_default(),
            choices,
            usage: self.usage.take(),
        }
    }
}

/// Chunk stream wrapper that finalizes the span and completion event of a streaming
/// call exactly once, at true completion.
///
/// `TracedStream` presents the same [`ChatStream`] contract as the raw stream and
/// passes chunks through unmodified (it also implements [`Iterator`] for
/// convenience). Finalization is triggered by one of:
///
/// - normal exhaustion (the underlying stream returns `None`): the completion event
///   is emitted with the accumulated response and the span ends with success;
/// - a consumption error: the span ends with that error, which is re-raised to the
///   caller unchanged; no completion event is emitted;
/// - an explicit [`close()`](Self::close) or a drop before exhaustion: the stream is
///   treated as complete with whatever was observed so far.
///
/// All finalization paths are guarded by a single-use flag, so at-least-once close
/// semantics result in exactly-once side effects. Spans therefore cannot leak even
/// for abandoned streams.
pub struct TracedStream<S: ChatStream> {
    inner: S,
    request: ChatRequest,
    instrumenter: Arc<dyn Instrumenter>,
    event_logger: Arc<dyn EventLogger>,
    policy: CapturePolicy,
    span: Option<SpanHandle>,
    accumulator: ResponseAccumulator,
    finished: bool,
}

impl<S: ChatStream> fmt::Debug for TracedStream<S> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TracedStream")
            .field("request", &self.request)
            .field("policy", &self.policy)
            .field("has_span", &self.span.is_some())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<S: ChatStream> TracedStream<S> {
    pub(crate) fn new(
        inner: S,
        request: ChatRequest,
        span: Option<SpanHandle>,
        instrumenter: Arc<dyn Instrumenter>,
        event_logger: Arc<dyn EventLogger>,
        policy: CapturePolicy,
    ) -> Self {
        Self {
            inner,
            request,
            instrumenter,
            event_logger,
            policy,
            span,
            accumulator: ResponseAccumulator::default(),
            finished: false,
        }
    }

    /// Checks whether the stream has been finalized (exhausted, errored or closed).
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Pulls the next chunk from the underlying stream.
    ///
    /// Equivalent to [`ChatStream::next_chunk()`]; also available via [`Iterator`].
    /// Pulling after the stream was finalized returns `None`.
    pub fn next_chunk(&mut self) -> Option<Result<ChatChunk, S::Error>> {
        if self.finished {
            return None;
        }
        match self.inner.next_chunk() {
            Some(Ok(chunk)) => {
                self.accumulator.observe(&chunk, self.policy);
                Some(Ok(chunk))
            }
            Some(Err(err)) => {
                self.finalize_error(&err);
                Some(Err(err))
            }
            None => {
                self.finalize_success();
                None
            }
        }
    }

    /// Closes the underlying stream and finalizes the span / completion event if that
    /// has not happened yet. Closing is idempotent; redundant calls (e.g., an explicit
    /// close after natural exhaustion) have no further side effects.
    pub fn close(&mut self) {
        self.inner.close();
        self.finalize_success();
    }

    fn finalize_success(&mut self) {
        if mem::replace(&mut self.finished, true) {
            return;
        }
        let response = self.accumulator.build();
        if let Some(span) = self.span.take() {
            {
                // Re-enter the span so that the completion event is parented to it even
                // though emission happens outside the originating call stack.
                let _guard = self.instrumenter.enter(&span);
                events::emit_completion(&*self.event_logger, &response, self.policy);
            }
            self.instrumenter
                .end(span, &self.request, Some(&response), None);
        } else {
            events::emit_completion(&*self.event_logger, &response, self.policy);
        }
    }

    fn finalize_error(&mut self, err: &S::Error) {
        if mem::replace(&mut self.finished, true) {
            return;
        }
        if let Some(span) = self.span.take() {
            self.instrumenter.end(span, &self.request, None, Some(err));
        }
    }
}

impl<S: ChatStream> ChatStream for TracedStream<S> {
    type Error = S::Error;

    fn next_chunk(&mut self) -> Option<Result<ChatChunk, Self::Error>> {
        TracedStream::next_chunk(self)
    }

    fn close(&mut self) {
        TracedStream::close(self);
    }
}

impl<S: ChatStream> Iterator for TracedStream<S> {
    type Item = Result<ChatChunk, S::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk()
    }
}

impl<S: ChatStream> Drop for TracedStream<S> {
    fn drop(&mut self) {
        if !self.finished {
            self.close();
        }
    }
}
