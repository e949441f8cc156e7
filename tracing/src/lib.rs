//! [`tracing`] binding for the `chat-instrument` capability contract.
//!
//! This crate connects the SDK-agnostic interceptor from [`chat_instrument`] to the
//! [`tracing`] ecosystem:
//!
//! - [`TracingInstrumenter`] implements [`Instrumenter`]: chat completion calls become
//!   `tracing` spans carrying `gen_ai.*` request attributes, with response attributes
//!   recorded on span end. Parent propagation is explicit: the ambient context is
//!   read once per call and threaded through, not re-read from thread-local state at
//!   span end (streams typically end outside the call stack that created them).
//! - [`TracingEventLogger`] implements [`EventLogger`]: prompt / completion events
//!   become structured `tracing` events with the JSON-rendered payload.
//!
//! Any [`Subscriber`] configured in the host application sees the produced spans and
//! events; nothing here assumes a particular subscriber.
//!
//! [`tracing`]: https://docs.rs/tracing/0.1/tracing
//! [`Subscriber`]: https://docs.rs/tracing-core/0.1/tracing_core/trait.Subscriber.html
//!
//! # Examples
//!
//! ```
//! # use std::{convert::Infallible, sync::Arc};
//! # use chat_instrument::{
//! #     CallOptions, ChatChunk, ChatClient, ChatRequest, ChatResponse, ChatStream,
//! #     InstrumentedClient, RawCall, Role,
//! # };
//! use chat_instrument_tracing::{TracingEventLogger, TracingInstrumenter};
//!
//! # struct NeverStream;
//! # impl ChatStream for NeverStream {
//! #     type Error = Infallible;
//! #     fn next_chunk(&mut self) -> Option<Result<ChatChunk, Infallible>> { None }
//! #     fn close(&mut self) {}
//! # }
//! # struct EchoClient;
//! # impl ChatClient for EchoClient {
//! #     type Error = Infallible;
//! #     type Stream = NeverStream;
//! #     fn create(
//! #         &self,
//! #         request: &ChatRequest,
//! #         _options: &CallOptions,
//! #     ) -> Result<ChatResponse, Infallible> {
//! #         Ok(ChatResponse { model: request.model.clone(), ..ChatResponse::default() })
//! #     }
//! #     fn create_streaming(
//! #         &self,
//! #         _request: &ChatRequest,
//! #         _options: &CallOptions,
//! #     ) -> Result<NeverStream, Infallible> {
//! #         Ok(NeverStream)
//! #     }
//! #     fn call_raw(&self, _call: RawCall) -> Result<serde_json::Value, Infallible> {
//! #         Ok(serde_json::Value::Null)
//! #     }
//! # }
//! let client = InstrumentedClient::new(
//!     EchoClient,
//!     Arc::new(TracingInstrumenter::default()),
//!     Arc::new(TracingEventLogger::default()),
//! );
//! let request = ChatRequest::new("gpt-test").with_message(Role::User, "hello");
//! let response = client.create(&request, &CallOptions::none())?;
//! # assert_eq!(response.model, "gpt-test");
//! # Ok::<_, std::convert::Infallible>(())
//! ```

// Documentation settings.
#![doc(html_root_url = "https://docs.rs/chat-instrument-tracing/0.1.0")]
// Linter settings.
#![warn(missing_debug_implementations, missing_docs, bare_trait_objects)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]

use tracing::{field, Level, Span};

use std::{error::Error, fmt::Write as _};

use chat_instrument::{
    ChatRequest, ChatResponse, EventLogger, Instrumenter, LogEvent, ScopeGuard, SpanHandle,
    TraceContext,
};

/// Target of the spans produced by [`TracingInstrumenter`].
pub const SPAN_TARGET: &str = "chat_instrument::span";
/// Target of the events produced by [`TracingEventLogger`].
pub const EVENT_TARGET: &str = "chat_instrument::event";

/// [`Instrumenter`] implementation producing [`tracing`] spans.
///
/// Spans are named `chat`, emitted at `INFO` level with the [`SPAN_TARGET`] target
/// and carry `gen_ai.*` attributes: request attributes are set on span creation,
/// response / error attributes are recorded when the span ends. [`should_start()`]
/// consults the current subscriber, so disabling the target in the subscriber
/// suppresses span creation entirely (log events are unaffected; they are an
/// independent axis).
///
/// [`tracing`]: https://docs.rs/tracing/0.1/tracing
/// [`should_start()`]: Instrumenter::should_start()
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct TracingInstrumenter;

impl TracingInstrumenter {
    /// Creates a new instrumenter.
    pub fn new() -> Self {
        Self
    }
}

impl Instrumenter for TracingInstrumenter {
    fn current_context(&self) -> TraceContext {
        let current = Span::current();
        if current.is_none() {
            TraceContext::empty()
        } else {
            TraceContext::new(current)
        }
    }

    fn should_start(&self, _parent: &TraceContext, _request: &ChatRequest) -> bool {
        tracing::span_enabled!(target: SPAN_TARGET, Level::INFO)
    }

    fn start(&self, parent: &TraceContext, request: &ChatRequest) -> SpanHandle {
        let parent_id = parent.downcast_ref::<Span>().and_then(Span::id);
        let span = tracing::info_span!(
            target: SPAN_TARGET,
            parent: parent_id,
            "chat",
            gen_ai.operation.name = "chat",
            gen_ai.request.model = request.model.as_str(),
            gen_ai.request.temperature = field::Empty,
            gen_ai.request.max_tokens = field::Empty,
            gen_ai.response.id = field::Empty,
            gen_ai.response.model = field::Empty,
            gen_ai.response.finish_reasons = field::Empty,
            gen_ai.usage.input_tokens = field::Empty,
            gen_ai.usage.output_tokens = field::Empty,
            error = field::Empty,
        );
        if let Some(temperature) = request.temperature {
            span.record("gen_ai.request.temperature", temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            span.record("gen_ai.request.max_tokens", u64::from(max_tokens));
        }
        SpanHandle::new(span)
    }

    fn enter(&self, span: &SpanHandle) -> ScopeGuard {
        match span.downcast_ref::<Span>() {
            Some(span) => ScopeGuard::new(span.clone().entered()),
            None => ScopeGuard::noop(),
        }
    }

    fn end(
        &self,
        span: SpanHandle,
        _request: &ChatRequest,
        response: Option<&ChatResponse>,
        error: Option<&(dyn Error + 'static)>,
    ) {
        let Ok(span) = span.downcast::<Span>() else {
            return;
        };
        if let Some(response) = response {
            span.record("gen_ai.response.id", response.id.as_str());
            span.record("gen_ai.response.model", response.model.as_str());
            span.record(
                "gen_ai.response.finish_reasons",
                finish_reasons(response).as_str(),
            );
            if let Some(usage) = response.usage {
                span.record("gen_ai.usage.input_tokens", usage.input_tokens);
                span.record("gen_ai.usage.output_tokens", usage.output_tokens);
            }
        }
        if let Some(error) = error {
            span.record("error", field::display(error));
        }
        // Dropping the handle closes the span: the scope guards created via `enter()`
        // are stack-scoped and thus already dropped by this point.
        drop(span);
    }
}

fn finish_reasons(response: &ChatResponse) -> String {
    let mut reasons = String::new();
    for choice in &response.choices {
        if let Some(reason) = choice.finish_reason {
            if !reasons.is_empty() {
                reasons.push(',');
            }
            // Writing to a string cannot fail.
            let _ = write!(reasons, "{}", reason.as_str());
        }
    }
    reasons
}

/// [`EventLogger`] implementation producing structured [`tracing`] events.
///
/// Each [`LogEvent`] becomes a single `INFO` event with the [`EVENT_TARGET`] target,
/// an `event.kind` field (`prompt` / `completion`) and the JSON-rendered payload in
/// the `payload` field. Events emitted while a span is current are parented to it by
/// the subscriber as usual.
///
/// [`tracing`]: https://docs.rs/tracing/0.1/tracing
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct TracingEventLogger;

impl TracingEventLogger {
    /// Creates a new event logger.
    pub fn new() -> Self {
        Self
    }
}

impl EventLogger for TracingEventLogger {
    fn emit(&self, event: LogEvent) {
        // The payload consists of plain maps / strings; serialization cannot
        // realistically fail, but a logging capability must never panic.
        let payload = serde_json::to_string(&event).unwrap_or_default();
        // `info!(target: ..)` with dotted field names trips a macro parsing
        // ambiguity on current rustc; `event!` with an explicit level is the
        // exact expansion of `info!` and parses fine.
        tracing::event!(
            target: EVENT_TARGET,
            Level::INFO,
            event.kind = event.kind().as_str(),
            payload = payload.as_str(),
            "chat completion client event",
        );
    }
}

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
