//! Instrumentation layer wrapping chat completion clients.
//!
//! This crate transparently wraps a client's request-issuing API so that every call
//! produces a trace span and structured log events describing request / response
//! content, without altering the caller-visible contract of the wrapped API:
//!
//! - [`InstrumentedClient`] intercepts the two call shapes of a [`ChatClient`]
//!   (a blocking call, and a call returning a lazily consumed chunk stream) and
//!   bridges them into an injected [`Instrumenter`] (spans) and [`EventLogger`]
//!   (structured events). Operations matching neither shape are forwarded to the
//!   wrapped client unchanged.
//! - [`TracedStream`] wraps a returned chunk stream so that *consuming* it drives
//!   span / event finalization exactly once, at the stream's true completion
//!   (exhaustion, error, or early close) rather than when the originating call
//!   returns.
//!
//! Whether message content is included in the emitted events is controlled by a
//! [`CapturePolicy`], fixed per interceptor instance; with capture disabled the
//! events still carry metadata (model, roles, finish reasons, token usage).
//!
//! The crate is agnostic of any particular tracing SDK. The sibling
//! `chat-instrument-tracing` crate binds the capability traits to the [`tracing`]
//! ecosystem.
//!
//! [`tracing`]: https://docs.rs/tracing/0.1/tracing
//!
//! # Error transparency
//!
//! The interceptor never swallows, wraps or retypes delegate failures: whatever the
//! wrapped client raises is what the caller observes, with telemetry side effects
//! added around it. Failures to *acquire* a stream end the span synchronously;
//! failures *during* consumption end it from inside [`TracedStream`].
//!
//! # Examples
//!
//! See [`InstrumentedClient`] docs for a usage example.

// Documentation settings.
#![doc(html_root_url = "https://docs.rs/chat-instrument/0.1.0")]
// Linter settings.
#![warn(missing_debug_implementations, missing_docs, bare_trait_objects)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]

mod client;
mod events;
mod instrumenter;
mod interceptor;
mod stream;
mod types;

pub use crate::{
    client::{ChatClient, ChatStream, RawCall},
    events::{
        CapturePolicy, CompletionChoice, CompletionPayload, EventKind, LogEvent, PromptMessage,
        PromptPayload,
    },
    instrumenter::{EventLogger, Instrumenter, ScopeGuard, SpanHandle, TraceContext},
    interceptor::{DispatchOutcome, InstrumentedClient},
    stream::TracedStream,
    types::{
        CallOptions, ChatChunk, ChatMessage, ChatRequest, ChatResponse, Choice, ChunkChoice,
        FinishReason, MessageDelta, Role, Usage,
    },
};

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
