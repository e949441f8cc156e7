//! Capability contract between the interceptor and the tracing / logging infrastructure.
//!
//! The interceptor itself is agnostic of any particular tracing SDK; it talks to the
//! outside world via the [`Instrumenter`] and [`EventLogger`] traits defined here.
//! The `chat-instrument-tracing` crate binds these capabilities to the [`tracing`]
//! ecosystem.
//!
//! [`tracing`]: https://docs.rs/tracing/0.1/tracing

use std::{any::Any, error::Error, fmt, sync::Arc};

use crate::{
    events::LogEvent,
    types::{ChatRequest, ChatResponse},
};

/// Ambient trace context read before a call starts, used as the parent of a new span.
///
/// The context is opaque to the interceptor; its payload is defined by the
/// [`Instrumenter`] implementation that produced it (e.g., the ID of the currently
/// entered span). An empty context means "no parent".
#[derive(Clone)]
pub struct TraceContext {
    inner: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for TraceContext {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TraceContext")
            .field("is_empty", &self.inner.is_none())
            .finish_non_exhaustive()
    }
}

impl TraceContext {
    /// Creates an empty context (no parent span).
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Wraps an implementation-defined context payload.
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self {
            inner: Some(Arc::new(inner)),
        }
    }

    /// Checks whether this context is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Returns a reference to the context payload if it has the specified type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_deref().and_then(|inner| inner.downcast_ref())
    }
}

/// Opaque handle of a started span.
///
/// A handle has exactly one terminal transition: it is passed *by value* to
/// [`Instrumenter::end()`], which makes double-ending a compile-time error rather
/// than a runtime one.
pub struct SpanHandle {
    inner: Box<dyn Any + Send>,
}

impl fmt::Debug for SpanHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("SpanHandle").finish_non_exhaustive()
    }
}

impl SpanHandle {
    /// Wraps an implementation-defined span payload.
    pub fn new<T: Any + Send>(inner: T) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Returns a reference to the span payload if it has the specified type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    /// Consumes the handle, returning the span payload if it has the specified type.
    ///
    /// # Errors
    ///
    /// Returns the handle back if the payload has a different type.
    pub fn downcast<T: Any>(self) -> Result<Box<T>, Self> {
        self.inner
            .downcast()
            .map_err(|inner| Self { inner })
    }
}

/// Guard keeping a span *current* for the duration of a synchronous call extent.
///
/// Dropping the guard releases the scope. Guards are strictly stack-scoped: they
/// must never be held across a point that outlives the call that created them.
pub struct ScopeGuard {
    _inner: Option<Box<dyn Any>>,
}

impl fmt::Debug for ScopeGuard {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ScopeGuard")
            .field("is_noop", &self._inner.is_none())
            .finish_non_exhaustive()
    }
}

impl ScopeGuard {
    /// Wraps an implementation-defined guard; the scope is released when the wrapped
    /// value is dropped.
    pub fn new<T: Any>(inner: T) -> Self {
        Self {
            _inner: Some(Box::new(inner)),
        }
    }

    /// Creates a guard that releases nothing on drop.
    pub fn noop() -> Self {
        Self { _inner: None }
    }
}

/// Tracing capability injected into the interceptor.
///
/// Implementations decide whether a call is worth a span, create spans with proper
/// parent propagation, and record the terminal outcome. The interceptor guarantees
/// that every handle returned from [`start()`](Self::start) is passed to
/// [`end()`](Self::end) exactly once, on exactly one of {response, error}.
pub trait Instrumenter: Send + Sync {
    /// Reads the ambient trace context of the calling thread / task.
    fn current_context(&self) -> TraceContext;

    /// Decides whether a span should be started for the specified request.
    ///
    /// Returning `false` suppresses all span lifecycle calls for the invocation;
    /// log events are still emitted (tracing and logging are independent axes).
    fn should_start(&self, parent: &TraceContext, request: &ChatRequest) -> bool;

    /// Starts a span as a child of `parent`.
    fn start(&self, parent: &TraceContext, request: &ChatRequest) -> SpanHandle;

    /// Makes the span current until the returned guard is dropped.
    fn enter(&self, span: &SpanHandle) -> ScopeGuard;

    /// Ends the span with the specified outcome. Exactly one of `response` / `error`
    /// is `Some`, except for partially consumed streams where a synthesized partial
    /// response is supplied.
    fn end(
        &self,
        span: SpanHandle,
        request: &ChatRequest,
        response: Option<&ChatResponse>,
        error: Option<&(dyn Error + 'static)>,
    );
}

/// Log-event capability injected into the interceptor.
pub trait EventLogger: Send + Sync {
    /// Emits a single structured event. Must not panic; event emission happens on the
    /// caller's hot path, including while a delegate failure is being propagated.
    fn emit(&self, event: LogEvent);
}
