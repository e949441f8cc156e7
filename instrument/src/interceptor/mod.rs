//! Call interceptor wrapping a [`ChatClient`].

use serde_json::Value;

use std::{fmt, sync::Arc};


use crate::{
    client::{ChatClient, RawCall},
    events,
    instrumenter::{EventLogger, Instrumenter, SpanHandle},
    stream::TracedStream,
    types::{CallOptions, ChatRequest, ChatResponse},
    CapturePolicy,
};

/// Result of [`InstrumentedClient::dispatch()`].
pub enum DispatchOutcome<C: ChatClient> {
    /// The call matched the blocking shape and completed.
    Response(ChatResponse),
    /// The call matched the streaming shape; consume the returned stream to drive
    /// span / event finalization.
    Stream(TracedStream<C::Stream>),
    /// The call did not match an instrumented shape and was forwarded unchanged.
    Raw(Value),
}

impl<C: ChatClient> fmt::Debug for DispatchOutcome<C> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(response) => formatter.debug_tuple("Response").field(response).finish(),
            Self::Stream(stream) => formatter.debug_tuple("Stream").field(stream).finish(),
            Self::Raw(value) => formatter.debug_tuple("Raw").field(value).finish(),
        }
    }
}

/// Calls recognized by the dispatch boundary. Shape mismatches degrade to
/// [`Self::Other`] rather than erroring; the interceptor must not make stricter
/// assumptions than the wrapped API's overload set.
#[derive(Debug)]
enum RecognizedCall {
    Blocking(ChatRequest, CallOptions),
    Streaming(ChatRequest, CallOptions),
    Other(RawCall),
}

impl RecognizedCall {
    const BLOCKING_OPERATION: &'static str = "create";
    const STREAMING_OPERATION: &'static str = "create_streaming";

    fn recognize(call: RawCall) -> Self {
        let streaming = match call.operation.as_str() {
            Self::BLOCKING_OPERATION => false,
            Self::STREAMING_OPERATION => true,
            _ => return Self::Other(call),
        };
        match Self::parse_args(&call.args) {
            Some((request, options)) if streaming => Self::Streaming(request, options),
            Some((request, options)) => Self::Blocking(request, options),
            None => Self::Other(call),
        }
    }

    /// Parses `(request)` or `(request, options)` argument shapes; anything else
    /// is not ours.
    fn parse_args(args: &[Value]) -> Option<(ChatRequest, CallOptions)> {
        let (request_arg, options_arg) = match args {
            [request] => (request, None),
            [request, options] => (request, Some(options)),
            _ => return None,
        };
        let request = serde_json::from_value(request_arg.clone()).ok()?;
        let options = match options_arg {
            Some(options) => serde_json::from_value(options.clone()).ok()?,
            None => CallOptions::none(),
        };
        Some((request, options))
    }
}

/// Interceptor wrapping a [`ChatClient`] so that every call produces a trace span and
/// structured log events, without altering the caller-visible contract.
///
/// Per invocation, the interceptor asks the injected [`Instrumenter`] whether a span
/// should be started. If so, a child span of the ambient context is created and kept
/// current for the synchronous extent of the call. A prompt event is emitted before
/// the delegate call and a completion event once the genuine outcome is known. For
/// blocking calls the span ends when the delegate returns; for streaming calls the
/// returned stream is wrapped in a [`TracedStream`] and the span ends when the stream
/// does. Delegate failures are re-raised unchanged in all cases.
///
/// # Examples
///
/// ```
/// # use std::{convert::Infallible, sync::Arc};
/// # use chat_instrument::{
/// #     CallOptions, CapturePolicy, ChatChunk, ChatClient, ChatRequest, ChatResponse,
/// #     ChatStream, EventLogger, InstrumentedClient, Instrumenter, LogEvent, RawCall, Role,
/// #     ScopeGuard, SpanHandle, TraceContext,
/// # };
/// # struct NeverStream;
/// # impl ChatStream for NeverStream {
/// #     type Error = Infallible;
/// #     fn next_chunk(&mut self) -> Option<Result<ChatChunk, Infallible>> { None }
/// #     fn close(&mut self) {}
/// # }
/// # struct EchoClient;
/// # impl ChatClient for EchoClient {
/// #     type Error = Infallible;
/// #     type Stream = NeverStream;
/// #     fn create(
/// #         &self,
/// #         request: &ChatRequest,
/// #         _options: &CallOptions,
/// #     ) -> Result<ChatResponse, Infallible> {
/// #         Ok(ChatResponse { model: request.model.clone(), ..ChatResponse::default() })
/// #     }
/// #     fn create_streaming(
/// #         &self,
/// #         _request: &ChatRequest,
/// #         _options: &CallOptions,
/// #     ) -> Result<NeverStream, Infallible> {
/// #         Ok(NeverStream)
/// #     }
/// #     fn call_raw(&self, _call: RawCall) -> Result<serde_json::Value, Infallible> {
/// #         Ok(serde_json::Value::Null)
/// #     }
/// # }
/// # struct Noop;
/// # impl Instrumenter for Noop {
/// #     fn current_context(&self) -> TraceContext { TraceContext::empty() }
/// #     fn should_start(&self, _: &TraceContext, _: &ChatRequest) -> bool { false }
/// #     fn start(&self, _: &TraceContext, _: &ChatRequest) -> SpanHandle { SpanHandle::new(()) }
/// #     fn enter(&self, _: &SpanHandle) -> ScopeGuard { ScopeGuard::noop() }
/// #     fn end(
/// #         &self,
/// #         _: SpanHandle,
/// #         _: &ChatRequest,
/// #         _: Option<&ChatResponse>,
/// #         _: Option<&(dyn std::error::Error + 'static)>,
/// #     ) {}
/// # }
/// # impl EventLogger for Noop {
/// #     fn emit(&self, _: LogEvent) {}
/// # }
/// let instrumenter = Arc::new(Noop);
/// let client = InstrumentedClient::new(EchoClient, instrumenter.clone(), instrumenter)
///     .with_policy(CapturePolicy::new(true));
///
/// let request = ChatRequest::new("gpt-test").with_message(Role::User, "hello");
/// let response = client.create(&request, &CallOptions::none())?;
/// assert_eq!(response.model, "gpt-test");
/// # Ok::<_, std::convert::Infallible>(())
/// ```
pub struct InstrumentedClient<C> {
    delegate: C,
    instrumenter: Arc<dyn Instrumenter>,
    event_logger: Arc<dyn EventLogger>,
    policy: CapturePolicy,
}

impl<C: fmt::Debug> fmt::Debug for InstrumentedClient<C> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("InstrumentedClient")
            .field("delegate", &self.delegate)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<C: ChatClient> InstrumentedClient<C> {
    /// Wraps the specified client. Content capture is disabled by default; use
    /// [`with_policy()`](Self::with_policy) to change that.
    pub fn new(
        delegate: C,
        instrumenter: Arc<dyn Instrumenter>,
        event_logger: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            delegate,
            instrumenter,
            event_logger,
            policy: CapturePolicy::default(),
        }
    }

    /// Sets the content capture policy for this interceptor instance.
    #[must_use]
    pub fn with_policy(mut self, policy: CapturePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the capture policy of this interceptor.
    pub fn policy(&self) -> CapturePolicy {
        self.policy
    }

    /// Returns a reference to the wrapped client.
    pub fn get_ref(&self) -> &C {
        &self.delegate
    }

    /// Performs an instrumented blocking chat completion call.
    ///
    /// # Errors
    ///
    /// Re-raises any error of the wrapped client unchanged, after recording it on
    /// the span.
    pub fn create(
        &self,
        request: &ChatRequest,
        options: &CallOptions,
    ) -> Result<ChatResponse, C::Error> {
        let parent = self.instrumenter.current_context();
        if !self.instrumenter.should_start(&parent, request) {
            return self.create_with_events(request, options);
        }

        let span = self.instrumenter.start(&parent, request);
        let result = {
            // The scope is released before the span is ended, on both exit paths.
            let _guard = self.instrumenter.enter(&span);
            self.create_with_events(request, options)
        };
        match result {
            Ok(response) => {
                self.instrumenter.end(span, request, Some(&response), None);
                Ok(response)
            }
            Err(err) => {
                self.instrumenter.end(span, request, None, Some(&err));
                Err(err)
            }
        }
    }

    fn create_with_events(
        &self,
        request: &ChatRequest,
        options: &CallOptions,
    ) -> Result<ChatResponse, C::Error> {
        events::emit_prompt(&*self.event_logger, request, self.policy);
        let response = self.delegate.create(request, options)?;
        events::emit_completion(&*self.event_logger, &response, self.policy);
        Ok(response)
    }

    /// Starts an instrumented streaming chat completion call.
    ///
    /// The span (if started) is kept current only while the stream is being acquired;
    /// it ends when the returned [`TracedStream`] observes the stream's true outcome.
    ///
    /// # Errors
    ///
    /// Fails if the stream cannot be acquired; the span is ended with that failure
    /// synchronously and the error is re-raised unchanged.
    pub fn create_streaming(
        &self,
        request: &ChatRequest,
        options: &CallOptions,
    ) -> Result<TracedStream<C::Stream>, C::Error> {
        let parent = self.instrumenter.current_context();
        if !self.instrumenter.should_start(&parent, request) {
            events::emit_prompt(&*self.event_logger, request, self.policy);
            let stream = self.delegate.create_streaming(request, options)?;
            return Ok(self.wrap_stream(stream, request, None));
        }

        let span = self.instrumenter.start(&parent, request);
        let result = {
            let _guard = self.instrumenter.enter(&span);
            events::emit_prompt(&*self.event_logger, request, self.policy);
            self.delegate.create_streaming(request, options)
        };
        match result {
            Ok(stream) => Ok(self.wrap_stream(stream, request, Some(span))),
            Err(err) => {
                // Acquisition failure: there is nothing to defer to.
                self.instrumenter.end(span, request, None, Some(&err));
                Err(err)
            }
        }
    }

    fn wrap_stream(
        &self,
        stream: C::Stream,
        request: &ChatRequest,
        span: Option<SpanHandle>,
    ) -> TracedStream<C::Stream> {
        TracedStream::new(
            stream,
            request.clone(),
            span,
            Arc::clone(&self.instrumenter),
            Arc::clone(&self.event_logger),
            self.policy,
        )
    }

    /// Routes a dynamically shaped call to one of the two instrumented operations, or
    /// forwards it to [`ChatClient::call_raw()`] if it matches neither. Mismatched
    /// argument shapes for a matched operation name also fall through to the
    /// passthrough rather than erroring.
    ///
    /// # Errors
    ///
    /// Re-raises any error of the wrapped client unchanged.
    pub fn dispatch(&self, call: RawCall) -> Result<DispatchOutcome<C>, C::Error> {
        match RecognizedCall::recognize(call) {
            RecognizedCall::Blocking(request, options) => self
                .create(&request, &options)
                .map(DispatchOutcome::Response),
            RecognizedCall::Streaming(request, options) => self
                .create_streaming(&request, &options)
                .map(DispatchOutcome::Stream),
            RecognizedCall::Other(call) => {
                self.delegate.call_raw(call).map(DispatchOutcome::Raw)
            }
        }
    }
}
