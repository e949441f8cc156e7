//! Traits abstracting the wrapped chat completion client.

use serde_json::Value;

use std::error::Error;

use crate::types::{CallOptions, ChatChunk, ChatRequest, ChatResponse};

/// Lazily consumed stream of [`ChatChunk`]s returned by a streaming call.
///
/// A stream is pulled by a single logical consumer. It may end normally (exhaustion),
/// abort with an error on any pull, or be abandoned early; [`close()`](Self::close)
/// releases underlying resources in the latter case and must be idempotent.
pub trait ChatStream {
    /// Error raised by the underlying transport during consumption.
    type Error: Error + Send + Sync + 'static;

    /// Pulls the next chunk. `None` signals normal end of the sequence; after an
    /// `Err` or `None` the stream must not be pulled again.
    fn next_chunk(&mut self) -> Option<Result<ChatChunk, Self::Error>>;

    /// Releases underlying resources without waiting for natural exhaustion.
    fn close(&mut self);
}

/// The wrapped client issuing actual chat completion calls.
///
/// The instrumentation layer never changes what implementations return or raise;
/// it only adds observability side effects around the call boundaries.
pub trait ChatClient {
    /// Error raised by the client. The same type is raised by blocking calls,
    /// stream acquisition and stream consumption.
    type Error: Error + Send + Sync + 'static;
    /// Stream returned by [`create_streaming()`](Self::create_streaming).
    type Stream: ChatStream<Error = Self::Error>;

    /// Performs a blocking chat completion call.
    ///
    /// # Errors
    ///
    /// Propagates transport / server errors of the underlying client.
    fn create(
        &self,
        request: &ChatRequest,
        options: &CallOptions,
    ) -> Result<ChatResponse, Self::Error>;

    /// Starts a streaming chat completion call, returning the chunk stream.
    ///
    /// # Errors
    ///
    /// Fails if the stream itself cannot be obtained; errors *during* consumption are
    /// reported by the stream instead.
    fn create_streaming(
        &self,
        request: &ChatRequest,
        options: &CallOptions,
    ) -> Result<Self::Stream, Self::Error>;

    /// Forwards an operation that is not one of the two instrumented call shapes.
    ///
    /// # Errors
    ///
    /// Propagates errors of the underlying client unchanged.
    fn call_raw(&self, call: RawCall) -> Result<Value, Self::Error>;
}

/// Dynamically shaped call: an operation name plus loosely typed arguments.
///
/// This is how callers that do not know the instrumented call shapes at compile time
/// (e.g., generic proxy layers) reach the client. [`InstrumentedClient::dispatch()`]
/// recognizes the two instrumented shapes in a `RawCall` and forwards everything else
/// to [`ChatClient::call_raw()`] untouched.
///
/// [`InstrumentedClient::dispatch()`]: crate::InstrumentedClient::dispatch()
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCall {
    /// Operation name, e.g. `create`.
    pub operation: String,
    /// Positional arguments encoded as JSON values.
    pub args: Vec<Value>,
}

impl RawCall {
    /// Creates a call with the specified operation name and arguments.
    pub fn new(operation: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            operation: operation.into(),
            args,
        }
    }
}
