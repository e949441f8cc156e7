//! Integration tests for the call interceptor and the stream completion tracker.

use assert_matches::assert_matches;
use serde_json::json;

use std::sync::{atomic::Ordering, Arc};


use chat_instrument::{
    CallOptions, CapturePolicy, DispatchOutcome, InstrumentedClient, LogEvent, RawCall,
};
use mock::{
    content_chunk, entries, final_chunk, request, timeline, Entry, MockClient,
    RecordingInstrumenter, RecordingLogger, TestError,
};

fn instrumented(
    client: MockClient,
    accept: bool,
) -> (
    InstrumentedClient<MockClient>,
    Arc<RecordingInstrumenter>,
    Arc<RecordingLogger>,
    mock::Timeline,
) {
    let timeline = timeline();
    let instrumenter = RecordingInstrumenter::new(accept, &timeline);
    let logger = RecordingLogger::new(&timeline);
    let wrapped = InstrumentedClient::new(client, instrumenter.clone(), logger.clone());
    (wrapped, instrumenter, logger, timeline)
}

#[test]
fn blocking_call_records_span_and_events_in_order() {
    let (client, instrumenter, _, timeline) = instrumented(MockClient::default(), true);

    let response = client.create(&request(), &CallOptions::none()).unwrap();

    assert_eq!(response.id, "resp-1");
    assert_eq!(
        entries(&timeline),
        [
            Entry::SpanStarted,
            Entry::SpanEntered,
            Entry::Prompt,
            Entry::Completion,
            Entry::SpanExited,
            Entry::SpanEnded { success: true },
        ]
    );
    let last_end = instrumenter.last_end.lock().unwrap().take().unwrap();
    assert_eq!(last_end.0.unwrap(), response);
    assert!(last_end.1.is_none());
}

#[test]
fn declined_span_still_emits_events() {
    let (client, _, _, timeline) = instrumented(MockClient::default(), false);

    client.create(&request(), &CallOptions::none()).unwrap();

    // Tracing and logging are independent axes: no span lifecycle, but both events.
    assert_eq!(entries(&timeline), [Entry::Prompt, Entry::Completion]);
}

#[test]
fn blocking_failure_is_reraised_and_recorded() {
    let client = MockClient {
        fail_blocking: true,
        ..MockClient::default()
    };
    let (client, instrumenter, _, timeline) = instrumented(client, true);

    let err = client.create(&request(), &CallOptions::none()).unwrap_err();

    assert_eq!(err, TestError("blocking call failed"));
    // No completion event masks the failure; the scope is released before span end.
    assert_eq!(
        entries(&timeline),
        [
            Entry::SpanStarted,
            Entry::SpanEntered,
            Entry::Prompt,
            Entry::SpanExited,
            Entry::SpanEnded { success: false },
        ]
    );
    let last_end = instrumenter.last_end.lock().unwrap().take().unwrap();
    assert!(last_end.0.is_none());
    assert_eq!(last_end.1.unwrap(), "test error: blocking call failed");
}

#[test]
fn streaming_span_ends_exactly_after_exhaustion() {
    let client = MockClient::with_chunks(vec![
        content_chunk("Hello, "),
        content_chunk("world"),
        final_chunk(),
    ]);
    let (client, _, _, timeline) = instrumented(client, true);

    let mut stream = client
        .create_streaming(&request(), &CallOptions::none())
        .unwrap();

    // The span is started, but stays open after the originating call returns;
    // the scope is only held for the synchronous acquisition extent.
    assert_eq!(
        entries(&timeline),
        [
            Entry::SpanStarted,
            Entry::SpanEntered,
            Entry::Prompt,
            Entry::SpanExited,
        ]
    );

    let mut contents = vec![];
    while let Some(chunk) = stream.next_chunk() {
        let chunk = chunk.unwrap();
        if let Some(content) = &chunk.choices[0].delta.content {
            contents.push(content.clone());
        }
        // Not finalized while chunks are still flowing.
        if !stream.is_finished() {
            assert!(!entries(&timeline).contains(&Entry::SpanEnded { success: true }));
        }
    }

    assert_eq!(contents, ["Hello, ", "world"]);
    assert_eq!(
        entries(&timeline)[4..],
        [
            Entry::SpanEntered,
            Entry::Completion,
            Entry::SpanExited,
            Entry::SpanEnded { success: true },
        ]
    );
}

#[test]
fn streaming_error_propagates_on_next_read() {
    let client = MockClient::with_chunks(vec![
        content_chunk("partial"),
        Err(TestError("stream broke")),
    ]);
    let (client, instrumenter, logger, timeline) = instrumented(client, true);

    let mut stream = client
        .create_streaming(&request(), &CallOptions::none())
        .unwrap();
    assert_matches!(stream.next_chunk(), Some(Ok(_)));
    let err = stream.next_chunk().unwrap().unwrap_err();
    assert_eq!(err, TestError("stream broke"));

    assert!(entries(&timeline).contains(&Entry::SpanEnded { success: false }));
    let last_end = instrumenter.last_end.lock().unwrap().take().unwrap();
    assert_eq!(last_end.1.unwrap(), "test error: stream broke");

    // Closing after the error neither re-ends the span nor emits a completion event.
    let timeline_len = entries(&timeline).len();
    stream.close();
    assert_eq!(entries(&timeline).len(), timeline_len);
    let events = logger.events.lock().unwrap();
    assert!(events
        .iter()
        .all(|event| matches!(event, LogEvent::Prompt(_))));
}

#[test]
fn redundant_close_finalizes_once() {
    let client = MockClient::with_chunks(vec![content_chunk("hi"), final_chunk()]);
    let close_count = Arc::clone(&client.stream_close_count);
    let (client, _, _, timeline) = instrumented(client, true);

    let mut stream = client
        .create_streaming(&request(), &CallOptions::none())
        .unwrap();
    while stream.next_chunk().is_some() {
        // Drain.
    }
    stream.close();
    stream.close();

    let ends = entries(&timeline)
        .iter()
        .filter(|entry| matches!(entry, Entry::SpanEnded { .. }))
        .count();
    assert_eq!(ends, 1);
    let completions = entries(&timeline)
        .iter()
        .filter(|entry| matches!(entry, Entry::Completion))
        .count();
    assert_eq!(completions, 1);
    assert_eq!(close_count.load(Ordering::SeqCst), 2);
}

#[test]
fn abandoned_stream_finalizes_on_drop() {
    let client = MockClient::with_chunks(vec![
        content_chunk("Hello, "),
        content_chunk("world"),
        final_chunk(),
    ]);
    let close_count = Arc::clone(&client.stream_close_count);
    let (client, instrumenter, _, timeline) = instrumented(client, true);

    {
        let mut stream = client
            .create_streaming(&request(), &CallOptions::none())
            .unwrap();
        assert_matches!(stream.next_chunk(), Some(Ok(_)));
    }

    // Dropping the partially consumed stream must not leak the span.
    assert!(entries(&timeline).contains(&Entry::SpanEnded { success: true }));
    assert_eq!(close_count.load(Ordering::SeqCst), 1);
    let last_end = instrumenter.last_end.lock().unwrap().take().unwrap();
    let partial = last_end.0.unwrap();
    assert_eq!(partial.id, "resp-1");
    assert!(partial.choices[0].finish_reason.is_none());
}

#[test]
fn declined_streaming_span_still_emits_completion_once() {
    let client = MockClient::with_chunks(vec![content_chunk("hi"), final_chunk()]);
    let (client, _, _, timeline) = instrumented(client, false);

    let mut stream = client
        .create_streaming(&request(), &CallOptions::none())
        .unwrap();
    while stream.next_chunk().is_some() {
        // Drain.
    }
    stream.close();

    assert_eq!(entries(&timeline), [Entry::Prompt, Entry::Completion]);
}

#[test]
fn acquisition_failure_ends_span_synchronously() {
    let client = MockClient {
        fail_acquisition: true,
        ..MockClient::default()
    };
    let (client, instrumenter, _, timeline) = instrumented(client, true);

    let err = client
        .create_streaming(&request(), &CallOptions::none())
        .unwrap_err();

    assert_eq!(err, TestError("stream acquisition failed"));
    assert_eq!(
        entries(&timeline),
        [
            Entry::SpanStarted,
            Entry::SpanEntered,
            Entry::Prompt,
            Entry::SpanExited,
            Entry::SpanEnded { success: false },
        ]
    );
    let last_end = instrumenter.last_end.lock().unwrap().take().unwrap();
    assert_eq!(last_end.1.unwrap(), "test error: stream acquisition failed");
}

#[test]
fn streamed_content_is_captured_when_policy_allows() {
    let client = MockClient::with_chunks(vec![
        content_chunk("Hello, "),
        content_chunk("world"),
        final_chunk(),
    ]);
    let (client, instrumenter, logger, _) = instrumented(client, true);
    let client = client.with_policy(CapturePolicy::new(true));

    let stream = client
        .create_streaming(&request(), &CallOptions::none())
        .unwrap();
    for chunk in stream {
        chunk.unwrap();
    }

    let events = logger.events.lock().unwrap();
    let completion = events
        .iter()
        .find_map(|event| match event {
            LogEvent::Completion(payload) => Some(payload.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(completion.choices[0].content.as_deref(), Some("Hello, world"));
    assert_eq!(completion.usage.unwrap().output_tokens, 2);

    let last_end = instrumenter.last_end.lock().unwrap().take().unwrap();
    let response = last_end.0.unwrap();
    assert_eq!(response.choices[0].message.content, "Hello, world");
}

#[test]
fn streamed_content_is_redacted_by_default() {
    let client = MockClient::with_chunks(vec![content_chunk("secret"), final_chunk()]);
    let (client, _, logger, _) = instrumented(client, true);

    let stream = client
        .create_streaming(&request(), &CallOptions::none())
        .unwrap();
    for chunk in stream {
        // Chunks are passed through unmodified regardless of the policy.
        assert_eq!(chunk.unwrap().id, "resp-1");
    }

    let events = logger.events.lock().unwrap();
    let completion = events
        .iter()
        .find_map(|event| match event {
            LogEvent::Completion(payload) => Some(payload.clone()),
            _ => None,
        })
        .unwrap();
    assert!(completion.choices[0].content.is_none());
    assert_eq!(completion.id, "resp-1");
}

#[test]
fn dispatch_routes_blocking_calls() {
    let (client, _, _, timeline) = instrumented(MockClient::default(), true);

    let call = RawCall::new(
        "create",
        vec![json!({
            "model": "gpt-test",
            "messages": [{ "role": "user", "content": "hello" }],
        })],
    );
    let outcome = client.dispatch(call).unwrap();

    assert_matches!(outcome, DispatchOutcome::Response(response) if response.id == "resp-1");
    assert!(entries(&timeline).contains(&Entry::SpanEnded { success: true }));
}

#[test]
fn dispatch_routes_streaming_calls() {
    let client = MockClient::with_chunks(vec![content_chunk("hi"), final_chunk()]);
    let (client, _, _, timeline) = instrumented(client, true);

    let call = RawCall::new(
        "create_streaming",
        vec![json!({ "model": "gpt-test", "messages": [] })],
    );
    let outcome = client.dispatch(call).unwrap();

    let mut stream = assert_matches!(outcome, DispatchOutcome::Stream(stream) => stream);
    assert!(!entries(&timeline).contains(&Entry::SpanEnded { success: true }));
    while stream.next_chunk().is_some() {
        // Drain.
    }
    assert!(entries(&timeline).contains(&Entry::SpanEnded { success: true }));
}

#[test]
fn dispatch_forwards_unknown_operations_without_instrumentation() {
    let (client, _, _, timeline) = instrumented(MockClient::default(), true);

    let call = RawCall::new("embeddings", vec![json!({ "input": "hello" })]);
    let outcome = client.dispatch(call).unwrap();

    assert_matches!(outcome, DispatchOutcome::Raw(value) => {
        assert_eq!(value, json!({ "forwarded": "embeddings" }));
    });
    // Passthrough means no spans and no events.
    assert!(entries(&timeline).is_empty());
}
