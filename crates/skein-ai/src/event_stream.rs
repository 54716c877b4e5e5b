// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Generic event stream with a terminal result value.
//!
//! A producer pushes events through an [`EventSink`]; the consumer iterates
//! the paired [`EventStream`] and can additionally await a single terminal
//! result, extracted from whichever event satisfies the stream's
//! completion predicate.  One stream spans one LLM turn or one agent run,
//! so the unbounded queue is bounded in practice by the run itself.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::types::{AssistantMessage, AssistantMessageEvent};

/// The stream closed without producing a terminal event and without the
/// producer supplying an explicit result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event stream closed without a terminal result")]
pub struct StreamClosedWithoutResult;

type CompletePredicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type ResultExtractor<T, R> = Box<dyn Fn(&T) -> Option<R> + Send + Sync>;

struct SinkShared<T, R> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    result_tx: Mutex<Option<oneshot::Sender<R>>>,
    closed: AtomicBool,
    is_complete: CompletePredicate<T>,
    extract_result: ResultExtractor<T, R>,
}

/// Producer half.  Clones share the same underlying stream, so a producer
/// can hand a clone to helper tasks (e.g. tool update callbacks).
pub struct EventSink<T, R> {
    shared: Arc<SinkShared<T, R>>,
}

impl<T, R> Clone for EventSink<T, R> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T, R> EventSink<T, R> {
    /// Push an event.  If the event satisfies the completion predicate the
    /// terminal result is resolved and the stream closes; pushes after
    /// close are silently dropped.
    pub fn push(&self, event: T) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        let completing = (shared.is_complete)(&event);
        if completing {
            shared.closed.store(true, Ordering::Release);
            if let Some(result) = (shared.extract_result)(&event) {
                if let Some(tx) = shared.result_tx.lock().unwrap().take() {
                    let _ = tx.send(result);
                }
            }
        }
        if let Some(tx) = shared.tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
        if completing {
            // Drop the sender so iteration ends once the queue drains.
            shared.tx.lock().unwrap().take();
        }
    }

    /// Close the stream without a completing event.
    ///
    /// When `result` is `None` and no completing event was pushed earlier,
    /// the terminal future resolves with [`StreamClosedWithoutResult`].
    pub fn end(&self, result: Option<R>) {
        let shared = &self.shared;
        shared.closed.store(true, Ordering::Release);
        if let Some(result) = result {
            if let Some(tx) = shared.result_tx.lock().unwrap().take() {
                let _ = tx.send(result);
            }
        }
        shared.tx.lock().unwrap().take();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Consumer half: an async sequence of events plus an awaitable terminal
/// result.  Single-consumer.
pub struct EventStream<T, R> {
    rx: mpsc::UnboundedReceiver<T>,
    result_rx: oneshot::Receiver<R>,
}

impl<T, R> EventStream<T, R> {
    /// Next event in push order, or `None` once the stream has closed and
    /// the queue is drained.  Suspends while the stream is open and empty.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Await the terminal result.  May be called before, during, or after
    /// iteration; consumes the stream (remaining queued events are
    /// dropped, which releases the producer).
    pub async fn result(self) -> Result<R, StreamClosedWithoutResult> {
        self.result_rx.await.map_err(|_| StreamClosedWithoutResult)
    }
}

impl<T, R> Stream for EventStream<T, R> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// Create a sink/stream pair.
///
/// `is_complete` decides which event closes the stream; `extract_result`
/// pulls the terminal value out of that event.
pub fn event_stream<T, R>(
    is_complete: impl Fn(&T) -> bool + Send + Sync + 'static,
    extract_result: impl Fn(&T) -> Option<R> + Send + Sync + 'static,
) -> (EventSink<T, R>, EventStream<T, R>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = oneshot::channel();
    let sink = EventSink {
        shared: Arc::new(SinkShared {
            tx: Mutex::new(Some(tx)),
            result_tx: Mutex::new(Some(result_tx)),
            closed: AtomicBool::new(false),
            is_complete: Box::new(is_complete),
            extract_result: Box::new(extract_result),
        }),
    };
    (sink, EventStream { rx, result_rx })
}

/// Sink side of an assistant-message event stream.
pub type AssistantEventSink = EventSink<AssistantMessageEvent, AssistantMessage>;

/// The stream produced by every provider transport: canonical
/// [`AssistantMessageEvent`]s terminating in the final [`AssistantMessage`].
pub type AssistantMessageStream = EventStream<AssistantMessageEvent, AssistantMessage>;

/// Create an assistant-message event stream.  `done` and `error` complete
/// it; the terminal result is the message either carries.
pub fn assistant_event_stream() -> (AssistantEventSink, AssistantMessageStream) {
    event_stream(
        AssistantMessageEvent::is_terminal,
        |event| event.terminal_message().cloned(),
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn int_stream() -> (EventSink<i32, i32>, EventStream<i32, i32>) {
        // Completion: any negative number; result: its absolute value.
        event_stream(|e: &i32| *e < 0, |e: &i32| Some(e.abs()))
    }

    // ── Push / iterate ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn events_are_delivered_in_push_order() {
        let (sink, mut stream) = int_stream();
        sink.push(1);
        sink.push(2);
        sink.push(-3);
        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
        assert_eq!(stream.next().await, Some(-3));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn consumer_suspends_until_event_arrives() {
        let (sink, mut stream) = int_stream();
        let producer = tokio::spawn(async move {
            tokio::task::yield_now().await;
            sink.push(7);
            sink.end(None);
        });
        assert_eq!(stream.next().await, Some(7));
        assert_eq!(stream.next().await, None);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn completing_event_resolves_terminal_result() {
        let (sink, stream) = int_stream();
        sink.push(5);
        sink.push(-42);
        assert_eq!(stream.result().await, Ok(42));
    }

    #[tokio::test]
    async fn pushes_after_close_are_dropped() {
        let (sink, mut stream) = int_stream();
        sink.push(-1);
        sink.push(99);
        assert!(sink.is_closed());
        assert_eq!(stream.next().await, Some(-1));
        assert_eq!(stream.next().await, None, "late push must not be delivered");
    }

    #[tokio::test]
    async fn result_available_while_events_still_queued() {
        let (sink, stream) = int_stream();
        sink.push(1);
        sink.push(-2);
        // Await the result without draining the queue first.
        assert_eq!(stream.result().await, Ok(2));
    }

    // ── end() semantics ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn end_with_explicit_result_resolves_it() {
        let (sink, stream) = int_stream();
        sink.push(1);
        sink.end(Some(10));
        assert_eq!(stream.result().await, Ok(10));
    }

    #[tokio::test]
    async fn end_without_result_fails_terminal_future() {
        let (sink, stream) = int_stream();
        sink.end(None);
        assert_eq!(stream.result().await, Err(StreamClosedWithoutResult));
    }

    #[tokio::test]
    async fn dropped_sink_behaves_like_end_without_result() {
        let (sink, mut stream) = int_stream();
        sink.push(3);
        drop(sink);
        assert_eq!(stream.next().await, Some(3));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn end_after_completing_event_keeps_first_result() {
        let (sink, stream) = int_stream();
        sink.push(-5);
        sink.end(Some(100));
        assert_eq!(stream.result().await, Ok(5));
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn abandoned_consumer_does_not_strand_producer() {
        let (sink, stream) = int_stream();
        drop(stream);
        // Producer keeps pushing into the void without blocking or panicking.
        for i in 0..100 {
            sink.push(i);
        }
        sink.end(None);
    }

    #[tokio::test]
    async fn cloned_sinks_share_one_stream() {
        let (sink, mut stream) = int_stream();
        let other = sink.clone();
        sink.push(1);
        other.push(2);
        other.push(-3);
        assert!(sink.is_closed(), "close is visible through every clone");
        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
        assert_eq!(stream.next().await, Some(-3));
        assert_eq!(stream.next().await, None);
    }
}
