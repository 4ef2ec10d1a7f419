//! Observer surface of a stream
//!
//! Higher layers learn about a stream through a [`StreamObserver`]: when it
//! opened, every message received, and the status it failed with. A graceful
//! close produces no callback.
//!
//! [`events`] provides an observer backed by a channel, for consumers that
//! would rather poll a [`Stream`] of [`StreamEvent`]s.
use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use futures_lite::Stream;

use crate::status::Status;

/// Receives the notifications of one stream.
///
/// Callbacks run on the stream worker and must not block.
pub trait StreamObserver<M>: Send + 'static {
    /// The stream is open and accepts writes
    fn on_open(&self);

    /// A message was received
    fn on_message(&self, message: M);

    /// The stream failed.
    ///
    /// Called at most once, and nothing is delivered afterwards.
    fn on_error(&self, status: Status);
}

/// A notification delivered through [`events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent<M> {
    /// See [`StreamObserver::on_open`]
    Opened,
    /// See [`StreamObserver::on_message`]
    Message(M),
    /// See [`StreamObserver::on_error`]
    Error(Status),
}

/// Observer that forwards every notification to a [`StreamEvents`].
pub struct EventSender<M>(flume::Sender<StreamEvent<M>>);

impl<M> Clone for EventSender<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M> fmt::Debug for EventSender<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender").finish()
    }
}

impl<M> EventSender<M> {
    fn send(&self, event: StreamEvent<M>) {
        // nobody listening is fine
        self.0.send(event).ok();
    }
}

impl<M: Send + 'static> StreamObserver<M> for EventSender<M> {
    fn on_open(&self) {
        self.send(StreamEvent::Opened);
    }

    fn on_message(&self, message: M) {
        self.send(StreamEvent::Message(message));
    }

    fn on_error(&self, status: Status) {
        self.send(StreamEvent::Error(status));
    }
}

/// Stream of the notifications of one stream.
///
/// Ends once the stream has terminated and released its observer.
pub struct StreamEvents<M: 'static>(flume::r#async::RecvStream<'static, StreamEvent<M>>);

impl<M: 'static> fmt::Debug for StreamEvents<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEvents").finish()
    }
}

impl<M: 'static> Stream for StreamEvents<M> {
    type Item = StreamEvent<M>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.0).poll_next(cx)
    }
}

/// Create a channel backed observer and the stream of its events.
pub fn events<M: 'static>() -> (EventSender<M>, StreamEvents<M>) {
    let (send, recv) = flume::unbounded();
    (EventSender(send), StreamEvents(recv.into_stream()))
}
