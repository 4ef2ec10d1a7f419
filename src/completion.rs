//! Completion queue connecting a transport to the stream that issued work on it
//!
//! A transport answers every tagged request with exactly one [`Completion`],
//! posted through a [`CompletionSender`]. The stream worker is the only consumer
//! of the matching [`CompletionQueue`].
use std::fmt;

/// Identifies an issued operation on a completion queue.
///
/// Tags are handed out by the stream when an operation becomes active and are
/// only meaningful to that stream. Transports treat them as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub(crate) usize);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The outcome of one transport event.
#[derive(Debug)]
pub struct Completion<M> {
    /// Tag of the operation this completes
    pub tag: Tag,
    /// Whether the transport event succeeded
    pub ok: bool,
    /// Message received, for read events
    pub message: Option<M>,
}

impl<M> Completion<M> {
    /// A successful event without payload
    pub fn success(tag: Tag) -> Self {
        Self {
            tag,
            ok: true,
            message: None,
        }
    }

    /// A failed event
    pub fn failure(tag: Tag) -> Self {
        Self {
            tag,
            ok: false,
            message: None,
        }
    }

    /// A successful read event carrying `message`
    pub fn message(tag: Tag, message: M) -> Self {
        Self {
            tag,
            ok: true,
            message: Some(message),
        }
    }
}

/// Sending side of a completion queue, held by the transport.
pub struct CompletionSender<M>(flume::Sender<Completion<M>>);

impl<M> Clone for CompletionSender<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M> fmt::Debug for CompletionSender<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSender").finish()
    }
}

impl<M> CompletionSender<M> {
    /// Post a completion.
    ///
    /// If the queue is gone the stream has already terminated, so the
    /// completion is dropped.
    pub fn post(&self, completion: Completion<M>) {
        let tag = completion.tag;
        if self.0.send(completion).is_err() {
            tracing::trace!(%tag, "completion queue closed, dropping completion");
        }
    }
}

/// Receiving side of a completion queue, drained by the stream worker.
pub struct CompletionQueue<M>(flume::Receiver<Completion<M>>);

impl<M> fmt::Debug for CompletionQueue<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("len", &self.0.len())
            .finish()
    }
}

impl<M> CompletionQueue<M> {
    /// Wait for the next completion.
    ///
    /// Returns `None` once every [`CompletionSender`] has been dropped and the
    /// queue is drained.
    pub async fn next(&self) -> Option<Completion<M>> {
        self.0.recv_async().await.ok()
    }
}

/// Create a completion queue.
///
/// The queue is unbounded: a transport never blocks when reporting an event.
pub fn queue<M>() -> (CompletionSender<M>, CompletionQueue<M>) {
    let (send, recv) = flume::unbounded();
    (CompletionSender(send), CompletionQueue(recv))
}
