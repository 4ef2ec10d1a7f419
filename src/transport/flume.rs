//! Memory transport implementation using [flume]
//!
//! A [`FlumeConnector`] opens client side [`FlumeTransport`]s, a
//! [`FlumeListener`] accepts the server side of each stream as a
//! [`SendSink`] and a [`RecvStream`].
//!
//! Transport requests run as tokio tasks, so the transport must be used from
//! within a tokio runtime.
//!
//! [flume]: https://docs.rs/flume/
use core::fmt;
use std::{error, fmt::Display, pin::Pin, result, task::Poll};

use futures_lite::Stream;
use futures_sink::Sink;
use tokio_util::sync::CancellationToken;

use super::Transport;
use crate::{
    completion::{self, Completion, CompletionQueue, CompletionSender, Tag},
    RpcMessage,
};

/// Error when receiving from a channel
///
/// This type has zero inhabitants, so it is always safe to unwrap a result with this error type.
#[derive(Debug)]
pub enum RecvError {}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl error::Error for RecvError {}

/// Sink for memory channels
pub struct SendSink<T: RpcMessage>(flume::r#async::SendSink<'static, T>);

impl<T: RpcMessage> fmt::Debug for SendSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendSink").finish()
    }
}

impl<T: RpcMessage> Sink<T> for SendSink<T> {
    type Error = self::SendError;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0)
            .poll_ready(cx)
            .map_err(|_| SendError::ReceiverDropped)
    }

    fn start_send(mut self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        Pin::new(&mut self.0)
            .start_send(item)
            .map_err(|_| SendError::ReceiverDropped)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0)
            .poll_flush(cx)
            .map_err(|_| SendError::ReceiverDropped)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0)
            .poll_close(cx)
            .map_err(|_| SendError::ReceiverDropped)
    }
}

/// Stream for memory channels
pub struct RecvStream<T: RpcMessage>(flume::r#async::RecvStream<'static, T>);

impl<T: RpcMessage> fmt::Debug for RecvStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvStream").finish()
    }
}

impl<T: RpcMessage> Stream for RecvStream<T> {
    type Item = result::Result<T, self::RecvError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.0).poll_next(cx) {
            Poll::Ready(Some(v)) => Poll::Ready(Some(Ok(v))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

type Socket<In, Out> = (self::SendSink<Out>, self::RecvStream<In>);

/// A flume based listener.
///
/// Created using [channel].
pub struct FlumeListener<In: RpcMessage, Out: RpcMessage> {
    stream: flume::Receiver<Socket<In, Out>>,
}

impl<In: RpcMessage, Out: RpcMessage> Clone for FlumeListener<In, Out> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<In: RpcMessage, Out: RpcMessage> fmt::Debug for FlumeListener<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlumeListener")
            .field("stream", &self.stream)
            .finish()
    }
}

impl<In: RpcMessage, Out: RpcMessage> FlumeListener<In, Out> {
    /// Accept the server side of the next stream that was started.
    pub async fn accept(&self) -> result::Result<Socket<In, Out>, AcceptError> {
        self.stream
            .recv_async()
            .await
            .map_err(|_| AcceptError::RemoteDropped)
    }
}

/// A flume based connector.
///
/// Created using [channel].
pub struct FlumeConnector<In: RpcMessage, Out: RpcMessage> {
    sink: flume::Sender<Socket<Out, In>>,
    buffer: usize,
}

impl<In: RpcMessage, Out: RpcMessage> Clone for FlumeConnector<In, Out> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            buffer: self.buffer,
        }
    }
}

impl<In: RpcMessage, Out: RpcMessage> fmt::Debug for FlumeConnector<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlumeConnector")
            .field("sink", &self.sink)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl<In: RpcMessage, Out: RpcMessage> FlumeConnector<In, Out> {
    /// Open a transport for one stream, and the completion queue it reports to.
    ///
    /// Nothing reaches the listener until the transport is started.
    pub fn open(&self) -> (FlumeTransport<In, Out>, CompletionQueue<In>) {
        let (completions, queue) = completion::queue();
        let transport = FlumeTransport {
            listener: self.sink.clone(),
            buffer: self.buffer,
            completions,
            cancel: CancellationToken::new(),
            send: None,
            recv: None,
        };
        (transport, queue)
    }
}

/// Client side of one stream over flume channels.
pub struct FlumeTransport<In: RpcMessage, Out: RpcMessage> {
    listener: flume::Sender<Socket<Out, In>>,
    buffer: usize,
    completions: CompletionSender<In>,
    cancel: CancellationToken,
    send: Option<flume::Sender<Out>>,
    recv: Option<flume::Receiver<In>>,
}

impl<In: RpcMessage, Out: RpcMessage> fmt::Debug for FlumeTransport<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlumeTransport")
            .field("started", &self.send.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<In: RpcMessage, Out: RpcMessage> Transport for FlumeTransport<In, Out> {
    type In = In;
    type Out = Out;

    fn start(&mut self, tag: Tag) {
        let (local_send, remote_recv) = flume::bounded::<Out>(self.buffer);
        let (remote_send, local_recv) = flume::bounded::<In>(self.buffer);
        let remote_chan = (
            SendSink(remote_send.into_sink()),
            RecvStream(remote_recv.into_stream()),
        );
        self.send = Some(local_send);
        self.recv = Some(local_recv);

        let listener = self.listener.clone();
        let completions = self.completions.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let ok = tokio::select! {
                res = listener.send_async(remote_chan) => res.is_ok(),
                _ = cancel.cancelled() => false,
            };
            if !ok {
                tracing::debug!(%tag, "listener gone, stream not started");
            }
            completions.post(if ok {
                Completion::success(tag)
            } else {
                Completion::failure(tag)
            });
        });
    }

    fn read(&mut self, tag: Tag) {
        let Some(recv) = self.recv.clone() else {
            self.completions.post(Completion::failure(tag));
            return;
        };
        let completions = self.completions.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let completion = tokio::select! {
                res = recv.recv_async() => match res {
                    Ok(message) => Completion::message(tag, message),
                    Err(_) => Completion::failure(tag),
                },
                _ = cancel.cancelled() => Completion::failure(tag),
            };
            completions.post(completion);
        });
    }

    fn write(&mut self, message: Out, tag: Option<Tag>) {
        let Some(send) = self.send.clone() else {
            if let Some(tag) = tag {
                self.completions.post(Completion::failure(tag));
            }
            return;
        };
        let completions = self.completions.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            // a write that can go out right away wins over a concurrent cancel
            let ok = tokio::select! {
                biased;
                res = send.send_async(message) => res.is_ok(),
                _ = cancel.cancelled() => false,
            };
            if let Some(tag) = tag {
                completions.post(if ok {
                    Completion::success(tag)
                } else {
                    Completion::failure(tag)
                });
            }
        });
    }

    fn cancel(&mut self) {
        self.cancel.cancel();
        self.send = None;
        self.recv = None;
    }
}

/// AcceptError for mem channels.
///
/// There is not much that can go wrong with mem channels.
#[derive(Debug)]
pub enum AcceptError {
    /// The remote side of the channel was dropped
    RemoteDropped,
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl error::Error for AcceptError {}

/// SendError for mem channels.
///
/// There is not much that can go wrong with mem channels.
#[derive(Debug)]
pub enum SendError {
    /// Receiver was dropped
    ReceiverDropped,
}

impl Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for SendError {}

/// Create a flume listener and a connected flume connector.
///
/// `buffer` the size of the buffer for each channel. Keep this at a low value to get backpressure
pub fn channel<Req: RpcMessage, Res: RpcMessage>(
    buffer: usize,
) -> (FlumeListener<Req, Res>, FlumeConnector<Res, Req>) {
    let (sink, stream) = flume::bounded(buffer);
    (FlumeListener { stream }, FlumeConnector { sink, buffer })
}
