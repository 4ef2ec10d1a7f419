//! Transports that carry a single bidirectional stream
//!
//! A transport is the wire-level side of one streaming call. The stream asks it
//! to start the call, to read the next message and to write a message, each
//! request tagged with the [`Tag`] of the operation that issued it. The transport
//! answers every tagged request with exactly one [`Completion`] on the
//! [`CompletionQueue`] it was created with.
//!
//! In the transport module, the message types are referred to as `In` and `Out`.
//!
//! [`Completion`]: crate::completion::Completion
//! [`CompletionQueue`]: crate::completion::CompletionQueue
use crate::{completion::Tag, RpcMessage};

#[cfg(feature = "flume-transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "flume-transport")))]
pub mod flume;

/// The wire side of one bidirectional streaming call.
///
/// All methods are called from the stream worker and must not block. Work is
/// reported back asynchronously through the completion queue.
pub trait Transport: Send + 'static {
    /// The type of messages that can be received on the stream
    type In: RpcMessage;
    /// The type of messages that can be sent on the stream
    type Out: RpcMessage;

    /// Start the call. Completes with `ok == true` once the call is established.
    fn start(&mut self, tag: Tag);

    /// Read the next message. Completes with the message, or with
    /// `ok == false` if the stream ended or failed.
    fn read(&mut self, tag: Tag);

    /// Write a message.
    ///
    /// With `tag == None` the write is fire-and-forget and no completion must
    /// be posted for it.
    fn write(&mut self, message: Self::Out, tag: Option<Tag>);

    /// Cancel the call.
    ///
    /// Every tagged request still outstanding completes, with `ok == false`
    /// unless it already succeeded.
    fn cancel(&mut self);
}
