//! Write flow control and operation lifecycle for bidirectional streaming rpc calls
//!
//! A streaming call delivers every asynchronous result, be it the call start,
//! a read or a write, as a notification on a completion queue. This crate turns
//! that notification stream into an orderly protocol for one stream:
//!
//! - at most one write is in flight, and writes go out in the order they were
//!   submitted ([`buffered_writer::BufferedWriter`]),
//! - exactly one read is outstanding while the stream is open,
//! - the call is finished either silently or with an error that the observer
//!   hears about exactly once ([`call::Call`]),
//! - every issued [`operation::Operation`] is executed once and completed once,
//!   and the stream only terminates after all of them completed.
//!
//! The stream runs on a single worker task per stream ([`stream::spawn`]), so
//! none of this needs locking.
//!
//! # Example
//! ```
//! # async fn example() -> anyhow::Result<()> {
//! use futures_lite::StreamExt;
//! use sync_stream_rpc::{observer::{self, StreamEvent}, stream, transport::flume};
//!
//! // create a transport channel
//! let (server, client) = flume::channel::<u64, u64>(16);
//!
//! // open a stream and run it on its own worker
//! let (transport, completions) = client.open();
//! let (observer, mut events) = observer::events();
//! let handle = stream::spawn(transport, completions, observer);
//! handle.start()?;
//!
//! // the server side gets a sink and a stream
//! let (_send, _recv) = server.accept().await?;
//!
//! assert_eq!(events.next().await, Some(StreamEvent::Opened));
//! handle.write(1)?;
//! handle.stop()?;
//! handle.closed().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
#![doc = document_features::document_features!()]
#![cfg_attr(docsrs, feature(doc_cfg))]
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

pub mod buffered_writer;
pub mod call;
pub mod completion;
pub mod error;
pub mod observer;
pub mod operation;
pub mod status;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod test_util;

pub use error::Error;
pub use status::{Code, Status};
pub use stream::{spawn, RpcStream, StreamHandle, StreamState};

/// Requirements for a message carried by a stream
///
/// Messages must be serializable even though the in-memory transport never
/// serializes them, so any stream can be moved onto a wire transport. They
/// must be `Send` because completions are posted from transport tasks.
pub trait RpcMessage: Debug + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

impl<T> RpcMessage for T where
    T: Debug + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static
{
}
