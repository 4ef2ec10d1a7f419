//! Termination of a live rpc call
//!
//! A [`Call`] ends in exactly one of two ways: [`Call::finish`], which is
//! silent, or [`Call::finish_with_error`], which tells the observer registered
//! on the call. Both consume the call, so it cannot be finished twice or used
//! after it was finished.
use std::fmt;

use crate::{observer::StreamObserver, status::Status, transport::Transport};

/// One live rpc call, seen only through its termination.
pub trait Call {
    /// Finish the call gracefully.
    ///
    /// Doesn't produce a notification to any callbacks or observers. Safe to
    /// call when no activity is outstanding.
    fn finish(self);

    /// Finish the call with an error, notifying the registered observer once.
    fn finish_with_error(self, status: Status);
}

/// A streaming call: the transport carrying it and the observer registered on it.
pub struct RpcCall<T, O> {
    transport: T,
    observer: O,
}

impl<T: fmt::Debug, O> fmt::Debug for RpcCall<T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCall")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl<T, O> RpcCall<T, O>
where
    T: Transport,
    O: StreamObserver<T::In>,
{
    /// Create a call on `transport`, with `observer` to be told about errors.
    pub fn new(transport: T, observer: O) -> Self {
        Self {
            transport,
            observer,
        }
    }

    /// The transport, for issuing operations on the call
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T, O> Call for RpcCall<T, O>
where
    T: Transport,
    O: StreamObserver<T::In>,
{
    fn finish(mut self) {
        tracing::debug!("finishing call");
        self.transport.cancel();
    }

    fn finish_with_error(mut self, status: Status) {
        tracing::debug!(%status, "finishing call with error");
        self.transport.cancel();
        self.observer.on_error(status);
    }
}
