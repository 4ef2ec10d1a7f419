//! Errors returned by a [`StreamHandle`](crate::stream::StreamHandle)
use std::{error, fmt};

/// Error when talking to a stream worker.
///
/// Failures of the stream itself are not reported here. They are delivered
/// once, through [`StreamObserver::on_error`](crate::observer::StreamObserver::on_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The stream worker has terminated and no longer accepts commands
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl error::Error for Error {}
