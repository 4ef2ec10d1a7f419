//! Units of asynchronous work and the executor that owns them while in flight
//!
//! An [`Operation`] is executed exactly once when it becomes active and
//! completed exactly once when the completion queue reports its event. It is
//! an owned task: whoever issues it gives it up by value, and [`InFlight`]
//! releases it after its completion has run.
use slab::Slab;
use std::fmt;

use crate::{
    completion::{Completion, Tag},
    status::Status,
    transport::Transport,
};

/// What a completed operation means for the stream that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<M> {
    /// The call was established
    Started,
    /// A message was read
    Read(M),
    /// A write went out
    Written,
    /// The operation failed. This is terminal for the stream.
    Failed(Status),
}

/// A unit of asynchronous work against a transport.
pub trait Operation<T: Transport>: Send + 'static {
    /// Hand the work to the transport.
    ///
    /// Called once, when the operation becomes active. Operations that do not
    /// await a completion must not pass `tag` on to the transport.
    fn execute(&mut self, transport: &mut T, tag: Tag);

    /// Interpret the transport event for this operation.
    ///
    /// Called once, with the payload of a read event if there was one.
    fn complete(self: Box<Self>, ok: bool, message: Option<T::In>) -> Outcome<T::In>;

    /// Whether a completion is expected after [`Operation::execute`].
    ///
    /// Fire-and-forget operations return `false` and are released right after
    /// they executed.
    fn awaits_completion(&self) -> bool {
        true
    }
}

/// Boxed operation, the form in which operations are queued and issued.
pub type BoxedOperation<T> = Box<dyn Operation<T>>;

/// Executor for the operations of one stream.
///
/// Keeps every issued operation until the completion queue reports its event,
/// so an operation is never released while the transport may still complete it.
pub struct InFlight<T: Transport> {
    ops: Slab<BoxedOperation<T>>,
}

impl<T: Transport> fmt::Debug for InFlight<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("len", &self.ops.len())
            .finish()
    }
}

impl<T: Transport> Default for InFlight<T> {
    fn default() -> Self {
        Self { ops: Slab::new() }
    }
}

impl<T: Transport> InFlight<T> {
    /// Create an empty executor
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` active: execute it against `transport` and keep it until its
    /// completion arrives.
    pub fn issue(&mut self, transport: &mut T, mut op: BoxedOperation<T>) {
        if !op.awaits_completion() {
            op.execute(transport, Tag(self.ops.vacant_key()));
            return;
        }
        let entry = self.ops.vacant_entry();
        let tag = Tag(entry.key());
        tracing::trace!(%tag, "issuing operation");
        op.execute(transport, tag);
        entry.insert(op);
    }

    /// Complete the operation `completion` is tagged with and release it.
    ///
    /// Returns `None` for a tag that is not in flight.
    pub fn complete(&mut self, completion: Completion<T::In>) -> Option<Outcome<T::In>> {
        let Completion { tag, ok, message } = completion;
        let Some(op) = self.ops.try_remove(tag.0) else {
            tracing::warn!(%tag, "completion for unknown operation");
            return None;
        };
        tracing::trace!(%tag, ok, "operation completed");
        Some(op.complete(ok, message))
    }

    /// Release every outstanding operation without completing it.
    ///
    /// Only valid once the transport can no longer report any completion.
    pub fn abandon(&mut self) -> usize {
        let n = self.ops.len();
        self.ops.clear();
        n
    }

    /// True if no operation is outstanding
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of outstanding operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}
