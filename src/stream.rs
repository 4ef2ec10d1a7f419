//! A bidirectional stream over one call
//!
//! [`RpcStream`] composes a [`RpcCall`], the operations it issues and a
//! [`BufferedWriter`] into a channel with explicit states:
//!
//! ```text
//! NotStarted -> Starting -> Open -> Finishing -> Closed | Errored
//! ```
//!
//! Once open, the stream keeps exactly one read outstanding and funnels every
//! write through the writer, so at most one write is in flight. A failed
//! operation finishes the call with an error, a caller stop finishes it
//! silently. Either way the stream only becomes terminal once every operation
//! it issued has completed.
//!
//! [`RpcStream`] is a plain state machine. [`spawn`] moves it onto a single
//! tokio task that feeds it caller commands and transport completions, and
//! returns a [`StreamHandle`] to talk to it.
use std::fmt;

use tokio::sync::watch;
use tracing::{debug_span, Instrument};

use crate::{
    buffered_writer::BufferedWriter,
    call::{Call, RpcCall},
    completion::{Completion, CompletionQueue, Tag},
    error::Error,
    observer::StreamObserver,
    operation::{BoxedOperation, InFlight, Operation, Outcome},
    status::{Code, Status},
    transport::Transport,
};

/// The states of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Created, `start` was not requested yet
    NotStarted,
    /// Waiting for the call to be established
    Starting,
    /// Reading and accepting writes
    Open,
    /// The call was finished, waiting for outstanding operations
    Finishing,
    /// Finished gracefully
    Closed,
    /// Finished with an error
    Errored,
}

impl StreamState {
    /// True for [`StreamState::Closed`] and [`StreamState::Errored`]
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Errored)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct StartOp;

impl<T: Transport> Operation<T> for StartOp {
    fn execute(&mut self, transport: &mut T, tag: Tag) {
        transport.start(tag);
    }

    fn complete(self: Box<Self>, ok: bool, _message: Option<T::In>) -> Outcome<T::In> {
        if ok {
            Outcome::Started
        } else {
            Outcome::Failed(Status::unavailable("failed to start stream"))
        }
    }
}

struct ReadOp;

impl<T: Transport> Operation<T> for ReadOp {
    fn execute(&mut self, transport: &mut T, tag: Tag) {
        transport.read(tag);
    }

    fn complete(self: Box<Self>, ok: bool, message: Option<T::In>) -> Outcome<T::In> {
        match (ok, message) {
            (true, Some(message)) => Outcome::Read(message),
            (true, None) => Outcome::Failed(Status::new(
                Code::Internal,
                "read completed without a message",
            )),
            (false, _) => Outcome::Failed(Status::unavailable("stream read failed")),
        }
    }
}

struct WriteOp<T: Transport> {
    message: Option<T::Out>,
    last: bool,
}

impl<T: Transport> WriteOp<T> {
    fn new(message: T::Out) -> Self {
        Self {
            message: Some(message),
            last: false,
        }
    }

    /// The final write of a stream, sent without waiting for its completion
    fn last(message: T::Out) -> Self {
        Self {
            message: Some(message),
            last: true,
        }
    }
}

impl<T: Transport> Operation<T> for WriteOp<T> {
    fn execute(&mut self, transport: &mut T, tag: Tag) {
        if let Some(message) = self.message.take() {
            transport.write(message, (!self.last).then_some(tag));
        }
    }

    fn complete(self: Box<Self>, ok: bool, _message: Option<T::In>) -> Outcome<T::In> {
        if ok {
            Outcome::Written
        } else {
            Outcome::Failed(Status::unavailable("stream write failed"))
        }
    }

    fn awaits_completion(&self) -> bool {
        !self.last
    }
}

/// A request from the owner of a stream.
#[derive(Debug)]
pub enum Command<M> {
    /// See [`RpcStream::start`]
    Start,
    /// See [`RpcStream::write`]
    Write(M),
    /// See [`RpcStream::write_and_finish`]
    WriteAndFinish(M),
    /// See [`RpcStream::stop`]
    Stop,
}

/// The state machine of one bidirectional stream.
///
/// All methods must be called from one worker, the same that drains the
/// completion queue of the transport. [`spawn`] takes care of that.
pub struct RpcStream<T: Transport, O> {
    state: StreamState,
    call: Option<RpcCall<T, O>>,
    writer: BufferedWriter<BoxedOperation<T>>,
    in_flight: InFlight<T>,
    observer: O,
    error: Option<Status>,
}

impl<T: Transport, O> fmt::Debug for RpcStream<T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcStream")
            .field("state", &self.state)
            .field("pending_writes", &self.writer.len())
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl<T, O> RpcStream<T, O>
where
    T: Transport,
    O: StreamObserver<T::In> + Clone,
{
    /// Create a stream on `transport`.
    ///
    /// `observer` is registered on the call as well, so it learns about
    /// errors through [`Call::finish_with_error`].
    pub fn new(transport: T, observer: O) -> Self {
        Self {
            state: StreamState::NotStarted,
            call: Some(RpcCall::new(transport, observer.clone())),
            writer: BufferedWriter::new(),
            in_flight: InFlight::new(),
            observer,
            error: None,
        }
    }

    /// The current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// True once `start` was called
    pub fn is_started(&self) -> bool {
        self.state != StreamState::NotStarted
    }

    /// True once the stream reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Number of writes waiting behind the active one
    pub fn pending_writes(&self) -> usize {
        self.writer.len()
    }

    /// Number of operations waiting for their completion
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    /// Start the call.
    ///
    /// The stream must not have been started before.
    pub fn start(&mut self) {
        debug_assert_eq!(self.state, StreamState::NotStarted, "stream started twice");
        if self.state != StreamState::NotStarted {
            tracing::warn!(state = %self.state, "ignoring start");
            return;
        }
        self.set_state(StreamState::Starting);
        self.issue(Box::new(StartOp));
    }

    /// Write a message.
    ///
    /// The stream must be open. Writes go out one at a time, in the order of
    /// the calls.
    ///
    /// Writing before the stream opened is a caller bug and asserted in debug
    /// builds. A write after the stream started finishing is only logged and
    /// dropped: a failure arrives asynchronously, so the caller cannot know in
    /// time that the stream is gone.
    pub fn write(&mut self, message: T::Out) {
        if self.accepts_writes() {
            self.enqueue(WriteOp::new(message));
        }
    }

    /// Write a final message and finish the stream gracefully.
    ///
    /// The message is sent fire-and-forget, and only if no other write is
    /// active at this point. Otherwise it is dropped with the queued writes.
    pub fn write_and_finish(&mut self, message: T::Out) {
        if self.accepts_writes() {
            if self.writer.has_active_write() {
                tracing::debug!("write in progress, dropping final write");
            } else {
                self.enqueue(WriteOp::last(message));
            }
        }
        self.stop();
    }

    /// Finish the stream gracefully, without notifying the observer.
    ///
    /// Queued writes are dropped. Does nothing if the stream is already
    /// finishing.
    pub fn stop(&mut self) {
        match self.state {
            StreamState::NotStarted | StreamState::Starting | StreamState::Open => {
                self.begin_finishing(None)
            }
            StreamState::Finishing | StreamState::Closed | StreamState::Errored => {
                tracing::trace!(state = %self.state, "stream already finishing");
            }
        }
    }

    /// Apply a command from the owner.
    pub fn handle_command(&mut self, command: Command<T::Out>) {
        match command {
            Command::Start => self.start(),
            Command::Write(message) => self.write(message),
            Command::WriteAndFinish(message) => self.write_and_finish(message),
            Command::Stop => self.stop(),
        }
    }

    /// Route a completion to the operation it belongs to and act on the outcome.
    pub fn handle_completion(&mut self, completion: Completion<T::In>) {
        let Some(outcome) = self.in_flight.complete(completion) else {
            return;
        };
        match self.state {
            StreamState::Starting | StreamState::Open => self.on_outcome(outcome),
            _ => {
                tracing::trace!(state = %self.state, "ignoring completion");
                self.try_close();
            }
        }
    }

    /// Give up on every outstanding operation.
    ///
    /// For when the completion queue was disconnected and nothing can
    /// complete any more. A live stream fails with [`Code::Unavailable`].
    pub fn abandon(&mut self) {
        let n = self.in_flight.abandon();
        if n > 0 {
            tracing::warn!(n, "completion queue closed with operations outstanding");
        }
        match self.state {
            StreamState::NotStarted | StreamState::Starting | StreamState::Open => {
                self.begin_finishing(Some(Status::unavailable("completion queue closed")))
            }
            StreamState::Finishing => self.try_close(),
            StreamState::Closed | StreamState::Errored => {}
        }
    }

    fn on_outcome(&mut self, outcome: Outcome<T::In>) {
        match outcome {
            Outcome::Started => {
                self.set_state(StreamState::Open);
                self.observer.on_open();
                self.issue(Box::new(ReadOp));
            }
            Outcome::Read(message) => {
                self.observer.on_message(message);
                self.issue(Box::new(ReadOp));
            }
            Outcome::Written => {
                let Some(call) = self.call.as_mut() else {
                    return;
                };
                let transport = call.transport_mut();
                let in_flight = &mut self.in_flight;
                self.writer
                    .dequeue_next_write(|op| in_flight.issue(transport, op));
            }
            Outcome::Failed(status) => {
                tracing::warn!(%status, "stream failed");
                self.begin_finishing(Some(status));
            }
        }
    }

    fn accepts_writes(&self) -> bool {
        match self.state {
            StreamState::Open => true,
            StreamState::NotStarted | StreamState::Starting => {
                debug_assert!(false, "write on a stream that is not open");
                tracing::warn!(state = %self.state, "dropping write on a stream that is not open");
                false
            }
            StreamState::Finishing | StreamState::Closed | StreamState::Errored => {
                tracing::debug!(state = %self.state, "dropping write on a finished stream");
                false
            }
        }
    }

    fn enqueue(&mut self, op: WriteOp<T>) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let transport = call.transport_mut();
        let in_flight = &mut self.in_flight;
        self.writer
            .enqueue_write(Box::new(op), |op| in_flight.issue(transport, op));
    }

    fn issue(&mut self, op: BoxedOperation<T>) {
        if let Some(call) = self.call.as_mut() {
            self.in_flight.issue(call.transport_mut(), op);
        }
    }

    fn begin_finishing(&mut self, error: Option<Status>) {
        self.set_state(StreamState::Finishing);
        let dropped = self.writer.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "dropping queued writes");
        }
        if let Some(call) = self.call.take() {
            match &error {
                Some(status) => call.finish_with_error(status.clone()),
                None => call.finish(),
            }
        }
        self.error = error;
        self.try_close();
    }

    fn try_close(&mut self) {
        if self.state != StreamState::Finishing || !self.in_flight.is_empty() {
            return;
        }
        let state = match self.error {
            Some(_) => StreamState::Errored,
            None => StreamState::Closed,
        };
        self.set_state(state);
    }

    fn set_state(&mut self, state: StreamState) {
        tracing::debug!(from = %self.state, to = %state, "stream state");
        self.state = state;
    }
}

/// Handle to a stream running on its own worker task.
///
/// Commands are applied by the worker in the order they were sent. Dropping
/// every handle of a live stream stops it gracefully.
pub struct StreamHandle<M> {
    commands: flume::Sender<Command<M>>,
    state: watch::Receiver<StreamState>,
}

impl<M> Clone for StreamHandle<M> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
        }
    }
}

impl<M> fmt::Debug for StreamHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl<M> StreamHandle<M> {
    /// Start the stream
    pub fn start(&self) -> Result<(), Error> {
        self.send(Command::Start)
    }

    /// Write a message. Only valid once the observer was told the stream is open.
    pub fn write(&self, message: M) -> Result<(), Error> {
        self.send(Command::Write(message))
    }

    /// Write a final message and finish gracefully, see [`RpcStream::write_and_finish`]
    pub fn write_and_finish(&self, message: M) -> Result<(), Error> {
        self.send(Command::WriteAndFinish(message))
    }

    /// Finish gracefully
    pub fn stop(&self) -> Result<(), Error> {
        self.send(Command::Stop)
    }

    /// The state most recently published by the worker
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Wait until the stream is terminal, and return the terminal state.
    pub async fn closed(&self) -> Result<StreamState, Error> {
        let mut state = self.state.clone();
        let terminal = state
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| Error::Closed)?;
        Ok(*terminal)
    }

    fn send(&self, command: Command<M>) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::Closed)
    }
}

/// Run a stream on a new tokio task.
///
/// `completions` must be the queue `transport` reports to. The task owns the
/// stream and is the only place it is touched, and it exits once the stream
/// is terminal.
pub fn spawn<T, O>(
    transport: T,
    completions: CompletionQueue<T::In>,
    observer: O,
) -> StreamHandle<T::Out>
where
    T: Transport,
    O: StreamObserver<T::In> + Clone,
{
    let (commands_tx, commands_rx) = flume::unbounded();
    let (state_tx, state_rx) = watch::channel(StreamState::NotStarted);
    let stream = RpcStream::new(transport, observer);
    tokio::spawn(run(stream, commands_rx, completions, state_tx).instrument(debug_span!("stream")));
    StreamHandle {
        commands: commands_tx,
        state: state_rx,
    }
}

async fn run<T, O>(
    mut stream: RpcStream<T, O>,
    commands: flume::Receiver<Command<T::Out>>,
    completions: CompletionQueue<T::In>,
    state: watch::Sender<StreamState>,
) where
    T: Transport,
    O: StreamObserver<T::In> + Clone,
{
    let mut accepting = true;
    loop {
        tokio::select! {
            command = commands.recv_async(), if accepting => match command {
                Ok(command) => stream.handle_command(command),
                Err(_) => {
                    tracing::debug!("all handles dropped");
                    accepting = false;
                    stream.stop();
                }
            },
            completion = completions.next() => match completion {
                Some(completion) => stream.handle_completion(completion),
                None => stream.abandon(),
            },
        }
        if stream.is_finished() {
            break;
        }
        state.send_replace(stream.state());
    }
    // refuse commands before announcing the terminal state
    drop(commands);
    state.send_replace(stream.state());
    tracing::debug!(state = %stream.state(), "stream worker done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{Recorder, Request, ScriptedTransport, Seen};

    type TestStream = RpcStream<ScriptedTransport, Recorder>;

    fn stream() -> (TestStream, ScriptedTransport, Recorder) {
        let transport = ScriptedTransport::new();
        let observer = Recorder::new();
        let stream = RpcStream::new(transport.clone(), observer.clone());
        (stream, transport, observer)
    }

    fn open_stream() -> (TestStream, ScriptedTransport, Recorder) {
        let (mut stream, transport, observer) = stream();
        stream.start();
        stream.handle_completion(Completion::success(transport.start_tag()));
        assert_eq!(stream.state(), StreamState::Open);
        (stream, transport, observer)
    }

    #[test]
    fn start_opens_and_reads() {
        let (mut stream, transport, observer) = stream();
        assert!(!stream.is_started());

        stream.start();
        assert_eq!(stream.state(), StreamState::Starting);
        assert!(matches!(&transport.requests()[..], [Request::Start(_)]));

        stream.handle_completion(Completion::success(transport.start_tag()));
        assert_eq!(stream.state(), StreamState::Open);
        assert_eq!(observer.seen(), vec![Seen::Open]);
        assert_eq!(stream.outstanding(), 1);

        stream.handle_completion(Completion::message(transport.read_tag(), 42));
        stream.handle_completion(Completion::message(transport.read_tag(), 43));
        assert_eq!(
            observer.seen(),
            vec![Seen::Open, Seen::Message(42), Seen::Message(43)]
        );
        // exactly one read outstanding at all times
        assert_eq!(stream.outstanding(), 1);
        let reads = transport
            .requests()
            .iter()
            .filter(|r| matches!(r, Request::Read(_)))
            .count();
        assert_eq!(reads, 3);
    }

    #[test]
    fn start_failure_errors() {
        let (mut stream, transport, observer) = stream();
        stream.start();
        stream.handle_completion(Completion::failure(transport.start_tag()));

        assert_eq!(stream.state(), StreamState::Errored);
        let errors = observer.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), Code::Unavailable);
        assert!(!observer.seen().contains(&Seen::Open));
    }

    #[test]
    fn writes_go_out_one_at_a_time() {
        let (mut stream, transport, _observer) = open_stream();
        stream.write(1);
        stream.write(2);
        stream.write(3);
        assert_eq!(transport.writes(), vec![1]);
        assert_eq!(stream.pending_writes(), 2);

        stream.handle_completion(Completion::success(transport.write_tag()));
        assert_eq!(transport.writes(), vec![1, 2]);

        stream.handle_completion(Completion::success(transport.write_tag()));
        assert_eq!(transport.writes(), vec![1, 2, 3]);

        stream.handle_completion(Completion::success(transport.write_tag()));
        assert_eq!(transport.writes(), vec![1, 2, 3]);
        assert_eq!(stream.pending_writes(), 0);
        // only the read is left
        assert_eq!(stream.outstanding(), 1);
    }

    #[test]
    fn read_failure_while_open_errors_once() {
        let (mut stream, transport, observer) = open_stream();
        stream.handle_completion(Completion::failure(transport.read_tag()));

        assert_eq!(stream.state(), StreamState::Errored);
        assert!(transport.cancelled());
        let errors = observer.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), Code::Unavailable);
    }

    #[test]
    fn read_without_message_is_internal() {
        let (mut stream, transport, observer) = open_stream();
        stream.handle_completion(Completion::success(transport.read_tag()));

        assert_eq!(stream.state(), StreamState::Errored);
        let errors = observer.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), Code::Internal);
    }

    #[test]
    fn write_failure_while_open_errors_once() {
        let (mut stream, transport, observer) = open_stream();
        stream.write(1);
        stream.write(2);

        stream.handle_completion(Completion::failure(transport.write_tag()));
        assert_eq!(stream.state(), StreamState::Finishing);
        assert!(transport.cancelled());
        assert_eq!(stream.pending_writes(), 0);

        // the cancelled read drains the stream
        stream.handle_completion(Completion::failure(transport.read_tag()));
        assert_eq!(stream.state(), StreamState::Errored);
        assert_eq!(transport.writes(), vec![1]);
        let errors = observer.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), Code::Unavailable);
    }

    #[test]
    fn stop_while_starting_closes_without_open() {
        let (mut stream, transport, observer) = stream();
        stream.start();
        stream.stop();
        assert_eq!(stream.state(), StreamState::Finishing);

        // the start still completes, but the stream never opens
        stream.handle_completion(Completion::success(transport.start_tag()));
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(observer.seen().is_empty());
        assert!(!transport
            .requests()
            .iter()
            .any(|r| matches!(r, Request::Read(_))));
    }

    #[test]
    fn failure_waits_for_outstanding_operations() {
        let (mut stream, transport, observer) = open_stream();
        stream.write(1);
        stream.write(2);
        let write = transport.write_tag();

        stream.handle_completion(Completion::failure(transport.read_tag()));
        assert_eq!(stream.state(), StreamState::Finishing);
        assert_eq!(stream.pending_writes(), 0);

        // the cancelled write still completes, without issuing the queued one
        let before = transport.requests().len();
        stream.handle_completion(Completion::failure(write));
        assert_eq!(stream.state(), StreamState::Errored);
        assert_eq!(transport.requests().len(), before);
        assert_eq!(transport.writes(), vec![1]);
        assert_eq!(observer.errors().len(), 1);
    }

    #[test]
    fn stop_while_idle_is_silent() {
        let (mut stream, transport, observer) = open_stream();
        stream.stop();
        assert_eq!(stream.state(), StreamState::Finishing);
        assert!(transport.cancelled());

        // the cancelled read completes with a failure that is not an error any more
        stream.handle_completion(Completion::failure(transport.read_tag()));
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(observer.errors().is_empty());

        // further stops are no-ops
        stream.stop();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn stop_before_start_closes() {
        let (mut stream, transport, observer) = stream();
        stream.stop();
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(transport.requests(), vec![Request::Cancel]);
        assert!(observer.seen().is_empty());
    }

    #[test]
    fn write_and_finish_when_idle() {
        let (mut stream, transport, observer) = open_stream();
        stream.write_and_finish(9);

        assert_eq!(stream.state(), StreamState::Finishing);
        let requests = transport.requests();
        assert_eq!(requests[requests.len() - 2], Request::Write(9, None));
        assert_eq!(requests[requests.len() - 1], Request::Cancel);

        stream.handle_completion(Completion::failure(transport.read_tag()));
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(observer.errors().is_empty());
    }

    #[test]
    fn write_and_finish_behind_active_write() {
        let (mut stream, transport, _observer) = open_stream();
        stream.write(1);
        stream.write_and_finish(2);
        assert_eq!(transport.writes(), vec![1]);
        assert_eq!(stream.state(), StreamState::Finishing);

        stream.handle_completion(Completion::success(transport.write_tag()));
        stream.handle_completion(Completion::failure(transport.read_tag()));
        assert_eq!(transport.writes(), vec![1]);
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn writes_while_finishing_are_dropped() {
        let (mut stream, transport, _observer) = open_stream();
        stream.stop();
        stream.write(5);
        assert!(transport.writes().is_empty());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "not open")]
    fn write_before_open_is_a_precondition_violation() {
        let (mut stream, _transport, _observer) = stream();
        stream.start();
        stream.write(1);
    }

    #[test]
    fn abandon_fails_a_live_stream() {
        let (mut stream, transport, observer) = open_stream();
        stream.write(1);
        stream.abandon();
        assert_eq!(stream.state(), StreamState::Errored);
        assert_eq!(stream.outstanding(), 0);
        assert!(transport.cancelled());
        assert_eq!(observer.errors().len(), 1);
    }

    #[test]
    fn commands_are_applied() {
        let (mut stream, transport, _observer) = stream();
        stream.handle_command(Command::Start);
        stream.handle_completion(Completion::success(transport.start_tag()));
        stream.handle_command(Command::Write(3));
        stream.handle_command(Command::Stop);
        assert_eq!(transport.writes(), vec![3]);
        assert_eq!(stream.state(), StreamState::Finishing);
    }
}
