//! Scripted transport and recording observer for unit tests
use std::sync::{Arc, Mutex};

use crate::{completion::Tag, observer::StreamObserver, status::Status, transport::Transport};

/// A request the stream made of the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    Start(Tag),
    Read(Tag),
    Write(u64, Option<Tag>),
    Cancel,
}

impl Request {
    pub fn tag(&self) -> Option<Tag> {
        match self {
            Request::Start(tag) | Request::Read(tag) => Some(*tag),
            Request::Write(_, tag) => *tag,
            Request::Cancel => None,
        }
    }
}

/// Transport that only records what it was asked to do.
///
/// Tests complete the recorded requests by hand, in whatever order they need.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedTransport {
    log: Arc<Mutex<Vec<Request>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    fn last(&self, f: impl Fn(&Request) -> bool) -> Tag {
        self.requests()
            .iter()
            .rev()
            .find(|r| f(r))
            .and_then(Request::tag)
            .expect("no matching tagged request")
    }

    pub fn start_tag(&self) -> Tag {
        self.last(|r| matches!(r, Request::Start(_)))
    }

    pub fn read_tag(&self) -> Tag {
        self.last(|r| matches!(r, Request::Read(_)))
    }

    pub fn write_tag(&self) -> Tag {
        self.last(|r| matches!(r, Request::Write(_, Some(_))))
    }

    pub fn writes(&self) -> Vec<u64> {
        self.requests()
            .iter()
            .filter_map(|r| match r {
                Request::Write(n, _) => Some(*n),
                _ => None,
            })
            .collect()
    }

    pub fn cancelled(&self) -> bool {
        self.requests().contains(&Request::Cancel)
    }

    fn push(&self, request: Request) {
        self.log.lock().unwrap().push(request);
    }
}

impl Transport for ScriptedTransport {
    type In = u64;
    type Out = u64;

    fn start(&mut self, tag: Tag) {
        self.push(Request::Start(tag));
    }

    fn read(&mut self, tag: Tag) {
        self.push(Request::Read(tag));
    }

    fn write(&mut self, message: u64, tag: Option<Tag>) {
        self.push(Request::Write(message, tag));
    }

    fn cancel(&mut self) {
        self.push(Request::Cancel);
    }
}

/// Something an observer was told
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Seen {
    Open,
    Message(u64),
    Error(Status),
}

/// Observer that records every callback
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<Status> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Error(status) => Some(status),
                _ => None,
            })
            .collect()
    }
}

impl StreamObserver<u64> for Recorder {
    fn on_open(&self) {
        self.seen.lock().unwrap().push(Seen::Open);
    }

    fn on_message(&self, message: u64) {
        self.seen.lock().unwrap().push(Seen::Message(message));
    }

    fn on_error(&self, status: Status) {
        self.seen.lock().unwrap().push(Seen::Error(status));
    }
}
