//! The socket a [`crate::Shuttle`] drives.
//!
//! A [`Transport`] does the handshake, framing and close negotiation. It never blocks: every
//! call returns immediately and outcomes are reported later through the [`TransportEvents`]
//! handed to [`Transport::open`].

use crate::config::Endpoint;
use crate::socket::{CloseCode, CloseEvent, CloseFrame, Message};
use crate::Error;
use tokio::sync::mpsc;

/// Rough cause of a transport failure, used to pick an [`crate::ErrorReason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The server refused the connection or rejected the handshake.
    Refused,
    /// The connection went away without a closing handshake.
    Dropped,
    Other,
}

#[derive(Debug)]
pub enum TransportEvent {
    Open,
    Message(Message),
    Failure { kind: FailureKind, error: Error },
    Close(CloseEvent),
}

/// Reporting side of one connect attempt.
///
/// Events are tagged with the attempt they belong to, so a session can tell late callbacks of
/// an aborted attempt apart from the current one.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    attempt: u64,
    sender: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub(crate) fn new(attempt: u64, sender: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { attempt, sender }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    pub fn message(&self, message: Message) {
        self.emit(TransportEvent::Message(message));
    }

    pub fn failure(&self, kind: FailureKind, error: impl Into<Error>) {
        self.emit(TransportEvent::Failure {
            kind,
            error: error.into(),
        });
    }

    pub fn close(&self, code: CloseCode, reason: impl Into<String>, was_clean: bool) {
        self.emit(TransportEvent::Close(CloseEvent {
            code,
            reason: reason.into(),
            was_clean,
        }));
    }

    /// Whether the session listening to these events still exists.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn emit(&self, event: TransportEvent) {
        if self.sender.send((self.attempt, event)).is_err() {
            tracing::trace!(attempt = self.attempt, "session is gone, dropping transport event");
        }
    }
}

pub trait Transport: Send + 'static {
    /// Starts connecting. Must later report exactly one of `open` or `failure` through
    /// `events`, unless [`Transport::close`] is called first.
    fn open(&mut self, endpoint: Endpoint, events: TransportEvents);

    /// Queues a message on the open connection.
    fn send(&mut self, message: Message);

    /// Closes the connection, or abandons the attempt in progress. Reports `close` once the
    /// closing handshake is done.
    fn close(&mut self, frame: Option<CloseFrame>);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, endpoint: Endpoint, events: TransportEvents) {
        (**self).open(endpoint, events)
    }

    fn send(&mut self, message: Message) {
        (**self).send(message)
    }

    fn close(&mut self, frame: Option<CloseFrame>) {
        (**self).close(frame)
    }
}
