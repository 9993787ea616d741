use crate::transport::FailureKind;
use crate::Error;
use std::error::Error as StdError;
use std::fmt;

/// Why a session lost or failed to establish its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    /// No usable network.
    Offline,
    /// The server refused the connection or dropped an established one.
    ServerDown,
    /// The connect attempt did not complete within the session timeout.
    Timeout,
    /// Any other transport failure.
    Generic,
}

impl ErrorReason {
    /// Classifies a transport failure. `established` tells whether the connection had been
    /// opened before it failed.
    pub fn classify(kind: FailureKind, reachable: bool, established: bool) -> Self {
        if !reachable {
            return Self::Offline;
        }
        match kind {
            FailureKind::Refused => Self::ServerDown,
            FailureKind::Dropped if established => Self::ServerDown,
            FailureKind::Dropped | FailureKind::Other => Self::Generic,
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Offline => "network is offline",
            Self::ServerDown => "server is down",
            Self::Timeout => "connection timed out",
            Self::Generic => "connection failed",
        };
        f.write_str(text)
    }
}

/// Error reported to [`crate::ShuttleExt::on_failure`].
#[derive(Debug)]
pub struct ConnectionError {
    pub reason: ErrorReason,
    /// Underlying transport error, if there was one.
    pub detail: Option<Error>,
}

impl ConnectionError {
    pub fn new(reason: ErrorReason) -> Self {
        Self {
            reason,
            detail: None,
        }
    }

    pub fn with_detail(reason: ErrorReason, detail: Error) -> Self {
        Self {
            reason,
            detail: Some(detail),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

impl StdError for ConnectionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.detail
            .as_ref()
            .map(|detail| &**detail as &(dyn StdError + 'static))
    }
}

/// Returned by [`crate::Shuttle::send`] when the message could not be handed to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The session is not in the `Connected` state.
    NotConnected,
    /// The session task has stopped.
    Closed,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => f.write_str("socket is not connected"),
            Self::Closed => f.write_str("socket session has stopped"),
        }
    }
}

impl StdError for SendError {}
