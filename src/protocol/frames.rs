//! Request and reply frames

use crate::types::Message;
use crate::BrokerError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Enqueue a message onto its destination
    Send(Message),
    /// Ask whether a destination has a pending message
    Check(String),
    /// Dequeue the oldest message of a destination
    Receive(String),
}

impl Request {
    /// Operation tag, as it appears on the wire
    pub fn op(&self) -> &'static str {
        match self {
            Request::Send(_) => "SEND",
            Request::Check(_) => "CHECK",
            Request::Receive(_) => "RECEIVE",
        }
    }

    /// Destination the request targets
    pub fn destination(&self) -> &str {
        match self {
            Request::Send(message) => &message.destination,
            Request::Check(destination) | Request::Receive(destination) => destination,
        }
    }
}

/// A broker reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    /// The message of a SEND has been durably stored
    Ack,
    /// Answer to CHECK
    Available(bool),
    /// Message dequeued by RECEIVE
    Message(Message),
    /// RECEIVE found nothing to deliver
    Empty,
    /// The request failed; nothing was changed
    Error(ErrorReply),
}

impl Response {
    /// Reply tag, as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ack => "ACK",
            Response::Available(_) => "AVAILABLE",
            Response::Message(_) => "MESSAGE",
            Response::Empty => "EMPTY",
            Response::Error(_) => "ERROR",
        }
    }
}

/// Category of a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Queue files could not be opened, read, written or flushed
    StorageFailure,
    /// Destination name cannot be mapped onto a queue
    InvalidDestination,
    /// Queue was used outside its lifecycle (e.g. during shutdown)
    IllegalState,
    /// Anything else
    Internal,
}

/// Error carried back to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Error category
    pub kind: ErrorKind,
    /// Human readable detail
    pub message: String,
}

impl ErrorReply {
    /// Turn the reply back into the matching local error
    pub fn into_error(self) -> BrokerError {
        match self.kind {
            ErrorKind::StorageFailure => BrokerError::Storage(self.message),
            ErrorKind::InvalidDestination => BrokerError::InvalidDestination(self.message),
            ErrorKind::IllegalState => BrokerError::IllegalState(self.message),
            ErrorKind::Internal => BrokerError::Server(self.message),
        }
    }
}

impl From<&BrokerError> for ErrorReply {
    fn from(err: &BrokerError) -> Self {
        let (kind, message) = match err {
            BrokerError::Storage(m) => (ErrorKind::StorageFailure, m.clone()),
            BrokerError::Io(e) => (ErrorKind::StorageFailure, e.to_string()),
            BrokerError::InvalidDestination(m) => (ErrorKind::InvalidDestination, m.clone()),
            BrokerError::IllegalState(m) => (ErrorKind::IllegalState, m.clone()),
            other => (ErrorKind::Internal, other.to_string()),
        };
        Self { kind, message }
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
