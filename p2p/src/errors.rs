use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::IdentityError;

/// Fatal errors raised while building or starting a [`crate::Host`].
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Could not bind the listen address {addr}. {source}")]
    Bind { addr: String, source: std::io::Error },
    #[error("The listen address {0} is not a dialable ip/tcp address.")]
    UnsupportedAddress(String),
    #[error("Invalid host configuration. {0}")]
    InvalidConfig(String),
    #[error("Could not register a dispatch surface. {0}")]
    Registration(#[from] DispatchRegistrationError),
    #[error("The host is already accepting connections.")]
    AlreadyAccepting,
    #[error("Identity error. {0}")]
    Identity(#[from] IdentityError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchRegistrationError {
    #[error("Service names cannot be empty.")]
    EmptyName,
    #[error("A service called '{0}' is already registered.")]
    Duplicate(String),
}

/// The outcome of a failed connection attempt.
///
/// This is `Clone` so that a single in-flight connect in the [`crate::ClientPool`] can hand the same result to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Dial all maddr fail. No endpoint of {peer} was reachable ({attempts} attempts).")]
    DialAllFailed { peer: PeerId, attempts: usize },
    #[error("The connection attempt was cancelled.")]
    Cancelled,
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),
    #[error("Could not identify the remote peer. {0}")]
    Handshake(String),
    #[error("Dialled {expected}, but the remote identified itself as {actual}.")]
    PeerMismatch { expected: PeerId, actual: PeerId },
}

/// Errors from a single remote call over an established connection.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("I/O error on the connection. {0}")]
    Io(#[from] std::io::Error),
    #[error("The call was cancelled.")]
    Cancelled,
    #[error("The connection is closed.")]
    ConnectionClosed,
    #[error("Could not de/encode an rpc frame. {0}")]
    Codec(#[from] serde_json::Error),
    #[error("The remote peer returned an error. {0}")]
    Remote(#[from] RemoteServerError),
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("No client ID is: {0}")]
    NoClient(PeerId),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Call(#[from] CallError),
}

impl SendError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SendError::Call(CallError::Cancelled) | SendError::Connect(ConnectError::Cancelled))
    }
}

/// An error code from the peer server, akin to an HTTP error code. These travel over the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteServerError {
    #[error("No handler is registered for message id {0}.")]
    NoHandler(i32),
    #[error("The remote peer does not offer a service called '{0}'.")]
    UnknownService(String),
    #[error("Service '{service}' has no method called '{method}'.")]
    UnknownMethod { service: String, method: String },
    #[error("Malformed request. {0}")]
    BadRequest(String),
    #[error("The message handler failed. {0}")]
    Handler(String),
}

impl RemoteServerError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        RemoteServerError::BadRequest(msg.into())
    }
}

/// A score could not be computed for a counter vector. This is never folded into a zero score.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScoringFault {
    #[error("The weighted sum overflowed.")]
    Overflow,
    #[error("The score policy panicked: {0}")]
    Panicked(String),
}
