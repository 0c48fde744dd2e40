use std::time::Duration;

use duopack::CodecError;
use duopack::ErrorValue;

use crate::message::ConnectionId;
use crate::transport::TransportError;

#[derive(Debug, Clone)]
pub enum Error {
    Transport(TransportError),
    Codec(CodecError),
    /// The other side rejected the request.
    Remote(ErrorValue),
    /// A handler is already registered on this channel.
    DuplicateHandler(String),
    /// No such connection, or it has been torn down.
    UnknownConnection(ConnectionId),
    /// No reply arrived before the deadline.
    Timeout { channel: String, after: Duration },
    /// The connection closed while a reply was outstanding.
    ConnectionClosed,
    /// A frame could not be parsed or violated the protocol.
    Protocol(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
            Self::Remote(e) => write!(f, "Remote error: {}", e),
            Self::DuplicateHandler(channel) => {
                write!(f, "Attempted to register a second handler for '{}'", channel)
            }
            Self::UnknownConnection(id) => write!(f, "Unknown connection {}", id),
            Self::Timeout { channel, after } => {
                write!(f, "no response within {} ms on channel {}", after.as_millis(), channel)
            }
            Self::ConnectionClosed => write!(f, "Connection closed before a reply arrived"),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Codec(e) => Some(e),
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl Error {
    /// Converts this error into the value sent back in a `reject` reply.
    ///
    /// A remote error is forwarded unchanged so a rejection relayed through
    /// several hops keeps its original kind and cause chain.
    pub fn to_error_value(&self) -> ErrorValue {
        match self {
            Self::Remote(e) => e.clone(),
            other => ErrorValue::from_error(other),
        }
    }
}

/// Converts a handler failure into the value sent back in a `reject` reply.
///
/// An `ErrorValue` or router [`Error`] anywhere at the top of the chain is
/// kept as is; anything else becomes a generic error whose cause chain mirrors
/// the `source()` chain.
pub fn error_value_of(err: &anyhow::Error) -> ErrorValue {
    if let Some(value) = err.downcast_ref::<ErrorValue>() {
        return value.clone();
    }
    if let Some(error) = err.downcast_ref::<Error>() {
        return error.to_error_value();
    }
    let inner: &(dyn std::error::Error + 'static) = err.as_ref();
    ErrorValue::from_error(inner)
}

pub type Result<T> = std::result::Result<T, Error>;
