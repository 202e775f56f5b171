use crate::channel_status::ChannelState;
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use std::{error, fmt, io, sync::Arc};

/// A std Result with a terrier::Error error type
pub type Result<T> = std::result::Result<T, Error>;

/// The type of error that can be returned in this crate.
///
/// Even though we expose the complete enumeration of possible error variants, it is not
/// considered stable to exhaustively match on this enumeration: do it at your own risk.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    AlreadyConnected,
    InvalidAck,
    NotConnected,

    InvalidChannel(u16),
    InvalidChannelState(ChannelState),
    InvalidPayload(String),
    InvalidResponse(String),
    NotFound(String),
    PreconditionFailed(String),

    IOError(Arc<io::Error>),
    ManagementError(Arc<reqwest::Error>),
    TransportError(lapin::Error),
}

impl Error {
    /// Whether the topology resolver may recover from this error by
    /// reopening the channel and declaring the entity.
    pub fn is_topology_conflict(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::InvalidChannelState(_))
    }

    /// The broker refused a declaration because an entity with the same name
    /// but different parameters already exists.
    pub fn is_declaration_conflict(&self) -> bool {
        matches!(self, Error::PreconditionFailed(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyConnected => write!(f, "client is already connected"),
            Error::InvalidAck => write!(f, "delivery has already been acknowledged"),
            Error::NotConnected => write!(f, "not connected"),

            Error::InvalidChannel(channel) => write!(f, "invalid channel: {}", channel),
            Error::InvalidChannelState(state) => write!(f, "invalid channel state: {:?}", state),
            Error::InvalidPayload(e) => write!(f, "invalid payload: {}", e),
            Error::InvalidResponse(e) => write!(f, "invalid management API response: {}", e),
            Error::NotFound(e) => write!(f, "not found: {}", e),
            Error::PreconditionFailed(e) => write!(f, "precondition failed: {}", e),

            Error::IOError(e) => write!(f, "IO error: {}", e),
            Error::ManagementError(e) => write!(f, "management API error: {}", e),
            Error::TransportError(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IOError(e) => Some(&**e),
            Error::ManagementError(e) => Some(&**e),
            Error::TransportError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(other: io::Error) -> Self {
        Error::IOError(Arc::new(other))
    }
}

impl From<reqwest::Error> for Error {
    fn from(other: reqwest::Error) -> Self {
        Error::ManagementError(Arc::new(other))
    }
}

impl From<lapin::Error> for Error {
    fn from(other: lapin::Error) -> Self {
        match &other {
            lapin::Error::ProtocolError(e) => {
                let message = e.get_message().as_str().to_string();
                match e.kind() {
                    AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => Error::NotFound(message),
                    AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                        Error::PreconditionFailed(message)
                    }
                    _ => Error::TransportError(other),
                }
            }
            lapin::Error::InvalidChannelState(_) => {
                Error::InvalidChannelState(ChannelState::Closed)
            }
            _ => Error::TransportError(other),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use tracing::error;
        use Error::*;

        match (self, other) {
            (AlreadyConnected, AlreadyConnected) => true,
            (InvalidAck, InvalidAck) => true,
            (NotConnected, NotConnected) => true,

            (InvalidChannel(left_inner), InvalidChannel(right_inner)) => left_inner == right_inner,
            (InvalidChannelState(left_inner), InvalidChannelState(right_inner)) => {
                left_inner == right_inner
            }
            (InvalidPayload(left_inner), InvalidPayload(right_inner)) => left_inner == right_inner,
            (InvalidResponse(left_inner), InvalidResponse(right_inner)) => {
                left_inner == right_inner
            }
            (NotFound(left_inner), NotFound(right_inner)) => left_inner == right_inner,
            (PreconditionFailed(left_inner), PreconditionFailed(right_inner)) => {
                left_inner == right_inner
            }

            (IOError(_), IOError(_)) => {
                error!("Unable to compare terrier::Error::IOError");
                false
            }
            (ManagementError(_), ManagementError(_)) => {
                error!("Unable to compare terrier::Error::ManagementError");
                false
            }
            (TransportError(left_inner), TransportError(right_inner)) => left_inner == right_inner,

            _ => false,
        }
    }
}
