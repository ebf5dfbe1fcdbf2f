use std::{io, sync::Arc};

use thiserror::Error;

#[derive(Error, Clone, Debug)]
pub enum TransportError {
    #[error("IO Error: {0:?}")]
    Io(Arc<io::Error>),
    #[error("Timeout")]
    Timeout,
    #[error("Other Error: {0}")]
    Other(Arc<anyhow::Error>),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::Io(err) => {
                err.kind() == io::ErrorKind::TimedOut || err.kind() == io::ErrorKind::WouldBlock
            }
            TransportError::Other(_) => false,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(x: anyhow::Error) -> Self {
        TransportError::Other(Arc::new(x))
    }
}

#[derive(Error, Clone, Debug)]
pub enum ProtocolError {
    #[error("Invalid IEEE block header: {0}")]
    InvalidBlockHeader(String),
    #[error("IEEE block truncated: expected {expected} bytes, received {received}")]
    TruncatedBlock { expected: usize, received: usize },
    #[error("Unexpected Response: {0}")]
    UnexpectedResponse(String),
    #[error("Other Error: {0}")]
    Other(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for ProtocolError {
    fn from(x: anyhow::Error) -> Self {
        ProtocolError::Other(Arc::new(x))
    }
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Transport Error {0}")]
    Transport(TransportError),
    #[error("Protocol Error {0}")]
    Protocol(ProtocolError),
    #[error("Configuration Error {0}")]
    Configuration(Arc<anyhow::Error>),
    #[error("Session is not initialized")]
    NotInitialized,
    #[error("Session is already initialized")]
    AlreadyInitialized,
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("Simulation cannot be disabled once enabled")]
    SimulationState,
    #[error("Value {value} of `{name}` is out of range [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Selector index {index} out of range (0..{count})")]
    SelectorRange { index: usize, count: usize },
    #[error("Unknown selector name `{0}`")]
    SelectorName(String),
    #[error("Instrument reported error {code}: {message}")]
    InstrumentStatus { code: i32, message: String },
}

impl Error {
    pub fn transport<T: Into<TransportError>>(err: T) -> Self {
        Self::Transport(err.into())
    }

    pub fn protocol<T: Into<ProtocolError>>(err: T) -> Self {
        Self::Protocol(err.into())
    }

    pub fn configuration<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::Configuration(Arc::new(err.into()))
    }

    pub fn timeout() -> Self {
        Error::Transport(TransportError::Timeout)
    }

    pub fn invalid_block<T: Into<String>>(msg: T) -> Self {
        Error::Protocol(ProtocolError::InvalidBlockHeader(msg.into()))
    }

    pub fn unexpected_response<T: Into<String>>(reply: T) -> Self {
        Error::Protocol(ProtocolError::UnexpectedResponse(reply.into()))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Transport(x) if x.is_timeout())
    }

    /// Returns true for errors a caller may reasonably recover from by reconnecting.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Transport(TransportError::Io(err)) => {
                err.kind() == io::ErrorKind::ConnectionReset
                    || err.kind() == io::ErrorKind::ConnectionAborted
                    || err.kind() == io::ErrorKind::BrokenPipe
                    || err.kind() == io::ErrorKind::UnexpectedEof
            }
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(x: io::Error) -> Self {
        if x.kind() == io::ErrorKind::TimedOut {
            return Error::Transport(TransportError::Timeout);
        }
        Error::Transport(TransportError::Io(Arc::new(x)))
    }
}
