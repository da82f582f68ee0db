use std::{fmt, io};

use super::{history::InvariantViolation, source::TransportError, topology::ConfigError};

#[derive(Debug)]
pub enum Error {
    Config(ConfigError),
    Transport(TransportError),
    Invariant(InvariantViolation),
    Io(io::Error),
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

impl From<InvariantViolation> for Error {
    fn from(error: InvariantViolation) -> Self {
        Self::Invariant(error)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "configuration error: {}", e),
            Error::Transport(e) => write!(f, "transport error: {}", e),
            Error::Invariant(e) => write!(f, "invariant violated: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(e) => Some(e),
            Error::Transport(e) => Some(e),
            Error::Invariant(e) => Some(e),
            Error::Io(e) => Some(e),
        }
    }
}
