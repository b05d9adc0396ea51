use serde_derive::{Deserialize, Serialize};

/// A quorum error. All errors are serializable, since command results are
/// replicated in the Raft log and returned to clients across the network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The request was aborted and must be retried, typically because the
    /// leader or term changed while it was in flight.
    Abort,
    /// A cluster reconfiguration is already in progress. The caller must wait
    /// for it to commit and retry.
    ConfigConflict,
    /// An internal error. These are fatal to the local node: it can't assume
    /// its state is valid and must stop serving, recovering from durable
    /// storage on restart.
    Internal(String),
    /// Invalid, corrupt, or unexpected data.
    InvalidData(String),
    /// An invalid user request or operation argument. Deterministic, and
    /// returned to the client without halting replication.
    InvalidInput(String),
    /// A network failure or timeout. Retried by the client proxy with the
    /// same sequence number, so server-side deduplication makes the retry
    /// exactly-once.
    Network(String),
    /// The node is not the Raft leader. Carries a redirect hint with the
    /// current leader's ID, if known.
    NotLeader { leader: Option<u8> },
    /// The client session has expired or does not exist. The client must
    /// open a new session.
    SessionExpired,
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::ConfigConflict => write!(f, "a reconfiguration is already in progress"),
            Error::Internal(message) => write!(f, "internal error: {message}"),
            Error::InvalidData(message) => write!(f, "invalid data: {message}"),
            Error::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Error::Network(message) => write!(f, "network error: {message}"),
            Error::NotLeader { leader: Some(leader) } => {
                write!(f, "not the leader, try node {leader}")
            }
            Error::NotLeader { leader: None } => write!(f, "not the leader, and no leader known"),
            Error::SessionExpired => write!(f, "session expired"),
        }
    }
}

impl Error {
    /// Returns whether the error is deterministic under entry application. A
    /// deterministic error yields the same result on every node applying the
    /// same entry, and is safe to return to the client. Non-deterministic
    /// errors (e.g. IO errors) must halt the node to avoid state divergence.
    pub fn is_deterministic(&self) -> bool {
        match self {
            Error::ConfigConflict
            | Error::InvalidData(_)
            | Error::InvalidInput(_)
            | Error::SessionExpired => true,
            Error::Abort | Error::Internal(_) | Error::Network(_) | Error::NotLeader { .. } => {
                false
            }
        }
    }
}

/// A quorum Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl serde::ser::Error for Error {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Error::InvalidData(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Error::InvalidData(msg.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        // IO failures during encoding/decoding are network errors (the wire
        // uses Bincode framing); everything else is malformed data.
        match *err {
            bincode::ErrorKind::Io(err) => Error::Network(err.to_string()),
            err => Error::InvalidData(err.to_string()),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(err: std::num::TryFromIntError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(err: std::array::TryFromSliceError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::time::SystemTimeError> for Error {
    fn from(err: std::time::SystemTimeError) -> Self {
        Error::Internal(err.to_string())
    }
}
