use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),

    #[error(transparent)]
    AddrParse(#[from] std::net::AddrParseError),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    /// Malformed RESP framing on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid command")]
    UnknownCommand,

    /// Missing or invalid command arguments.
    #[error("{0}")]
    Argument(String),

    #[error("{0}")]
    StreamId(StreamIdError),

    #[error("replication failure: {0}")]
    Replication(ReplicationError),

    #[error("malformed RDB file: {0}")]
    RdbFormat(String),

    #[error("unsupported RDB encoding: {0}")]
    Unsupported(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamIdError {
    #[error("The ID specified in XADD must be greater than 0-0")]
    LessOrEqualToZero,

    #[error("The ID specified in XADD is equal or smaller than the target stream top item")]
    TooSmallForTop,
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("could not connect to primary at {0}")]
    Connection(String),

    #[error("primary answered {got:?} while expecting {expected}")]
    HandshakeMismatch { expected: String, got: String },

    #[error("primary closed the replication link")]
    PrimaryClosed,
}

impl Error {
    /// Domain errors become `-ERR <msg>` replies; everything else tears the
    /// connection down.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Error::UnknownCommand | Error::Argument(_) | Error::StreamId(_) | Error::Protocol(_)
        )
    }
}

impl From<StreamIdError> for Error {
    fn from(e: StreamIdError) -> Self {
        Error::StreamId(e)
    }
}

impl From<ReplicationError> for Error {
    fn from(e: ReplicationError) -> Self {
        Error::Replication(e)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
