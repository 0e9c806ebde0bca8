//! Crate-wide error taxonomy.
//!
//! Seven local error kinds plus two transport-adjacent wrappers (`Io`,
//! `Serialization`) every storage path needs. The wire-protocol layer
//! lives outside this crate, but it needs a stable mapping from our
//! errors to Kafka error codes, so we keep that mapping here rather
//! than inventing a second taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("offset {requested} out of range [{start}, {end})")]
    OffsetOutOfRange {
        requested: i64,
        start: i64,
        end: i64,
    },

    #[error("incompatible schema: {0}")]
    IncompatibleSchema(String),

    #[error("authorization denied: {principal} may not {operation} on {resource}")]
    AuthorizationDenied {
        principal: String,
        operation: String,
        resource: String,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout")]
    Timeout,

    #[error("transient io error: {0}")]
    TransientIo(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Maps this error onto the Kafka protocol error code the
    /// (out-of-scope) wire-codec layer would serialize. Returns -1
    /// (unknown server error) for kinds with no direct Kafka analogue.
    pub fn kafka_error_code(&self) -> i16 {
        match self {
            Error::OffsetOutOfRange { .. } => 1,
            Error::NotFound(msg) if msg.contains("group") => 15,
            Error::NotFound(msg) if msg.contains("member") => 25,
            Error::NotFound(_) => 3,
            Error::Conflict(msg) if msg.contains("generation") => 22,
            Error::Conflict(msg) if msg.contains("rebalance") => 27,
            Error::Conflict(_) => 36,
            Error::AuthorizationDenied { .. } => 29,
            Error::InvalidInput(_) => 42,
            Error::IncompatibleSchema(_) => 42,
            Error::Timeout => 7,
            Error::TransientIo(_) => -1,
            Error::Fatal(_) => -1,
            Error::Io(_) => -1,
            Error::Serialization(_) => -1,
        }
    }

    /// Whether a caller-level retry once makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientIo(_) | Error::Timeout)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}
