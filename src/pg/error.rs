//! Error types for the PostgreSQL protocol implementation.
//!
//! Every failure is surfaced as a distinct variant. Nothing in this crate
//! retries or recovers: I/O and protocol failures leave the connection
//! unusable, and the caller decides whether to reconnect.

use std::fmt;
use std::io;

use thiserror::Error;

use super::types::Oid;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug, Error)]
pub enum PgError {
    /// Dial, authentication or startup handshake failure.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectError),

    /// The backend rejected a Parse message.
    #[error("Prepare of statement {name:?} failed: {source}")]
    Prepare {
        name: String,
        #[source]
        source: ServerError,
    },

    /// A query buffer could not be built. No I/O was performed.
    #[error("Cannot build query buffer: {0}")]
    Build(#[from] BuildError),

    /// Unexpected message sequence or malformed frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket read failure (EOF, reset, timeout).
    #[error("Read error: {0}")]
    Read(#[source] io::Error),

    /// Socket write failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Server returned an error outside of a prepare.
    #[error("{0}")]
    Server(ServerError),

    /// Invalid connection configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A statement with this name already exists on the connection.
    #[error("Statement {0:?} is already prepared on this connection")]
    DuplicateStatement(String),

    /// Connection is closed or was broken by an earlier failure.
    #[error("Connection is closed")]
    ConnectionClosed,
}

impl PgError {
    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Connection(_)
                | PgError::Protocol(_)
                | PgError::Read(_)
                | PgError::Io(_)
                | PgError::ConnectionClosed
        )
    }
}

/// Failure while establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot reach {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The backend answered the startup or password message with an ErrorResponse.
    #[error("rejected by server: {0}")]
    Rejected(ServerError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unexpected message '{0}' during startup")]
    UnexpectedMessage(char),

    #[error("I/O during startup: {0}")]
    Io(#[source] io::Error),

    #[error("malformed startup response: {0}")]
    Malformed(String),
}

/// Reasons a Bind+Execute+Sync buffer cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("statement {statement:?} expects {expected} parameters, got {actual}")]
    ParameterCount {
        statement: String,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported parameter type: parameter {index} is declared as oid {declared} but got {value}")]
    UnsupportedParameterType {
        index: usize,
        declared: Oid,
        value: &'static str,
    },

    #[error("{what} exceeds the protocol limit")]
    TooLarge { what: &'static str },
}

/// Fields of an ErrorResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}
