//! Error types for mywire operations.

use std::fmt;
use std::time::Duration;

/// The primary error type for all mywire operations.
#[derive(Debug)]
pub enum Error {
    /// Operation attempted on a connection that is not connected, or the
    /// connection could not be established
    Connection(ConnectionError),
    /// The peer closed the socket, or a socket read/write failed
    Read(ReadError),
    /// No response arrived within the configured timeout
    ResponseTimeout(ResponseTimeoutError),
    /// Malformed or truncated packet
    Decode(DecodeError),
    /// ERR packet sent by the server
    Server(ServerError),
    /// Type conversion errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Connection has not finished connecting, or is shutting down
    NotConnected,
    /// Connection has been closed
    Closed,
    /// `connect()` called on an established connection
    AlreadyConnected,
    /// Failed to establish the TCP connection
    Connect,
    /// Connection refused
    Refused,
    /// Server requested an authentication plugin we do not speak
    UnsupportedAuth,
}

#[derive(Debug)]
pub struct ReadError {
    pub message: String,
    pub source: Option<std::io::Error>,
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseTimeoutError {
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct DecodeError {
    pub message: String,
    /// Payload of the packet that failed to decode, when known
    pub raw_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// MySQL error code (e.g. 1045 = ER_ACCESS_DENIED_ERROR)
    pub code: u16,
    /// Five character SQL state, when the server sent one
    pub sql_state: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a connection error of the given kind.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a decode error without the offending bytes.
    pub fn decode(message: impl Into<String>) -> Self {
        Error::Decode(DecodeError {
            message: message.into(),
            raw_data: None,
        })
    }

    /// Attach the offending packet payload to a decode error. Other
    /// errors are returned unchanged.
    #[must_use]
    pub fn with_raw_data(self, payload: &[u8]) -> Self {
        match self {
            Error::Decode(DecodeError { message, .. }) => Error::Decode(DecodeError {
                message,
                raw_data: Some(payload.to_vec()),
            }),
            other => other,
        }
    }

    /// Did the connection become unusable (or was it never usable)?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Read(_) | Error::ResponseTimeout(_)
        )
    }

    /// Did the operation fail because the server was too slow to answer?
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ResponseTimeout(_))
    }

    /// Get the server error code, if this error came from an ERR packet.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.code),
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for duplicate key)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(e) => e.sql_state.as_deref(),
            _ => None,
        }
    }

    /// Get the connection error kind, if any.
    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Error::Connection(c) => Some(c.kind),
            _ => None,
        }
    }
}

impl ServerError {
    /// Is this a unique constraint violation?
    pub fn is_duplicate_key(&self) -> bool {
        // ER_DUP_ENTRY
        self.code == 1062
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.code == 1451 || self.code == 1452
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Read(e) => write!(f, "Read error: {}", e.message),
            Error::ResponseTimeout(e) => write!(f, "{}", e),
            Error::Decode(e) => write!(f, "Decode error: {}", e.message),
            Error::Server(e) => write!(f, "Server error: {}", e),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Read(e) => e
                .source
                .as_ref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ResponseTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response timeout: no response from server within {}ms",
            self.timeout.as_millis()
        )
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(state) = &self.sql_state {
            write!(f, "{} (code {}, SQLSTATE {})", self.message, self.code, state)
        } else {
            write!(f, "{} (code {})", self.message, self.code)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}

/// Result type alias for mywire operations.
pub type Result<T> = std::result::Result<T, Error>;
