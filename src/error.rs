use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the driver.
///
/// Three broad categories exist: communications failures (the connection is
/// unusable, every in-flight and future operation on the session fails),
/// server errors (one request was rejected, siblings are unaffected) and
/// usage errors (caller-side contract violations caught before any I/O).
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Socket, connect-timeout or TLS failure. Not recoverable within the
    /// session.
    #[error("communications error: {0}")]
    Communications(String),

    /// The session was closed, either explicitly or because its connection
    /// died.
    #[error("session has been closed")]
    SessionClosed,

    /// The server rejected a specific request.
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    /// Caller-side contract violation, detected before any network round
    /// trip.
    #[error("usage error: {0}")]
    Usage(String),

    /// A frame could not be encoded or decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A message exceeded the maximum frame size.
    #[error("message exceeds maximum frame size")]
    MessageTooLarge,

    /// The result cursor is exhausted.
    #[error("no more rows in result")]
    NoMoreRows,
}

impl Error {
    /// True for failures that poison the whole session.
    pub fn is_communications(&self) -> bool {
        matches!(self, Error::Communications(_) | Error::SessionClosed)
    }

    /// True when the server rejected a single request.
    pub fn is_server(&self) -> bool {
        matches!(self, Error::Server { .. })
    }

    /// True for caller-side contract violations.
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::Usage(_))
    }

    /// The numeric server error code, when this is a server error.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Communications(e.to_string())
    }
}
