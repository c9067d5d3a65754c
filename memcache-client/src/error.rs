//! Client errors and the classic result-code set.

use std::fmt;
use std::io;

use hashring::RouteError;
use protocol_memcache::ParseError;
use protocol_memcache::binary::Status;

/// Result alias used throughout the client.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the memcache client.
///
/// `Error` is `Clone` so a single node failure can be reported against
/// every key of a batch routed to that node.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Unsupported or unavailable codec, hasher or auth mechanism.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connect refused, unreachable or otherwise failed.
    #[error("connection failure: {0}")]
    Connection(String),

    /// A connect, read or write hit its timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Malformed frame, unexpected token or a server error line.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("write failure: {0}")]
    WriteFailure(String),

    #[error("read failure: {0}")]
    ReadFailure(String),

    #[error("not found")]
    NotFound,

    #[error("not stored")]
    NotStored,

    /// The key already exists (add) or the CAS token is stale.
    #[error("data exists")]
    Exists,

    #[error("no servers defined")]
    NoServers,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid-argument failure for a key rejected before any I/O.
    #[error("bad key provided: {0}")]
    BadKey(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Serialization, compression or type coercion failed.
    #[error("payload failure: {0}")]
    Payload(String),

    /// Binary status outside the canonical set.
    #[error("server error ({}): {message}", .status.as_str())]
    Server { status: Status, message: String },
}

impl Error {
    /// The result code this error reports through `ShardedClient::result_code`.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::Configuration(_) => ResultCode::Failure,
            Error::Connection(_) => ResultCode::ConnectionFailure,
            Error::Timeout(_) => ResultCode::Timeout,
            Error::Protocol(_) => ResultCode::ProtocolError,
            Error::WriteFailure(_) => ResultCode::WriteFailure,
            Error::ReadFailure(_) => ResultCode::ReadFailure,
            Error::NotFound => ResultCode::NotFound,
            Error::NotStored => ResultCode::NotStored,
            Error::Exists => ResultCode::DataExists,
            Error::NoServers => ResultCode::NoServers,
            Error::InvalidArgument(_) => ResultCode::ClientError,
            Error::BadKey(_) => ResultCode::BadKeyProvided,
            Error::AuthenticationFailed(_) => ResultCode::AuthFailure,
            Error::Payload(_) => ResultCode::PayloadFailure,
            Error::Server { .. } => ResultCode::ServerError,
        }
    }

    /// Transport-level failures leave the connection in an unknown state.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::Timeout(_)
                | Error::Protocol(_)
                | Error::WriteFailure(_)
                | Error::ReadFailure(_)
        )
    }

    pub(crate) fn read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::Timeout(format!("read: {err}"))
            }
            _ => Error::ReadFailure(err.to_string()),
        }
    }

    pub(crate) fn write(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::Timeout(format!("write: {err}"))
            }
            _ => Error::WriteFailure(err.to_string()),
        }
    }

    /// Map a non-success binary status.
    pub(crate) fn from_status(status: Status, message: String) -> Self {
        match status {
            Status::KeyNotFound => Error::NotFound,
            Status::KeyExists => Error::Exists,
            Status::ItemNotStored => Error::NotStored,
            Status::AuthError => Error::AuthenticationFailed(message),
            _ => Error::Server { status, message },
        }
    }
}

impl From<RouteError> for Error {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NoServers => Error::NoServers,
            RouteError::NotFound(_) => Error::NotFound,
            RouteError::InvalidArgument(msg) => Error::InvalidArgument(msg.to_string()),
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Protocol(err.to_string())
    }
}

/// Outcome of the most recent facade call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultCode {
    #[default]
    Success,
    Failure,
    WriteFailure,
    ReadFailure,
    ProtocolError,
    ClientError,
    ServerError,
    DataExists,
    NotStored,
    NotFound,
    SomeErrors,
    NoServers,
    End,
    Timeout,
    BadKeyProvided,
    ConnectionFailure,
    AuthFailure,
    PayloadFailure,
}

impl ResultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Success => "SUCCESS",
            ResultCode::Failure => "FAILURE",
            ResultCode::WriteFailure => "WRITE FAILURE",
            ResultCode::ReadFailure => "READ FAILURE",
            ResultCode::ProtocolError => "PROTOCOL ERROR",
            ResultCode::ClientError => "CLIENT ERROR",
            ResultCode::ServerError => "SERVER ERROR",
            ResultCode::DataExists => "DATA EXISTS",
            ResultCode::NotStored => "NOT STORED",
            ResultCode::NotFound => "NOT FOUND",
            ResultCode::SomeErrors => "SOME ERRORS",
            ResultCode::NoServers => "NO SERVERS DEFINED",
            ResultCode::End => "END",
            ResultCode::Timeout => "TIMEOUT",
            ResultCode::BadKeyProvided => "BAD KEY PROVIDED",
            ResultCode::ConnectionFailure => "CONNECTION FAILURE",
            ResultCode::AuthFailure => "AUTHENTICATION FAILURE",
            ResultCode::PayloadFailure => "PAYLOAD FAILURE",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NotFound.code(), ResultCode::NotFound);
        assert_eq!(Error::Exists.code(), ResultCode::DataExists);
        assert_eq!(Error::BadKey("a b".into()).code(), ResultCode::BadKeyProvided);
        assert_eq!(
            Error::Server {
                status: Status::OutOfMemory,
                message: String::new()
            }
            .code(),
            ResultCode::ServerError
        );
        assert_eq!(Error::Timeout("read".into()).code(), ResultCode::Timeout);
    }

    #[test]
    fn test_from_status() {
        assert_eq!(
            Error::from_status(Status::KeyNotFound, "Not found".into()),
            Error::NotFound
        );
        assert_eq!(Error::from_status(Status::KeyExists, String::new()), Error::Exists);
        assert_eq!(
            Error::from_status(Status::ItemNotStored, String::new()),
            Error::NotStored
        );
        assert!(matches!(
            Error::from_status(Status::AuthError, "bad".into()),
            Error::AuthenticationFailed(_)
        ));
        assert!(matches!(
            Error::from_status(Status::NonNumericValue, String::new()),
            Error::Server {
                status: Status::NonNumericValue,
                ..
            }
        ));
    }

    #[test]
    fn test_io_mapping() {
        let timeout = io::Error::new(io::ErrorKind::WouldBlock, "slow");
        assert!(matches!(Error::read(timeout), Error::Timeout(_)));
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(Error::write(reset), Error::WriteFailure(_)));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Error::from(RouteError::NoServers), Error::NoServers);
        assert_eq!(
            Error::from(RouteError::NotFound("h:1:1".into())),
            Error::NotFound
        );
        assert!(matches!(
            Error::from(ParseError::InvalidNumber),
            Error::Protocol(_)
        ));
        assert!(Error::Protocol("x".into()).is_fatal());
        assert!(!Error::NotFound.is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::NoServers.to_string(), "no servers defined");
        assert_eq!(
            Error::Server {
                status: Status::Busy,
                message: "try later".into()
            }
            .to_string(),
            "server error (Busy): try later"
        );
        assert_eq!(ResultCode::BadKeyProvided.to_string(), "BAD KEY PROVIDED");
    }
}
