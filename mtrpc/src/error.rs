use serde::{Deserialize, Serialize};

/// Status code carried by every failed call and every fallible operation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or missing certificate material.
    Credential,
    /// TLS negotiation or peer verification failed.
    Handshake,
    /// Socket-level I/O failure.
    Transport,
    /// The call-shape contract was violated.
    Protocol,
    /// Operation attempted on a completed or failed call.
    CallClosed,
    /// Handler panicked or failed abruptly.
    Internal,
    Cancelled,
    NotFound,
    DuplicateMethod,
    /// The connection is closing and refuses new calls.
    Unavailable,
    Timeout,
    InvalidArgument,
    SerializeFailed,
    DeserializeFailed,
    /// The listening address could not be bound.
    Bind,
    #[serde(untagged)]
    Unknown(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
        }
    }

    #[must_use]
    pub fn is(&self, kind: &ErrorKind) -> bool {
        self.kind == *kind
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(value: std::num::TryFromIntError) -> Self {
        Self::new(ErrorKind::InvalidArgument, value.to_string())
    }
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(value: std::array::TryFromSliceError) -> Self {
        Self::new(ErrorKind::InvalidArgument, value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::new(ErrorKind::Transport, value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        if value.is_io() {
            Self::new(ErrorKind::SerializeFailed, value.to_string())
        } else {
            Self::new(ErrorKind::DeserializeFailed, value.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(value: rmp_serde::encode::Error) -> Self {
        Self::new(ErrorKind::SerializeFailed, value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(value: rmp_serde::decode::Error) -> Self {
        Self::new(ErrorKind::DeserializeFailed, value.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(value: rustls::Error) -> Self {
        Self::new(ErrorKind::Credential, value.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let error: Error = ErrorKind::Cancelled.into();
        assert_eq!(error.to_string(), "Cancelled");

        let error = Error::new(ErrorKind::Handshake, "unknown issuer");
        assert_eq!(error.to_string(), "Handshake: unknown issuer");

        let error: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(error.kind, ErrorKind::DeserializeFailed);
    }

    #[test]
    fn test_error_wire_format() {
        let err = Error::new(ErrorKind::Internal, "panic: boom");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "kind": "Internal", "msg": "panic: boom" })
        );

        let json = serde_json::json!({ "kind": "ResourceExhausted", "msg": "later kind" });
        let err = serde_json::from_value::<Error>(json).unwrap();
        assert_eq!(err.kind, ErrorKind::Unknown("ResourceExhausted".into()));
    }
}
