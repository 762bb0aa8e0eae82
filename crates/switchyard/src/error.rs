//! Error types for the call execution core.
//!
//! Two families of failure exist and they never mix:
//!
//! - [`Status`]: the terminal outcome of a failed call. Every call ends with
//!   exactly one status (or success), carrying one [`Code`] out of a small
//!   closed set. Control flow only ever branches on the code, never on the
//!   message.
//! - [`Error`]: setup-time and lifecycle failures that are not call outcomes,
//!   such as registering the same method twice.
//!
//! Both convert into `tonic::Status` so a transport can forward them without
//! knowing about this crate's internals.

use crate::metadata::Metadata;
use core::{fmt, str::FromStr};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Trailing metadata key carrying a description of frames that were attempted
/// after the call had already reached a terminal status.
pub const VIOLATION_KEY: &str = "x-protocol-violation";

/// Closed set of status codes a caller can observe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Code {
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    Unimplemented,
    ProtocolViolation,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

impl Code {
    pub const ALL: [Self; 10] = [
        Self::InvalidArgument,
        Self::Unauthenticated,
        Self::PermissionDenied,
        Self::NotFound,
        Self::AlreadyExists,
        Self::Unimplemented,
        Self::ProtocolViolation,
        Self::Cancelled,
        Self::DeadlineExceeded,
        Self::Internal,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Unimplemented => "unimplemented",
            Self::ProtocolViolation => "protocol_violation",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Internal => "internal",
        }
    }

    /// Whether the code describes a call that was stopped rather than one
    /// that failed on its own.
    #[must_use]
    pub const fn is_cancellation(self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Whether the failure is attributable to the caller (bad input, missing
    /// credentials, wrong pattern) rather than to the server.
    #[must_use]
    pub const fn is_client_error(self) -> bool {
        !matches!(self, Self::Internal | Self::Unimplemented)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing a string that names no [`Code`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Unknown status code `{0}`")]
pub struct UnknownCode(pub String);

impl FromStr for Code {
    type Err = UnknownCode;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| UnknownCode(s.to_string()))
    }
}

/// Terminal error status of a call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: String,
    metadata: Metadata,
}

macro_rules! status_ctor {
    ($($name:ident => $code:ident),* $(,)?) => {
        $(
            #[doc = concat!("Creates a status with code [`Code::", stringify!($code), "`].")]
            pub fn $name(message: impl Into<String>) -> Self {
                Self::new(Code::$code, message)
            }
        )*
    };
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: Metadata::new(),
        }
    }

    status_ctor! {
        invalid_argument => InvalidArgument,
        unauthenticated => Unauthenticated,
        permission_denied => PermissionDenied,
        not_found => NotFound,
        already_exists => AlreadyExists,
        unimplemented => Unimplemented,
        protocol_violation => ProtocolViolation,
        cancelled => Cancelled,
        deadline_exceeded => DeadlineExceeded,
        internal => Internal,
    }

    #[must_use]
    pub const fn code(&self) -> Code {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Trailing metadata attached to the status.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub const fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

/// Setup-time and lifecycle errors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A handler is already registered under this method identifier.
    #[error("Method `{method}` is already registered")]
    DuplicateRegistration { method: String },

    /// The method identifier cannot be routed.
    #[error("Invalid method identifier `{method}`: {reason}")]
    InvalidMethod { method: String, reason: String },

    /// The dispatcher has already been shut down.
    #[error("Dispatcher is shutting down")]
    Shutdown,

    /// A configuration value is out of range.
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl From<Code> for tonic::Code {
    fn from(code: Code) -> Self {
        match code {
            Code::InvalidArgument => Self::InvalidArgument,
            Code::Unauthenticated => Self::Unauthenticated,
            Code::PermissionDenied => Self::PermissionDenied,
            Code::NotFound => Self::NotFound,
            Code::AlreadyExists => Self::AlreadyExists,
            Code::Unimplemented => Self::Unimplemented,
            Code::ProtocolViolation => Self::FailedPrecondition,
            Code::Cancelled => Self::Cancelled,
            Code::DeadlineExceeded => Self::DeadlineExceeded,
            Code::Internal => Self::Internal,
        }
    }
}

impl From<tonic::Code> for Code {
    fn from(code: tonic::Code) -> Self {
        match code {
            tonic::Code::InvalidArgument => Self::InvalidArgument,
            tonic::Code::Unauthenticated => Self::Unauthenticated,
            tonic::Code::PermissionDenied => Self::PermissionDenied,
            tonic::Code::NotFound => Self::NotFound,
            tonic::Code::AlreadyExists => Self::AlreadyExists,
            tonic::Code::Unimplemented => Self::Unimplemented,
            tonic::Code::FailedPrecondition => Self::ProtocolViolation,
            tonic::Code::Cancelled => Self::Cancelled,
            tonic::Code::DeadlineExceeded => Self::DeadlineExceeded,
            _ => Self::Internal,
        }
    }
}

impl From<Status> for tonic::Status {
    fn from(status: Status) -> Self {
        Self::with_metadata(
            status.code.into(),
            status.message,
            status.metadata.to_tonic(),
        )
    }
}

impl From<tonic::Status> for Status {
    fn from(status: tonic::Status) -> Self {
        Self {
            code: status.code().into(),
            message: status.message().to_string(),
            metadata: Metadata::from_tonic(status.metadata()),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::DuplicateRegistration { .. } | Error::Config { .. } => {
                Self::internal(err.to_string())
            }
            Error::InvalidMethod { .. } => Self::invalid_argument(err.to_string()),
            Error::Shutdown => Self::cancelled(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Status {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_argument(format!("Malformed payload: {err}"))
    }
}
