//! gRPC status codes and the error-to-status mapping used by the transport.

use crate::error::ChaosError;
use std::fmt;

/// gRPC status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    const ALL: [Code; 17] = [
        Code::Ok,
        Code::Cancelled,
        Code::Unknown,
        Code::InvalidArgument,
        Code::DeadlineExceeded,
        Code::NotFound,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::ResourceExhausted,
        Code::FailedPrecondition,
        Code::Aborted,
        Code::OutOfRange,
        Code::Unimplemented,
        Code::Internal,
        Code::Unavailable,
        Code::DataLoss,
        Code::Unauthenticated,
    ];

    /// Parse a canonical code name such as `UNAVAILABLE` (case-insensitive).
    pub fn from_name(name: &str) -> Option<Code> {
        let upper = name.trim().to_ascii_uppercase();
        if upper == "CANCELED" {
            return Some(Code::Cancelled);
        }
        Self::ALL.iter().copied().find(|c| c.as_str() == upper)
    }

    /// Map a numeric `grpc-status` value back to a code.
    pub fn from_i32(value: i32) -> Code {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_i32() == value)
            .unwrap_or(Code::Unknown)
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status-carrying error: code plus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc error: code = {} desc = {}", self.code, self.message)
    }
}

impl From<&ChaosError> for Status {
    fn from(err: &ChaosError) -> Self {
        match err {
            ChaosError::Status(status) => status.clone(),
            ChaosError::NoMatchingRule => {
                Status::new(Code::NotFound, "no matching rule for this method")
            }
            ChaosError::RateLimitExceeded => {
                Status::new(Code::ResourceExhausted, err.to_string())
            }
            ChaosError::PacketLoss { .. } => Status::new(Code::Unavailable, err.to_string()),
            ChaosError::ScriptTimeout | ChaosError::DeadlineExceeded => {
                Status::new(Code::DeadlineExceeded, err.to_string())
            }
            ChaosError::Cancelled => Status::new(Code::Cancelled, err.to_string()),
            ChaosError::ScriptInjected(_) => Status::new(Code::Aborted, err.to_string()),
            _ => Status::new(Code::Internal, "internal chaos error"),
        }
    }
}
