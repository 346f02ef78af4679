//! Error taxonomy for the fault-injection engine.

use crate::injector::InjectorType;
use crate::status::Status;
use thiserror::Error;

/// Errors produced while compiling rules or processing a call.
///
/// Compilation errors (`InvalidConfig`, `InvalidPattern`, `UnknownInjectorType`)
/// are recovered by the engine. Everything an injector returns from `apply` is
/// the intended outcome of the call and reaches the transport unchanged.
#[derive(Debug, Error)]
pub enum ChaosError {
    #[error("config is not loaded")]
    ConfigNotLoaded,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid method pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unknown injector: {0}")]
    UnknownInjectorType(InjectorType),

    #[error("no matching rule found")]
    NoMatchingRule,

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("{0}")]
    Status(Status),

    #[error("network chaos: simulated packet loss ({percentage}%)")]
    PacketLoss { percentage: u32 },

    #[error("call cancelled")]
    Cancelled,

    #[error("call deadline exceeded")]
    DeadlineExceeded,

    #[error("only 'sh' or 'bash' scripts supported, got {0:?}")]
    UnsupportedLanguage(String),

    #[error("script timeout")]
    ScriptTimeout,

    #[error("script error: {status}, output: {output}")]
    ScriptFailed { status: String, output: String },

    #[error("chaos script error: {0}")]
    ScriptInjected(String),

    #[error("script io: {0}")]
    ScriptIo(#[from] std::io::Error),

    #[error("transport: {0}")]
    Transport(String),
}

impl ChaosError {
    /// Shorthand for an `InvalidConfig` error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        ChaosError::InvalidConfig(msg.into())
    }
}

impl From<Status> for ChaosError {
    fn from(status: Status) -> Self {
        ChaosError::Status(status)
    }
}
