//! Error types surfaced by the engine.
//!
//! One enum per failure domain, following the split between wire-level
//! decode failures (`CodecError`) and everything a caller of the Initiator
//! or Responder APIs can observe (`CiError`). Codec errors never panic or
//! throw past `parse` — they come back as `None`/`Result` and it's up to
//! the caller what to do with them.

use thiserror::Error;

/// Failures while encoding or decoding CI SysEx frames.
///
/// Bad framing, truncation, and unrecognized message types are cheap to hit
/// on a shared transport stream (a frame meant for a different protocol, a
/// partial read) and are not actionable beyond "not a CI message for us" —
/// `parse`/`parse_message` report those as a bare `None` rather than a typed
/// variant here. `CodecError` is reserved for failures in the header-JSON
/// decode step, which is the only place in the codec that can fail with
/// something worth describing to a caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid UTF-8 in header JSON: {0}")]
    InvalidUtf8(String),

    #[error("invalid header JSON: {0}")]
    InvalidHeaderJson(String),
}

/// Error kinds surfaced to callers of `PEManager`/`PEResponder`.
#[derive(Debug, Error, Clone)]
pub enum CiError {
    #[error("device not found: MUID {0:#010x}")]
    DeviceNotFound(u32),

    #[error("request timed out")]
    Timeout,

    #[error("too many in-flight requests to this device")]
    TooManyInFlight,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error("responder returned status {code}: {message}")]
    PeStatus { code: u16, message: String },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource is read-only: {0}")]
    ReadOnly(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("resource does not support subscription: {0}")]
    SubscriptionNotSupported(String),

    #[error("payload validation failed: {0}")]
    PayloadValidationFailed(String),

    #[error("pipeline condition not met")]
    PipelineConditionNotMet,

    #[error("pipeline transform failed: {0}")]
    PipelineTransformFailed(String),
}

impl From<CodecError> for CiError {
    fn from(e: CodecError) -> Self {
        CiError::MalformedReply(e.to_string())
    }
}

pub type CiResult<T> = Result<T, CiError>;
