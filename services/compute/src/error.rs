//! Error kinds surfaced by the compute core.

use serde::Serialize;
use stratus_networking::NetworkError;
use thiserror::Error;

use crate::runtime::RuntimeError;

/// Result alias for compute operations.
pub type ComputeResult<T> = Result<T, ComputeError>;

/// Errors returned to the request-handling layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// Malformed request: bad machine type, malformed name, bad CIDR, ...
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A resource with the same name already exists in scope.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Unknown instance, operation or address.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not valid for the resource's current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// An address pool has no free addresses left.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A specifically requested address is taken.
    #[error("address already in use: {0}")]
    AlreadyInUse(String),

    /// The container runtime could not complete the call.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ComputeError {
    /// Upper-snake code used on operation errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::NotFound(_) => "NOT_FOUND",
            Self::FailedPrecondition(_) => "FAILED_PRECONDITION",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::AlreadyInUse(_) => "ALREADY_IN_USE",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument(m)
            | Self::AlreadyExists(m)
            | Self::NotFound(m)
            | Self::FailedPrecondition(m)
            | Self::ResourceExhausted(m)
            | Self::AlreadyInUse(m)
            | Self::Unavailable(m)
            | Self::Internal(m) => m,
        }
    }
}

impl From<NetworkError> for ComputeError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::PoolExhausted(_) => Self::ResourceExhausted(err.to_string()),
            NetworkError::AlreadyInUse(_) => Self::AlreadyInUse(err.to_string()),
            NetworkError::OutOfRange { .. }
            | NetworkError::InvalidAddress(_)
            | NetworkError::InvalidPrefix(_) => Self::InvalidArgument(err.to_string()),
        }
    }
}

impl From<RuntimeError> for ComputeError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(_) => Self::NotFound(err.to_string()),
            RuntimeError::Unavailable(_) => Self::Unavailable(err.to_string()),
            RuntimeError::Other(e) => Self::Internal(format!("{e:#}")),
        }
    }
}

/// Error recorded on a completed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationError {
    pub code: String,
    pub message: String,
}

impl From<&ComputeError> for OperationError {
    fn from(err: &ComputeError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.message().to_string(),
        }
    }
}
