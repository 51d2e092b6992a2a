// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Error taxonomy shared by every application service.
//!
//! Each variant carries a stable [`ErrorKind`] that the presentation layer
//! maps onto its own status codes.

use serde::Serialize;
use thiserror::Error;

use crate::domain::access::AccessError;
use crate::domain::blueprint::BlueprintError;
use crate::domain::engine::EngineError;
use crate::domain::file_policy::PolicyViolation;
use crate::domain::path_sanitizer::PathSanitizerError;
use crate::domain::repository::RepositoryError;
use crate::domain::server::ServerError;
use crate::infrastructure::sandbox::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    AccessDenied,
    FailedPrecondition,
    Dependency,
    Internal,
    Unimplemented,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::AccessDenied => "access_denied",
            Self::FailedPrecondition => "failed_precondition",
            Self::Dependency => "dependency",
            Self::Internal => "internal",
            Self::Unimplemented => "unimplemented",
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Precondition failed: {0}")]
    FailedPrecondition(String),

    #[error("Container engine error: {0}")]
    Dependency(String),

    /// The setup script ran and exited non-zero
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("{} step(s) failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<ServiceError>),
}

fn join_errors(errors: &[ServiceError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Self::Dependency(_) | Self::InstallFailed(_) => ErrorKind::Dependency,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Unimplemented(_) => ErrorKind::Unimplemented,
            Self::Aggregate(errors) => {
                let mut kinds = errors.iter().map(ServiceError::kind);
                match kinds.next() {
                    Some(first) if kinds.all(|k| k == first) => first,
                    _ => ErrorKind::Internal,
                }
            }
        }
    }

    /// Whether a background pipeline may try again after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Dependency(_) | Self::Internal(_) => true,
            Self::Aggregate(errors) => errors.iter().all(ServiceError::is_retryable),
            _ => false,
        }
    }
}

impl From<ServerError> for ServiceError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::ContainerMissing(_) => Self::FailedPrecondition(err.to_string()),
            ServerError::InvalidStateTransition { .. } => Self::Conflict(err.to_string()),
            ServerError::UnknownStatus(_) => Self::Internal(err.to_string()),
            ServerError::EmptyField(_)
            | ServerError::InvalidId(_)
            | ServerError::InvalidPort(_)
            | ServerError::InvalidLimit(_) => Self::Validation(err.to_string()),
        }
    }
}

impl From<BlueprintError> for ServiceError {
    fn from(err: BlueprintError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(_) => Self::NotFound(err.to_string()),
            RepositoryError::AlreadyExists(_) => Self::Conflict(err.to_string()),
            RepositoryError::Database(_) | RepositoryError::Serialization(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(_) => Self::NotFound(err.to_string()),
            EngineError::Conflict(_) => Self::Conflict(err.to_string()),
            EngineError::Connection(_) | EngineError::Api(_) => Self::Dependency(err.to_string()),
        }
    }
}

impl From<AccessError> for ServiceError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Denied { .. } => Self::AccessDenied(err.to_string()),
            AccessError::UnknownServer(_) => Self::NotFound(err.to_string()),
            AccessError::Unavailable(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<PolicyViolation> for ServiceError {
    fn from(err: PolicyViolation) -> Self {
        Self::AccessDenied(err.to_string())
    }
}

impl From<PathSanitizerError> for ServiceError {
    fn from(err: PathSanitizerError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<SandboxError> for ServiceError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::NotFound(_) => Self::NotFound(err.to_string()),
            SandboxError::AlreadyExists(_) => Self::Conflict(err.to_string()),
            SandboxError::IsDirectory(_) | SandboxError::NotDirectory(_) | SandboxError::InvalidMove(_) => {
                Self::Validation(err.to_string())
            }
            SandboxError::PermissionDenied(_) => Self::AccessDenied(err.to_string()),
            SandboxError::Io(_) => Self::Dependency(err.to_string()),
        }
    }
}
