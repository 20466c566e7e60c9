//! Error types for tunnel operations.
//!
//! This module defines the error taxonomy shared by every vxtun crate.
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Errors that can occur while provisioning or tearing down tunnels.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// The host platform cannot run this operation.
    #[error("{operation} is only supported on Linux (running on {platform})")]
    PlatformUnsupported {
        /// The operation that was refused.
        operation: String,
        /// The detected platform.
        platform: String,
    },

    /// The operation needs root privileges.
    #[error("Root privileges required to {operation}")]
    PrivilegeRequired {
        /// The operation that was refused.
        operation: String,
    },

    /// A port, VNI, subnet or interface is already in use.
    #[error("{resource} already in use: {message}")]
    ResourceConflict {
        /// Kind of resource (e.g. "VNI", "port").
        resource: String,
        /// Error message.
        message: String,
    },

    /// An allocation range has no free value left.
    #[error("No free {resource} left in {range}")]
    ResourceExhausted {
        /// Kind of resource.
        resource: String,
        /// Human readable range description.
        range: String,
    },

    /// Malformed input or transfer descriptor.
    #[error("Invalid {field}: {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// A provisioning step failed.
    #[error("{step} failed: {message}")]
    Provisioning {
        /// Label of the failing step.
        step: String,
        /// Error message.
        message: String,
    },

    /// The proxy service did not come up.
    #[error("Service {service} failed to start: {detail}")]
    ServiceStart {
        /// Service name.
        service: String,
        /// Captured diagnostic output.
        detail: String,
    },

    /// A mandatory teardown step failed.
    #[error("Teardown failed at {step}: {message}")]
    Teardown {
        /// Label of the failing step.
        step: String,
        /// Error message.
        message: String,
    },

    /// Entity not found.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Entity kind.
        kind: String,
        /// Identifier that was looked up.
        id: String,
    },

    /// Start on an active tunnel, or stop on an inactive one.
    #[error("Tunnel '{id}' is already {state}")]
    AlreadyInState {
        /// Tunnel id.
        id: String,
        /// Current state.
        state: String,
    },

    /// Registry persistence failed.
    #[error("Storage operation failed: {operation}: {message}")]
    Storage {
        /// The operation that failed (e.g., "load", "save").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Request through a tunnel's proxy did not complete.
    #[error("Connectivity check via {target} failed: {message}")]
    Connectivity {
        /// Proxy address the request went through.
        target: String,
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl TunnelError {
    /// Creates a platform unsupported error.
    pub fn platform_unsupported(operation: impl Into<String>, platform: impl Into<String>) -> Self {
        Self::PlatformUnsupported {
            operation: operation.into(),
            platform: platform.into(),
        }
    }

    /// Creates a privilege required error.
    pub fn privilege_required(operation: impl Into<String>) -> Self {
        Self::PrivilegeRequired {
            operation: operation.into(),
        }
    }

    /// Creates a resource conflict error.
    pub fn conflict(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceConflict {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates a resource exhausted error.
    pub fn exhausted(resource: impl Into<String>, range: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            range: range.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a provisioning error labeled with the failing step.
    pub fn provisioning(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provisioning {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Creates a service start error.
    pub fn service_start(service: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ServiceStart {
            service: service.into(),
            detail: detail.into(),
        }
    }

    /// Creates a teardown error.
    pub fn teardown(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Teardown {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Creates an already-in-state error.
    pub fn already_in_state(id: impl Into<String>, state: impl Into<String>) -> Self {
        Self::AlreadyInState {
            id: id.into(),
            state: state.into(),
        }
    }

    /// Creates a storage error.
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a connectivity error.
    pub fn connectivity(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the error was raised before any host state changed.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            TunnelError::PlatformUnsupported { .. }
                | TunnelError::PrivilegeRequired { .. }
                | TunnelError::Validation { .. }
                | TunnelError::AlreadyInState { .. }
                | TunnelError::NotFound { .. }
        )
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunnelError::ShellCommandFailed { .. }
                | TunnelError::ServiceStart { .. }
                | TunnelError::Connectivity { .. }
                | TunnelError::Storage { .. }
        )
    }
}
