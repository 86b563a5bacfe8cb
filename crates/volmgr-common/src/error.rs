//! Error types for volume orchestration.
//!
//! Every failure that crosses a component boundary is one of these variants.
//! Raw transport errors (redis, io, QMP framing) are folded into them at the
//! boundary and never escape as-is.

use std::io;
use thiserror::Error;

/// Result type alias for volume operations.
pub type VolumeResult<T> = Result<T, VolumeError>;

/// Errors that can occur while publishing, unpublishing or managing volumes.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// The replicated store could not hand out a serial (unreachable, timed
    /// out, or holding a corrupt counter).
    #[error("Serial allocation unavailable: {reason}")]
    AllocationUnavailable {
        /// Why the allocation could not complete.
        reason: String,
    },

    /// A binding already exists for the volume. Handled inside publish.
    #[error("Volume '{volume}' is already bound to serial {serial}")]
    AlreadyBound {
        /// The volume name.
        volume: String,
        /// The serial currently bound.
        serial: String,
    },

    /// The hypervisor definitively refused a command.
    #[error("Host '{host}' rejected '{command}': {detail}")]
    CommandRejected {
        /// Target host.
        host: String,
        /// The command text.
        command: String,
        /// What the remote side reported.
        detail: String,
    },

    /// The control channel could not be reached or did not answer in time.
    /// Whether the remote side applied the command is unknown.
    #[error("Control channel for host '{host}' unreachable: {reason}")]
    ChannelUnreachable {
        /// Target host.
        host: String,
        /// Transport level reason.
        reason: String,
    },

    /// Publish failed cleanly; nothing is left attached by this call.
    #[error("Failed to publish volume '{volume}' to host '{host}': {source}")]
    PublishFailed {
        /// The volume name.
        volume: String,
        /// Target host.
        host: String,
        /// The step failure.
        #[source]
        source: Box<VolumeError>,
    },

    /// The device attach failed and so did the compensating backend detach.
    /// Host state must be inspected before anything retries.
    #[error(
        "Publish of volume '{volume}' to host '{host}' left a dangling backend: \
         attach failed ({attach_error}) and cleanup failed ({source})"
    )]
    PublishFailedDirty {
        /// The volume name.
        volume: String,
        /// Target host.
        host: String,
        /// The device attach failure.
        attach_error: Box<VolumeError>,
        /// The compensation failure.
        #[source]
        source: Box<VolumeError>,
    },

    /// Both the device detach and the backend detach failed.
    #[error(
        "Failed to unpublish volume '{volume}' from host '{host}': \
         device detach ({device_error}), backend detach ({source})"
    )]
    UnpublishFailed {
        /// The volume name.
        volume: String,
        /// Target host.
        host: String,
        /// The device detach failure.
        device_error: Box<VolumeError>,
        /// The backend detach failure.
        #[source]
        source: Box<VolumeError>,
    },

    /// No binding exists for the volume (never published).
    #[error("Volume '{volume}' not found, not published yet?")]
    NotFound {
        /// The volume name.
        volume: String,
    },

    /// Store operation failed outside of serial allocation.
    #[error("Store operation failed: {operation}: {message}")]
    Store {
        /// The operation that failed (e.g., "get", "conditional_put").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Disk image lifecycle operation failed.
    #[error("Image operation failed: {operation} '{path}': {message}")]
    Image {
        /// The operation (create, resize, delete).
        operation: String,
        /// Image path.
        path: String,
        /// Error message.
        message: String,
    },

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

    /// A volume name or host id that cannot be used in commands or paths.
    #[error("Invalid {kind} '{value}': {message}")]
    InvalidName {
        /// What was being validated ("volume name", "host id").
        kind: &'static str,
        /// The rejected value.
        value: String,
        /// Error message.
        message: String,
    },

    /// Requested image size is outside the configured limits.
    #[error("Invalid size {size} bytes: must be between {min} and {max}")]
    InvalidSize {
        /// Requested size.
        size: u64,
        /// Minimum allowed size.
        min: u64,
        /// Maximum allowed size.
        max: u64,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
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

impl VolumeError {
    /// Creates an allocation unavailable error.
    pub fn allocation_unavailable(reason: impl Into<String>) -> Self {
        Self::AllocationUnavailable {
            reason: reason.into(),
        }
    }

    /// Creates a command rejected error.
    pub fn rejected(
        host: impl Into<String>,
        command: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::CommandRejected {
            host: host.into(),
            command: command.into(),
            detail: detail.into(),
        }
    }

    /// Creates a channel unreachable error.
    pub fn unreachable(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ChannelUnreachable {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Creates a store error.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(volume: impl Into<String>) -> Self {
        Self::NotFound {
            volume: volume.into(),
        }
    }

    /// Creates an image error.
    pub fn image(
        operation: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Image {
            operation: operation.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the same request may succeed when retried as-is.
    ///
    /// Wrapped publish/unpublish failures inherit retryability from their
    /// cause. `PublishFailedDirty` is never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            VolumeError::AllocationUnavailable { .. }
            | VolumeError::ChannelUnreachable { .. }
            | VolumeError::Store { .. } => true,
            VolumeError::PublishFailed { source, .. } => source.is_retryable(),
            VolumeError::UnpublishFailed {
                device_error,
                source,
                ..
            } => device_error.is_retryable() || source.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if an operator has to inspect host state.
    pub fn requires_operator(&self) -> bool {
        matches!(self, VolumeError::PublishFailedDirty { .. })
    }
}
