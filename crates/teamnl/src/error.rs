//! Error types for team device operations.

use std::io;

/// Result type for team device operations.
pub type Result<T> = std::result::Result<T, TeamError>;

/// Errors that can occur while controlling a team device.
#[derive(Debug, thiserror::Error)]
pub enum TeamError {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The team driver (generic netlink family "team") is not present
    /// in the running kernel.
    #[error("team driver unavailable: generic netlink family not found")]
    DeviceDriverUnavailable,

    /// The requested device does not exist.
    #[error("device not found: {name}")]
    DeviceNotFound {
        /// Interface name or index that failed to resolve.
        name: String,
    },

    /// The kernel refused the request for lack of privileges.
    #[error("permission denied")]
    PermissionDenied,

    /// The kernel rejected the request with an errno not covered by a
    /// more specific variant.
    #[error("kernel rejected request: {message} (errno {errno})")]
    KernelRejected {
        /// The errno value from the kernel (positive).
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// A single incoming message could not be decoded. Non-fatal during
    /// event processing: the message is skipped.
    #[error("decode error: {0}")]
    Decode(String),

    /// An option was accessed with a value type other than the one the
    /// kernel reported for it.
    #[error("option type mismatch: {name}")]
    OptionTypeMismatch {
        /// The option name.
        name: String,
    },

    /// A per-port operation targeted a device-global option, or vice versa.
    #[error("option scope mismatch: {name}")]
    OptionScopeMismatch {
        /// The option name.
        name: String,
    },

    /// Lookup by name or interface index found nothing.
    #[error("not found: {0}")]
    NotFound(String),
}

impl TeamError {
    /// Map a negative kernel ack code to the error taxonomy.
    ///
    /// `errno` is the raw (negative) value from the netlink error message.
    pub fn from_errno(errno: i32) -> Self {
        let positive = -errno;
        match positive {
            libc::EPERM | libc::EACCES => Self::PermissionDenied,
            _ => Self::KernelRejected {
                errno: positive,
                message: io::Error::from_raw_os_error(positive).to_string(),
            },
        }
    }

    /// Check if this is a "not found" error (ENOENT, ENODEV, or a lookup miss).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::KernelRejected { errno, .. } => {
                matches!(*errno, libc::ENOENT | libc::ENODEV)
            }
            Self::DeviceNotFound { .. } | Self::NotFound(_) => true,
            _ => false,
        }
    }

    /// Check if this is a permission error.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied)
    }

    /// Get the errno value if the kernel rejected the request.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::KernelRejected { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errno_permission() {
        assert!(TeamError::from_errno(-libc::EPERM).is_permission_denied());
        assert!(TeamError::from_errno(-libc::EACCES).is_permission_denied());
    }

    #[test]
    fn test_from_errno_rejected() {
        let err = TeamError::from_errno(-libc::EBUSY);
        assert_eq!(err.errno(), Some(libc::EBUSY));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_is_not_found() {
        assert!(TeamError::from_errno(-libc::ENODEV).is_not_found());
        assert!(TeamError::from_errno(-libc::ENOENT).is_not_found());
        assert!(
            TeamError::DeviceNotFound {
                name: "team0".into()
            }
            .is_not_found()
        );
        assert!(TeamError::NotFound("mode".into()).is_not_found());
    }

    #[test]
    fn test_error_messages() {
        let err = TeamError::OptionTypeMismatch {
            name: "mode".into(),
        };
        assert_eq!(err.to_string(), "option type mismatch: mode");

        let err = TeamError::OptionScopeMismatch {
            name: "enabled".into(),
        };
        assert_eq!(err.to_string(), "option scope mismatch: enabled");
    }
}
