use thiserror::Error;

use crate::kernel::KernelError;
use crate::mount::MountError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("You cannot mount more than {max} filesystems in one process")]
    CapacityExceeded { max: usize },

    #[error("Invalid argument: {msg}")]
    InvalidArgument { msg: String },

    #[error("Already mounted: {mountpoint}")]
    AlreadyMounted { mountpoint: String },

    #[error("Request context is only available inside a filesystem operation")]
    NoActiveRequest,

    #[error("Failed to spawn driver thread: {0}")]
    ThreadSpawn(std::io::Error),

    #[error("Kernel interface error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Dispatcher is no longer running")]
    DispatcherGone,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<MountError> for BridgeError {
    fn from(e: MountError) -> Self {
        BridgeError::InvalidArgument { msg: e.to_string() }
    }
}

impl BridgeError {
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            BridgeError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            BridgeError::CapacityExceeded { .. } => EMFILE,
            BridgeError::InvalidArgument { .. } => EINVAL,
            BridgeError::AlreadyMounted { .. } => EBUSY,
            BridgeError::NoActiveRequest => EPERM,
            BridgeError::ThreadSpawn(e) => e.raw_os_error().unwrap_or(EAGAIN),
            BridgeError::Kernel(e) => e.to_errno(),
            BridgeError::DispatcherGone => EIO,
        }
    }
}

/// Turns an errno (either sign) into a negative result code.
pub fn result_code(errno: i32) -> i32 {
    match errno {
        0 => -libc::EIO,
        e if e > 0 => -e,
        e => e,
    }
}

/// Turns a negative result code back into the positive errno the kernel expects.
pub fn errno_of(code: i32) -> i32 {
    match code.checked_neg() {
        Some(e) if e > 0 => e,
        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_errno() {
        let err = BridgeError::CapacityExceeded { max: 1024 };
        assert_eq!(err.to_errno(), libc::EMFILE);
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn test_invalid_argument_errno() {
        let err = BridgeError::InvalidArgument {
            msg: "bad".to_string(),
        };
        assert_eq!(err.to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_already_mounted_errno() {
        let err = BridgeError::AlreadyMounted {
            mountpoint: "/mnt/a".to_string(),
        };
        assert_eq!(err.to_errno(), libc::EBUSY);
        assert!(err.to_string().contains("/mnt/a"));
    }

    #[test]
    fn test_no_active_request_errno() {
        assert_eq!(BridgeError::NoActiveRequest.to_errno(), libc::EPERM);
    }

    #[test]
    fn test_io_error_keeps_raw_errno() {
        let err = BridgeError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn test_mount_error_becomes_invalid_argument() {
        let err: BridgeError = MountError::InvalidOption("a,b".to_string()).into();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
    }

    #[test]
    fn test_result_code_normalizes_sign() {
        assert_eq!(result_code(libc::ENOENT), -libc::ENOENT);
        assert_eq!(result_code(-libc::ENOENT), -libc::ENOENT);
        assert_eq!(result_code(0), -libc::EIO);
    }

    #[test]
    fn test_errno_of_negative_code() {
        assert_eq!(errno_of(-libc::EACCES), libc::EACCES);
        assert_eq!(errno_of(i32::MIN), libc::EIO);
        assert_eq!(errno_of(5), libc::EIO);
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            BridgeError::CapacityExceeded { max: 1 },
            BridgeError::InvalidArgument {
                msg: "x".to_string(),
            },
            BridgeError::AlreadyMounted {
                mountpoint: "/m".to_string(),
            },
            BridgeError::NoActiveRequest,
            BridgeError::DispatcherGone,
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }
}
