//! Error types for forgebd.

use std::io;

use thiserror::Error;

// Re-export NbdError from the nbd crate
pub use nbd::NbdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for a device serving run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("device setup failed ({phase}): {source}")]
    Setup {
        phase: &'static str,
        source: io::Error,
    },

    #[error("nbd protocol error: {0}")]
    Protocol(#[from] NbdError),

    #[error("geometry error: {0}")]
    Geometry(#[from] GeometryError),

    #[error("a serving session is already active in this process")]
    SessionActive,

    #[error("kernel handoff process exited with status {status}")]
    ChildFailed { status: i32 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn setup(phase: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Setup { phase, source }
    }

    /// Process exit code for this failure.
    ///
    /// Reflects the underlying OS error or child exit status where one
    /// exists; 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Setup { source, .. } => source.raw_os_error().unwrap_or(1),
            Error::Protocol(NbdError::Io(e)) => e.raw_os_error().unwrap_or(1),
            Error::Protocol(_) | Error::Geometry(_) | Error::SessionActive => 1,
            Error::ChildFailed { status } => *status,
            Error::Io(e) => e.raw_os_error().unwrap_or(1),
        }
    }
}

/// Device geometry errors.
#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("invalid geometry: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

/// Backend capability errors.
///
/// These are absorbed per request: the serving loop embeds the wire errno in
/// the reply frame and keeps going.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("operation not supported")]
    Unsupported,

    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("backend error: {message}")]
    Other { message: String },
}

impl BackendError {
    pub fn other(err: impl std::fmt::Display) -> Self {
        Self::Other {
            message: err.to_string(),
        }
    }

    /// Errno for the reply frame's error field.
    pub fn to_wire(&self) -> u32 {
        match self {
            Self::Unsupported => nbd::NBD_ENOTSUP,
            Self::Io(e) => e
                .raw_os_error()
                .map(|code| code as u32)
                .unwrap_or(nbd::NBD_EIO),
            Self::Other { .. } => nbd::NBD_EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_wire_mapping() {
        assert_eq!(BackendError::Unsupported.to_wire(), nbd::NBD_ENOTSUP);
        assert_eq!(
            BackendError::other("checksum mismatch").to_wire(),
            nbd::NBD_EIO
        );
        let enospc = BackendError::Io(io::Error::from_raw_os_error(28));
        assert_eq!(enospc.to_wire(), nbd::NBD_ENOSPC);
    }

    #[test]
    fn child_failure_propagates_status() {
        let err = Error::ChildFailed { status: 5 };
        assert_eq!(err.exit_code(), 5);
        assert!(err.to_string().contains("5"));
    }
}
