//! Error reporting for data-plane operations
//!
//! Data-plane failures all look alike to the control plane: an operation
//! on an SA did not take effect. One error struct carries the operation
//! that failed, a human-readable detail, and the underlying I/O error
//! when a syscall was involved.

use std::fmt;

/// The data-plane operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedOp {
    /// Installing an SA pair
    Install,
    /// Removing an SA pair
    Removal,
    /// A negotiated algorithm has no data-plane implementation
    AlgorithmLookup,
}

impl FailedOp {
    fn as_str(self) -> &'static str {
        match self {
            FailedOp::Install => "install",
            FailedOp::Removal => "removal",
            FailedOp::AlgorithmLookup => "algorithm lookup",
        }
    }
}

/// A failed data-plane operation
#[derive(Debug)]
pub struct PlatformError {
    op: FailedOp,
    detail: String,
    io: Option<std::io::Error>,
}

impl PlatformError {
    /// An SA install failure
    pub fn install(detail: impl Into<String>) -> Self {
        PlatformError {
            op: FailedOp::Install,
            detail: detail.into(),
            io: None,
        }
    }

    /// An SA removal failure
    pub fn removal(detail: impl Into<String>) -> Self {
        PlatformError {
            op: FailedOp::Removal,
            detail: detail.into(),
            io: None,
        }
    }

    /// A negotiated algorithm the platform cannot provide
    pub fn unsupported(detail: impl Into<String>) -> Self {
        PlatformError {
            op: FailedOp::AlgorithmLookup,
            detail: detail.into(),
            io: None,
        }
    }

    /// Attach the I/O error behind this failure
    pub fn with_io(mut self, io: std::io::Error) -> Self {
        self.io = Some(io);
        self
    }

    /// Which operation failed
    pub fn op(&self) -> FailedOp {
        self.op
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SA {} failed: {}", self.op.as_str(), self.detail)?;
        if let Some(io) = &self.io {
            write!(f, " ({})", io)?;
        }
        Ok(())
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.io.as_ref().map(|io| io as _)
    }
}

impl From<std::io::Error> for PlatformError {
    // a bare syscall failure with no further context is an install
    // problem until a caller says otherwise
    fn from(io: std::io::Error) -> Self {
        PlatformError::install("kernel rejected the operation").with_io(io)
    }
}

/// Result type for data-plane operations
pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn message_names_the_operation() {
        assert_eq!(
            PlatformError::removal("SPI 0x11223344 unknown").to_string(),
            "SA removal failed: SPI 0x11223344 unknown"
        );
        assert_eq!(
            PlatformError::unsupported("ENCR_NULL").op(),
            FailedOp::AlgorithmLookup
        );
    }

    #[test]
    fn io_cause_is_chained() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "CAP_NET_ADMIN");
        let err = PlatformError::install("netlink send").with_io(io);
        let shown = err.to_string();
        assert!(shown.starts_with("SA install failed: netlink send"));
        assert!(shown.contains("CAP_NET_ADMIN"));
        assert!(err.source().is_some());

        let plain = PlatformError::removal("no such SA");
        assert!(plain.source().is_none());
    }
}
