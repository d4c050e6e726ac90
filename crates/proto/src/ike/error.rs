//! Error types for the IKEv2 engine
//!
//! Three tiers, reflected in how a session reacts:
//!
//! - [`Error::Protocol`] wraps an [`IkeError`] that maps 1:1 to an RFC 7296
//!   notify code and is usually reported to the peer.
//! - Transient conditions ([`Error::MissingCookie`],
//!   [`Error::TemporaryFailure`]) are recovered by answering with a guidance
//!   notify and waiting for the peer to retry.
//! - Fatal conditions ([`Error::CryptoKeysMissing`], [`Error::Cancelled`],
//!   [`Error::UnsupportedAlgorithm`]) terminate the session.

use super::constants::NotifyType;
use std::fmt;

/// Result type for IKE operations
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol errors carrying their RFC 7296 notify code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeError {
    /// UNSUPPORTED_CRITICAL_PAYLOAD (1)
    UnsupportedCriticalPayload,
    /// INVALID_IKE_SPI (4)
    InvalidIkeSpi,
    /// INVALID_MAJOR_VERSION (5)
    InvalidMajorVersion,
    /// INVALID_SYNTAX (7)
    InvalidSyntax,
    /// INVALID_MESSAGE_ID (9)
    InvalidMessageId,
    /// INVALID_SPI (11)
    InvalidSpi,
    /// NO_PROPOSAL_CHOSEN (14)
    NoProposalChosen,
    /// INVALID_KE_PAYLOAD (17)
    InvalidKePayload,
    /// AUTHENTICATION_FAILED (24)
    AuthenticationFailed,
    /// SINGLE_PAIR_REQUIRED (34)
    SinglePairRequired,
    /// NO_ADDITIONAL_SAS (35)
    NoAdditionalSas,
    /// INTERNAL_ADDRESS_FAILURE (36)
    InternalAddressFailure,
    /// FAILED_CP_REQUIRED (37)
    FailedCpRequired,
    /// TS_UNACCEPTABLE (38)
    TsUnacceptable,
    /// INVALID_SELECTORS (39)
    InvalidSelectors,
    /// TEMPORARY_FAILURE (43)
    TemporaryFailure,
    /// CHILD_SA_NOT_FOUND (44)
    ChildSaNotFound,
}

impl IkeError {
    /// The notify code carried on the wire for this error
    pub fn notify_type(self) -> NotifyType {
        use IkeError::*;
        match self {
            UnsupportedCriticalPayload => NotifyType::UnsupportedCriticalPayload,
            InvalidIkeSpi => NotifyType::InvalidIkeSpi,
            InvalidMajorVersion => NotifyType::InvalidMajorVersion,
            InvalidSyntax => NotifyType::InvalidSyntax,
            InvalidMessageId => NotifyType::InvalidMessageId,
            InvalidSpi => NotifyType::InvalidSpi,
            NoProposalChosen => NotifyType::NoProposalChosen,
            InvalidKePayload => NotifyType::InvalidKePayload,
            AuthenticationFailed => NotifyType::AuthenticationFailed,
            SinglePairRequired => NotifyType::SinglePairRequired,
            NoAdditionalSas => NotifyType::NoAdditionalSas,
            InternalAddressFailure => NotifyType::InternalAddressFailure,
            FailedCpRequired => NotifyType::FailedCpRequired,
            TsUnacceptable => NotifyType::TsUnacceptable,
            InvalidSelectors => NotifyType::InvalidSelectors,
            TemporaryFailure => NotifyType::TemporaryFailure,
            ChildSaNotFound => NotifyType::ChildSaNotFound,
        }
    }

    /// Map a received notify code back to the error it signals, if any
    pub fn from_notify(nt: NotifyType) -> Option<Self> {
        use IkeError::*;
        match nt {
            NotifyType::UnsupportedCriticalPayload => Some(UnsupportedCriticalPayload),
            NotifyType::InvalidIkeSpi => Some(InvalidIkeSpi),
            NotifyType::InvalidMajorVersion => Some(InvalidMajorVersion),
            NotifyType::InvalidSyntax => Some(InvalidSyntax),
            NotifyType::InvalidMessageId => Some(InvalidMessageId),
            NotifyType::InvalidSpi => Some(InvalidSpi),
            NotifyType::NoProposalChosen => Some(NoProposalChosen),
            NotifyType::InvalidKePayload => Some(InvalidKePayload),
            NotifyType::AuthenticationFailed => Some(AuthenticationFailed),
            NotifyType::SinglePairRequired => Some(SinglePairRequired),
            NotifyType::NoAdditionalSas => Some(NoAdditionalSas),
            NotifyType::InternalAddressFailure => Some(InternalAddressFailure),
            NotifyType::FailedCpRequired => Some(FailedCpRequired),
            NotifyType::TsUnacceptable => Some(TsUnacceptable),
            NotifyType::InvalidSelectors => Some(InvalidSelectors),
            NotifyType::TemporaryFailure => Some(TemporaryFailure),
            NotifyType::ChildSaNotFound => Some(ChildSaNotFound),
            _ => None,
        }
    }
}

impl fmt::Display for IkeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use IkeError::*;
        let name = match self {
            UnsupportedCriticalPayload => "UNSUPPORTED_CRITICAL_PAYLOAD",
            InvalidIkeSpi => "INVALID_IKE_SPI",
            InvalidMajorVersion => "INVALID_MAJOR_VERSION",
            InvalidSyntax => "INVALID_SYNTAX",
            InvalidMessageId => "INVALID_MESSAGE_ID",
            InvalidSpi => "INVALID_SPI",
            NoProposalChosen => "NO_PROPOSAL_CHOSEN",
            InvalidKePayload => "INVALID_KE_PAYLOAD",
            AuthenticationFailed => "AUTHENTICATION_FAILED",
            SinglePairRequired => "SINGLE_PAIR_REQUIRED",
            NoAdditionalSas => "NO_ADDITIONAL_SAS",
            InternalAddressFailure => "INTERNAL_ADDRESS_FAILURE",
            FailedCpRequired => "FAILED_CP_REQUIRED",
            TsUnacceptable => "TS_UNACCEPTABLE",
            InvalidSelectors => "INVALID_SELECTORS",
            TemporaryFailure => "TEMPORARY_FAILURE",
            ChildSaNotFound => "CHILD_SA_NOT_FOUND",
        };
        f.write_str(name)
    }
}

/// IKE engine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Protocol error mapped 1:1 to an RFC 7296 notify code
    Protocol(IkeError),

    /// Responder demands a cookie round-trip before creating state
    MissingCookie,

    /// Transient failure; the peer is expected to retry
    TemporaryFailure,

    /// An operation needed SK_* keys before IKE_SA_INIT completed
    CryptoKeysMissing,

    /// The session was cancelled
    Cancelled,

    /// A negotiated transform is not in the algorithm registry
    UnsupportedAlgorithm(String),

    /// A session queue closed underneath us (shutdown in progress)
    ChannelClosed,

    /// The peer's write callback failed
    Io(String),
}

impl Error {
    /// Shorthand for `Error::Protocol(IkeError::InvalidSyntax)`, the
    /// blanket decode failure
    pub fn invalid_syntax() -> Self {
        Error::Protocol(IkeError::InvalidSyntax)
    }

    /// Whether this error terminates the session outright
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CryptoKeysMissing
                | Error::Cancelled
                | Error::UnsupportedAlgorithm(_)
                | Error::ChannelClosed
                | Error::Io(_)
        )
    }

    /// The notify code to report to the peer, when there is one
    pub fn notify_type(&self) -> Option<NotifyType> {
        match self {
            Error::Protocol(e) => Some(e.notify_type()),
            Error::MissingCookie => Some(NotifyType::Cookie),
            Error::TemporaryFailure => Some(NotifyType::TemporaryFailure),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
            Error::MissingCookie => write!(f, "cookie required"),
            Error::TemporaryFailure => write!(f, "temporary failure"),
            Error::CryptoKeysMissing => write!(f, "crypto keys not yet derived"),
            Error::Cancelled => write!(f, "session cancelled"),
            Error::UnsupportedAlgorithm(alg) => write!(f, "unsupported algorithm: {}", alg),
            Error::ChannelClosed => write!(f, "session queue closed"),
            Error::Io(msg) => write!(f, "write error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<IkeError> for Error {
    fn from(e: IkeError) -> Self {
        Error::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_round_trip() {
        for e in [
            IkeError::InvalidSyntax,
            IkeError::NoProposalChosen,
            IkeError::InvalidKePayload,
            IkeError::AuthenticationFailed,
            IkeError::NoAdditionalSas,
        ] {
            assert_eq!(IkeError::from_notify(e.notify_type()), Some(e));
        }
    }

    #[test]
    fn test_status_notify_is_not_error() {
        assert_eq!(IkeError::from_notify(NotifyType::Cookie), None);
        assert_eq!(IkeError::from_notify(NotifyType::InitialContact), None);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::CryptoKeysMissing.is_fatal());
        assert!(Error::Cancelled.is_fatal());
        assert!(Error::UnsupportedAlgorithm("ENCR_3DES".into()).is_fatal());
        assert!(!Error::Protocol(IkeError::InvalidSyntax).is_fatal());
        assert!(!Error::MissingCookie.is_fatal());
    }

    #[test]
    fn test_error_to_notify() {
        assert_eq!(
            Error::Protocol(IkeError::AuthenticationFailed).notify_type(),
            Some(NotifyType::AuthenticationFailed)
        );
        assert_eq!(Error::MissingCookie.notify_type(), Some(NotifyType::Cookie));
        assert_eq!(Error::Cancelled.notify_type(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Protocol(IkeError::NoProposalChosen).to_string(),
            "protocol error: NO_PROPOSAL_CHOSEN"
        );
    }
}
