//! IKEv2 protocol constants from RFC 7296

/// IKE version 2 (major version = 2, minor version = 0)
pub const IKE_VERSION: u8 = 0x20;

/// Major version nibble expected in every message
pub const IKE_MAJOR_VERSION: u8 = 2;

/// IKE header size (28 bytes)
pub const IKE_HEADER_LEN: usize = 28;

/// Generic payload header size (4 bytes)
pub const PAYLOAD_HEADER_LEN: usize = 4;

/// Maximum IKE message size accepted (64KB - 1)
pub const MAX_IKE_MESSAGE_LEN: u32 = 65535;

/// UDP port for plain IKE
pub const IKE_PORT: u16 = 500;

/// UDP port for NAT-traversal IKE (4-byte non-ESP marker prefix)
pub const IKE_NATT_PORT: u16 = 4500;

/// Exchange Types (RFC 7296 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// IKE_SA_INIT exchange (34)
    IkeSaInit = 34,
    /// IKE_AUTH exchange (35)
    IkeAuth = 35,
    /// CREATE_CHILD_SA exchange (36)
    CreateChildSa = 36,
    /// INFORMATIONAL exchange (37)
    Informational = 37,
}

impl ExchangeType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            34 => Some(ExchangeType::IkeSaInit),
            35 => Some(ExchangeType::IkeAuth),
            36 => Some(ExchangeType::CreateChildSa),
            37 => Some(ExchangeType::Informational),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Decoded IKE header flags (RFC 7296 Section 3.1)
///
/// The octet carries three defined bits; everything else is reserved and
/// dropped on decode. Keeping the bits as plain booleans lets handlers
/// match on direction without bit arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IkeFlags {
    /// Initiator bit (3): sender is the original initiator of this SA
    pub initiator: bool,
    /// Version bit (4): sender can speak a higher major version
    pub version: bool,
    /// Response bit (5): this message answers a request
    pub response: bool,
}

impl IkeFlags {
    const BIT_INITIATOR: u8 = 1 << 3;
    const BIT_VERSION: u8 = 1 << 4;
    const BIT_RESPONSE: u8 = 1 << 5;

    /// Flags for an outgoing message, given our role in the SA and
    /// whether the message answers a peer request
    pub fn outbound(from_initiator: bool, is_response: bool) -> Self {
        IkeFlags {
            initiator: from_initiator,
            version: false,
            response: is_response,
        }
    }

    /// Decode the wire octet
    pub fn from_octet(octet: u8) -> Self {
        IkeFlags {
            initiator: octet & Self::BIT_INITIATOR != 0,
            version: octet & Self::BIT_VERSION != 0,
            response: octet & Self::BIT_RESPONSE != 0,
        }
    }

    /// Encode to the wire octet
    pub fn to_octet(self) -> u8 {
        let mut octet = 0;
        if self.initiator {
            octet |= Self::BIT_INITIATOR;
        }
        if self.version {
            octet |= Self::BIT_VERSION;
        }
        if self.response {
            octet |= Self::BIT_RESPONSE;
        }
        octet
    }
}

/// Payload Types (RFC 7296 Section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// No next payload (0)
    None = 0,
    /// Security Association (33)
    Sa = 33,
    /// Key Exchange (34)
    Ke = 34,
    /// Identification - Initiator (35)
    IdI = 35,
    /// Identification - Responder (36)
    IdR = 36,
    /// Certificate (37)
    Cert = 37,
    /// Certificate Request (38)
    CertReq = 38,
    /// Authentication (39)
    Auth = 39,
    /// Nonce (40)
    Nonce = 40,
    /// Notify (41)
    Notify = 41,
    /// Delete (42)
    Delete = 42,
    /// Vendor ID (43)
    VendorId = 43,
    /// Traffic Selector - Initiator (44)
    TsI = 44,
    /// Traffic Selector - Responder (45)
    TsR = 45,
    /// Encrypted and Authenticated (46)
    Sk = 46,
    /// Configuration (47)
    Cp = 47,
    /// Extensible Authentication (48)
    Eap = 48,
}

impl PayloadType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadType::None),
            33 => Some(PayloadType::Sa),
            34 => Some(PayloadType::Ke),
            35 => Some(PayloadType::IdI),
            36 => Some(PayloadType::IdR),
            37 => Some(PayloadType::Cert),
            38 => Some(PayloadType::CertReq),
            39 => Some(PayloadType::Auth),
            40 => Some(PayloadType::Nonce),
            41 => Some(PayloadType::Notify),
            42 => Some(PayloadType::Delete),
            43 => Some(PayloadType::VendorId),
            44 => Some(PayloadType::TsI),
            45 => Some(PayloadType::TsR),
            46 => Some(PayloadType::Sk),
            47 => Some(PayloadType::Cp),
            48 => Some(PayloadType::Eap),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Protocol IDs used in proposals, notifies and deletes (RFC 7296 Section 3.3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// No protocol (used in some notifies)
    None = 0,
    /// IKE SA
    Ike = 1,
    /// Authentication Header
    Ah = 2,
    /// Encapsulating Security Payload
    Esp = 3,
}

impl ProtocolId {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ProtocolId::None),
            1 => Some(ProtocolId::Ike),
            2 => Some(ProtocolId::Ah),
            3 => Some(ProtocolId::Esp),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Transform types (RFC 7296 Section 3.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TransformType {
    /// Encryption Algorithm (IKE and ESP)
    Encr = 1,
    /// Pseudorandom Function (IKE only)
    Prf = 2,
    /// Integrity Algorithm (IKE, AH, optional in ESP)
    Integ = 3,
    /// Diffie-Hellman Group (IKE, optional in AH/ESP)
    Dh = 4,
    /// Extended Sequence Numbers (AH and ESP)
    Esn = 5,
}

impl TransformType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransformType::Encr),
            2 => Some(TransformType::Prf),
            3 => Some(TransformType::Integ),
            4 => Some(TransformType::Dh),
            5 => Some(TransformType::Esn),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Encryption transform IDs (IKEv2 Transform Type 1)
pub mod encr {
    /// ENCR_NULL (ESP only)
    pub const NULL: u16 = 11;
    /// ENCR_AES_CBC
    pub const AES_CBC: u16 = 12;
    /// ENCR_AES_GCM_16 (16-octet ICV)
    pub const AES_GCM_16: u16 = 20;
    /// ENCR_CAMELLIA_CBC
    pub const CAMELLIA_CBC: u16 = 23;
}

/// PRF transform IDs (IKEv2 Transform Type 2)
pub mod prf {
    /// PRF_HMAC_SHA1
    pub const HMAC_SHA1: u16 = 2;
    /// PRF_HMAC_SHA2_256
    pub const HMAC_SHA2_256: u16 = 5;
    /// PRF_HMAC_SHA2_384
    pub const HMAC_SHA2_384: u16 = 6;
    /// PRF_HMAC_SHA2_512
    pub const HMAC_SHA2_512: u16 = 7;
}

/// Integrity transform IDs (IKEv2 Transform Type 3)
pub mod integ {
    /// AUTH_NONE (AEAD suites)
    pub const NONE: u16 = 0;
    /// AUTH_HMAC_SHA1_96
    pub const HMAC_SHA1_96: u16 = 2;
    /// AUTH_HMAC_SHA2_256_128
    pub const HMAC_SHA2_256_128: u16 = 12;
}

/// Diffie-Hellman group transform IDs (IKEv2 Transform Type 4)
pub mod dh {
    /// 768-bit MODP (group 1)
    pub const MODP_768: u16 = 1;
    /// 1024-bit MODP (group 2)
    pub const MODP_1024: u16 = 2;
    /// 1536-bit MODP (group 5)
    pub const MODP_1536: u16 = 5;
    /// 2048-bit MODP (group 14)
    pub const MODP_2048: u16 = 14;
    /// 3072-bit MODP (group 15)
    pub const MODP_3072: u16 = 15;
    /// 4096-bit MODP (group 16)
    pub const MODP_4096: u16 = 16;
    /// 6144-bit MODP (group 17)
    pub const MODP_6144: u16 = 17;
    /// 8192-bit MODP (group 18)
    pub const MODP_8192: u16 = 18;
    /// NIST P-256 (group 19)
    pub const ECP_256: u16 = 19;
    /// NIST P-384 (group 20)
    pub const ECP_384: u16 = 20;
    /// NIST P-521 (group 21)
    pub const ECP_521: u16 = 21;
}

/// Extended sequence number transform IDs (IKEv2 Transform Type 5)
pub mod esn {
    /// No extended sequence numbers
    pub const NONE: u16 = 0;
    /// Extended (64-bit) sequence numbers
    pub const ESN: u16 = 1;
}

/// Transform attribute types (RFC 7296 Section 3.3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AttributeType {
    /// Key Length in bits (the only attribute defined for IKEv2)
    KeyLength = 14,
}

/// Identification types (RFC 7296 Section 3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IdType {
    /// Four-octet IPv4 address
    Ipv4Addr = 1,
    /// Fully-qualified domain name
    Fqdn = 2,
    /// RFC 822 email address
    Rfc822Addr = 3,
    /// Sixteen-octet IPv6 address
    Ipv6Addr = 5,
    /// DER-encoded ASN.1 X.500 Distinguished Name
    DerAsn1Dn = 9,
    /// DER-encoded ASN.1 X.509 GeneralName
    DerAsn1Gn = 10,
    /// Opaque key identifier
    KeyId = 11,
}

impl IdType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(IdType::Ipv4Addr),
            2 => Some(IdType::Fqdn),
            3 => Some(IdType::Rfc822Addr),
            5 => Some(IdType::Ipv6Addr),
            9 => Some(IdType::DerAsn1Dn),
            10 => Some(IdType::DerAsn1Gn),
            11 => Some(IdType::KeyId),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Authentication methods (RFC 7296 Section 3.8 / RFC 7427)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    /// RSA digital signature
    RsaSignature = 1,
    /// Shared key message integrity code (PSK)
    SharedKeyMic = 2,
    /// DSS digital signature
    DssSignature = 3,
    /// Generic digital signature (RFC 7427)
    DigitalSignature = 14,
}

impl AuthMethod {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AuthMethod::RsaSignature),
            2 => Some(AuthMethod::SharedKeyMic),
            3 => Some(AuthMethod::DssSignature),
            14 => Some(AuthMethod::DigitalSignature),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Traffic selector types (RFC 7296 Section 3.13.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TsType {
    /// IPv4 address range
    Ipv4AddrRange = 7,
    /// IPv6 address range
    Ipv6AddrRange = 8,
}

impl TsType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            7 => Some(TsType::Ipv4AddrRange),
            8 => Some(TsType::Ipv6AddrRange),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Notification message types (RFC 7296 Section 3.10.1)
///
/// Values below 16384 are errors; the rest are status notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NotifyType {
    /// UNSUPPORTED_CRITICAL_PAYLOAD (1)
    UnsupportedCriticalPayload = 1,
    /// INVALID_IKE_SPI (4)
    InvalidIkeSpi = 4,
    /// INVALID_MAJOR_VERSION (5)
    InvalidMajorVersion = 5,
    /// INVALID_SYNTAX (7)
    InvalidSyntax = 7,
    /// INVALID_MESSAGE_ID (9)
    InvalidMessageId = 9,
    /// INVALID_SPI (11)
    InvalidSpi = 11,
    /// NO_PROPOSAL_CHOSEN (14)
    NoProposalChosen = 14,
    /// INVALID_KE_PAYLOAD (17)
    InvalidKePayload = 17,
    /// AUTHENTICATION_FAILED (24)
    AuthenticationFailed = 24,
    /// SINGLE_PAIR_REQUIRED (34)
    SinglePairRequired = 34,
    /// NO_ADDITIONAL_SAS (35)
    NoAdditionalSas = 35,
    /// INTERNAL_ADDRESS_FAILURE (36)
    InternalAddressFailure = 36,
    /// FAILED_CP_REQUIRED (37)
    FailedCpRequired = 37,
    /// TS_UNACCEPTABLE (38)
    TsUnacceptable = 38,
    /// INVALID_SELECTORS (39)
    InvalidSelectors = 39,
    /// TEMPORARY_FAILURE (43)
    TemporaryFailure = 43,
    /// CHILD_SA_NOT_FOUND (44)
    ChildSaNotFound = 44,

    /// INITIAL_CONTACT (16384)
    InitialContact = 16384,
    /// SET_WINDOW_SIZE (16385)
    SetWindowSize = 16385,
    /// ADDITIONAL_TS_POSSIBLE (16386)
    AdditionalTsPossible = 16386,
    /// IPCOMP_SUPPORTED (16387)
    IpcompSupported = 16387,
    /// NAT_DETECTION_SOURCE_IP (16388)
    NatDetectionSourceIp = 16388,
    /// NAT_DETECTION_DESTINATION_IP (16389)
    NatDetectionDestinationIp = 16389,
    /// COOKIE (16390)
    Cookie = 16390,
    /// USE_TRANSPORT_MODE (16391)
    UseTransportMode = 16391,
    /// HTTP_CERT_LOOKUP_SUPPORTED (16392)
    HttpCertLookupSupported = 16392,
    /// REKEY_SA (16393)
    RekeySa = 16393,
    /// ESP_TFC_PADDING_NOT_SUPPORTED (16394)
    EspTfcPaddingNotSupported = 16394,
    /// NON_FIRST_FRAGMENTS_ALSO (16395)
    NonFirstFragmentsAlso = 16395,
    /// SIGNATURE_HASH_ALGORITHMS (16431, RFC 7427)
    SignatureHashAlgorithms = 16431,
}

impl NotifyType {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        use NotifyType::*;
        match value {
            1 => Some(UnsupportedCriticalPayload),
            4 => Some(InvalidIkeSpi),
            5 => Some(InvalidMajorVersion),
            7 => Some(InvalidSyntax),
            9 => Some(InvalidMessageId),
            11 => Some(InvalidSpi),
            14 => Some(NoProposalChosen),
            17 => Some(InvalidKePayload),
            24 => Some(AuthenticationFailed),
            34 => Some(SinglePairRequired),
            35 => Some(NoAdditionalSas),
            36 => Some(InternalAddressFailure),
            37 => Some(FailedCpRequired),
            38 => Some(TsUnacceptable),
            39 => Some(InvalidSelectors),
            43 => Some(TemporaryFailure),
            44 => Some(ChildSaNotFound),
            16384 => Some(InitialContact),
            16385 => Some(SetWindowSize),
            16386 => Some(AdditionalTsPossible),
            16387 => Some(IpcompSupported),
            16388 => Some(NatDetectionSourceIp),
            16389 => Some(NatDetectionDestinationIp),
            16390 => Some(Cookie),
            16391 => Some(UseTransportMode),
            16392 => Some(HttpCertLookupSupported),
            16393 => Some(RekeySa),
            16394 => Some(EspTfcPaddingNotSupported),
            16395 => Some(NonFirstFragmentsAlso),
            16431 => Some(SignatureHashAlgorithms),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Whether this notification type signals an error
    pub fn is_error(self) -> bool {
        self.to_u16() < 16384
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_carry_direction_and_role() {
        let request = IkeFlags::outbound(true, false);
        assert!(request.initiator && !request.response);
        assert_eq!(request.to_octet(), 0x08);

        let reply = IkeFlags::outbound(false, true);
        assert!(reply.response && !reply.initiator);
        assert_eq!(reply.to_octet(), 0x20);

        // an initiator answering an INFORMATIONAL sets both
        assert_eq!(IkeFlags::outbound(true, true).to_octet(), 0x28);
        assert_eq!(IkeFlags::default().to_octet(), 0);
    }

    #[test]
    fn flags_reserved_bits_do_not_survive_decode() {
        let flags = IkeFlags::from_octet(0xFF);
        assert!(flags.initiator && flags.version && flags.response);
        assert_eq!(flags.to_octet(), 0x38);
        for octet in [0x00u8, 0x08, 0x10, 0x20, 0x28, 0x38] {
            assert_eq!(IkeFlags::from_octet(octet).to_octet(), octet);
        }
    }

    #[test]
    fn registry_tables_reject_unassigned_values() {
        // one known and one unassigned probe per table
        assert_eq!(ExchangeType::from_u8(36), Some(ExchangeType::CreateChildSa));
        assert_eq!(ExchangeType::from_u8(99), None);

        assert_eq!(PayloadType::from_u8(46), Some(PayloadType::Sk));
        assert_eq!(PayloadType::from_u8(255), None);

        assert_eq!(ProtocolId::from_u8(3), Some(ProtocolId::Esp));
        assert_eq!(ProtocolId::from_u8(9), None);

        assert_eq!(IdType::from_u8(11), Some(IdType::KeyId));
        assert_eq!(IdType::from_u8(4), None);

        assert_eq!(AuthMethod::from_u8(14), Some(AuthMethod::DigitalSignature));
        assert_eq!(AuthMethod::from_u8(99), None);
    }

    #[test]
    fn registry_values_match_iana() {
        assert_eq!(ExchangeType::IkeSaInit.to_u8(), 34);
        assert_eq!(ExchangeType::Informational.to_u8(), 37);
        assert_eq!(PayloadType::None.to_u8(), 0);
        assert_eq!(PayloadType::Sa.to_u8(), 33);
        assert_eq!(PayloadType::Nonce.to_u8(), 40);
        assert_eq!(TransformType::Esn.to_u8(), 5);
        assert_eq!(dh::MODP_2048, 14);
        assert_eq!(encr::AES_GCM_16, 20);
    }

    #[test]
    fn notify_errors_sit_below_the_status_range() {
        assert!(NotifyType::InvalidSyntax.is_error());
        assert!(NotifyType::ChildSaNotFound.is_error());
        assert!(!NotifyType::InitialContact.is_error());
        assert!(!NotifyType::Cookie.is_error());
        assert_eq!(NotifyType::from_u16(16390), Some(NotifyType::Cookie));
        // 2 is reserved, not a notify we accept
        assert_eq!(NotifyType::from_u16(2), None);
    }
}
