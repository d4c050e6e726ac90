//! Session configuration

use super::constants::{IdType, ProtocolId};
use super::error::{Error, IkeError, Result};
use super::payload::{IdPayload, Selector};
use super::proposal::{
    esp_aes_cbc_sha2_256, ike_aes_cbc_sha2_256_modp2048, Proposal, Transforms,
};
use std::net::IpAddr;
use zeroize::Zeroizing;

/// Local identity presented in IDi/IDr
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// IPv4 address identity
    Ipv4(std::net::Ipv4Addr),
    /// Fully-qualified domain name
    Fqdn(String),
    /// Email address (RFC 822)
    Email(String),
    /// IPv6 address identity
    Ipv6(std::net::Ipv6Addr),
    /// Opaque key ID
    KeyId(Vec<u8>),
}

impl Identity {
    /// Build the identification payload for this identity
    pub fn to_payload(&self) -> IdPayload {
        match self {
            Identity::Ipv4(a) => IdPayload {
                id_type: IdType::Ipv4Addr,
                data: a.octets().to_vec(),
            },
            Identity::Fqdn(name) => IdPayload {
                id_type: IdType::Fqdn,
                data: name.as_bytes().to_vec(),
            },
            Identity::Email(addr) => IdPayload {
                id_type: IdType::Rfc822Addr,
                data: addr.as_bytes().to_vec(),
            },
            Identity::Ipv6(a) => IdPayload {
                id_type: IdType::Ipv6Addr,
                data: a.octets().to_vec(),
            },
            Identity::KeyId(id) => IdPayload {
                id_type: IdType::KeyId,
                data: id.clone(),
            },
        }
    }

    /// Whether a received identification payload names this identity
    pub fn matches(&self, id: &IdPayload) -> bool {
        let own = self.to_payload();
        own.id_type == id.id_type && own.data == id.data
    }
}

/// How the session authenticates (and expects the peer to authenticate)
pub enum AuthConfig {
    /// Pre-shared key (SHARED_KEY_MESSAGE_INTEGRITY_CODE)
    SharedKey(Zeroizing<Vec<u8>>),
    /// RSA signatures; needs the external certificate subsystem
    Rsa,
    /// RFC 7427 digital signatures over Ed25519
    DigitalSignature {
        /// Our signing key
        signing_key: Box<ed25519_dalek::SigningKey>,
        /// The peer's verification key
        peer_public: Box<ed25519_dalek::VerifyingKey>,
    },
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::SharedKey(_) => f.write_str("AuthConfig::SharedKey(..)"),
            AuthConfig::Rsa => f.write_str("AuthConfig::Rsa"),
            AuthConfig::DigitalSignature { .. } => f.write_str("AuthConfig::DigitalSignature(..)"),
        }
    }
}

/// Everything a session needs to negotiate
#[derive(Debug)]
pub struct Config {
    /// IKE SA transform set
    pub proposal_ike: Transforms,
    /// ESP child SA transform set
    pub proposal_esp: Transforms,
    /// Initiator-side traffic selectors
    pub ts_i: Vec<Selector>,
    /// Responder-side traffic selectors
    pub ts_r: Vec<Selector>,
    /// Our identity
    pub local_id: Identity,
    /// The identity we expect from the peer
    pub remote_id: Identity,
    /// Authentication method and material
    pub auth: AuthConfig,
    /// Request transport mode for the child SA
    pub is_transport_mode: bool,
    /// Demand a cookie round-trip before creating responder state
    pub throttle_init_requests: bool,
}

impl Config {
    /// Configuration with the default transform sets
    /// (AES-CBC-256 / HMAC-SHA2-256 / MODP-2048)
    pub fn new(local_id: Identity, remote_id: Identity, auth: AuthConfig) -> Self {
        Config {
            proposal_ike: ike_aes_cbc_sha2_256_modp2048(),
            proposal_esp: esp_aes_cbc_sha2_256(),
            ts_i: Vec::new(),
            ts_r: Vec::new(),
            local_id,
            remote_id,
            auth,
            is_transport_mode: false,
            throttle_init_requests: false,
        }
    }

    /// Validate the configuration before a session is created.
    ///
    /// # Errors
    ///
    /// `NoProposalChosen` for unusable transform sets;
    /// `UnsupportedAlgorithm` for the RSA method, whose signing path lives
    /// in the external certificate subsystem.
    pub fn validate(&self) -> Result<()> {
        self.proposal_ike.check_ike()?;
        self.proposal_esp.check_esp()?;
        if matches!(self.auth, AuthConfig::Rsa) {
            return Err(Error::UnsupportedAlgorithm(
                "RSA authentication requires the certificate subsystem".into(),
            ));
        }
        Ok(())
    }

    /// Check that at least one offered proposal for `protocol` contains
    /// our configured transform set.
    pub fn check_proposals(&self, protocol: ProtocolId, offered: &[Proposal]) -> Result<()> {
        let configured = match protocol {
            ProtocolId::Ike => &self.proposal_ike,
            ProtocolId::Esp => &self.proposal_esp,
            _ => return Err(Error::Protocol(IkeError::NoProposalChosen)),
        };
        for prop in offered.iter().filter(|p| p.protocol_id == protocol) {
            if configured.within(&prop.transforms) {
                return Ok(());
            }
        }
        Err(Error::Protocol(IkeError::NoProposalChosen))
    }

    /// The DH group our IKE transform set requires
    pub fn dh_transform_id(&self) -> Option<u16> {
        self.proposal_ike
            .get(super::constants::TransformType::Dh)
            .map(|t| t.transform_id)
    }

    /// Install single-host traffic selectors for a local/remote address
    /// pair. Which endpoint lands in TSi depends on our role.
    pub fn add_host_selectors(&mut self, local: IpAddr, remote: IpAddr, is_initiator: bool) {
        let (ini, res) = if is_initiator {
            (local, remote)
        } else {
            (remote, local)
        };
        self.ts_i = vec![Selector::for_host(ini)];
        self.ts_r = vec![Selector::for_host(res)];
    }
}
