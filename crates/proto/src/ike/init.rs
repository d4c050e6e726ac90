//! IKE_SA_INIT exchange: builders, handlers, cookie challenge
//!
//! ```text
//! Initiator                         Responder
//! -----------                       -----------
//! HDR, SAi1, KEi, Ni,
//!      N(NAT_SRC), N(NAT_DST)  -->
//!                <--  HDR, SAr1, KEr, Nr, N(NAT_SRC), N(NAT_DST)
//! ```
//!
//! The raw bytes of both messages are captured verbatim; the AUTH exchange
//! signs them later.

use super::config::AuthConfig;
use super::constants::{
    ExchangeType, IkeFlags, NotifyType, PayloadType, ProtocolId, TransformType, IKE_VERSION,
};
use super::error::{Error, IkeError, Result};
use super::message::{IkeHeader, Message};
use super::nat::{check_nat_hash, nat_hash};
use super::payload::{KePayload, NoncePayload, NotifyPayload, Payload};
use super::proposal::Transform;
use super::session::Session;
use super::tkm::Tkm;
use crate::ike::crypto::{CipherSuite, DhGroup};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// RFC 7427 hash algorithm identifiers we announce: SHA2-256, SHA2-384,
/// SHA2-512 and Identity (Ed25519 signs the raw octets)
const SIGNATURE_HASH_ALGORITHMS: [u16; 4] = [2, 3, 4, 5];

/// What the INIT response handler decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum InitOutcome {
    /// Keys derived; continue with IKE_AUTH
    Proceed,
    /// The responder redirected us (cookie or DH group); send INIT again
    Retry,
}

/// Stateless cookie: `SHA-256(Ni | SPIi | remote address | secret)`
pub fn cookie_hash(ni: &[u8], spi_i: &[u8; 8], remote: SocketAddr, secret: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(ni);
    h.update(spi_i);
    match remote.ip() {
        std::net::IpAddr::V4(a) => h.update(a.octets()),
        std::net::IpAddr::V6(a) => h.update(a.octets()),
    }
    h.update(remote.port().to_be_bytes());
    h.update(secret);
    h.finalize().to_vec()
}

/// Pre-session policy check on a first INIT request: no responder state
/// is created until this passes. Returns the specific protocol error the
/// dispatcher should answer with (INVALID_KE_PAYLOAD before
/// NO_PROPOSAL_CHOSEN, as the more actionable of the two).
pub(crate) fn check_init_policy(cfg: &super::config::Config, msg: &Message) -> Result<()> {
    if !msg.header.flags.initiator || msg.header.flags.response {
        return Err(Error::invalid_syntax());
    }
    msg.ensure_payloads(&[PayloadType::Sa, PayloadType::Ke, PayloadType::Nonce])?;
    let ke = msg.ke().expect("presence checked");
    if Some(ke.dh_group) != cfg.dh_transform_id() {
        return Err(Error::Protocol(IkeError::InvalidKePayload));
    }
    let sa = msg.sa().expect("presence checked");
    cfg.check_proposals(ProtocolId::Ike, &sa.proposals)?;
    Ok(())
}

/// A sessionless IKE_SA_INIT response carrying a single notify; used for
/// cookie challenges and pre-session policy rejections.
pub fn notification_response(spi_i: [u8; 8], nt: NotifyType, data: Vec<u8>) -> Message {
    let header = IkeHeader {
        spi_i,
        spi_r: [0u8; 8],
        next_payload: PayloadType::Notify.to_u8(),
        major_version: IKE_VERSION >> 4,
        minor_version: IKE_VERSION & 0x0f,
        exchange_type: ExchangeType::IkeSaInit,
        flags: IkeFlags::outbound(false, true),
        msg_id: 0,
        length: 0,
    };
    Message::new(header, vec![Payload::Notify(NotifyPayload::new(nt, data))])
}

impl Session {
    fn nat_notifies(&self, spi_r: [u8; 8]) -> Vec<Payload> {
        let (Some(local), Some(remote)) = (self.local_addr, self.remote_addr) else {
            return Vec::new();
        };
        vec![
            Payload::Notify(NotifyPayload::new(
                NotifyType::NatDetectionSourceIp,
                nat_hash(&self.spi_i, &spi_r, local),
            )),
            Payload::Notify(NotifyPayload::new(
                NotifyType::NatDetectionDestinationIp,
                nat_hash(&self.spi_i, &spi_r, remote),
            )),
        ]
    }

    fn build_init(&mut self) -> Message {
        let is_initiator = self.is_initiator;
        let spi_r = if is_initiator { [0u8; 8] } else { self.spi_r };

        let mut payloads = Vec::new();
        if let Some(cookie) = &self.responder_cookie {
            // a reissued cookie leads the chain
            payloads.push(Payload::Notify(NotifyPayload::new(
                NotifyType::Cookie,
                cookie.clone(),
            )));
        }
        payloads.push(Payload::Sa(super::payload::SaPayload {
            proposals: vec![self
                .cfg
                .proposal_ike
                .to_proposal(1, ProtocolId::Ike, &self.spi_i)],
        }));
        payloads.push(Payload::Ke(KePayload {
            dh_group: self.tkm.dh_transform_id(),
            key_data: self.tkm.dh_public().to_vec(),
        }));
        payloads.push(Payload::Nonce(
            NoncePayload::new(self.tkm.own_nonce(is_initiator).to_vec())
                .expect("nonce sized to the PRF output"),
        ));
        payloads.extend(self.nat_notifies(spi_r));
        if matches!(self.cfg.auth, AuthConfig::DigitalSignature { .. }) {
            let data = SIGNATURE_HASH_ALGORITHMS
                .iter()
                .flat_map(|id| id.to_be_bytes())
                .collect();
            payloads.push(Payload::Notify(NotifyPayload::new(
                NotifyType::SignatureHashAlgorithms,
                data,
            )));
        }

        let header = IkeHeader {
            spi_i: self.spi_i,
            spi_r,
            next_payload: payloads[0].payload_type(),
            major_version: IKE_VERSION >> 4,
            minor_version: IKE_VERSION & 0x0f,
            exchange_type: ExchangeType::IkeSaInit,
            // the initiator's INIT is a request, the responder's the reply
            flags: IkeFlags::outbound(is_initiator, !is_initiator),
            msg_id: 0,
            length: 0,
        };
        Message::new(header, payloads)
    }

    /// Build, encode and queue our IKE_SA_INIT (request or response by
    /// role), capturing the raw bytes for the later AUTH computation.
    pub(super) fn send_init(&mut self) -> Result<()> {
        let is_response = !self.is_initiator;
        let msg_id = self.msg_id_inc(is_response);
        let mut msg = self.build_init();
        msg.header.msg_id = msg_id;
        let bytes = msg.encode(None, self.is_initiator)?;
        if self.is_initiator {
            self.init_ib = Zeroizing::new(bytes.clone());
            self.enqueue_request(bytes);
        } else {
            self.init_rb = Zeroizing::new(bytes.clone());
            self.enqueue_response(msg_id, bytes);
        }
        Ok(())
    }

    fn process_init_notifies(&mut self, msg: &Message, spi_r: [u8; 8]) {
        for n in msg.notifies() {
            match n.notify_type {
                NotifyType::NatDetectionDestinationIp => {
                    if let Some(local) = self.local_addr {
                        if !check_nat_hash(&n.data, &self.spi_i, &spi_r, local) {
                            info!(addr = %local, "NAT detected in front of this host");
                            self.nat_local = true;
                        }
                    }
                }
                NotifyType::NatDetectionSourceIp => {
                    if let Some(remote) = self.remote_addr {
                        if !check_nat_hash(&n.data, &self.spi_i, &spi_r, remote) {
                            info!(addr = %remote, "NAT detected in front of the peer");
                            self.nat_peer = true;
                        }
                    }
                }
                NotifyType::SignatureHashAlgorithms => {
                    self.peer_offers_rfc7427 = true;
                }
                _ => {}
            }
        }
        if matches!(self.cfg.auth, AuthConfig::DigitalSignature { .. })
            && !self.peer_offers_rfc7427
        {
            warn!("digital signatures configured but the peer did not offer them");
        }
    }

    /// Validate a peer's IKE_SA_INIT request and set up the key schedule.
    /// The caller answers with our INIT response on success.
    pub(super) fn handle_init_request(&mut self, msg: &Message) -> Result<()> {
        if !msg.header.flags.initiator || msg.header.flags.response {
            return Err(Error::invalid_syntax());
        }
        msg.ensure_payloads(&[PayloadType::Sa, PayloadType::Ke, PayloadType::Nonce])?;

        // the DH check comes first: a group mismatch gets the specific
        // INVALID_KE_PAYLOAD answer, not NO_PROPOSAL_CHOSEN
        let ke = msg.ke().expect("presence checked");
        if Some(ke.dh_group) != self.cfg.dh_transform_id() {
            debug!(
                offered = ke.dh_group,
                configured = ?self.cfg.dh_transform_id(),
                "peer offered a different DH group"
            );
            return Err(Error::Protocol(IkeError::InvalidKePayload));
        }

        let sa = msg.sa().expect("presence checked");
        self.cfg.check_proposals(ProtocolId::Ike, &sa.proposals)?;

        // hashes in the request were computed with a zero responder SPI
        self.process_init_notifies(msg, msg.header.spi_r);

        let nonce = msg.nonce().expect("presence checked");
        self.tkm.set_peer_nonce(&nonce.nonce, false);
        self.tkm.compute_dh_shared(&ke.key_data)?;
        self.tkm.derive_ike_keys(&self.spi_i, &self.spi_r, None)?;

        self.init_ib = Zeroizing::new(msg.raw.clone());
        info!(spi_i = %hex::encode(self.spi_i), "IKE SA keys derived (responder)");
        Ok(())
    }

    /// Validate the peer's IKE_SA_INIT response. May decide on a retry
    /// (cookie challenge, DH group redirect) instead of proceeding.
    pub(super) fn handle_init_response(&mut self, msg: &Message) -> Result<InitOutcome> {
        if !msg.header.flags.response || msg.header.flags.initiator {
            return Err(Error::invalid_syntax());
        }

        // guidance notifies come before payload requirements: a challenge
        // or redirect response carries nothing else
        for n in msg.notifies() {
            match n.notify_type {
                NotifyType::Cookie => {
                    debug!("responder demands a cookie; reissuing INIT");
                    self.responder_cookie = Some(n.data.clone());
                    return Ok(InitOutcome::Retry);
                }
                NotifyType::InvalidKePayload => {
                    let group = n
                        .data
                        .get(..2)
                        .map(|b| u16::from_be_bytes([b[0], b[1]]))
                        .ok_or_else(Error::invalid_syntax)?;
                    debug!(group, "responder demands a different DH group");
                    self.switch_dh_group(group)?;
                    return Ok(InitOutcome::Retry);
                }
                other if other.is_error() => {
                    let code = IkeError::from_notify(other).unwrap_or(IkeError::InvalidSyntax);
                    warn!(notify = ?other, "IKE_SA_INIT rejected by peer");
                    return Err(Error::Protocol(code));
                }
                _ => {}
            }
        }

        msg.ensure_payloads(&[PayloadType::Sa, PayloadType::Ke, PayloadType::Nonce])?;
        let spi_r = msg.header.spi_r;
        if spi_r == [0u8; 8] || spi_r == self.spi_i {
            return Err(Error::invalid_syntax());
        }

        let sa = msg.sa().expect("presence checked");
        self.cfg.check_proposals(ProtocolId::Ike, &sa.proposals)?;

        let ke = msg.ke().expect("presence checked");
        if Some(ke.dh_group) != self.cfg.dh_transform_id() {
            return Err(Error::Protocol(IkeError::InvalidKePayload));
        }

        self.spi_r = spi_r;
        self.process_init_notifies(msg, spi_r);

        let nonce = msg.nonce().expect("presence checked");
        self.tkm.set_peer_nonce(&nonce.nonce, true);
        self.tkm.compute_dh_shared(&ke.key_data)?;
        self.tkm.derive_ike_keys(&self.spi_i, &self.spi_r, None)?;

        self.init_rb = Zeroizing::new(msg.raw.clone());
        info!(
            spi_i = %hex::encode(self.spi_i),
            spi_r = %hex::encode(self.spi_r),
            "IKE SA keys derived (initiator)"
        );
        Ok(InitOutcome::Proceed)
    }

    /// Adopt the DH group a responder redirected us to, rebuilding the
    /// transform set and the TKM for the fresh attempt.
    fn switch_dh_group(&mut self, group: u16) -> Result<()> {
        // reject redirects to groups we do not implement
        DhGroup::from_transform_id(group)?;
        if self.cfg.dh_transform_id() == Some(group) {
            // a redirect to the group we already sent is a downgrade probe
            return Err(Error::Protocol(IkeError::InvalidKePayload));
        }
        self.cfg
            .proposal_ike
            .0
            .insert(TransformType::Dh, Transform::new(TransformType::Dh, group));
        let suite = CipherSuite::new(&self.cfg.proposal_ike.as_list())?;
        let esp_suite = CipherSuite::new(&self.cfg.proposal_esp.as_list())?;
        self.tkm = Tkm::new(suite, esp_suite, self.is_initiator)?;
        Ok(())
    }
}
