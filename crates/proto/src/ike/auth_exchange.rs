//! IKE_AUTH exchange: authenticate the peer, negotiate the first child SA
//!
//! ```text
//! Initiator                         Responder
//! -----------                       -----------
//! HDR, SK {IDi, AUTH, SAi2,
//!          TSi, TSr, [N(...)]}  -->
//!                 <--  HDR, SK {IDr, AUTH, SAr2, TSi, TSr}
//! ```
//!
//! Everything after IKE_SA_INIT rides inside the SK payload. Per policy,
//! any AUTH-stage failure is reported to the peer as
//! AUTHENTICATION_FAILED; the specific cause only reaches the log.

use super::auth::{compute_auth, verify_auth};
use super::constants::{
    ExchangeType, IkeFlags, NotifyType, PayloadType, ProtocolId, IKE_VERSION,
};
use super::error::{Error, IkeError, Result};
use super::message::{IkeHeader, Message};
use super::payload::{NotifyPayload, Payload, SaPayload, TsPayload};
use super::session::Session;
use tracing::{debug, info, warn};

/// What the AUTH response handler decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AuthOutcome {
    /// Peer authenticated; install the SA
    Proceed,
    /// Peer rejected our AUTH with an error notify; close silently
    PeerRejected(IkeError),
}

impl Session {
    /// Build, seal and queue our IKE_AUTH message (request or response by
    /// role).
    pub(super) fn send_auth(&mut self) -> Result<()> {
        if self.cfg.ts_i.is_empty() || self.cfg.ts_r.is_empty() {
            // fall back to host-to-host selectors when addresses are known
            match (self.local_addr, self.remote_addr) {
                (Some(local), Some(remote)) => {
                    self.cfg
                        .add_host_selectors(local.ip(), remote.ip(), self.is_initiator);
                }
                _ => return Err(Error::Protocol(IkeError::NoProposalChosen)),
            }
        }
        debug!(
            ts_i = ?self.cfg.ts_i,
            ts_r = ?self.cfg.ts_r,
            "child SA selectors"
        );

        let is_initiator = self.is_initiator;
        let id = self.cfg.local_id.to_payload();
        let own_init: &[u8] = if is_initiator {
            &self.init_ib
        } else {
            &self.init_rb
        };
        let octets = self.tkm.auth_octets(own_init, &id, is_initiator)?;
        let auth_payload = compute_auth(&self.cfg.auth, &self.tkm, &octets)?;

        let own_esp_spi = if is_initiator {
            self.esp_spi_i
        } else {
            self.esp_spi_r
        };
        let esp_sa = SaPayload {
            proposals: vec![self.cfg.proposal_esp.to_proposal(
                1,
                ProtocolId::Esp,
                &own_esp_spi.to_be_bytes(),
            )],
        };

        let mut payloads = vec![
            if is_initiator {
                Payload::IdI(id)
            } else {
                Payload::IdR(id)
            },
            Payload::Auth(auth_payload),
            Payload::Sa(esp_sa),
            Payload::TsI(TsPayload {
                selectors: self.cfg.ts_i.clone(),
            }),
            Payload::TsR(TsPayload {
                selectors: self.cfg.ts_r.clone(),
            }),
        ];
        if self.cfg.is_transport_mode {
            payloads.push(Payload::Notify(NotifyPayload::new(
                NotifyType::UseTransportMode,
                vec![],
            )));
        }
        if is_initiator {
            payloads.push(Payload::Notify(NotifyPayload::new(
                NotifyType::InitialContact,
                vec![],
            )));
        }

        let is_response = !is_initiator;
        let msg_id = self.msg_id_inc(is_response);
        let header = IkeHeader {
            spi_i: self.spi_i,
            spi_r: self.spi_r,
            next_payload: PayloadType::Sk.to_u8(),
            major_version: IKE_VERSION >> 4,
            minor_version: IKE_VERSION & 0x0f,
            exchange_type: ExchangeType::IkeAuth,
            flags: IkeFlags::outbound(is_initiator, is_response),
            msg_id,
            length: 0,
        };
        let msg = Message::new(header, payloads);
        let bytes = msg.encode(Some(&self.tkm), is_initiator)?;
        if is_initiator {
            self.enqueue_request(bytes);
        } else {
            self.enqueue_response(msg_id, bytes);
        }
        Ok(())
    }

    /// Pull the peer's ESP SPI out of its accepted proposal
    fn peer_esp_spi(sa: &SaPayload) -> Result<u32> {
        let prop = sa
            .proposals
            .iter()
            .find(|p| p.protocol_id == ProtocolId::Esp)
            .ok_or(Error::Protocol(IkeError::NoProposalChosen))?;
        let spi: [u8; 4] = prop
            .spi
            .as_slice()
            .try_into()
            .map_err(|_| Error::invalid_syntax())?;
        Ok(u32::from_be_bytes(spi))
    }

    fn check_auth_payloads(&mut self, msg: &Message, from_initiator: bool) -> Result<()> {
        let id_type = if from_initiator {
            PayloadType::IdI
        } else {
            PayloadType::IdR
        };
        msg.ensure_payloads(&[
            id_type,
            PayloadType::Auth,
            PayloadType::Sa,
            PayloadType::TsI,
            PayloadType::TsR,
        ])?;

        let peer_id = if from_initiator {
            msg.id_i().expect("presence checked")
        } else {
            msg.id_r().expect("presence checked")
        };
        if !self.cfg.remote_id.matches(peer_id) {
            warn!(peer_id = ?peer_id.id_type, "peer identity does not match configuration");
            return Err(Error::Protocol(IkeError::AuthenticationFailed));
        }

        // the peer signed its own INIT message with its own nonce mixed in
        let peer_init: &[u8] = if from_initiator {
            &self.init_ib
        } else {
            &self.init_rb
        };
        let octets = self
            .tkm
            .auth_octets(peer_init, peer_id, from_initiator)?;
        let auth = msg.auth().expect("presence checked");
        verify_auth(&self.cfg.auth, &self.tkm, &octets, auth)?;

        let sa = msg.sa().expect("presence checked");
        self.cfg.check_proposals(ProtocolId::Esp, &sa.proposals)?;

        let ts_i = msg.ts_i().expect("presence checked");
        let ts_r = msg.ts_r().expect("presence checked");
        if ts_i.selectors.is_empty() || ts_r.selectors.is_empty() {
            return Err(Error::Protocol(IkeError::TsUnacceptable));
        }
        if self.cfg.ts_i.is_empty() {
            // no local policy; adopt the peer's selectors
            self.cfg.ts_i = ts_i.selectors.clone();
            self.cfg.ts_r = ts_r.selectors.clone();
        }

        if msg.notify(NotifyType::UseTransportMode).is_some() != self.cfg.is_transport_mode {
            debug!(
                requested = msg.notify(NotifyType::UseTransportMode).is_some(),
                configured = self.cfg.is_transport_mode,
                "transport mode mismatch; staying with local policy"
            );
        }

        let spi = Self::peer_esp_spi(sa)?;
        if from_initiator {
            self.esp_spi_i = spi;
        } else {
            self.esp_spi_r = spi;
        }
        Ok(())
    }

    /// Validate the initiator's IKE_AUTH request (responder side). Every
    /// failure collapses to AUTHENTICATION_FAILED on the wire.
    pub(super) fn handle_auth_request(&mut self, msg: &Message) -> Result<()> {
        if !msg.header.flags.initiator || msg.header.flags.response {
            return Err(Error::Protocol(IkeError::AuthenticationFailed));
        }
        match self.check_auth_payloads(msg, true) {
            Ok(()) => {
                if msg.notify(NotifyType::InitialContact).is_some() {
                    debug!("peer announces initial contact");
                }
                info!(spi_i = %hex::encode(self.spi_i), "peer authenticated (responder)");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "IKE_AUTH request rejected");
                Err(Error::Protocol(IkeError::AuthenticationFailed))
            }
        }
    }

    /// Validate the responder's IKE_AUTH response (initiator side).
    pub(super) fn handle_auth_response(&mut self, msg: &Message) -> Result<AuthOutcome> {
        if !msg.header.flags.response {
            return Err(Error::Protocol(IkeError::AuthenticationFailed));
        }

        // an error notify means the responder refused us; do not answer it
        for n in msg.notifies() {
            if let Some(code) = IkeError::from_notify(n.notify_type) {
                warn!(notify = %code, "IKE_AUTH rejected by peer");
                return Ok(AuthOutcome::PeerRejected(code));
            }
        }

        match self.check_auth_payloads(msg, false) {
            Ok(()) => {
                info!(
                    spi_i = %hex::encode(self.spi_i),
                    spi_r = %hex::encode(self.spi_r),
                    "peer authenticated (initiator)"
                );
                Ok(AuthOutcome::Proceed)
            }
            Err(e) => {
                warn!(error = %e, "IKE_AUTH response rejected");
                Err(Error::Protocol(IkeError::AuthenticationFailed))
            }
        }
    }
}
