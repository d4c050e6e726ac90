//! INFORMATIONAL exchange and the standalone notify/delete senders
//!
//! Deletes, error notifies, keepalives and the NO_ADDITIONAL_SAS refusal
//! all live here. Before SK keys exist, notifies go out in clear inside an
//! IKE_SA_INIT response; afterwards everything is encrypted.

use super::constants::{ExchangeType, IkeFlags, NotifyType, PayloadType, ProtocolId, IKE_VERSION};
use super::error::{Error, IkeError, Result};
use super::message::{IkeHeader, Message};
use super::payload::{DeletePayload, NotifyPayload, Payload};
use super::session::Session;
use tracing::{debug, info, warn};

impl Session {
    fn informational_header(&self, exchange: ExchangeType, encrypted: bool, is_response: bool, msg_id: u32) -> IkeHeader {
        IkeHeader {
            spi_i: self.spi_i,
            spi_r: self.spi_r,
            next_payload: if encrypted {
                PayloadType::Sk.to_u8()
            } else {
                PayloadType::None.to_u8()
            },
            major_version: IKE_VERSION >> 4,
            minor_version: IKE_VERSION & 0x0f,
            exchange_type: exchange,
            flags: IkeFlags::outbound(self.is_initiator, is_response),
            msg_id,
            length: 0,
        }
    }

    /// Queue a notify carrying `code`. Encrypted under the session keys
    /// when they exist, otherwise a clear IKE_SA_INIT response.
    /// INVALID_KE_PAYLOAD automatically carries the expected group number.
    ///
    /// `exchange` pins the exchange type when the notify answers a
    /// specific request; `None` picks IKE_SA_INIT pre-keys and
    /// INFORMATIONAL after.
    pub(super) fn send_notify_message(
        &mut self,
        code: IkeError,
        data: Option<Vec<u8>>,
        is_response: bool,
        exchange: Option<ExchangeType>,
    ) -> Result<()> {
        let data = match data {
            Some(d) => d,
            None if code == IkeError::InvalidKePayload => self
                .cfg
                .dh_transform_id()
                .map(|g| g.to_be_bytes().to_vec())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let payloads = vec![Payload::Notify(NotifyPayload::new(code.notify_type(), data))];
        let encrypted = self.tkm.has_keys();
        let exchange = exchange.unwrap_or(if encrypted {
            ExchangeType::Informational
        } else {
            ExchangeType::IkeSaInit
        });
        let msg_id = self.msg_id_inc(is_response);
        let header = self.informational_header(exchange, encrypted, is_response, msg_id);
        let msg = Message::new(header, payloads);
        let tkm = encrypted.then_some(&self.tkm);
        let bytes = msg.encode(tkm, self.is_initiator)?;
        debug!(code = %code, encrypted, is_response, "sending notify");
        if is_response {
            self.enqueue_response(msg_id, bytes);
        } else {
            self.enqueue_request(bytes);
        }
        Ok(())
    }

    /// Queue the encrypted Delete for this IKE SA
    pub(super) fn send_delete(&mut self) -> Result<()> {
        let msg_id = self.msg_id_inc(false);
        let header =
            self.informational_header(ExchangeType::Informational, true, false, msg_id);
        let msg = Message::new(header, vec![Payload::Delete(DeletePayload::for_ike())]);
        let bytes = msg.encode(Some(&self.tkm), self.is_initiator)?;
        self.enqueue_request(bytes);
        Ok(())
    }

    /// Queue an empty INFORMATIONAL. As a request this is a keepalive; as
    /// a response it acknowledges a peer's request (typically its Delete).
    pub fn send_empty_informational(&mut self, is_response: bool) -> Result<()> {
        let msg_id = self.msg_id_inc(is_response);
        let header =
            self.informational_header(ExchangeType::Informational, true, is_response, msg_id);
        let msg = Message::new(header, vec![]);
        let bytes = msg.encode(Some(&self.tkm), self.is_initiator)?;
        if is_response {
            self.enqueue_response(msg_id, bytes);
        } else {
            self.enqueue_request(bytes);
        }
        Ok(())
    }

    /// Refuse a peer CREATE_CHILD_SA request: the response carries
    /// NO_ADDITIONAL_SAS and the session stays mature.
    pub(super) fn refuse_child_sa(&mut self, request: &Message) -> Result<()> {
        if request.header.flags.response {
            // our own rekey requests do not exist yet, so a response here
            // is a peer refusing something we never sent
            debug!("ignoring CREATE_CHILD_SA response");
            return Ok(());
        }
        info!("refusing peer CREATE_CHILD_SA request");
        let msg_id = self.msg_id_inc(true);
        debug_assert_eq!(msg_id, request.header.msg_id);
        let header =
            self.informational_header(ExchangeType::CreateChildSa, true, true, msg_id);
        let msg = Message::new(
            header,
            vec![Payload::Notify(NotifyPayload::new(
                NotifyType::NoAdditionalSas,
                vec![],
            ))],
        );
        let bytes = msg.encode(Some(&self.tkm), self.is_initiator)?;
        self.enqueue_response(msg_id, bytes);
        Ok(())
    }

    /// Process a decrypted INFORMATIONAL message: peer deletes, error
    /// notifies, keepalives.
    pub(super) fn handle_informational(&mut self, msg: &Message) -> Result<()> {
        let is_request = !msg.header.flags.response;

        if let Some(delete) = msg.delete() {
            if delete.protocol_id == ProtocolId::Ike && is_request {
                info!("peer closed the IKE SA");
                // the ack needs keys; a pre-key delete just tears down
                if self.tkm.has_keys() {
                    self.send_empty_informational(true)?;
                }
                self.begin_teardown(None, false);
                return Ok(());
            }
            debug!(protocol = ?delete.protocol_id, "delete processed");
            return Ok(());
        }

        if let Some(err) = msg
            .notifies()
            .find_map(|n| IkeError::from_notify(n.notify_type))
        {
            // an error notify is never answered with another error
            warn!(notify = %err, "peer reported an error");
            if self.state != super::state::State::Mature {
                self.begin_teardown(Some(Error::Protocol(err)), false);
            }
            return Ok(());
        }

        if msg.payloads.is_empty() {
            if is_request {
                // keepalive probe
                self.send_empty_informational(true)?;
            }
            // an empty response just acknowledges our last request
            return Ok(());
        }

        debug!(payloads = msg.payloads.len(), "informational ignored");
        Ok(())
    }
}
