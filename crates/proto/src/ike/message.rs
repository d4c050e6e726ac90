//! IKE message: header codec and the generic payload chain
//!
//! A [`Message`] owns its decoded payloads and the raw wire buffer it was
//! parsed from; the raw bytes of the two IKE_SA_INIT messages feed the AUTH
//! computation later, so they must survive decode intact.

use super::constants::{
    ExchangeType, IkeFlags, PayloadType, IKE_HEADER_LEN, IKE_MAJOR_VERSION, MAX_IKE_MESSAGE_LEN,
    PAYLOAD_HEADER_LEN,
};
use super::error::{Error, IkeError, Result};
use super::payload::{
    AuthPayload, DeletePayload, IdPayload, KePayload, NoncePayload, NotifyPayload, Payload,
    PayloadHeader, SaPayload, SkPayload, TsPayload,
};
use super::tkm::Tkm;

/*
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   |                       IKE SA Initiator's SPI                  |
   |                                                               |
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   |                       IKE SA Responder's SPI                  |
   |                                                               |
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   |                          Message ID                           |
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   |                            Length                             |
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

/// Fixed 28-byte IKE header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeHeader {
    /// Initiator SPI
    pub spi_i: [u8; 8],
    /// Responder SPI (zero in the first INIT request)
    pub spi_r: [u8; 8],
    /// Type of the first payload (SK for encrypted messages)
    pub next_payload: u8,
    /// Major protocol version (must be 2)
    pub major_version: u8,
    /// Minor protocol version
    pub minor_version: u8,
    /// Exchange this message belongs to
    pub exchange_type: ExchangeType,
    /// Flags octet
    pub flags: IkeFlags,
    /// Message ID
    pub msg_id: u32,
    /// Total message length including this header
    pub length: u32,
}

impl IkeHeader {
    /// Decode the fixed header from the front of a datagram.
    ///
    /// # Errors
    ///
    /// `InvalidSyntax` for truncated or over-long buffers and unknown
    /// exchange types; `InvalidMajorVersion` when the peer speaks
    /// something other than IKEv2.
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < IKE_HEADER_LEN {
            return Err(Error::invalid_syntax());
        }
        let mut spi_i = [0u8; 8];
        let mut spi_r = [0u8; 8];
        spi_i.copy_from_slice(&b[0..8]);
        spi_r.copy_from_slice(&b[8..16]);

        let next_payload = b[16];
        let major_version = b[17] >> 4;
        let minor_version = b[17] & 0x0f;
        if major_version != IKE_MAJOR_VERSION {
            return Err(Error::Protocol(IkeError::InvalidMajorVersion));
        }
        let exchange_type = ExchangeType::from_u8(b[18]).ok_or_else(Error::invalid_syntax)?;
        let flags = IkeFlags::from_octet(b[19]);
        let msg_id = u32::from_be_bytes([b[20], b[21], b[22], b[23]]);
        let length = u32::from_be_bytes([b[24], b[25], b[26], b[27]]);
        if length < IKE_HEADER_LEN as u32 || length > MAX_IKE_MESSAGE_LEN {
            return Err(Error::invalid_syntax());
        }
        Ok(IkeHeader {
            spi_i,
            spi_r,
            next_payload,
            major_version,
            minor_version,
            exchange_type,
            flags,
            msg_id,
            length,
        })
    }

    /// Encode the header into its 28-byte wire form
    pub fn encode(&self) -> [u8; IKE_HEADER_LEN] {
        let mut b = [0u8; IKE_HEADER_LEN];
        b[0..8].copy_from_slice(&self.spi_i);
        b[8..16].copy_from_slice(&self.spi_r);
        b[16] = self.next_payload;
        b[17] = (self.major_version << 4) | self.minor_version;
        b[18] = self.exchange_type.to_u8();
        b[19] = self.flags.to_octet();
        b[20..24].copy_from_slice(&self.msg_id.to_be_bytes());
        b[24..28].copy_from_slice(&self.length.to_be_bytes());
        b
    }
}

/// Parse a payload chain.
///
/// `first` is the type octet announced by the IKE header (or by the SK
/// payload header for decrypted bodies). The chain must consume `b`
/// exactly; trailing bytes are a syntax error.
pub(crate) fn parse_chain(mut next: u8, mut b: &[u8]) -> Result<Vec<Payload>> {
    let mut payloads = Vec::new();
    while next != PayloadType::None.to_u8() {
        let header = PayloadHeader::decode(b)?;
        if b.len() < header.length as usize {
            return Err(Error::invalid_syntax());
        }
        let body = &b[PAYLOAD_HEADER_LEN..header.length as usize];
        payloads.push(Payload::decode(next, header.critical, body)?);
        next = header.next_payload;
        b = &b[header.length as usize..];
    }
    if !b.is_empty() {
        return Err(Error::invalid_syntax());
    }
    Ok(payloads)
}

/// Encode a payload chain. Each payload's generic header carries the
/// type of its successor; the last one points at None.
pub(crate) fn encode_chain(payloads: &[Payload], out: &mut Vec<u8>) {
    for (idx, p) in payloads.iter().enumerate() {
        let next = if idx + 1 < payloads.len() {
            payloads[idx + 1].payload_type()
        } else {
            PayloadType::None.to_u8()
        };
        let mut body = Vec::new();
        p.encode_body(&mut body);
        PayloadHeader::encode(next, body.len(), out);
        out.extend_from_slice(&body);
    }
}

/// A decoded (or under-construction) IKE message
#[derive(Debug, Clone)]
pub struct Message {
    /// The fixed header
    pub header: IkeHeader,
    /// Payloads, in wire order. For a decrypted message these are the
    /// inner payloads; the SK wrapper itself is not kept.
    pub payloads: Vec<Payload>,
    /// Raw wire bytes this message was decoded from (empty for messages
    /// built locally)
    pub raw: Vec<u8>,
}

impl Message {
    /// Build an outgoing message. `next_payload` in `header` decides the
    /// encoding path: SK means the payloads are sealed by the TKM.
    pub fn new(header: IkeHeader, payloads: Vec<Payload>) -> Self {
        Message {
            header,
            payloads,
            raw: Vec::new(),
        }
    }

    /// Decode a whole datagram: header, then the (cleartext) payload
    /// chain. Encrypted messages keep their SK payload opaque until
    /// [`Message::decrypt_in_place`] runs with the session keys.
    pub fn decode(b: &[u8]) -> Result<Self> {
        let header = IkeHeader::decode(b)?;
        if b.len() < header.length as usize {
            return Err(Error::invalid_syntax());
        }
        let body = &b[IKE_HEADER_LEN..header.length as usize];
        let payloads = if header.next_payload == PayloadType::Sk.to_u8() {
            // keep the wrapper; the session decrypts once keys exist
            let ph = PayloadHeader::decode(body)?;
            if body.len() != ph.length as usize {
                return Err(Error::invalid_syntax());
            }
            vec![Payload::Sk(SkPayload {
                first_payload: ph.next_payload,
                body: body[PAYLOAD_HEADER_LEN..].to_vec(),
            })]
        } else {
            parse_chain(header.next_payload, body)?
        };
        let length = header.length as usize;
        Ok(Message {
            header,
            payloads,
            raw: b[..length].to_vec(),
        })
    }

    /// Replace the opaque SK payload with the decrypted inner chain.
    ///
    /// Verifies the ICV over the whole datagram, decrypts, strips padding
    /// and parses the inner payloads. No-op for cleartext messages.
    pub fn decrypt_in_place(&mut self, tkm: &Tkm, is_initiator: bool) -> Result<()> {
        if self.header.next_payload != PayloadType::Sk.to_u8() {
            return Ok(());
        }
        let first = match self.payloads.first() {
            Some(Payload::Sk(sk)) => sk.first_payload,
            _ => return Err(Error::invalid_syntax()),
        };
        let clear = tkm.verify_decrypt(&self.raw, is_initiator)?;
        self.payloads = parse_chain(first, &clear)?;
        Ok(())
    }

    /// Encode for the wire. Messages whose header announces SK are sealed
    /// with the TKM (encrypt + ICV); everything else encodes in clear.
    pub fn encode(&self, tkm: Option<&Tkm>, is_initiator: bool) -> Result<Vec<u8>> {
        if self.header.next_payload == PayloadType::Sk.to_u8() {
            let tkm = tkm.ok_or(Error::CryptoKeysMissing)?;
            tkm.encrypt_mac(self, is_initiator)
        } else {
            let mut body = Vec::new();
            encode_chain(&self.payloads, &mut body);
            let mut header = self.header.clone();
            header.next_payload = self
                .payloads
                .first()
                .map(|p| p.payload_type())
                .unwrap_or(PayloadType::None.to_u8());
            header.length = (body.len() + IKE_HEADER_LEN) as u32;
            let mut out = Vec::with_capacity(header.length as usize);
            out.extend_from_slice(&header.encode());
            out.extend_from_slice(&body);
            Ok(out)
        }
    }

    /// Check the required payload types are all present.
    ///
    /// # Errors
    ///
    /// `InvalidSyntax` naming nothing specific; the missing set is logged
    /// by callers that care.
    pub fn ensure_payloads(&self, required: &[PayloadType]) -> Result<()> {
        let missing: Vec<PayloadType> = required
            .iter()
            .copied()
            .filter(|t| !self.payloads.iter().any(|p| p.payload_type() == t.to_u8()))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            tracing::debug!(?missing, "required payloads absent");
            Err(Error::invalid_syntax())
        }
    }

    /// First payload with an unknown type and the critical bit set, if any
    pub fn unknown_critical(&self) -> Option<u8> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Unknown {
                payload_type,
                critical: true,
                ..
            } => Some(*payload_type),
            _ => None,
        })
    }

    /// The SA payload, if present
    pub fn sa(&self) -> Option<&SaPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Sa(sa) => Some(sa),
            _ => None,
        })
    }

    /// The KE payload, if present
    pub fn ke(&self) -> Option<&KePayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Ke(ke) => Some(ke),
            _ => None,
        })
    }

    /// The nonce payload, if present
    pub fn nonce(&self) -> Option<&NoncePayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Nonce(n) => Some(n),
            _ => None,
        })
    }

    /// The IDi payload, if present
    pub fn id_i(&self) -> Option<&IdPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::IdI(id) => Some(id),
            _ => None,
        })
    }

    /// The IDr payload, if present
    pub fn id_r(&self) -> Option<&IdPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::IdR(id) => Some(id),
            _ => None,
        })
    }

    /// The AUTH payload, if present
    pub fn auth(&self) -> Option<&AuthPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Auth(a) => Some(a),
            _ => None,
        })
    }

    /// The TSi payload, if present
    pub fn ts_i(&self) -> Option<&TsPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::TsI(ts) => Some(ts),
            _ => None,
        })
    }

    /// The TSr payload, if present
    pub fn ts_r(&self) -> Option<&TsPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::TsR(ts) => Some(ts),
            _ => None,
        })
    }

    /// The Delete payload, if present
    pub fn delete(&self) -> Option<&DeletePayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Delete(d) => Some(d),
            _ => None,
        })
    }

    /// All Notify payloads, in order
    pub fn notifies(&self) -> impl Iterator<Item = &NotifyPayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Notify(n) => Some(n),
            _ => None,
        })
    }

    /// The notify of a given type, if present
    pub fn notify(&self, nt: super::constants::NotifyType) -> Option<&NotifyPayload> {
        self.notifies().find(|n| n.notify_type == nt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ike::constants::{dh, NotifyType, ProtocolId};
    use crate::ike::proposal::ike_aes_cbc_sha1_96_modp2048;

    fn sample_header(next: u8) -> IkeHeader {
        IkeHeader {
            spi_i: [1, 2, 3, 4, 5, 6, 7, 8],
            spi_r: [0; 8],
            next_payload: next,
            major_version: 2,
            minor_version: 0,
            exchange_type: ExchangeType::IkeSaInit,
            flags: IkeFlags::outbound(true, false),
            msg_id: 0,
            length: 0,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let mut h = sample_header(PayloadType::Sa.to_u8());
        h.length = 100;
        let bytes = h.encode();
        let dec = IkeHeader::decode(&bytes).unwrap();
        assert_eq!(dec, h);
    }

    #[test]
    fn test_header_too_short() {
        assert!(matches!(
            IkeHeader::decode(&[0u8; 27]),
            Err(Error::Protocol(IkeError::InvalidSyntax))
        ));
    }

    #[test]
    fn test_header_bad_version() {
        let mut h = sample_header(0);
        h.length = 28;
        let mut b = h.encode();
        b[17] = 0x10; // IKEv1
        assert!(matches!(
            IkeHeader::decode(&b),
            Err(Error::Protocol(IkeError::InvalidMajorVersion))
        ));
    }

    #[test]
    fn test_header_bad_length() {
        let mut h = sample_header(0);
        h.length = 27;
        assert!(IkeHeader::decode(&h.encode()).is_err());
    }

    #[test]
    fn test_header_unknown_exchange() {
        let mut h = sample_header(0);
        h.length = 28;
        let mut b = h.encode();
        b[18] = 99;
        assert!(IkeHeader::decode(&b).is_err());
    }

    fn sample_message() -> Message {
        let payloads = vec![
            Payload::Sa(SaPayload {
                proposals: vec![ike_aes_cbc_sha1_96_modp2048().to_proposal(
                    1,
                    ProtocolId::Ike,
                    &[1, 2, 3, 4, 5, 6, 7, 8],
                )],
            }),
            Payload::Ke(KePayload {
                dh_group: dh::MODP_2048,
                key_data: vec![0xAB; 256],
            }),
            Payload::Nonce(NoncePayload::new(vec![0xCD; 32]).unwrap()),
        ];
        Message::new(sample_header(PayloadType::Sa.to_u8()), payloads)
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = sample_message();
        let wire = msg.encode(None, true).unwrap();
        let dec = Message::decode(&wire).unwrap();
        assert_eq!(dec.header.length as usize, wire.len());
        assert_eq!(dec.payloads, msg.payloads);
        assert_eq!(dec.raw, wire);
        // round-trip law: encode(decode(w)) == w
        assert_eq!(dec.encode(None, true).unwrap(), wire);
    }

    #[test]
    fn test_message_truncated_buffer() {
        let wire = sample_message().encode(None, true).unwrap();
        assert!(Message::decode(&wire[..wire.len() - 1]).is_err());
    }

    #[test]
    fn test_chain_must_land_exactly() {
        let mut wire = sample_message().encode(None, true).unwrap();
        // declare a longer message than the chain encodes
        let bad_len = (wire.len() + 8) as u32;
        wire[24..28].copy_from_slice(&bad_len.to_be_bytes());
        wire.extend_from_slice(&[0u8; 8]);
        assert!(Message::decode(&wire).is_err());
    }

    #[test]
    fn test_ensure_payloads() {
        let msg = sample_message();
        assert!(msg
            .ensure_payloads(&[PayloadType::Sa, PayloadType::Ke, PayloadType::Nonce])
            .is_ok());
        assert!(msg.ensure_payloads(&[PayloadType::Auth]).is_err());
    }

    #[test]
    fn test_unknown_critical_detection() {
        let mut msg = sample_message();
        assert_eq!(msg.unknown_critical(), None);
        msg.payloads.push(Payload::Unknown {
            payload_type: 49,
            critical: true,
            body: vec![],
        });
        // re-encode keeps the critical bit clear (we never send critical
        // unknowns), so test detection on the in-memory form only
        assert_eq!(msg.unknown_critical(), Some(49));
    }

    #[test]
    fn test_notify_lookup() {
        let mut msg = sample_message();
        msg.payloads.push(Payload::Notify(NotifyPayload::new(
            NotifyType::Cookie,
            vec![1, 2, 3],
        )));
        assert!(msg.notify(NotifyType::Cookie).is_some());
        assert!(msg.notify(NotifyType::InitialContact).is_none());
        assert_eq!(msg.notifies().count(), 1);
    }

    #[test]
    fn test_empty_message_encodes_none_next() {
        let msg = Message::new(sample_header(PayloadType::None.to_u8()), vec![]);
        let wire = msg.encode(None, true).unwrap();
        assert_eq!(wire.len(), IKE_HEADER_LEN);
        assert_eq!(wire[16], 0);
        let dec = Message::decode(&wire).unwrap();
        assert!(dec.payloads.is_empty());
    }
}
