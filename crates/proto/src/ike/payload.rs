//! IKEv2 payload dialects (RFC 7296 Section 3)
//!
//! Every payload is one arm of the [`Payload`] sum; decoding dispatches on
//! the preceding NextPayload octet, encoding is a `match`. Payload types we
//! do not implement land in [`Payload::Unknown`], which keeps the critical
//! bit so the message layer can answer UNSUPPORTED_CRITICAL_PAYLOAD.

use super::constants::{
    AuthMethod, IdType, NotifyType, PayloadType, ProtocolId, TsType,
};
use super::error::{Error, Result};
use super::proposal::{decode_proposals, encode_proposals, Proposal};
use std::net::IpAddr;

/*
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   | Next Payload  |C|  RESERVED   |         Payload Length        |
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

/// Generic payload header: next payload type, critical bit, total length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Type of the payload that follows (None terminates the chain)
    pub next_payload: u8,
    /// Critical bit
    pub critical: bool,
    /// Total payload length including this 4-byte header
    pub length: u16,
}

impl PayloadHeader {
    /// Encoded size
    pub const LEN: usize = 4;

    /// Decode from the first four octets of `b`
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < Self::LEN {
            return Err(Error::invalid_syntax());
        }
        let length = u16::from_be_bytes([b[2], b[3]]);
        if (length as usize) < Self::LEN {
            return Err(Error::invalid_syntax());
        }
        Ok(PayloadHeader {
            next_payload: b[0],
            critical: b[1] & 0x80 != 0,
            length,
        })
    }

    /// Append the encoded header for a body of `body_len` octets
    pub fn encode(next_payload: u8, body_len: usize, out: &mut Vec<u8>) {
        out.push(next_payload);
        out.push(0);
        out.extend_from_slice(&((body_len + Self::LEN) as u16).to_be_bytes());
    }
}

/// Security Association payload: a list of proposals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPayload {
    /// Offered (or selected) proposals
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    fn decode(b: &[u8]) -> Result<Self> {
        Ok(SaPayload {
            proposals: decode_proposals(b)?,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        encode_proposals(&self.proposals, out);
    }
}

/// Key Exchange payload: DH group number plus the sender's public value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KePayload {
    /// Diffie-Hellman group number
    pub dh_group: u16,
    /// Public value, group-sized big-endian octets
    pub key_data: Vec<u8>,
}

impl KePayload {
    fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < 4 {
            return Err(Error::invalid_syntax());
        }
        Ok(KePayload {
            dh_group: u16::from_be_bytes([b[0], b[1]]),
            key_data: b[4..].to_vec(),
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.dh_group.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.key_data);
    }
}

/// Nonce payload: 16 to 256 octets of random data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePayload {
    /// The nonce octets
    pub nonce: Vec<u8>,
}

impl NoncePayload {
    /// Minimum nonce size
    pub const MIN_LEN: usize = 16;
    /// Maximum nonce size
    pub const MAX_LEN: usize = 256;

    /// Wrap nonce octets, enforcing the RFC size window
    pub fn new(nonce: Vec<u8>) -> Result<Self> {
        if nonce.len() < Self::MIN_LEN || nonce.len() > Self::MAX_LEN {
            return Err(Error::invalid_syntax());
        }
        Ok(NoncePayload { nonce })
    }

    fn decode(b: &[u8]) -> Result<Self> {
        Self::new(b.to_vec())
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.nonce);
    }
}

/// Identification payload (IDi and IDr share the layout)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    /// Kind of identifier
    pub id_type: IdType,
    /// Identification data
    pub data: Vec<u8>,
}

impl IdPayload {
    fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < 4 {
            return Err(Error::invalid_syntax());
        }
        let id_type = IdType::from_u8(b[0]).ok_or_else(Error::invalid_syntax)?;
        Ok(IdPayload {
            id_type,
            data: b[4..].to_vec(),
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.id_type.to_u8());
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&self.data);
    }

    /// The encoded body (type + reserved + data), as fed to the AUTH prf
    pub fn to_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        self.encode(&mut out);
        out
    }
}

/// Authentication payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// Authentication method
    pub method: AuthMethod,
    /// Signature / MAC data
    pub data: Vec<u8>,
}

impl AuthPayload {
    fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < 4 {
            return Err(Error::invalid_syntax());
        }
        let method = AuthMethod::from_u8(b[0]).ok_or_else(Error::invalid_syntax)?;
        Ok(AuthPayload {
            method,
            data: b[4..].to_vec(),
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.method.to_u8());
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&self.data);
    }
}

/// Notify payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Protocol the notification concerns
    pub protocol_id: ProtocolId,
    /// Notification type
    pub notify_type: NotifyType,
    /// SPI the notification concerns (often empty)
    pub spi: Vec<u8>,
    /// Notification data
    pub data: Vec<u8>,
}

impl NotifyPayload {
    /// Notification with no SPI
    pub fn new(notify_type: NotifyType, data: Vec<u8>) -> Self {
        NotifyPayload {
            protocol_id: ProtocolId::Ike,
            notify_type,
            spi: Vec::new(),
            data,
        }
    }

    fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < 4 {
            return Err(Error::invalid_syntax());
        }
        let protocol_id = ProtocolId::from_u8(b[0]).ok_or_else(Error::invalid_syntax)?;
        let spi_len = b[1] as usize;
        let nt = u16::from_be_bytes([b[2], b[3]]);
        let notify_type = NotifyType::from_u16(nt).ok_or_else(Error::invalid_syntax)?;
        if b.len() < 4 + spi_len {
            return Err(Error::invalid_syntax());
        }
        Ok(NotifyPayload {
            protocol_id,
            notify_type,
            spi: b[4..4 + spi_len].to_vec(),
            data: b[4 + spi_len..].to_vec(),
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.protocol_id.to_u8());
        out.push(self.spi.len() as u8);
        out.extend_from_slice(&self.notify_type.to_u16().to_be_bytes());
        out.extend_from_slice(&self.spi);
        out.extend_from_slice(&self.data);
    }
}

/// Delete payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol whose SAs are deleted
    pub protocol_id: ProtocolId,
    /// Size of each SPI (0 for IKE, 4 for ESP)
    pub spi_len: u8,
    /// Deleted SPIs
    pub spis: Vec<Vec<u8>>,
}

impl DeletePayload {
    /// Delete for the IKE SA itself (no SPI list)
    pub fn for_ike() -> Self {
        DeletePayload {
            protocol_id: ProtocolId::Ike,
            spi_len: 0,
            spis: Vec::new(),
        }
    }

    fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < 4 {
            return Err(Error::invalid_syntax());
        }
        let protocol_id = ProtocolId::from_u8(b[0]).ok_or_else(Error::invalid_syntax)?;
        let spi_len = b[1];
        let num = u16::from_be_bytes([b[2], b[3]]) as usize;
        let need = num * spi_len as usize;
        if b.len() < 4 + need {
            return Err(Error::invalid_syntax());
        }
        let mut spis = Vec::with_capacity(num);
        for i in 0..num {
            let at = 4 + i * spi_len as usize;
            spis.push(b[at..at + spi_len as usize].to_vec());
        }
        Ok(DeletePayload {
            protocol_id,
            spi_len,
            spis,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.protocol_id.to_u8());
        out.push(self.spi_len);
        out.extend_from_slice(&(self.spis.len() as u16).to_be_bytes());
        for spi in &self.spis {
            out.extend_from_slice(spi);
        }
    }
}

/*
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   |   TS Type     |IP Protocol ID*|       Selector Length         |
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   |           Start Port*         |           End Port*           |
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   ~                         Starting Address*                     ~
   ~                         Ending Address*                       ~
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

/// One traffic selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    /// Address family / selector type
    pub ts_type: TsType,
    /// IP protocol number (0 = any)
    pub ip_protocol: u8,
    /// First port of the range
    pub start_port: u16,
    /// Last port of the range
    pub end_port: u16,
    /// First address of the range
    pub start_addr: IpAddr,
    /// Last address of the range
    pub end_addr: IpAddr,
}

impl Selector {
    /// Selector covering a single host, all ports and protocols
    pub fn for_host(addr: IpAddr) -> Self {
        let ts_type = match addr {
            IpAddr::V4(_) => TsType::Ipv4AddrRange,
            IpAddr::V6(_) => TsType::Ipv6AddrRange,
        };
        Selector {
            ts_type,
            ip_protocol: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: addr,
            end_addr: addr,
        }
    }

    fn addr_len(ts_type: TsType) -> usize {
        match ts_type {
            TsType::Ipv4AddrRange => 4,
            TsType::Ipv6AddrRange => 16,
        }
    }

    fn decode(b: &[u8]) -> Result<(Self, usize)> {
        if b.len() < 8 {
            return Err(Error::invalid_syntax());
        }
        let ts_type = TsType::from_u8(b[0]).ok_or_else(Error::invalid_syntax)?;
        let ip_protocol = b[1];
        let sel_len = u16::from_be_bytes([b[2], b[3]]) as usize;
        let iplen = Self::addr_len(ts_type);
        if sel_len != 8 + 2 * iplen || b.len() < sel_len {
            return Err(Error::invalid_syntax());
        }
        let start_port = u16::from_be_bytes([b[4], b[5]]);
        let end_port = u16::from_be_bytes([b[6], b[7]]);
        let parse_addr = |o: &[u8]| -> IpAddr {
            match ts_type {
                TsType::Ipv4AddrRange => {
                    IpAddr::from(<[u8; 4]>::try_from(o).expect("length checked"))
                }
                TsType::Ipv6AddrRange => {
                    IpAddr::from(<[u8; 16]>::try_from(o).expect("length checked"))
                }
            }
        };
        Ok((
            Selector {
                ts_type,
                ip_protocol,
                start_port,
                end_port,
                start_addr: parse_addr(&b[8..8 + iplen]),
                end_addr: parse_addr(&b[8 + iplen..8 + 2 * iplen]),
            },
            sel_len,
        ))
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let iplen = Self::addr_len(self.ts_type);
        out.push(self.ts_type.to_u8());
        out.push(self.ip_protocol);
        out.extend_from_slice(&((8 + 2 * iplen) as u16).to_be_bytes());
        out.extend_from_slice(&self.start_port.to_be_bytes());
        out.extend_from_slice(&self.end_port.to_be_bytes());
        let push_addr = |addr: &IpAddr, out: &mut Vec<u8>| match addr {
            IpAddr::V4(a) => out.extend_from_slice(&a.octets()),
            IpAddr::V6(a) => out.extend_from_slice(&a.octets()),
        };
        push_addr(&self.start_addr, out);
        push_addr(&self.end_addr, out);
    }
}

/// Traffic selector payload (TSi and TSr share the layout)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsPayload {
    /// The selectors
    pub selectors: Vec<Selector>,
}

impl TsPayload {
    fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < 4 {
            return Err(Error::invalid_syntax());
        }
        let num = b[0] as usize;
        let mut rest = &b[4..];
        let mut selectors = Vec::with_capacity(num);
        while !rest.is_empty() {
            let (sel, used) = Selector::decode(rest)?;
            selectors.push(sel);
            rest = &rest[used..];
        }
        if selectors.len() != num {
            return Err(Error::invalid_syntax());
        }
        Ok(TsPayload { selectors })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.selectors.len() as u8);
        out.extend_from_slice(&[0, 0, 0]);
        for sel in &self.selectors {
            sel.encode(out);
        }
    }
}

/// Encrypted and Authenticated payload, kept opaque at the codec layer.
///
/// `body` is `IV | ciphertext [| pad | pad_len] [| ICV]` exactly as on the
/// wire; the TKM owns framing and keys. The first inner payload type rides
/// in this payload's generic header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkPayload {
    /// Type of the first payload inside the ciphertext
    pub first_payload: u8,
    /// Raw encrypted body
    pub body: Vec<u8>,
}

/// The payload sum
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Security Association
    Sa(SaPayload),
    /// Key Exchange
    Ke(KePayload),
    /// Nonce
    Nonce(NoncePayload),
    /// Identification - Initiator
    IdI(IdPayload),
    /// Identification - Responder
    IdR(IdPayload),
    /// Authentication
    Auth(AuthPayload),
    /// Notify
    Notify(NotifyPayload),
    /// Delete
    Delete(DeletePayload),
    /// Traffic Selector - Initiator
    TsI(TsPayload),
    /// Traffic Selector - Responder
    TsR(TsPayload),
    /// Encrypted and Authenticated
    Sk(SkPayload),
    /// Any payload type we do not implement
    Unknown {
        /// Wire payload type
        payload_type: u8,
        /// Critical bit from the generic header
        critical: bool,
        /// Raw body
        body: Vec<u8>,
    },
}

impl Payload {
    /// The wire payload type of this payload
    pub fn payload_type(&self) -> u8 {
        match self {
            Payload::Sa(_) => PayloadType::Sa.to_u8(),
            Payload::Ke(_) => PayloadType::Ke.to_u8(),
            Payload::Nonce(_) => PayloadType::Nonce.to_u8(),
            Payload::IdI(_) => PayloadType::IdI.to_u8(),
            Payload::IdR(_) => PayloadType::IdR.to_u8(),
            Payload::Auth(_) => PayloadType::Auth.to_u8(),
            Payload::Notify(_) => PayloadType::Notify.to_u8(),
            Payload::Delete(_) => PayloadType::Delete.to_u8(),
            Payload::TsI(_) => PayloadType::TsI.to_u8(),
            Payload::TsR(_) => PayloadType::TsR.to_u8(),
            Payload::Sk(_) => PayloadType::Sk.to_u8(),
            Payload::Unknown { payload_type, .. } => *payload_type,
        }
    }

    /// Decode a payload body, dispatching on the type octet the previous
    /// payload (or the IKE header) announced.
    pub fn decode(payload_type: u8, critical: bool, body: &[u8]) -> Result<Self> {
        let known = PayloadType::from_u8(payload_type);
        let payload = match known {
            Some(PayloadType::Sa) => Payload::Sa(SaPayload::decode(body)?),
            Some(PayloadType::Ke) => Payload::Ke(KePayload::decode(body)?),
            Some(PayloadType::Nonce) => Payload::Nonce(NoncePayload::decode(body)?),
            Some(PayloadType::IdI) => Payload::IdI(IdPayload::decode(body)?),
            Some(PayloadType::IdR) => Payload::IdR(IdPayload::decode(body)?),
            Some(PayloadType::Auth) => Payload::Auth(AuthPayload::decode(body)?),
            Some(PayloadType::Notify) => {
                // notify types outside our table are legal and ignorable
                // (FRAGMENTATION_SUPPORTED and friends); keep them raw
                // instead of failing the whole chain
                let nt = body
                    .get(2..4)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .ok_or_else(Error::invalid_syntax)?;
                match NotifyType::from_u16(nt) {
                    Some(_) => Payload::Notify(NotifyPayload::decode(body)?),
                    None => Payload::Unknown {
                        payload_type,
                        critical: false,
                        body: body.to_vec(),
                    },
                }
            }
            Some(PayloadType::Delete) => Payload::Delete(DeletePayload::decode(body)?),
            Some(PayloadType::TsI) => Payload::TsI(TsPayload::decode(body)?),
            Some(PayloadType::TsR) => Payload::TsR(TsPayload::decode(body)?),
            // SK is handled by the message layer (needs the header's
            // first-inner-payload octet); reaching here means a nested SK
            Some(PayloadType::Sk) | Some(PayloadType::None) => {
                return Err(Error::invalid_syntax())
            }
            // Vendor ID, CERT, CERTREQ, CP, EAP and everything unassigned
            _ => Payload::Unknown {
                payload_type,
                critical,
                body: body.to_vec(),
            },
        };
        Ok(payload)
    }

    /// Append the encoded body (no generic header) to `out`
    pub fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Payload::Sa(p) => p.encode(out),
            Payload::Ke(p) => p.encode(out),
            Payload::Nonce(p) => p.encode(out),
            Payload::IdI(p) | Payload::IdR(p) => p.encode(out),
            Payload::Auth(p) => p.encode(out),
            Payload::Notify(p) => p.encode(out),
            Payload::Delete(p) => p.encode(out),
            Payload::TsI(p) | Payload::TsR(p) => p.encode(out),
            Payload::Sk(p) => out.extend_from_slice(&p.body),
            Payload::Unknown { body, .. } => out.extend_from_slice(body),
        }
    }

    /// True for an unknown payload whose critical bit is set
    pub fn is_unknown_critical(&self) -> bool {
        matches!(self, Payload::Unknown { critical: true, .. })
    }
}
