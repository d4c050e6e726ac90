//! SA proposal and transform substructures (RFC 7296 Section 3.3)
//!
//! ```text
//! SA Payload
//!   └── Proposal(s)          "Last Substruc": 0 = last, 2 = more
//!         └── Transform(s)   "Last Substruc": 0 = last, 3 = more
//!               └── Attribute(s)   only KeyLength (14) is understood
//! ```

use super::constants::{dh, encr, esn, integ, prf, AttributeType, ProtocolId, TransformType};
use super::error::{Error, IkeError, Result};
use std::collections::BTreeMap;

/// Minimum encoded transform length (no attributes)
const MIN_LEN_TRANSFORM: usize = 8;

/// Minimum encoded proposal length (no SPI, no transforms)
const MIN_LEN_PROPOSAL: usize = 8;

/// Attribute type value for KeyLength, with the AF (short form) bit set
const ATTR_KEY_LENGTH_AF: u16 = 0x8000 | AttributeType::KeyLength as u16;

/// One transform: an algorithm choice of a given type, with an optional
/// key-length attribute (in bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transform {
    /// Transform type (ENCR, PRF, INTEG, DH, ESN)
    pub transform_type: TransformType,
    /// IANA transform ID within the type
    pub transform_id: u16,
    /// KeyLength attribute in bits; 0 means absent
    pub key_length: u16,
}

impl Transform {
    /// Transform without a key-length attribute
    pub fn new(transform_type: TransformType, transform_id: u16) -> Self {
        Transform {
            transform_type,
            transform_id,
            key_length: 0,
        }
    }

    /// Transform with a key-length attribute (bits)
    pub fn with_key_length(transform_type: TransformType, transform_id: u16, bits: u16) -> Self {
        Transform {
            transform_type,
            transform_id,
            key_length: bits,
        }
    }
}

/*
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   | Last Substruc |   RESERVED    |        Transform Length       |
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   |Transform Type |   RESERVED    |          Transform ID         |
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   ~                      Transform Attributes                     ~
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
fn decode_transform(b: &[u8]) -> Result<(Transform, bool, usize)> {
    if b.len() < MIN_LEN_TRANSFORM {
        return Err(Error::invalid_syntax());
    }
    let is_last = b[0] == 0;
    let tr_len = u16::from_be_bytes([b[2], b[3]]) as usize;
    if tr_len < MIN_LEN_TRANSFORM || b.len() < tr_len {
        return Err(Error::invalid_syntax());
    }
    let transform_type =
        TransformType::from_u8(b[4]).ok_or_else(Error::invalid_syntax)?;
    let transform_id = u16::from_be_bytes([b[6], b[7]]);

    let mut key_length = 0u16;
    let mut attrs = &b[MIN_LEN_TRANSFORM..tr_len];
    while !attrs.is_empty() {
        if attrs.len() < 4 {
            return Err(Error::invalid_syntax());
        }
        let at = u16::from_be_bytes([attrs[0], attrs[1]]);
        if at & 0x7fff != AttributeType::KeyLength as u16 {
            // only KeyLength is understood
            return Err(Error::invalid_syntax());
        }
        key_length = u16::from_be_bytes([attrs[2], attrs[3]]);
        attrs = &attrs[4..];
    }

    Ok((
        Transform {
            transform_type,
            transform_id,
            key_length,
        },
        is_last,
        tr_len,
    ))
}

fn encode_transform(tr: &Transform, is_last: bool, out: &mut Vec<u8>) {
    let start = out.len();
    out.push(if is_last { 0 } else { 3 });
    out.push(0);
    out.extend_from_slice(&[0, 0]); // length, patched below
    out.push(tr.transform_type.to_u8());
    out.push(0);
    out.extend_from_slice(&tr.transform_id.to_be_bytes());
    if tr.key_length != 0 {
        out.extend_from_slice(&ATTR_KEY_LENGTH_AF.to_be_bytes());
        out.extend_from_slice(&tr.key_length.to_be_bytes());
    }
    let len = (out.len() - start) as u16;
    out[start + 2..start + 4].copy_from_slice(&len.to_be_bytes());
}

/*
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   | Last Substruc |   RESERVED    |         Proposal Length       |
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   | Proposal Num  |  Protocol ID  |    SPI Size   |Num  Transforms|
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   ~                        SPI (variable)                         ~
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   ~                        <Transforms>                           ~
   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

/// One proposal: an ordered set of transforms for a protocol, plus the
/// sender's SPI for that protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposal number (1-based on the wire)
    pub number: u8,
    /// Protocol the proposal is for (IKE or ESP)
    pub protocol_id: ProtocolId,
    /// Sending entity's SPI (8 octets for IKE, 4 for ESP, may be empty)
    pub spi: Vec<u8>,
    /// Transforms offered
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// Find the first transform of the given type
    pub fn transform(&self, tt: TransformType) -> Option<&Transform> {
        self.transforms.iter().find(|t| t.transform_type == tt)
    }

    /// The DH group offered, if any
    pub fn dh_group(&self) -> Option<u16> {
        self.transform(TransformType::Dh).map(|t| t.transform_id)
    }
}

pub(crate) fn decode_proposal(b: &[u8]) -> Result<(Proposal, bool, usize)> {
    if b.len() < MIN_LEN_PROPOSAL {
        return Err(Error::invalid_syntax());
    }
    let is_last = b[0] == 0;
    let prop_len = u16::from_be_bytes([b[2], b[3]]) as usize;
    if prop_len < MIN_LEN_PROPOSAL || b.len() < prop_len {
        return Err(Error::invalid_syntax());
    }
    let number = b[4];
    let protocol_id = ProtocolId::from_u8(b[5]).ok_or_else(Error::invalid_syntax)?;
    let spi_size = b[6] as usize;
    let num_transforms = b[7] as usize;
    if prop_len < MIN_LEN_PROPOSAL + spi_size {
        return Err(Error::invalid_syntax());
    }
    let spi = b[8..8 + spi_size].to_vec();

    let mut transforms = Vec::new();
    let mut rest = &b[MIN_LEN_PROPOSAL + spi_size..prop_len];
    while !rest.is_empty() {
        let (tr, tr_last, used) = decode_transform(rest)?;
        transforms.push(tr);
        rest = &rest[used..];
        if tr_last {
            if !rest.is_empty() {
                // "last" marker before the declared end
                return Err(Error::invalid_syntax());
            }
            break;
        }
    }
    if transforms.len() != num_transforms {
        return Err(Error::invalid_syntax());
    }

    Ok((
        Proposal {
            number,
            protocol_id,
            spi,
            transforms,
        },
        is_last,
        prop_len,
    ))
}

pub(crate) fn encode_proposal(prop: &Proposal, is_last: bool, out: &mut Vec<u8>) {
    let start = out.len();
    out.push(if is_last { 0 } else { 2 });
    out.push(0);
    out.extend_from_slice(&[0, 0]); // length, patched below
    out.push(prop.number);
    out.push(prop.protocol_id.to_u8());
    out.push(prop.spi.len() as u8);
    out.push(prop.transforms.len() as u8);
    out.extend_from_slice(&prop.spi);
    for (idx, tr) in prop.transforms.iter().enumerate() {
        encode_transform(tr, idx == prop.transforms.len() - 1, out);
    }
    let len = (out.len() - start) as u16;
    out[start + 2..start + 4].copy_from_slice(&len.to_be_bytes());
}

/// Decode the body of an SA payload into its proposals
pub(crate) fn decode_proposals(mut b: &[u8]) -> Result<Vec<Proposal>> {
    let mut proposals = Vec::new();
    while !b.is_empty() {
        let (prop, is_last, used) = decode_proposal(b)?;
        proposals.push(prop);
        b = &b[used..];
        if is_last {
            if !b.is_empty() {
                return Err(Error::invalid_syntax());
            }
            break;
        }
    }
    Ok(proposals)
}

/// Encode proposals as an SA payload body
pub(crate) fn encode_proposals(proposals: &[Proposal], out: &mut Vec<u8>) {
    for (idx, prop) in proposals.iter().enumerate() {
        encode_proposal(prop, idx == proposals.len() - 1, out);
    }
}

/// A configured transform set, keyed by transform type.
///
/// This is the local policy side of negotiation: one entry per type. The
/// map key order (ENCR < PRF < INTEG < DH < ESN) is also the wire encoding
/// order, keeping encodes deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transforms(pub BTreeMap<TransformType, Transform>);

impl Transforms {
    /// Get the configured transform of a type
    pub fn get(&self, tt: TransformType) -> Option<&Transform> {
        self.0.get(&tt)
    }

    /// The configured transforms as an ordered list
    pub fn as_list(&self) -> Vec<Transform> {
        self.0.values().copied().collect()
    }

    /// True if every configured transform occurs in the offered list.
    ///
    /// Key lengths must match exactly; this is the acceptance check run
    /// against each proposal a peer offers.
    pub fn within(&self, offered: &[Transform]) -> bool {
        self.0.values().all(|want| offered.contains(want))
    }

    /// Build a single-proposal list from this set
    pub fn to_proposal(&self, number: u8, protocol_id: ProtocolId, spi: &[u8]) -> Proposal {
        Proposal {
            number,
            protocol_id,
            spi: spi.to_vec(),
            transforms: self.as_list(),
        }
    }

    fn from_list(list: &[Transform]) -> Self {
        let mut map = BTreeMap::new();
        for tr in list {
            map.insert(tr.transform_type, *tr);
        }
        Transforms(map)
    }

    /// Check the set carries everything an IKE suite needs (PRF + DH, and
    /// an encryption transform that is not NULL)
    pub fn check_ike(&self) -> Result<()> {
        let e = self
            .get(TransformType::Encr)
            .ok_or(Error::Protocol(IkeError::NoProposalChosen))?;
        if e.transform_id == encr::NULL {
            return Err(Error::Protocol(IkeError::NoProposalChosen));
        }
        if self.get(TransformType::Prf).is_none() || self.get(TransformType::Dh).is_none() {
            return Err(Error::Protocol(IkeError::NoProposalChosen));
        }
        Ok(())
    }

    /// Check the set is usable for ESP (encryption + ESN present)
    pub fn check_esp(&self) -> Result<()> {
        if self.get(TransformType::Encr).is_none() || self.get(TransformType::Esn).is_none() {
            return Err(Error::Protocol(IkeError::NoProposalChosen));
        }
        Ok(())
    }
}

/// IKE suite: AES-CBC-128 / HMAC-SHA1 / HMAC-SHA1-96 / MODP-1024
pub fn ike_aes_cbc_sha1_96_modp1024() -> Transforms {
    Transforms::from_list(&[
        Transform::with_key_length(TransformType::Encr, encr::AES_CBC, 128),
        Transform::new(TransformType::Prf, prf::HMAC_SHA1),
        Transform::new(TransformType::Integ, integ::HMAC_SHA1_96),
        Transform::new(TransformType::Dh, dh::MODP_1024),
    ])
}

/// IKE suite: AES-CBC-128 / HMAC-SHA1 / HMAC-SHA1-96 / MODP-2048
pub fn ike_aes_cbc_sha1_96_modp2048() -> Transforms {
    Transforms::from_list(&[
        Transform::with_key_length(TransformType::Encr, encr::AES_CBC, 128),
        Transform::new(TransformType::Prf, prf::HMAC_SHA1),
        Transform::new(TransformType::Integ, integ::HMAC_SHA1_96),
        Transform::new(TransformType::Dh, dh::MODP_2048),
    ])
}

/// IKE suite: AES-CBC-256 / HMAC-SHA2-256 / HMAC-SHA2-256-128 / MODP-2048
pub fn ike_aes_cbc_sha2_256_modp2048() -> Transforms {
    Transforms::from_list(&[
        Transform::with_key_length(TransformType::Encr, encr::AES_CBC, 256),
        Transform::new(TransformType::Prf, prf::HMAC_SHA2_256),
        Transform::new(TransformType::Integ, integ::HMAC_SHA2_256_128),
        Transform::new(TransformType::Dh, dh::MODP_2048),
    ])
}

/// IKE suite: Camellia-CBC-256 / HMAC-SHA2-256 / HMAC-SHA2-256-128 / MODP-2048
pub fn ike_camellia_cbc_sha2_256_modp2048() -> Transforms {
    Transforms::from_list(&[
        Transform::with_key_length(TransformType::Encr, encr::CAMELLIA_CBC, 256),
        Transform::new(TransformType::Prf, prf::HMAC_SHA2_256),
        Transform::new(TransformType::Integ, integ::HMAC_SHA2_256_128),
        Transform::new(TransformType::Dh, dh::MODP_2048),
    ])
}

/// IKE suite: AES-GCM-16-128 / HMAC-SHA2-256 (prf) / MODP-2048
pub fn ike_aes_gcm_16_modp2048() -> Transforms {
    Transforms::from_list(&[
        Transform::with_key_length(TransformType::Encr, encr::AES_GCM_16, 128),
        Transform::new(TransformType::Prf, prf::HMAC_SHA2_256),
        Transform::new(TransformType::Dh, dh::MODP_2048),
    ])
}

/// ESP suite: AES-CBC-128 / HMAC-SHA1-96, no ESN
pub fn esp_aes_cbc_sha1_96() -> Transforms {
    Transforms::from_list(&[
        Transform::with_key_length(TransformType::Encr, encr::AES_CBC, 128),
        Transform::new(TransformType::Integ, integ::HMAC_SHA1_96),
        Transform::new(TransformType::Esn, esn::NONE),
    ])
}

/// ESP suite: AES-CBC-256 / HMAC-SHA2-256-128, no ESN
pub fn esp_aes_cbc_sha2_256() -> Transforms {
    Transforms::from_list(&[
        Transform::with_key_length(TransformType::Encr, encr::AES_CBC, 256),
        Transform::new(TransformType::Integ, integ::HMAC_SHA2_256_128),
        Transform::new(TransformType::Esn, esn::NONE),
    ])
}

/// ESP suite: Camellia-CBC-256 / HMAC-SHA2-256-128, no ESN
pub fn esp_camellia_cbc_sha2_256() -> Transforms {
    Transforms::from_list(&[
        Transform::with_key_length(TransformType::Encr, encr::CAMELLIA_CBC, 256),
        Transform::new(TransformType::Integ, integ::HMAC_SHA2_256_128),
        Transform::new(TransformType::Esn, esn::NONE),
    ])
}

/// ESP suite: NULL encryption / HMAC-SHA1-96, no ESN
pub fn esp_null_sha1_96() -> Transforms {
    Transforms::from_list(&[
        Transform::new(TransformType::Encr, encr::NULL),
        Transform::new(TransformType::Integ, integ::HMAC_SHA1_96),
        Transform::new(TransformType::Esn, esn::NONE),
    ])
}

/// ESP suite: AES-GCM-16-128, no ESN
pub fn esp_aes_gcm_16() -> Transforms {
    Transforms::from_list(&[
        Transform::with_key_length(TransformType::Encr, encr::AES_GCM_16, 128),
        Transform::new(TransformType::Esn, esn::NONE),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proposal() -> Proposal {
        ike_aes_cbc_sha1_96_modp2048().to_proposal(1, ProtocolId::Ike, &[9; 8])
    }

    #[test]
    fn test_transform_roundtrip() {
        let tr = Transform::with_key_length(TransformType::Encr, encr::AES_CBC, 128);
        let mut buf = Vec::new();
        encode_transform(&tr, true, &mut buf);
        assert_eq!(buf.len(), 12); // 8 + 4-byte attribute
        let (dec, is_last, used) = decode_transform(&buf).unwrap();
        assert_eq!(dec, tr);
        assert!(is_last);
        assert_eq!(used, 12);
    }

    #[test]
    fn test_transform_no_keylen() {
        let tr = Transform::new(TransformType::Dh, dh::MODP_2048);
        let mut buf = Vec::new();
        encode_transform(&tr, false, &mut buf);
        assert_eq!(buf.len(), 8);
        assert_eq!(buf[0], 3); // more transforms follow
        let (dec, is_last, _) = decode_transform(&buf).unwrap();
        assert_eq!(dec.key_length, 0);
        assert!(!is_last);
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let mut buf = Vec::new();
        encode_transform(&Transform::new(TransformType::Prf, prf::HMAC_SHA1), true, &mut buf);
        // splice in a bogus attribute type 13
        buf[2..4].copy_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&(0x8000u16 | 13).to_be_bytes());
        buf.extend_from_slice(&[0, 64]);
        assert!(decode_transform(&buf).is_err());
    }

    #[test]
    fn test_proposal_roundtrip() {
        let prop = sample_proposal();
        let mut buf = Vec::new();
        encode_proposal(&prop, true, &mut buf);
        let (dec, is_last, used) = decode_proposal(&buf).unwrap();
        assert_eq!(dec, prop);
        assert!(is_last);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_proposal_transform_count_mismatch() {
        let prop = sample_proposal();
        let mut buf = Vec::new();
        encode_proposal(&prop, true, &mut buf);
        buf[7] = 3; // declares 3 transforms, encodes 4
        assert!(decode_proposal(&buf).is_err());
    }

    #[test]
    fn test_proposals_last_marker_consistency() {
        // two proposals, properly chained
        let prop = sample_proposal();
        let mut buf2 = Vec::new();
        encode_proposal(&prop, false, &mut buf2);
        let esp = esp_aes_cbc_sha1_96().to_proposal(2, ProtocolId::Esp, &[1, 2, 3, 4]);
        encode_proposal(&esp, true, &mut buf2);
        let props = decode_proposals(&buf2).unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props[1].protocol_id, ProtocolId::Esp);
        assert_eq!(props[1].spi, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_trailing_bytes_after_last_rejected() {
        let prop = sample_proposal();
        let mut buf = Vec::new();
        encode_proposal(&prop, true, &mut buf);
        buf.extend_from_slice(&[0u8; 8]);
        assert!(decode_proposals(&buf).is_err());
    }

    #[test]
    fn test_within() {
        let cfg = ike_aes_cbc_sha1_96_modp2048();
        let offered = cfg.as_list();
        assert!(cfg.within(&offered));

        // different key length is not acceptable
        let mut other = offered.clone();
        other[0].key_length = 256;
        assert!(!cfg.within(&other));

        // superset still acceptable
        let mut superset = offered;
        superset.push(Transform::new(TransformType::Prf, prf::HMAC_SHA2_256));
        assert!(cfg.within(&superset));
    }

    #[test]
    fn test_suite_validity() {
        assert!(ike_aes_cbc_sha1_96_modp2048().check_ike().is_ok());
        assert!(ike_aes_gcm_16_modp2048().check_ike().is_ok());
        assert!(esp_aes_cbc_sha1_96().check_esp().is_ok());
        assert!(esp_null_sha1_96().check_esp().is_ok());
        // NULL encryption is not allowed for IKE
        assert!(esp_null_sha1_96().check_ike().is_err());
        // ESP set lacks ESN when used as... IKE set lacks ESN
        assert!(ike_aes_cbc_sha1_96_modp2048().check_esp().is_err());
    }

    #[test]
    fn test_dh_group_lookup() {
        let prop = sample_proposal();
        assert_eq!(prop.dh_group(), Some(dh::MODP_2048));
        let esp = esp_aes_cbc_sha1_96().to_proposal(1, ProtocolId::Esp, &[]);
        assert_eq!(esp.dh_group(), None);
    }
}
