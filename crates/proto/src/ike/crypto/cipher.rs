//! Cipher suites for the Encrypted (SK) payload
//!
//! A [`CipherSuite`] is assembled from an accepted proposal and owns the
//! SK framing for both families:
//!
//! - block ciphers (AES-CBC, Camellia-CBC, ENCR_NULL) with a separate HMAC
//!   integrity transform: encrypt-then-MAC on send, MAC-then-decrypt on
//!   receive, IKEv2 trailing-pad-length padding;
//! - AEAD (AES-GCM-16): one call, associated data = IKE header + SK
//!   header, nonce = 4-octet salt | 8-octet explicit IV. The salt rides at
//!   the tail of the encryption keymat (RFC 5282), so `key_len` here is
//!   the keymat length, not the raw cipher key length.

use super::dh::DhGroup;
use super::prf::PrfAlgorithm;
use crate::ike::constants::{encr, integ, TransformType, IKE_HEADER_LEN, PAYLOAD_HEADER_LEN};
use crate::ike::error::{Error, IkeError, Result};
use crate::ike::proposal::Transform;
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::{Aead, KeyInit, Payload as AeadPayload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use camellia::{Camellia128, Camellia192, Camellia256};
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// AES / Camellia block size
const BLOCK_LEN: usize = 16;

/// GCM explicit IV length on the wire
const GCM_IV_LEN: usize = 8;

/// GCM keymat salt length
const GCM_SALT_LEN: usize = 4;

/// GCM authentication tag length (AES-GCM-16)
const GCM_TAG_LEN: usize = 16;

/// Integrity algorithm registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegAlgorithm {
    /// HMAC-SHA1 truncated to 96 bits
    HmacSha1_96,
    /// HMAC-SHA2-256 truncated to 128 bits
    HmacSha2_256_128,
}

impl IntegAlgorithm {
    /// Look up an integrity algorithm by its IKEv2 transform ID
    pub fn from_transform_id(id: u16) -> Result<Self> {
        match id {
            integ::HMAC_SHA1_96 => Ok(IntegAlgorithm::HmacSha1_96),
            integ::HMAC_SHA2_256_128 => Ok(IntegAlgorithm::HmacSha2_256_128),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "integrity transform {}",
                other
            ))),
        }
    }

    /// Truncated MAC length as written on the wire
    pub fn mac_len(self) -> usize {
        match self {
            IntegAlgorithm::HmacSha1_96 => 12,
            IntegAlgorithm::HmacSha2_256_128 => 16,
        }
    }

    /// Key length
    pub fn key_len(self) -> usize {
        match self {
            IntegAlgorithm::HmacSha1_96 => 20,
            IntegAlgorithm::HmacSha2_256_128 => 32,
        }
    }

    /// Compute the truncated MAC
    pub fn compute(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = match self {
            IntegAlgorithm::HmacSha1_96 => {
                let mut mac =
                    <Hmac<Sha1> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            IntegAlgorithm::HmacSha2_256_128 => {
                let mut mac =
                    <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        };
        out.truncate(self.mac_len());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CipherKind {
    /// AES-CBC / Camellia-CBC plus a separate integrity transform
    Cbc { encr_id: u16 },
    /// ENCR_NULL plus a separate integrity transform (ESP only)
    Null,
    /// AES-GCM-16
    Aead,
}

/// Immutable algorithm bundle assembled from one accepted proposal
#[derive(Debug, Clone)]
pub struct CipherSuite {
    kind: CipherKind,
    /// PRF, present for IKE suites
    pub prf: Option<PrfAlgorithm>,
    /// DH group, present for IKE suites
    pub dh_group: Option<DhGroup>,
    integ: Option<IntegAlgorithm>,
    /// Encryption keymat length in octets (cipher key plus GCM salt)
    pub key_len: usize,
    /// Integrity keymat length in octets (0 for AEAD)
    pub mac_key_len: usize,
    /// Negotiated ENCR transform ID
    pub encr_id: u16,
    /// Negotiated INTEG transform ID (0 for AEAD)
    pub integ_id: u16,
}

impl CipherSuite {
    /// Build a suite from the transform list of an accepted proposal.
    ///
    /// # Errors
    ///
    /// `UnsupportedAlgorithm` for any transform outside the registry and
    /// for inconsistent combinations (AEAD plus a separate integrity
    /// transform, missing encryption transform, bad key size).
    pub fn new(transforms: &[Transform]) -> Result<Self> {
        let mut kind = None;
        let mut prf = None;
        let mut dh_group = None;
        let mut integ_alg = None;
        let mut key_len = 0usize;
        let mut encr_id = 0u16;
        let mut integ_id = 0u16;

        for tr in transforms {
            match tr.transform_type {
                TransformType::Encr => {
                    encr_id = tr.transform_id;
                    let attr_len = tr.key_length as usize / 8;
                    match tr.transform_id {
                        encr::AES_CBC | encr::CAMELLIA_CBC => {
                            if !matches!(attr_len, 16 | 24 | 32) {
                                return Err(Error::UnsupportedAlgorithm(format!(
                                    "cbc key length {} bits",
                                    tr.key_length
                                )));
                            }
                            key_len = attr_len;
                            kind = Some(CipherKind::Cbc {
                                encr_id: tr.transform_id,
                            });
                        }
                        encr::NULL => {
                            key_len = 0;
                            kind = Some(CipherKind::Null);
                        }
                        encr::AES_GCM_16 => {
                            if !matches!(attr_len, 16 | 32) {
                                return Err(Error::UnsupportedAlgorithm(format!(
                                    "gcm key length {} bits",
                                    tr.key_length
                                )));
                            }
                            key_len = attr_len + GCM_SALT_LEN;
                            kind = Some(CipherKind::Aead);
                        }
                        other => {
                            return Err(Error::UnsupportedAlgorithm(format!(
                                "encryption transform {}",
                                other
                            )))
                        }
                    }
                }
                TransformType::Prf => {
                    prf = Some(PrfAlgorithm::from_transform_id(tr.transform_id)?);
                }
                TransformType::Integ => {
                    integ_id = tr.transform_id;
                    integ_alg = Some(IntegAlgorithm::from_transform_id(tr.transform_id)?);
                }
                TransformType::Dh => {
                    dh_group = Some(DhGroup::from_transform_id(tr.transform_id)?);
                }
                TransformType::Esn => {} // nothing to build
            }
        }

        let kind = kind.ok_or_else(|| {
            Error::UnsupportedAlgorithm("proposal without an encryption transform".into())
        })?;
        match kind {
            CipherKind::Aead => {
                if integ_alg.is_some() {
                    return Err(Error::UnsupportedAlgorithm(
                        "AEAD suite with a separate integrity transform".into(),
                    ));
                }
            }
            CipherKind::Cbc { .. } | CipherKind::Null => {
                if integ_alg.is_none() {
                    return Err(Error::UnsupportedAlgorithm(
                        "block cipher suite without an integrity transform".into(),
                    ));
                }
            }
        }

        Ok(CipherSuite {
            kind,
            prf,
            dh_group,
            integ: integ_alg,
            key_len,
            mac_key_len: integ_alg.map(|i| i.key_len()).unwrap_or(0),
            encr_id,
            integ_id,
        })
    }

    /// PRF output length, 0 when the suite carries no PRF
    pub fn prf_len(&self) -> usize {
        self.prf.map(|p| p.output_len()).unwrap_or(0)
    }

    /// Truncated ICV length appended after the ciphertext (0 for AEAD,
    /// whose tag lives inside the ciphertext)
    pub fn mac_len(&self) -> usize {
        self.integ.map(|i| i.mac_len()).unwrap_or(0)
    }

    /// IV length on the wire
    pub fn iv_len(&self) -> usize {
        match self.kind {
            CipherKind::Cbc { .. } => BLOCK_LEN,
            CipherKind::Null => 0,
            CipherKind::Aead => GCM_IV_LEN,
        }
    }

    /// Validate the suite as an IKE suite (needs PRF and DH; NULL
    /// encryption is not allowed for IKE)
    pub fn check_ike(&self) -> Result<()> {
        if self.prf.is_none() || self.dh_group.is_none() {
            return Err(Error::Protocol(IkeError::NoProposalChosen));
        }
        if matches!(self.kind, CipherKind::Null) {
            return Err(Error::Protocol(IkeError::NoProposalChosen));
        }
        Ok(())
    }

    /// Total SK overhead for a cleartext of `clear_len` octets: IV,
    /// padding, pad-length byte and ICV/tag
    pub fn overhead(&self, clear_len: usize) -> usize {
        match self.kind {
            CipherKind::Cbc { .. } => {
                let pad = BLOCK_LEN - (clear_len + 1) % BLOCK_LEN;
                BLOCK_LEN + pad + 1 + self.mac_len()
            }
            CipherKind::Null => 1 + self.mac_len(),
            CipherKind::Aead => GCM_IV_LEN + 1 + GCM_TAG_LEN,
        }
    }

    /// Pad `clear` per RFC 7296 Section 3.14: pad bytes, then one
    /// pad-length octet counting them.
    fn pad(&self, mut clear: Vec<u8>) -> Vec<u8> {
        let block = match self.kind {
            CipherKind::Cbc { .. } => BLOCK_LEN,
            _ => 1,
        };
        let pad = (block - (clear.len() + 1) % block) % block;
        clear.extend(std::iter::repeat(0u8).take(pad));
        clear.push(pad as u8);
        clear
    }

    /// Strip RFC 7296 padding: the trailing octet counts the pad bytes
    /// before it.
    fn unpad(&self, mut clear: Vec<u8>) -> Result<Vec<u8>> {
        let pad_len = *clear.last().ok_or_else(Error::invalid_syntax)? as usize;
        if pad_len >= BLOCK_LEN || pad_len + 1 > clear.len() {
            return Err(Error::Protocol(IkeError::AuthenticationFailed));
        }
        clear.truncate(clear.len() - pad_len - 1);
        Ok(clear)
    }

    fn cbc_encrypt(&self, encr_id: u16, key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
        let n = buf.len();
        macro_rules! enc {
            ($cipher:ty) => {
                cbc::Encryptor::<$cipher>::new_from_slices(key, iv)
                    .map_err(|_| Error::UnsupportedAlgorithm("cbc key/iv size".into()))?
                    .encrypt_padded_mut::<NoPadding>(buf, n)
                    .map(|_| ())
                    .map_err(|_| Error::invalid_syntax())
            };
        }
        match (encr_id, key.len()) {
            (encr::AES_CBC, 16) => enc!(Aes128),
            (encr::AES_CBC, 24) => enc!(Aes192),
            (encr::AES_CBC, 32) => enc!(Aes256),
            (encr::CAMELLIA_CBC, 16) => enc!(Camellia128),
            (encr::CAMELLIA_CBC, 24) => enc!(Camellia192),
            (encr::CAMELLIA_CBC, 32) => enc!(Camellia256),
            _ => Err(Error::UnsupportedAlgorithm("cbc key size".into())),
        }
    }

    fn cbc_decrypt(&self, encr_id: u16, key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
        macro_rules! dec {
            ($cipher:ty) => {
                cbc::Decryptor::<$cipher>::new_from_slices(key, iv)
                    .map_err(|_| Error::UnsupportedAlgorithm("cbc key/iv size".into()))?
                    .decrypt_padded_mut::<NoPadding>(buf)
                    .map(|_| ())
                    .map_err(|_| Error::Protocol(IkeError::AuthenticationFailed))
            };
        }
        match (encr_id, key.len()) {
            (encr::AES_CBC, 16) => dec!(Aes128),
            (encr::AES_CBC, 24) => dec!(Aes192),
            (encr::AES_CBC, 32) => dec!(Aes256),
            (encr::CAMELLIA_CBC, 16) => dec!(Camellia128),
            (encr::CAMELLIA_CBC, 24) => dec!(Camellia192),
            (encr::CAMELLIA_CBC, 32) => dec!(Camellia256),
            _ => Err(Error::UnsupportedAlgorithm("cbc key size".into())),
        }
    }

    /// Seal `payload` into SK form:
    /// `headers | IV | E(pad(payload)) | MAC(headers | IV | ct)` for block
    /// ciphers, `headers | IV | ct+tag` for AEAD (headers as AAD).
    ///
    /// `headers` must already contain the IKE header and the SK generic
    /// payload header, with final lengths filled in.
    pub fn encrypt_mac(
        &self,
        headers: &[u8],
        payload: &[u8],
        sk_a: &[u8],
        sk_e: &[u8],
    ) -> Result<Vec<u8>> {
        match self.kind {
            CipherKind::Cbc { encr_id } => {
                let mut clear = self.pad(payload.to_vec());
                let mut iv = vec![0u8; BLOCK_LEN];
                rand::thread_rng().fill_bytes(&mut iv);
                self.cbc_encrypt(encr_id, sk_e, &iv, &mut clear)?;

                let integ = self.integ.expect("checked at construction");
                let mut out =
                    Vec::with_capacity(headers.len() + iv.len() + clear.len() + integ.mac_len());
                out.extend_from_slice(headers);
                out.extend_from_slice(&iv);
                out.extend_from_slice(&clear);
                let mac = integ.compute(sk_a, &out);
                out.extend_from_slice(&mac);
                Ok(out)
            }
            CipherKind::Null => {
                let clear = self.pad(payload.to_vec());
                let integ = self.integ.expect("checked at construction");
                let mut out = Vec::with_capacity(headers.len() + clear.len() + integ.mac_len());
                out.extend_from_slice(headers);
                out.extend_from_slice(&clear);
                let mac = integ.compute(sk_a, &out);
                out.extend_from_slice(&mac);
                Ok(out)
            }
            CipherKind::Aead => {
                if sk_e.len() != self.key_len {
                    return Err(Error::CryptoKeysMissing);
                }
                let (key, salt) = sk_e.split_at(self.key_len - GCM_SALT_LEN);
                let mut iv = [0u8; GCM_IV_LEN];
                rand::thread_rng().fill_bytes(&mut iv);
                let mut nonce = [0u8; GCM_SALT_LEN + GCM_IV_LEN];
                nonce[..GCM_SALT_LEN].copy_from_slice(salt);
                nonce[GCM_SALT_LEN..].copy_from_slice(&iv);

                let clear = self.pad(payload.to_vec());
                let msg = AeadPayload {
                    msg: &clear,
                    aad: headers,
                };
                let ct = match key.len() {
                    16 => Aes128Gcm::new_from_slice(key)
                        .expect("length checked")
                        .encrypt((&nonce).into(), msg),
                    32 => Aes256Gcm::new_from_slice(key)
                        .expect("length checked")
                        .encrypt((&nonce).into(), msg),
                    _ => return Err(Error::UnsupportedAlgorithm("gcm key size".into())),
                }
                .map_err(|_| Error::Protocol(IkeError::AuthenticationFailed))?;

                let mut out = Vec::with_capacity(headers.len() + GCM_IV_LEN + ct.len());
                out.extend_from_slice(headers);
                out.extend_from_slice(&iv);
                out.extend_from_slice(&ct);
                Ok(out)
            }
        }
    }

    /// Open the SK framing of a whole datagram: verify the ICV over
    /// everything before it (constant time), decrypt, strip padding.
    ///
    /// `ike` is the complete message from the first header octet. Returns
    /// the inner payload chain bytes. Any failure maps to
    /// `AuthenticationFailed` without distinguishing the cause.
    pub fn verify_decrypt(&self, ike: &[u8], sk_a: &[u8], sk_e: &[u8]) -> Result<Vec<u8>> {
        let sk_body_at = IKE_HEADER_LEN + PAYLOAD_HEADER_LEN;
        if ike.len() < sk_body_at {
            return Err(Error::invalid_syntax());
        }
        match self.kind {
            CipherKind::Cbc { encr_id } => {
                let integ = self.integ.expect("checked at construction");
                let mac_len = integ.mac_len();
                if ike.len() < sk_body_at + BLOCK_LEN + mac_len {
                    return Err(Error::Protocol(IkeError::AuthenticationFailed));
                }
                let (msg, tag) = ike.split_at(ike.len() - mac_len);
                let expected = integ.compute(sk_a, msg);
                if expected.ct_eq(tag).unwrap_u8() != 1 {
                    return Err(Error::Protocol(IkeError::AuthenticationFailed));
                }
                let body = &msg[sk_body_at..];
                let (iv, ct) = body.split_at(BLOCK_LEN);
                if ct.is_empty() || ct.len() % BLOCK_LEN != 0 {
                    return Err(Error::Protocol(IkeError::AuthenticationFailed));
                }
                let mut buf = ct.to_vec();
                self.cbc_decrypt(encr_id, sk_e, iv, &mut buf)?;
                self.unpad(buf)
            }
            CipherKind::Null => {
                let integ = self.integ.expect("checked at construction");
                let mac_len = integ.mac_len();
                if ike.len() < sk_body_at + 1 + mac_len {
                    return Err(Error::Protocol(IkeError::AuthenticationFailed));
                }
                let (msg, tag) = ike.split_at(ike.len() - mac_len);
                let expected = integ.compute(sk_a, msg);
                if expected.ct_eq(tag).unwrap_u8() != 1 {
                    return Err(Error::Protocol(IkeError::AuthenticationFailed));
                }
                self.unpad(msg[sk_body_at..].to_vec())
            }
            CipherKind::Aead => {
                if sk_e.len() != self.key_len {
                    return Err(Error::CryptoKeysMissing);
                }
                if ike.len() < sk_body_at + GCM_IV_LEN + GCM_TAG_LEN {
                    return Err(Error::Protocol(IkeError::AuthenticationFailed));
                }
                let (key, salt) = sk_e.split_at(self.key_len - GCM_SALT_LEN);
                let aad = &ike[..sk_body_at];
                let iv = &ike[sk_body_at..sk_body_at + GCM_IV_LEN];
                let ct = &ike[sk_body_at + GCM_IV_LEN..];
                let mut nonce = [0u8; GCM_SALT_LEN + GCM_IV_LEN];
                nonce[..GCM_SALT_LEN].copy_from_slice(salt);
                nonce[GCM_SALT_LEN..].copy_from_slice(iv);
                let msg = AeadPayload { msg: ct, aad };
                let clear = match key.len() {
                    16 => Aes128Gcm::new_from_slice(key)
                        .expect("length checked")
                        .decrypt((&nonce).into(), msg),
                    32 => Aes256Gcm::new_from_slice(key)
                        .expect("length checked")
                        .decrypt((&nonce).into(), msg),
                    _ => return Err(Error::UnsupportedAlgorithm("gcm key size".into())),
                }
                .map_err(|_| Error::Protocol(IkeError::AuthenticationFailed))?;
                self.unpad(clear)
            }
        }
    }
}
