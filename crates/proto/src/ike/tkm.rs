//! Transform/Key Manager: per-session crypto state
//!
//! The TKM owns nonces, the ephemeral Diffie-Hellman exchange, the derived
//! `SK_*` key set and the SK payload framing. Sessions never touch key
//! bytes directly; they ask the TKM to seal, open, derive or sign.
//!
//! Key schedule (RFC 7296 Sections 2.14, 2.17, 2.18):
//!
//! ```text
//! SKEYSEED    = prf(Ni | Nr, g^ir)                       initial
//! SKEYSEED    = prf(SK_d_old, g^ir_new | Ni | Nr)        rekey
//! KEYMAT      = prf+(SKEYSEED, Ni | Nr | SPIi | SPIr)
//! {SK_d, SK_ai, SK_ar, SK_ei, SK_er, SK_pi, SK_pr} = split(KEYMAT)
//! ESP KEYMAT  = prf+(SK_d, [g^ir_child |] Ni | Nr)
//! ```

use super::crypto::{CipherSuite, DhPrivate};
use super::error::{Error, Result};
use super::message::{encode_chain, Message};
use super::payload::{IdPayload, PayloadHeader};
use crate::ike::constants::{PayloadType, IKE_HEADER_LEN, PAYLOAD_HEADER_LEN};
use rand::RngCore;
use zeroize::Zeroizing;

/// The four ESP keys handed to the data plane, in derivation order
#[derive(Debug)]
pub struct EspKeys {
    /// Encryption, initiator-to-responder
    pub esp_ei: Zeroizing<Vec<u8>>,
    /// Integrity, initiator-to-responder
    pub esp_ai: Zeroizing<Vec<u8>>,
    /// Encryption, responder-to-initiator
    pub esp_er: Zeroizing<Vec<u8>>,
    /// Integrity, responder-to-initiator
    pub esp_ar: Zeroizing<Vec<u8>>,
}

/// Per-session transform and key state
pub struct Tkm {
    suite: CipherSuite,
    esp_suite: CipherSuite,

    ni: Zeroizing<Vec<u8>>,
    nr: Zeroizing<Vec<u8>>,

    dh_private: Option<DhPrivate>,
    dh_public: Vec<u8>,
    dh_shared: Option<Zeroizing<Vec<u8>>>,

    sk_d: Zeroizing<Vec<u8>>,
    sk_ai: Zeroizing<Vec<u8>>,
    sk_ar: Zeroizing<Vec<u8>>,
    sk_ei: Zeroizing<Vec<u8>>,
    sk_er: Zeroizing<Vec<u8>>,
    sk_pi: Zeroizing<Vec<u8>>,
    sk_pr: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for Tkm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tkm")
            .field("keys_derived", &self.has_keys())
            .finish_non_exhaustive()
    }
}

fn random_nonce(len: usize) -> Zeroizing<Vec<u8>> {
    let mut nonce = Zeroizing::new(vec![0u8; len]);
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

impl Tkm {
    /// Fresh TKM for one side of an exchange: generates the local nonce
    /// (Ni as initiator, Nr as responder) and the ephemeral DH keypair.
    /// The peer's nonce arrives later via [`Tkm::set_peer_nonce`].
    pub fn new(suite: CipherSuite, esp_suite: CipherSuite, is_initiator: bool) -> Result<Self> {
        suite.check_ike()?;
        let group = suite.dh_group.ok_or(Error::CryptoKeysMissing)?;
        let (dh_private, dh_public) = group.generate();
        // at least half the PRF output size; we use the full size
        let own = random_nonce(suite.prf_len());
        let (ni, nr) = if is_initiator {
            (own, Zeroizing::new(Vec::new()))
        } else {
            (Zeroizing::new(Vec::new()), own)
        };
        Ok(Tkm {
            suite,
            esp_suite,
            ni,
            nr,
            dh_private: Some(dh_private),
            dh_public,
            dh_shared: None,
            sk_d: Zeroizing::new(Vec::new()),
            sk_ai: Zeroizing::new(Vec::new()),
            sk_ar: Zeroizing::new(Vec::new()),
            sk_ei: Zeroizing::new(Vec::new()),
            sk_er: Zeroizing::new(Vec::new()),
            sk_pi: Zeroizing::new(Vec::new()),
            sk_pr: Zeroizing::new(Vec::new()),
        })
    }

    /// The locally generated nonce (Ni as initiator, Nr as responder)
    pub fn own_nonce(&self, is_initiator: bool) -> &[u8] {
        if is_initiator {
            &self.ni
        } else {
            &self.nr
        }
    }

    /// Initiator nonce
    pub fn ni(&self) -> &[u8] {
        &self.ni
    }

    /// Responder nonce
    pub fn nr(&self) -> &[u8] {
        &self.nr
    }

    /// Record the peer's nonce once its INIT message arrives
    pub fn set_peer_nonce(&mut self, nonce: &[u8], is_initiator: bool) {
        if is_initiator {
            self.nr = Zeroizing::new(nonce.to_vec());
        } else {
            self.ni = Zeroizing::new(nonce.to_vec());
        }
    }

    /// Our DH public value for the KE payload
    pub fn dh_public(&self) -> &[u8] {
        &self.dh_public
    }

    /// The negotiated DH group's transform ID
    pub fn dh_transform_id(&self) -> u16 {
        self.suite
            .dh_group
            .map(|g| g.transform_id())
            .unwrap_or_default()
    }

    /// Compute the shared secret from the peer's KE public value.
    ///
    /// Must run before [`Tkm::derive_ike_keys`]; the private value stays
    /// usable for retransmitted INIT handling until the TKM is dropped.
    pub fn compute_dh_shared(&mut self, peer_public: &[u8]) -> Result<()> {
        let group = self.suite.dh_group.ok_or(Error::CryptoKeysMissing)?;
        let private = self.dh_private.as_ref().ok_or(Error::CryptoKeysMissing)?;
        let shared = group.shared(peer_public, private)?;
        self.dh_shared = Some(Zeroizing::new(shared));
        Ok(())
    }

    /// Whether the SK_* key set has been derived
    pub fn has_keys(&self) -> bool {
        !self.sk_d.is_empty()
    }

    /// Derive the seven SK_* keys (RFC 7296 Section 2.14).
    ///
    /// `old_sk_d` seeds the rekey variant of SKEYSEED; pass `None` for the
    /// initial exchange. `spi_r` may be empty while the responder SPI is
    /// still unknown (matching what the AUTH exchange signs).
    ///
    /// # Errors
    ///
    /// `CryptoKeysMissing` when the DH shared secret or peer nonce is not
    /// set yet.
    pub fn derive_ike_keys(
        &mut self,
        spi_i: &[u8],
        spi_r: &[u8],
        old_sk_d: Option<&[u8]>,
    ) -> Result<()> {
        let prf = self.suite.prf.ok_or(Error::CryptoKeysMissing)?;
        let shared = self.dh_shared.as_ref().ok_or(Error::CryptoKeysMissing)?;
        if self.ni.is_empty() || self.nr.is_empty() {
            return Err(Error::CryptoKeysMissing);
        }

        let skeyseed = match old_sk_d {
            None => {
                let mut key = Vec::with_capacity(self.ni.len() + self.nr.len());
                key.extend_from_slice(&self.ni);
                key.extend_from_slice(&self.nr);
                prf.compute(&key, shared)
            }
            Some(old) => {
                let mut data = Vec::with_capacity(shared.len() + self.ni.len() + self.nr.len());
                data.extend_from_slice(shared);
                data.extend_from_slice(&self.ni);
                data.extend_from_slice(&self.nr);
                prf.compute(old, &data)
            }
        };
        let skeyseed = Zeroizing::new(skeyseed);

        let prf_len = self.suite.prf_len();
        let key_len = self.suite.key_len;
        let mac_key_len = self.suite.mac_key_len;
        let km_len = 3 * prf_len + 2 * key_len + 2 * mac_key_len;

        let mut seed =
            Vec::with_capacity(self.ni.len() + self.nr.len() + spi_i.len() + spi_r.len());
        seed.extend_from_slice(&self.ni);
        seed.extend_from_slice(&self.nr);
        seed.extend_from_slice(spi_i);
        seed.extend_from_slice(spi_r);

        let keymat = Zeroizing::new(prf.prf_plus(&skeyseed, &seed, km_len)?);

        let mut at = 0usize;
        let mut take = |n: usize| {
            let part = Zeroizing::new(keymat[at..at + n].to_vec());
            at += n;
            part
        };
        self.sk_d = take(prf_len);
        self.sk_ai = take(mac_key_len);
        self.sk_ar = take(mac_key_len);
        self.sk_ei = take(key_len);
        self.sk_er = take(key_len);
        self.sk_pi = take(prf_len);
        self.sk_pr = take(prf_len);
        Ok(())
    }

    /// Outgoing SK keys by role: (SK_ei, SK_ai) for the initiator,
    /// (SK_er, SK_ar) for the responder
    fn send_keys(&self, is_initiator: bool) -> (&[u8], &[u8]) {
        if is_initiator {
            (&self.sk_ei, &self.sk_ai)
        } else {
            (&self.sk_er, &self.sk_ar)
        }
    }

    fn recv_keys(&self, is_initiator: bool) -> (&[u8], &[u8]) {
        if is_initiator {
            (&self.sk_er, &self.sk_ar)
        } else {
            (&self.sk_ei, &self.sk_ai)
        }
    }

    /// Seal a message into SK form: encode the inner chain, encrypt, and
    /// append the ICV. Returns the complete datagram.
    pub fn encrypt_mac(&self, msg: &Message, is_initiator: bool) -> Result<Vec<u8>> {
        if !self.has_keys() {
            return Err(Error::CryptoKeysMissing);
        }
        let mut inner = Vec::new();
        encode_chain(&msg.payloads, &mut inner);
        let first = msg
            .payloads
            .first()
            .map(|p| p.payload_type())
            .unwrap_or(PayloadType::None.to_u8());

        let sk_body_len = inner.len() + self.suite.overhead(inner.len());
        let mut header = msg.header.clone();
        header.next_payload = PayloadType::Sk.to_u8();
        header.length = (IKE_HEADER_LEN + PAYLOAD_HEADER_LEN + sk_body_len) as u32;

        let mut headers = header.encode().to_vec();
        PayloadHeader::encode(first, sk_body_len, &mut headers);

        let (sk_e, sk_a) = self.send_keys(is_initiator);
        self.suite.encrypt_mac(&headers, &inner, sk_a, sk_e)
    }

    /// Open a received SK datagram: verify the ICV over the whole message,
    /// decrypt, return the inner payload chain bytes.
    pub fn verify_decrypt(&self, ike: &[u8], is_initiator: bool) -> Result<Vec<u8>> {
        if !self.has_keys() {
            return Err(Error::CryptoKeysMissing);
        }
        let (sk_e, sk_a) = self.recv_keys(is_initiator);
        self.suite.verify_decrypt(ike, sk_a, sk_e)
    }

    /// The octets each side signs for AUTH (RFC 7296 Section 2.15):
    ///
    /// ```text
    /// initiator: RealMessage1 | Nr | prf(SK_pi, IDi')
    /// responder: RealMessage2 | Ni | prf(SK_pr, IDr')
    /// ```
    ///
    /// `init_raw` is the signer's own IKE_SA_INIT message exactly as sent
    /// on the wire; `id` is the signer's identification payload.
    pub fn auth_octets(
        &self,
        init_raw: &[u8],
        id: &IdPayload,
        signer_is_initiator: bool,
    ) -> Result<Vec<u8>> {
        if !self.has_keys() {
            return Err(Error::CryptoKeysMissing);
        }
        let prf = self.suite.prf.ok_or(Error::CryptoKeysMissing)?;
        let (key, nonce): (&[u8], &[u8]) = if signer_is_initiator {
            (&self.sk_pi, &self.nr)
        } else {
            (&self.sk_pr, &self.ni)
        };
        let id_hash = prf.compute(key, &id.to_body());
        let mut octets = Vec::with_capacity(init_raw.len() + nonce.len() + id_hash.len());
        octets.extend_from_slice(init_raw);
        octets.extend_from_slice(nonce);
        octets.extend_from_slice(&id_hash);
        Ok(octets)
    }

    /// prf(key, data) under the negotiated PRF
    pub fn prf(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let prf = self.suite.prf.ok_or(Error::CryptoKeysMissing)?;
        Ok(prf.compute(key, data))
    }

    /// PRF output length of the negotiated suite
    pub fn prf_len(&self) -> usize {
        self.suite.prf_len()
    }

    /// Derive ESP keying material (RFC 7296 Section 2.17).
    ///
    /// `child_shared` carries g^ir from a CREATE_CHILD_SA KE when PFS is
    /// in use; the first child SA passes `None`.
    pub fn derive_esp_keys(&self, child_shared: Option<&[u8]>) -> Result<EspKeys> {
        if !self.has_keys() {
            return Err(Error::CryptoKeysMissing);
        }
        let prf = self.suite.prf.ok_or(Error::CryptoKeysMissing)?;
        let key_len = self.esp_suite.key_len;
        let mac_key_len = self.esp_suite.mac_key_len;
        let km_len = 2 * key_len + 2 * mac_key_len;

        let mut seed = Vec::new();
        if let Some(shared) = child_shared {
            seed.extend_from_slice(shared);
        }
        seed.extend_from_slice(&self.ni);
        seed.extend_from_slice(&self.nr);

        let keymat = Zeroizing::new(prf.prf_plus(&self.sk_d, &seed, km_len)?);
        let mut at = 0usize;
        let mut take = |n: usize| {
            let part = Zeroizing::new(keymat[at..at + n].to_vec());
            at += n;
            part
        };
        Ok(EspKeys {
            esp_ei: take(key_len),
            esp_ai: take(mac_key_len),
            esp_er: take(key_len),
            esp_ar: take(mac_key_len),
        })
    }

    /// Negotiated ESP transform IDs, for the data-plane bundle
    pub fn esp_transform_ids(&self) -> (u16, u16) {
        (self.esp_suite.encr_id, self.esp_suite.integ_id)
    }
}
