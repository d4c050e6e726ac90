//! Pseudo-Random Function implementations (RFC 7296 Section 2.13)

use crate::ike::constants::prf;
use crate::ike::error::{Error, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

/// PRF algorithm registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlgorithm {
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA2-256
    HmacSha256,
    /// HMAC-SHA2-384
    HmacSha384,
    /// HMAC-SHA2-512
    HmacSha512,
}

impl PrfAlgorithm {
    /// Look up a PRF by its IKEv2 transform ID
    pub fn from_transform_id(id: u16) -> Result<Self> {
        match id {
            prf::HMAC_SHA1 => Ok(PrfAlgorithm::HmacSha1),
            prf::HMAC_SHA2_256 => Ok(PrfAlgorithm::HmacSha256),
            prf::HMAC_SHA2_384 => Ok(PrfAlgorithm::HmacSha384),
            prf::HMAC_SHA2_512 => Ok(PrfAlgorithm::HmacSha512),
            other => Err(Error::UnsupportedAlgorithm(format!("prf transform {}", other))),
        }
    }

    /// Output (and preferred key) length in bytes
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha1 => 20,
            PrfAlgorithm::HmacSha256 => 32,
            PrfAlgorithm::HmacSha384 => 48,
            PrfAlgorithm::HmacSha512 => 64,
        }
    }

    /// Compute prf(key, data)
    pub fn compute(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        macro_rules! mac {
            ($digest:ty) => {{
                let mut mac = Hmac::<$digest>::new_from_slice(key)
                    .expect("HMAC accepts keys of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }};
        }
        match self {
            PrfAlgorithm::HmacSha1 => mac!(Sha1),
            PrfAlgorithm::HmacSha256 => mac!(Sha256),
            PrfAlgorithm::HmacSha384 => mac!(Sha384),
            PrfAlgorithm::HmacSha512 => mac!(Sha512),
        }
    }

    /// Key expansion prf+ (RFC 7296 Section 2.13):
    ///
    /// ```text
    /// prf+ (K,S) = T1 | T2 | T3 | ...
    /// T1 = prf (K, S | 0x01)
    /// Ti = prf (K, T(i-1) | S | i)      i is a single octet
    /// ```
    ///
    /// # Errors
    ///
    /// The round counter is one octet, so requests beyond
    /// `255 * output_len` bytes fail with `UnsupportedAlgorithm`.
    pub fn prf_plus(self, key: &[u8], seed: &[u8], n_bytes: usize) -> Result<Vec<u8>> {
        if n_bytes > 255 * self.output_len() {
            return Err(Error::UnsupportedAlgorithm(format!(
                "prf+ request for {} bytes exceeds the 255-round limit",
                n_bytes
            )));
        }
        let mut out = Vec::with_capacity(n_bytes);
        let mut t = Vec::new();
        let mut round: u8 = 1;
        while out.len() < n_bytes {
            let mut input = Vec::with_capacity(t.len() + seed.len() + 1);
            input.extend_from_slice(&t);
            input.extend_from_slice(seed);
            input.push(round);
            t = self.compute(key, &input);
            out.extend_from_slice(&t);
            round = round.wrapping_add(1);
        }
        out.truncate(n_bytes);
        Ok(out)
    }
}
