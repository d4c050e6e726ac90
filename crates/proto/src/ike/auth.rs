//! AUTH payload computation and verification (RFC 7296 Section 2.15,
//! RFC 7427)
//!
//! The signed octets themselves come from [`Tkm::auth_octets`]; this
//! module turns them into (or checks them against) an AUTH payload using
//! the configured method.

use super::config::AuthConfig;
use super::constants::AuthMethod;
use super::error::{Error, IkeError, Result};
use super::payload::AuthPayload;
use super::tkm::Tkm;
use ed25519_dalek::{Signer, Verifier};
use subtle::ConstantTimeEq;

/// Key pad constant from RFC 7296 Section 2.15
const KEY_PAD: &[u8] = b"Key Pad for IKEv2";

/// DER AlgorithmIdentifier for Ed25519 (RFC 8410): SEQUENCE { OID 1.3.101.112 }
const ED25519_ALG_ID: &[u8] = &[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70];

/// Compute the AUTH payload over `signed_octets`.
///
/// PSK: `AUTH = prf(prf(secret, "Key Pad for IKEv2"), octets)`.
/// Digital signature (RFC 7427): one length octet, the DER
/// AlgorithmIdentifier, then the raw Ed25519 signature.
pub fn compute_auth(auth: &AuthConfig, tkm: &Tkm, signed_octets: &[u8]) -> Result<AuthPayload> {
    match auth {
        AuthConfig::SharedKey(secret) => {
            let pad_key = tkm.prf(secret, KEY_PAD)?;
            let data = tkm.prf(&pad_key, signed_octets)?;
            Ok(AuthPayload {
                method: AuthMethod::SharedKeyMic,
                data,
            })
        }
        AuthConfig::DigitalSignature { signing_key, .. } => {
            let sig = signing_key.sign(signed_octets);
            let mut data = Vec::with_capacity(1 + ED25519_ALG_ID.len() + 64);
            data.push(ED25519_ALG_ID.len() as u8);
            data.extend_from_slice(ED25519_ALG_ID);
            data.extend_from_slice(&sig.to_bytes());
            Ok(AuthPayload {
                method: AuthMethod::DigitalSignature,
                data,
            })
        }
        AuthConfig::Rsa => Err(Error::UnsupportedAlgorithm(
            "RSA authentication requires the certificate subsystem".into(),
        )),
    }
}

/// Verify a received AUTH payload over the octets the peer must have
/// signed. Failures collapse to `AuthenticationFailed` without detail.
pub fn verify_auth(
    auth: &AuthConfig,
    tkm: &Tkm,
    signed_octets: &[u8],
    received: &AuthPayload,
) -> Result<()> {
    match auth {
        AuthConfig::SharedKey(_) => {
            if received.method != AuthMethod::SharedKeyMic {
                return Err(Error::Protocol(IkeError::AuthenticationFailed));
            }
            let expected = compute_auth(auth, tkm, signed_octets)?;
            if expected.data.len() != received.data.len()
                || expected.data.ct_eq(&received.data).unwrap_u8() != 1
            {
                return Err(Error::Protocol(IkeError::AuthenticationFailed));
            }
            Ok(())
        }
        AuthConfig::DigitalSignature { peer_public, .. } => {
            if received.method != AuthMethod::DigitalSignature {
                return Err(Error::Protocol(IkeError::AuthenticationFailed));
            }
            // 1-octet AlgorithmIdentifier length, identifier, signature
            let (alg_len, rest) = received
                .data
                .split_first()
                .ok_or(Error::Protocol(IkeError::AuthenticationFailed))?;
            let alg_len = *alg_len as usize;
            if rest.len() < alg_len || &rest[..alg_len] != ED25519_ALG_ID {
                return Err(Error::Protocol(IkeError::AuthenticationFailed));
            }
            let sig_bytes: [u8; 64] = rest[alg_len..]
                .try_into()
                .map_err(|_| Error::Protocol(IkeError::AuthenticationFailed))?;
            let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
            peer_public
                .verify(signed_octets, &sig)
                .map_err(|_| Error::Protocol(IkeError::AuthenticationFailed))
        }
        AuthConfig::Rsa => Err(Error::UnsupportedAlgorithm(
            "RSA authentication requires the certificate subsystem".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ike::crypto::CipherSuite;
    use crate::ike::proposal::{esp_aes_cbc_sha1_96, ike_aes_cbc_sha1_96_modp1024};
    use zeroize::Zeroizing;

    fn tkm() -> Tkm {
        let ike = CipherSuite::new(&ike_aes_cbc_sha1_96_modp1024().as_list()).unwrap();
        let esp = CipherSuite::new(&esp_aes_cbc_sha1_96().as_list()).unwrap();
        Tkm::new(ike, esp, true).unwrap()
    }

    fn psk() -> AuthConfig {
        AuthConfig::SharedKey(Zeroizing::new(b"a shared secret".to_vec()))
    }

    fn signature_pair() -> (AuthConfig, AuthConfig) {
        let key_a = ed25519_dalek::SigningKey::from_bytes(&[0x11; 32]);
        let key_b = ed25519_dalek::SigningKey::from_bytes(&[0x22; 32]);
        let a = AuthConfig::DigitalSignature {
            signing_key: Box::new(key_a.clone()),
            peer_public: Box::new(key_b.verifying_key()),
        };
        let b = AuthConfig::DigitalSignature {
            signing_key: Box::new(key_b),
            peer_public: Box::new(key_a.verifying_key()),
        };
        (a, b)
    }

    #[test]
    fn test_psk_roundtrip() {
        let tkm = tkm();
        let octets = vec![0x5A; 200];
        let auth = compute_auth(&psk(), &tkm, &octets).unwrap();
        assert_eq!(auth.method, AuthMethod::SharedKeyMic);
        assert_eq!(auth.data.len(), 20); // SHA1 prf
        assert!(verify_auth(&psk(), &tkm, &octets, &auth).is_ok());
    }

    #[test]
    fn test_psk_wrong_octets() {
        let tkm = tkm();
        let auth = compute_auth(&psk(), &tkm, b"signed this").unwrap();
        assert!(matches!(
            verify_auth(&psk(), &tkm, b"but not that", &auth),
            Err(Error::Protocol(IkeError::AuthenticationFailed))
        ));
    }

    #[test]
    fn test_psk_wrong_secret() {
        let tkm = tkm();
        let octets = b"shared octets";
        let auth = compute_auth(&psk(), &tkm, octets).unwrap();
        let other = AuthConfig::SharedKey(Zeroizing::new(b"different".to_vec()));
        assert!(verify_auth(&other, &tkm, octets, &auth).is_err());
    }

    #[test]
    fn test_signature_roundtrip() {
        let tkm = tkm();
        let (a, b) = signature_pair();
        let octets = vec![0x7E; 150];
        let auth = compute_auth(&a, &tkm, &octets).unwrap();
        assert_eq!(auth.method, AuthMethod::DigitalSignature);
        // AlgorithmIdentifier prefix present
        assert_eq!(auth.data[0] as usize, ED25519_ALG_ID.len());
        // b holds a's public key
        assert!(verify_auth(&b, &tkm, &octets, &auth).is_ok());
        // a cannot verify its own signature against b's public key
        assert!(verify_auth(&a, &tkm, &octets, &auth).is_err());
    }

    #[test]
    fn test_method_mismatch() {
        let tkm = tkm();
        let (a, _) = signature_pair();
        let octets = b"octets";
        let psk_auth = compute_auth(&psk(), &tkm, octets).unwrap();
        assert!(verify_auth(&a, &tkm, octets, &psk_auth).is_err());
    }

    #[test]
    fn test_rsa_unsupported() {
        let tkm = tkm();
        assert!(matches!(
            compute_auth(&AuthConfig::Rsa, &tkm, b"x"),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }
}
