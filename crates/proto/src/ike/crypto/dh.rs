//! Diffie-Hellman group registry
//!
//! MODP groups (RFC 2409 / RFC 3526) run over `num_bigint` modular
//! exponentiation; the ECP groups (RFC 5903) use the NIST curves' ECDH.
//! Every group exposes `generate()` and `shared()`; public values and MODP
//! shared secrets are fixed-width big-endian, padded to the group size.

use crate::ike::constants::dh;
use crate::ike::error::{Error, IkeError, Result};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use zeroize::Zeroizing;

fn parse_prime(hex: &str) -> BigUint {
    BigUint::parse_bytes(hex.as_bytes(), 16).expect("well-formed prime literal")
}

static P_768: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF"
    ))
});

static P_1024: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF"
    ))
});

static P_1536: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF"
    ))
});

static P_2048: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF"
    ))
});

static P_3072: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF"
    ))
});

static P_4096: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8",
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2",
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199FFFFFFFFFFFFFFFF"
    ))
});

static P_6144: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8",
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2",
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C93402849236C3FAB4D27C7026",
    "C1D4DCB2602646DEC9751E763DBA37BDF8FF9406AD9E530EE5DB382F413001AE",
    "B06A53ED9027D831179727B0865A8918DA3EDBEBCF9B14ED44CE6CBACED4BB1B",
    "DB7F1447E6CC254B332051512BD7AF426FB8F401378CD2BF5983CA01C64B92EC",
    "F032EA15D1721D03F482D7CE6E74FEF6D55E702F46980C82B5A84031900B1C9E",
    "59E7C97FBEC7E8F323A97A7E36CC88BE0F1D45B7FF585AC54BD407B22B4154AA",
    "CC8F6D7EBF48E1D814CC5ED20F8037E0A79715EEF29BE32806A1D58BB7C5DA76",
    "F550AA3D8A1FBFF0EB19CCB1A313D55CDA56C9EC2EF29632387FE8D76E3C0468",
    "043E8F663F4860EE12BF2D5B0B7474D6E694F91E6DCC4024FFFFFFFFFFFFFFFF"
    ))
});

static P_8192: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8",
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2",
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C93402849236C3FAB4D27C7026",
    "C1D4DCB2602646DEC9751E763DBA37BDF8FF9406AD9E530EE5DB382F413001AE",
    "B06A53ED9027D831179727B0865A8918DA3EDBEBCF9B14ED44CE6CBACED4BB1B",
    "DB7F1447E6CC254B332051512BD7AF426FB8F401378CD2BF5983CA01C64B92EC",
    "F032EA15D1721D03F482D7CE6E74FEF6D55E702F46980C82B5A84031900B1C9E",
    "59E7C97FBEC7E8F323A97A7E36CC88BE0F1D45B7FF585AC54BD407B22B4154AA",
    "CC8F6D7EBF48E1D814CC5ED20F8037E0A79715EEF29BE32806A1D58BB7C5DA76",
    "F550AA3D8A1FBFF0EB19CCB1A313D55CDA56C9EC2EF29632387FE8D76E3C0468",
    "043E8F663F4860EE12BF2D5B0B7474D6E694F91E6DBE115974A3926F12FEE5E4",
    "38777CB6A932DF8CD8BEC4D073B931BA3BC832B68D9DD300741FA7BF8AFC47ED",
    "2576F6936BA424663AAB639C5AE4F5683423B4742BF1C978238F16CBE39D652D",
    "E3FDB8BEFC848AD922222E04A4037C0713EB57A81A23F0C73473FC646CEA306B",
    "4BCBC8862F8385DDFA9D4B7FA2C087E879683303ED5BDD3A062B3CF5B3A278A6",
    "6D2A13F83F44F82DDF310EE074AB6A364597E899A0255DC164F31CC50846851D",
    "F9AB48195DED7EA1B1D510BD7EE74D73FAF36BC31ECFA268359046F4EB879F92",
    "4009438B481C6CD7889A002ED5EE382BC9190DA6FC026E479558E4475677E9AA",
    "9E3050E2765694DFC81F56E880B96E7160C980DD98EDD3DFFFFFFFFFFFFFFFFF"
    ))
});

/// MODP generator (2 for every RFC 3526 group)
static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

/// A Diffie-Hellman group from the IKEv2 registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhGroup {
    /// RFC 2409 / RFC 3526 modular exponentiation group
    Modp(u16),
    /// NIST P-256 (group 19)
    Ecp256,
    /// NIST P-384 (group 20)
    Ecp384,
    /// NIST P-521 (group 21)
    Ecp521,
}

/// The private half of a key exchange, zeroized on drop
pub enum DhPrivate {
    /// MODP exponent
    Modp(Zeroizing<Vec<u8>>),
    /// P-256 scalar
    P256(p256::ecdh::EphemeralSecret),
    /// P-384 scalar
    P384(p384::ecdh::EphemeralSecret),
    /// P-521 scalar
    P521(p521::ecdh::EphemeralSecret),
}

impl std::fmt::Debug for DhPrivate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DhPrivate(..)")
    }
}

fn modp_prime(id: u16) -> Result<&'static BigUint> {
    match id {
        dh::MODP_768 => Ok(&P_768),
        dh::MODP_1024 => Ok(&P_1024),
        dh::MODP_1536 => Ok(&P_1536),
        dh::MODP_2048 => Ok(&P_2048),
        dh::MODP_3072 => Ok(&P_3072),
        dh::MODP_4096 => Ok(&P_4096),
        dh::MODP_6144 => Ok(&P_6144),
        dh::MODP_8192 => Ok(&P_8192),
        other => Err(Error::UnsupportedAlgorithm(format!("dh group {}", other))),
    }
}

/// Left-pad a big-endian value to `len` octets
fn pad_be(bytes: Vec<u8>, len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes;
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

impl DhGroup {
    /// Look up a group by its IKEv2 transform ID
    pub fn from_transform_id(id: u16) -> Result<Self> {
        match id {
            dh::ECP_256 => Ok(DhGroup::Ecp256),
            dh::ECP_384 => Ok(DhGroup::Ecp384),
            dh::ECP_521 => Ok(DhGroup::Ecp521),
            modp => {
                modp_prime(modp)?;
                Ok(DhGroup::Modp(modp))
            }
        }
    }

    /// The group's IKEv2 transform ID
    pub fn transform_id(&self) -> u16 {
        match self {
            DhGroup::Modp(id) => *id,
            DhGroup::Ecp256 => dh::ECP_256,
            DhGroup::Ecp384 => dh::ECP_384,
            DhGroup::Ecp521 => dh::ECP_521,
        }
    }

    /// Length of the KE public value in octets
    pub fn public_len(&self) -> usize {
        match self {
            DhGroup::Modp(id) => modp_prime(*id).expect("validated id").bits() as usize / 8,
            DhGroup::Ecp256 => 64,
            DhGroup::Ecp384 => 96,
            DhGroup::Ecp521 => 132,
        }
    }

    /// Generate an ephemeral keypair, returning the private half and the
    /// wire-format public value
    pub fn generate(&self) -> (DhPrivate, Vec<u8>) {
        let mut rng = rand::thread_rng();
        match self {
            DhGroup::Modp(id) => {
                let p = modp_prime(*id).expect("validated id");
                let x = rng.gen_biguint_range(&BigUint::from(2u32), &(p - 2u32));
                let public = G.modpow(&x, p);
                let private = DhPrivate::Modp(Zeroizing::new(x.to_bytes_be()));
                (private, pad_be(public.to_bytes_be(), self.public_len()))
            }
            DhGroup::Ecp256 => {
                use p256::elliptic_curve::sec1::ToEncodedPoint;
                let secret = p256::ecdh::EphemeralSecret::random(&mut rng);
                let point = secret.public_key().to_encoded_point(false);
                // uncompressed SEC1 minus the 0x04 tag: x | y (RFC 5903)
                let public = point.as_bytes()[1..].to_vec();
                (DhPrivate::P256(secret), public)
            }
            DhGroup::Ecp384 => {
                use p384::elliptic_curve::sec1::ToEncodedPoint;
                let secret = p384::ecdh::EphemeralSecret::random(&mut rng);
                let point = secret.public_key().to_encoded_point(false);
                let public = point.as_bytes()[1..].to_vec();
                (DhPrivate::P384(secret), public)
            }
            DhGroup::Ecp521 => {
                use p521::elliptic_curve::sec1::ToEncodedPoint;
                let secret = p521::ecdh::EphemeralSecret::random(&mut rng);
                let point = secret.public_key().to_encoded_point(false);
                let public = point.as_bytes()[1..].to_vec();
                (DhPrivate::P521(secret), public)
            }
        }
    }

    /// Compute the shared secret from the peer's public value.
    ///
    /// # Errors
    ///
    /// `InvalidKePayload` for out-of-range MODP values, malformed curve
    /// points, or a private key from a different group.
    pub fn shared(&self, peer_public: &[u8], private: &DhPrivate) -> Result<Vec<u8>> {
        match (self, private) {
            (DhGroup::Modp(id), DhPrivate::Modp(x)) => {
                let p = modp_prime(*id)?;
                let y = BigUint::from_bytes_be(peer_public);
                // reject the degenerate subgroup: 1 < y < p-1
                if y <= BigUint::from(1u32) || y >= p - 1u32 {
                    return Err(Error::Protocol(IkeError::InvalidKePayload));
                }
                let x = BigUint::from_bytes_be(x);
                let k = y.modpow(&x, p);
                Ok(pad_be(k.to_bytes_be(), self.public_len()))
            }
            (DhGroup::Ecp256, DhPrivate::P256(secret)) => {
                let sec1 = sec1_uncompressed(peer_public, 32)?;
                let pk = p256::PublicKey::from_sec1_bytes(&sec1)
                    .map_err(|_| Error::Protocol(IkeError::InvalidKePayload))?;
                Ok(secret.diffie_hellman(&pk).raw_secret_bytes().to_vec())
            }
            (DhGroup::Ecp384, DhPrivate::P384(secret)) => {
                let sec1 = sec1_uncompressed(peer_public, 48)?;
                let pk = p384::PublicKey::from_sec1_bytes(&sec1)
                    .map_err(|_| Error::Protocol(IkeError::InvalidKePayload))?;
                Ok(secret.diffie_hellman(&pk).raw_secret_bytes().to_vec())
            }
            (DhGroup::Ecp521, DhPrivate::P521(secret)) => {
                let sec1 = sec1_uncompressed(peer_public, 66)?;
                let pk = p521::PublicKey::from_sec1_bytes(&sec1)
                    .map_err(|_| Error::Protocol(IkeError::InvalidKePayload))?;
                Ok(secret.diffie_hellman(&pk).raw_secret_bytes().to_vec())
            }
            _ => Err(Error::Protocol(IkeError::InvalidKePayload)),
        }
    }
}

/// Rebuild an uncompressed SEC1 point from the RFC 5903 `x | y` wire form
fn sec1_uncompressed(wire: &[u8], coord_len: usize) -> Result<Vec<u8>> {
    if wire.len() != 2 * coord_len {
        return Err(Error::Protocol(IkeError::InvalidKePayload));
    }
    let mut sec1 = Vec::with_capacity(1 + wire.len());
    sec1.push(0x04);
    sec1.extend_from_slice(wire);
    Ok(sec1)
}
