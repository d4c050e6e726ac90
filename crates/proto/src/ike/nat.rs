//! NAT detection (RFC 7296 Section 2.23, RFC 3948)
//!
//! During IKE_SA_INIT both sides send NAT_DETECTION_SOURCE_IP and
//! NAT_DETECTION_DESTINATION_IP notifications carrying
//! `SHA-1(SPIi | SPIr | address | port)`. A hash that does not match the
//! locally observed 5-tuple means a NAT rewrote that side's address.

use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use subtle::ConstantTimeEq;

/// Length of a NAT detection hash (SHA-1 output)
pub const NAT_HASH_LEN: usize = 20;

/// Compute the detection hash for one endpoint
pub fn nat_hash(spi_i: &[u8; 8], spi_r: &[u8; 8], addr: SocketAddr) -> Vec<u8> {
    let mut h = Sha1::new();
    h.update(spi_i);
    h.update(spi_r);
    match addr.ip() {
        std::net::IpAddr::V4(a) => h.update(a.octets()),
        std::net::IpAddr::V6(a) => h.update(a.octets()),
    }
    h.update(addr.port().to_be_bytes());
    h.finalize().to_vec()
}

/// Check a received detection hash against the address we observe.
/// Returns true when they agree (no NAT on that side).
pub fn check_nat_hash(
    received: &[u8],
    spi_i: &[u8; 8],
    spi_r: &[u8; 8],
    addr: SocketAddr,
) -> bool {
    let expected = nat_hash(spi_i, spi_r, addr);
    received.len() == expected.len() && expected.ct_eq(received).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_hash_length() {
        let h = nat_hash(&[1; 8], &[2; 8], addr("192.0.2.1:500"));
        assert_eq!(h.len(), NAT_HASH_LEN);
    }

    #[test]
    fn test_same_tuple_matches() {
        let spi_i = [0x11; 8];
        let spi_r = [0x22; 8];
        let a = addr("192.0.2.1:500");
        let h = nat_hash(&spi_i, &spi_r, a);
        assert!(check_nat_hash(&h, &spi_i, &spi_r, a));
    }

    #[test]
    fn test_rewritten_address_detected() {
        let spi_i = [0x11; 8];
        let spi_r = [0x22; 8];
        let h = nat_hash(&spi_i, &spi_r, addr("10.0.0.1:500"));
        // NAT rewrote source to a public address
        assert!(!check_nat_hash(&h, &spi_i, &spi_r, addr("203.0.113.9:500")));
        // or just the port
        assert!(!check_nat_hash(&h, &spi_i, &spi_r, addr("10.0.0.1:4500")));
    }

    #[test]
    fn test_spi_binding() {
        let a = addr("192.0.2.1:500");
        let h = nat_hash(&[1; 8], &[2; 8], a);
        assert!(!check_nat_hash(&h, &[1; 8], &[3; 8], a));
    }

    #[test]
    fn test_ipv6_tuple() {
        let a = addr("[2001:db8::1]:4500");
        let h = nat_hash(&[5; 8], &[6; 8], a);
        assert!(check_nat_hash(&h, &[5; 8], &[6; 8], a));
        assert!(!check_nat_hash(&h, &[5; 8], &[6; 8], addr("[2001:db8::2]:4500")));
    }
}
