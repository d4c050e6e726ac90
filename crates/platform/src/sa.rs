//! Security Association parameters handed across the data-plane boundary

use crate::PlatformResult;
use std::net::IpAddr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// One traffic selector: an address range plus port range and IP protocol.
///
/// `protocol == 0` means "any protocol"; the full port range is
/// `0..=65535`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorParams {
    /// First address of the range (inclusive)
    pub start_addr: IpAddr,
    /// Last address of the range (inclusive)
    pub end_addr: IpAddr,
    /// First port of the range (inclusive)
    pub start_port: u16,
    /// Last port of the range (inclusive)
    pub end_port: u16,
    /// IP protocol number (0 = any)
    pub protocol: u8,
}

impl SelectorParams {
    /// Selector covering a single host, all ports, all protocols
    pub fn for_host(addr: IpAddr) -> Self {
        SelectorParams {
            start_addr: addr,
            end_addr: addr,
            start_port: 0,
            end_port: 65535,
            protocol: 0,
        }
    }
}

/// Everything the data plane needs to install (or remove) the ESP SA pair
/// authorized by one IKE SA.
///
/// The four ESP keys are zeroized when the bundle is dropped. The structure
/// is passed by reference to [`DataPlane`] callbacks; implementations must
/// copy what they need rather than retaining the reference.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SaParams {
    /// IKE SA initiator SPI (8 octets)
    pub spi_i: [u8; 8],
    /// IKE SA responder SPI (8 octets)
    pub spi_r: [u8; 8],
    /// ESP SPI chosen by the initiator (4 octets)
    pub esp_spi_i: u32,
    /// ESP SPI chosen by the responder (4 octets)
    pub esp_spi_r: u32,

    /// ESP encryption key, initiator-to-responder direction
    pub esp_ei: Vec<u8>,
    /// ESP integrity key, initiator-to-responder direction
    pub esp_ai: Vec<u8>,
    /// ESP encryption key, responder-to-initiator direction
    pub esp_er: Vec<u8>,
    /// ESP integrity key, responder-to-initiator direction
    pub esp_ar: Vec<u8>,

    /// Negotiated ESP encryption transform ID (IANA value)
    pub encr_transform: u16,
    /// Negotiated ESP integrity transform ID (IANA value, 0 for AEAD)
    pub integ_transform: u16,

    /// Initiator traffic selectors
    #[zeroize(skip)]
    pub ts_i: Vec<SelectorParams>,
    /// Responder traffic selectors
    #[zeroize(skip)]
    pub ts_r: Vec<SelectorParams>,

    /// Transport mode (true) vs tunnel mode (false)
    pub is_transport: bool,
    /// Whether the local end initiated the IKE SA
    pub is_initiator: bool,
}

impl std::fmt::Debug for SaParams {
    // keys deliberately omitted
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaParams")
            .field("spi_i", &self.spi_i)
            .field("spi_r", &self.spi_r)
            .field("esp_spi_i", &format_args!("{:#010x}", self.esp_spi_i))
            .field("esp_spi_r", &format_args!("{:#010x}", self.esp_spi_r))
            .field("encr_transform", &self.encr_transform)
            .field("integ_transform", &self.integ_transform)
            .field("ts_i", &self.ts_i)
            .field("ts_r", &self.ts_r)
            .field("is_transport", &self.is_transport)
            .field("is_initiator", &self.is_initiator)
            .finish_non_exhaustive()
    }
}

/// Interface the control plane calls to install and remove SAs.
///
/// `add_sa` is invoked exactly once when an IKE SA transitions to maturity;
/// `remove_sa` exactly once on session teardown. Both run on the session
/// task, so implementations should not block for long.
pub trait DataPlane: Send + Sync {
    /// Install the ESP SA pair described by `sa`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform rejects the parameters; the session
    /// treats this as fatal and tears down.
    fn add_sa(&self, sa: &SaParams) -> PlatformResult<()>;

    /// Remove the ESP SA pair described by `sa`.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails; teardown continues regardless.
    fn remove_sa(&self, sa: &SaParams) -> PlatformResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn params() -> SaParams {
        SaParams {
            spi_i: [1; 8],
            spi_r: [2; 8],
            esp_spi_i: 0x11223344,
            esp_spi_r: 0x55667788,
            esp_ei: vec![0xAA; 16],
            esp_ai: vec![0xBB; 20],
            esp_er: vec![0xCC; 16],
            esp_ar: vec![0xDD; 20],
            encr_transform: 12,
            integ_transform: 2,
            ts_i: vec![SelectorParams::for_host(IpAddr::V4(Ipv4Addr::LOCALHOST))],
            ts_r: vec![SelectorParams::for_host(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))],
            is_transport: false,
            is_initiator: true,
        }
    }

    #[test]
    fn test_host_selector() {
        let sel = SelectorParams::for_host(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(sel.start_addr, sel.end_addr);
        assert_eq!(sel.start_port, 0);
        assert_eq!(sel.end_port, 65535);
        assert_eq!(sel.protocol, 0);
    }

    #[test]
    fn test_debug_hides_keys() {
        let out = format!("{:?}", params());
        assert!(!out.contains("esp_ei"));
        assert!(out.contains("0x11223344"));
    }

    struct CountingPlane(std::sync::atomic::AtomicUsize);

    impl DataPlane for CountingPlane {
        fn add_sa(&self, _sa: &SaParams) -> PlatformResult<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        fn remove_sa(&self, _sa: &SaParams) -> PlatformResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_data_plane_trait_object() {
        let plane: &dyn DataPlane = &CountingPlane(std::sync::atomic::AtomicUsize::new(0));
        plane.add_sa(&params()).unwrap();
    }
}
