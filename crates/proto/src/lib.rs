//! Protocol implementations for the Osprey security ecosystem.
//!
//! This crate currently provides one protocol engine:
//!
//! - **IKEv2** (Internet Key Exchange v2) - RFC 7296 control plane
//!
//! The engine negotiates, authenticates, rekeys and tears down IKE Security
//! Associations and the ESP child SAs they authorize. Packet I/O and SA
//! installation are left to the caller; see [`ike::Session::run`] and the
//! `osprey-platform` crate for the two boundaries.
//!
//! # Security
//!
//! - All cryptographic operations use vetted RustCrypto / dalek libraries
//! - Constant-time comparison for MACs, AUTH data and cookies
//! - Secret key material is zeroized on drop with `zeroize`

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ike;
