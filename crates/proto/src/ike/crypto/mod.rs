//! Cryptographic primitives for IKEv2
//!
//! The registry is fixed at compile time: transform IDs map onto
//! implementations through `match`, so lookups are lock-free and the set
//! cannot change after startup.

pub mod cipher;
pub mod dh;
pub mod prf;

pub use cipher::{CipherSuite, IntegAlgorithm};
pub use dh::{DhGroup, DhPrivate};
pub use prf::PrfAlgorithm;
