//! # Osprey Platform
//!
//! Boundary types between the Osprey IKEv2 control plane and whatever
//! installs the negotiated keys: kernel XFRM, PF_KEY, or a userspace ESP
//! stack.
//!
//! The control plane never touches the data plane directly. When an IKE SA
//! reaches maturity it hands a [`SaParams`] bundle to a [`DataPlane`]
//! implementation; on teardown the same bundle is handed back for removal.
//!
//! # Examples
//!
//! ```
//! use osprey_platform::{DataPlane, PlatformResult, SaParams};
//!
//! struct NullPlane;
//!
//! impl DataPlane for NullPlane {
//!     fn add_sa(&self, _sa: &SaParams) -> PlatformResult<()> {
//!         Ok(())
//!     }
//!     fn remove_sa(&self, _sa: &SaParams) -> PlatformResult<()> {
//!         Ok(())
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod sa;

pub use error::{FailedOp, PlatformError, PlatformResult};
pub use sa::{DataPlane, SaParams, SelectorParams};

/// Platform crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
