//! IKEv2 control-plane engine (RFC 7296)
//!
//! This module negotiates, authenticates and tears down IKE Security
//! Associations and the first ESP child SA they authorize. It speaks
//! IKEv2 over UDP/500 and UDP/4500 in both the initiator and responder
//! roles, one peer pairing per [`Session`].
//!
//! # Architecture
//!
//! ```text
//! UDP reader ──► Dispatcher ──► Session task ──► UDP writer
//!                 (by SPI)        ├── codec      (write_fn)
//!                                 ├── TKM (keys)
//!                                 └── state machine
//!                                        │
//!                                        ▼
//!                                 DataPlane callbacks
//!                                 (XFRM / ESP install)
//! ```
//!
//! Packet I/O stays outside: the caller reads datagrams, feeds them to a
//! [`Dispatcher`], spawns [`Session::run`] with a write callback, and
//! implements `osprey_platform::DataPlane` to install the negotiated
//! keys.
//!
//! # Example
//!
//! ```no_run
//! use osprey_proto::ike::{AuthConfig, Config, Identity, Session};
//! use zeroize::Zeroizing;
//!
//! # async fn example() -> osprey_proto::ike::Result<()> {
//! let cfg = Config::new(
//!     Identity::Fqdn("east.example.net".into()),
//!     Identity::Fqdn("west.example.net".into()),
//!     AuthConfig::SharedKey(Zeroizing::new(b"shared secret".to_vec())),
//! );
//! let mut session = Session::new_initiator(cfg, None)?;
//! session.set_addresses("192.0.2.1:500".parse().unwrap(), "192.0.2.2:500".parse().unwrap());
//! let handle = session.handle();
//!
//! tokio::spawn(async move {
//!     session
//!         .run(|bytes| {
//!             // hand the datagram to the UDP socket
//!             let _ = bytes;
//!             Ok(())
//!         })
//!         .await;
//! });
//! # handle.close(None);
//! # Ok(())
//! # }
//! ```

pub mod auth;
mod auth_exchange;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod dispatch;
pub mod error;
mod init;
mod informational;
pub mod message;
pub mod nat;
pub mod payload;
pub mod proposal;
pub mod session;
pub mod state;
pub mod tkm;

pub use config::{AuthConfig, Config, Identity};
pub use dispatch::{Dispatch, Dispatcher};
pub use error::{Error, IkeError, Result};
pub use init::{cookie_hash, notification_response};
pub use message::{IkeHeader, Message};
pub use session::{Session, SessionHandle};
pub use state::State;
pub use tkm::Tkm;
