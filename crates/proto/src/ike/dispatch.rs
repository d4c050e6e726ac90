//! Inbound routing: SPI-keyed session lookup and first-contact handling
//!
//! The dispatcher sits between the UDP reader and the sessions. For each
//! datagram it decodes the fixed header only; full decode happens once the
//! owning session is known (or, for a first INIT, before responder state
//! is created). Unknown SPIs are dropped without a reply.

use super::config::Config;
use super::constants::{ExchangeType, NotifyType};
use super::error::Result;
use super::init::{cookie_hash, notification_response};
use super::message::{IkeHeader, Message};
use super::session::{Session, SessionHandle};
use osprey_platform::DataPlane;
use rand::RngCore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The 4-byte zero prefix carried before IKE messages on UDP/4500
pub const NON_ESP_MARKER: [u8; 4] = [0, 0, 0, 0];

/// Strip the non-ESP marker from a UDP/4500 datagram. Returns `None` for
/// datagrams without the marker (those are ESP and belong to the data
/// plane).
pub fn strip_non_esp_marker(datagram: &[u8]) -> Option<&[u8]> {
    datagram
        .strip_prefix(&NON_ESP_MARKER[..])
        .filter(|rest| !rest.is_empty())
}

/// Prepend the non-ESP marker for writes on UDP/4500
pub fn add_non_esp_marker(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + message.len());
    out.extend_from_slice(&NON_ESP_MARKER);
    out.extend_from_slice(message);
    out
}

/// What the dispatcher decided for one datagram
pub enum Dispatch {
    /// Delivered to an existing session
    Routed,
    /// A responder session was created (and already fed the message);
    /// the caller spawns its run loop
    NewSession(Box<Session>),
    /// Reply to send without creating any state (cookie challenge)
    Reply(Vec<u8>),
    /// Silently dropped
    Dropped,
}

/// SPI-keyed router for all sessions sharing one socket pair
pub struct Dispatcher {
    sessions: HashMap<[u8; 8], SessionHandle>,
    is_server: bool,
    cookie_secret: [u8; 32],
    data_plane: Option<Arc<dyn DataPlane>>,
}

impl Dispatcher {
    /// Create a dispatcher. `is_server` enables responder-session
    /// creation on first contact; the configuration's
    /// `throttle_init_requests` flag arms the stateless cookie challenge.
    pub fn new(is_server: bool, data_plane: Option<Arc<dyn DataPlane>>) -> Self {
        let mut cookie_secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut cookie_secret);
        Dispatcher {
            sessions: HashMap::new(),
            is_server,
            cookie_secret,
            data_plane,
        }
    }

    /// Register a locally created (initiator) session
    pub fn register(&mut self, handle: SessionHandle) {
        self.sessions.insert(handle.spi_i(), handle);
    }

    /// Drop handles whose sessions have finished
    pub fn prune_finished(&mut self) {
        self.sessions.retain(|_, h| !h.is_finished());
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Route one datagram (marker already stripped on UDP/4500).
    ///
    /// `make_config` is called once per accepted first contact to produce
    /// the responder configuration.
    pub async fn dispatch<F>(
        &mut self,
        datagram: &[u8],
        local: SocketAddr,
        remote: SocketAddr,
        make_config: F,
    ) -> Result<Dispatch>
    where
        F: FnOnce() -> Config,
    {
        let header = match IkeHeader::decode(datagram) {
            Ok(h) => h,
            Err(e) => {
                debug!(%remote, error = %e, "undecodable header");
                return Ok(Dispatch::Dropped);
            }
        };

        if let Some(handle) = self.sessions.get(&header.spi_i) {
            let msg = match Message::decode(datagram) {
                Ok(m) => m,
                Err(e) => {
                    debug!(%remote, error = %e, "undecodable message");
                    return Ok(Dispatch::Dropped);
                }
            };
            if handle.post_message(msg).await.is_err() {
                self.sessions.remove(&header.spi_i);
                return Ok(Dispatch::Dropped);
            }
            return Ok(Dispatch::Routed);
        }

        let first_contact = header.exchange_type == ExchangeType::IkeSaInit
            && header.spi_r == [0u8; 8]
            && !header.flags.response;
        if !first_contact || !self.is_server {
            debug!(%remote, spi_i = %hex::encode(header.spi_i), "unknown SPI");
            return Ok(Dispatch::Dropped);
        }

        let msg = match Message::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                debug!(%remote, error = %e, "undecodable INIT");
                return Ok(Dispatch::Dropped);
            }
        };

        let config = make_config();
        if config.throttle_init_requests {
            match self.check_cookie(&msg, remote) {
                CookieCheck::Accept => {}
                CookieCheck::Challenge(reply) => return Ok(Dispatch::Reply(reply)),
                CookieCheck::Drop => return Ok(Dispatch::Dropped),
            }
        }

        // policy runs before any responder state exists; mismatches are
        // answered statelessly with the most specific notify
        if let Err(e) = super::init::check_init_policy(&config, &msg) {
            let Some(nt) = e.notify_type() else {
                return Ok(Dispatch::Dropped);
            };
            debug!(%remote, notify = ?nt, "INIT rejected by policy");
            let data = if nt == NotifyType::InvalidKePayload {
                config
                    .dh_transform_id()
                    .map(|g| g.to_be_bytes().to_vec())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            let reply = notification_response(header.spi_i, nt, data);
            return Ok(match reply.encode(None, false) {
                Ok(bytes) => Dispatch::Reply(bytes),
                Err(_) => Dispatch::Dropped,
            });
        }

        let mut session =
            match Session::new_responder(config, header.spi_i, self.data_plane.clone()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(%remote, error = %e, "responder session rejected");
                    return Ok(Dispatch::Dropped);
                }
            };
        session.set_addresses(local, remote);
        let handle = session.handle();
        if handle.post_message(msg).await.is_err() {
            return Ok(Dispatch::Dropped);
        }
        info!(%remote, spi_i = %hex::encode(header.spi_i), "responder session created");
        self.sessions.insert(header.spi_i, handle);
        Ok(Dispatch::NewSession(Box::new(session)))
    }

    fn check_cookie(&self, msg: &Message, remote: SocketAddr) -> CookieCheck {
        let Some(nonce) = msg.nonce() else {
            return CookieCheck::Drop;
        };
        let expected = cookie_hash(&nonce.nonce, &msg.header.spi_i, remote, &self.cookie_secret);
        match msg.notify(NotifyType::Cookie) {
            None => {
                debug!(%remote, "INIT without cookie; challenging");
                let reply = notification_response(msg.header.spi_i, NotifyType::Cookie, expected);
                match reply.encode(None, false) {
                    Ok(bytes) => CookieCheck::Challenge(bytes),
                    Err(_) => CookieCheck::Drop,
                }
            }
            Some(n) => {
                use subtle::ConstantTimeEq;
                if n.data.len() == expected.len() && n.data.ct_eq(&expected).unwrap_u8() == 1 {
                    CookieCheck::Accept
                } else {
                    debug!(%remote, "INIT with wrong cookie");
                    CookieCheck::Drop
                }
            }
        }
    }
}

enum CookieCheck {
    Accept,
    Challenge(Vec<u8>),
    Drop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ike::config::{AuthConfig, Identity};
    use zeroize::Zeroizing;

    fn cfg() -> Config {
        Config::new(
            Identity::Email("res@test".into()),
            Identity::Email("ini@test".into()),
            AuthConfig::SharedKey(Zeroizing::new(b"secret".to_vec())),
        )
    }

    fn throttled_cfg() -> Config {
        let mut cfg = cfg();
        cfg.throttle_init_requests = true;
        cfg
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("10.0.0.1:500".parse().unwrap(), "10.0.0.2:500".parse().unwrap())
    }

    #[test]
    fn test_non_esp_marker() {
        let msg = vec![1u8, 2, 3];
        let framed = add_non_esp_marker(&msg);
        assert_eq!(&framed[..4], &NON_ESP_MARKER);
        assert_eq!(strip_non_esp_marker(&framed).unwrap(), &msg[..]);
        // an ESP packet starts with a non-zero SPI
        assert!(strip_non_esp_marker(&[0x12, 0x34, 0x56, 0x78, 1]).is_none());
        assert!(strip_non_esp_marker(&NON_ESP_MARKER).is_none());
    }

    #[tokio::test]
    async fn test_garbage_dropped() {
        let (local, remote) = addrs();
        let mut d = Dispatcher::new(true, None);
        let out = d.dispatch(&[0u8; 10], local, remote, cfg).await.unwrap();
        assert!(matches!(out, Dispatch::Dropped));
    }

    #[tokio::test]
    async fn test_unknown_spi_dropped() {
        let (local, remote) = addrs();
        let mut d = Dispatcher::new(true, None);
        // a well-formed notify response for a session nobody owns
        let msg = crate::ike::init::notification_response(
            [9u8; 8],
            NotifyType::InvalidSyntax,
            vec![],
        );
        let wire = msg.encode(None, false).unwrap();
        let out = d.dispatch(&wire, local, remote, cfg).await.unwrap();
        assert!(matches!(out, Dispatch::Dropped));
    }

    #[tokio::test]
    async fn test_first_contact_requires_server() {
        let (local, remote) = addrs();
        // craft a minimal INIT request from a real initiator session
        let mut ini = Session::new_initiator(cfg(), None).unwrap();
        ini.set_addresses(remote, local);
        let wire = {
            // drive just the first step to capture the INIT bytes
            let handle = ini.handle();
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            tokio::spawn(async move {
                // session loop writes the INIT and then idles
                ini.run(move |b| {
                    let _ = tx.send(b.to_vec());
                    Ok(())
                })
                .await;
            });
            let bytes = rx.recv().await.expect("INIT emitted");
            handle.close(None);
            bytes
        };

        let mut client_only = Dispatcher::new(false, None);
        let out = client_only
            .dispatch(&wire, local, remote, cfg)
            .await
            .unwrap();
        assert!(matches!(out, Dispatch::Dropped));

        let mut server = Dispatcher::new(true, None);
        let out = server.dispatch(&wire, local, remote, cfg).await.unwrap();
        assert!(matches!(out, Dispatch::NewSession(_)));
        assert_eq!(server.len(), 1);
    }

    #[tokio::test]
    async fn test_cookie_challenge_creates_no_state() {
        let (local, remote) = addrs();
        let mut ini = Session::new_initiator(cfg(), None).unwrap();
        ini.set_addresses(remote, local);
        let handle = ini.handle();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            ini.run(move |b| {
                let _ = tx.send(b.to_vec());
                Ok(())
            })
            .await;
        });
        let wire = rx.recv().await.expect("INIT emitted");
        handle.close(None);

        let mut server = Dispatcher::new(true, None);
        let out = server
            .dispatch(&wire, local, remote, throttled_cfg)
            .await
            .unwrap();
        let Dispatch::Reply(reply) = out else {
            panic!("expected a cookie challenge");
        };
        assert!(server.is_empty());

        let challenge = Message::decode(&reply).unwrap();
        assert!(challenge.notify(NotifyType::Cookie).is_some());

        // resending without the cookie draws another challenge, no state
        let out = server
            .dispatch(&wire, local, remote, throttled_cfg)
            .await
            .unwrap();
        assert!(matches!(out, Dispatch::Reply(_)));
        assert!(server.is_empty());
    }
}
