//! Two-party handshakes over an in-memory wire
//!
//! The initiator session and a serving dispatcher run as real tasks and
//! talk through channels standing in for UDP sockets. Covers the plain
//! handshake, the stateless cookie challenge and the DH-group redirect.

use osprey_platform::{DataPlane, PlatformResult, SaParams};
use osprey_proto::ike::constants::{dh, TransformType};
use osprey_proto::ike::proposal::Transform;
use osprey_proto::ike::{
    AuthConfig, Config, Dispatch, Dispatcher, Identity, Message, Session,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use zeroize::Zeroizing;

#[derive(Default)]
struct RecordingPlane {
    added: Mutex<Vec<SaParams>>,
    removed: Mutex<Vec<SaParams>>,
}

impl RecordingPlane {
    fn added_count(&self) -> usize {
        self.added.lock().unwrap().len()
    }
    fn removed_count(&self) -> usize {
        self.removed.lock().unwrap().len()
    }
}

impl DataPlane for RecordingPlane {
    fn add_sa(&self, sa: &SaParams) -> PlatformResult<()> {
        self.added.lock().unwrap().push(sa.clone());
        Ok(())
    }
    fn remove_sa(&self, sa: &SaParams) -> PlatformResult<()> {
        self.removed.lock().unwrap().push(sa.clone());
        Ok(())
    }
}

fn initiator_config() -> Config {
    Config::new(
        Identity::Email("roadwarrior@test".into()),
        Identity::Email("gateway@test".into()),
        AuthConfig::SharedKey(Zeroizing::new(b"both sides know this".to_vec())),
    )
}

fn responder_config() -> Config {
    Config::new(
        Identity::Email("gateway@test".into()),
        Identity::Email("roadwarrior@test".into()),
        AuthConfig::SharedKey(Zeroizing::new(b"both sides know this".to_vec())),
    )
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

/// Wire up one initiator against a serving dispatcher and drive the
/// handshake to maturity. Returns the planes and the initiator handle.
async fn establish(
    throttle: bool,
    tweak_initiator: impl FnOnce(&mut Config),
) -> (
    Arc<RecordingPlane>,
    Arc<RecordingPlane>,
    osprey_proto::ike::SessionHandle,
) {
    let client_addr: SocketAddr = "192.0.2.1:500".parse().unwrap();
    let server_addr: SocketAddr = "192.0.2.2:500".parse().unwrap();

    let plane_client = Arc::new(RecordingPlane::default());
    let plane_server = Arc::new(RecordingPlane::default());

    let mut cfg = initiator_config();
    tweak_initiator(&mut cfg);
    let mut client = Session::new_initiator(cfg, Some(plane_client.clone())).unwrap();
    client.set_addresses(client_addr, server_addr);
    let client_handle = client.handle();

    let (to_server_tx, mut to_server_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    // client task
    tokio::spawn(async move {
        client
            .run(move |bytes| {
                let _ = to_server_tx.send(bytes.to_vec());
                Ok(())
            })
            .await;
    });

    // server task: dispatcher plus one responder session per first contact
    let server_plane = plane_server.clone();
    tokio::spawn(async move {
        let mut dispatcher = Dispatcher::new(true, Some(server_plane));
        while let Some(datagram) = to_server_rx.recv().await {
            let make_config = || {
                let mut cfg = responder_config();
                cfg.throttle_init_requests = throttle;
                cfg
            };
            match dispatcher
                .dispatch(&datagram, server_addr, client_addr, make_config)
                .await
                .unwrap()
            {
                Dispatch::Reply(reply) => {
                    let _ = to_client_tx.send(reply);
                }
                Dispatch::NewSession(mut session) => {
                    let tx = to_client_tx.clone();
                    tokio::spawn(async move {
                        session
                            .run(move |bytes| {
                                let _ = tx.send(bytes.to_vec());
                                Ok(())
                            })
                            .await;
                    });
                }
                Dispatch::Routed | Dispatch::Dropped => {}
            }
        }
    });

    // pump server->client bytes into the client session
    let pump_handle = client_handle.clone();
    tokio::spawn(async move {
        while let Some(bytes) = to_client_rx.recv().await {
            if let Ok(msg) = Message::decode(&bytes) {
                let _ = pump_handle.post_message(msg).await;
            }
        }
    });

    (plane_client, plane_server, client_handle)
}

#[tokio::test]
async fn full_handshake_installs_matching_sas() {
    let (client_plane, server_plane, client) = establish(false, |_| {}).await;

    wait_for("both installs", || {
        client_plane.added_count() == 1 && server_plane.added_count() == 1
    })
    .await;

    let a = &client_plane.added.lock().unwrap()[0];
    let b = &server_plane.added.lock().unwrap()[0];
    assert_eq!(a.esp_ei, b.esp_ei);
    assert_eq!(a.esp_ai, b.esp_ai);
    assert_eq!(a.esp_er, b.esp_er);
    assert_eq!(a.esp_ar, b.esp_ar);
    assert_eq!(a.spi_i, b.spi_i);
    assert_eq!(a.spi_r, b.spi_r);
    assert_ne!(a.esp_ei, a.esp_er);
    assert!(!a.esp_ei.is_empty());

    // orderly shutdown: delete flows, both sides remove exactly once
    client.close(None);
    wait_for("both removals", || {
        client_plane.removed_count() == 1 && server_plane.removed_count() == 1
    })
    .await;
}

#[tokio::test]
async fn cookie_challenge_round_trip() {
    let (client_plane, server_plane, _client) = establish(true, |_| {}).await;

    // the first INIT draws a challenge; the echoed cookie completes the
    // handshake without any extra help
    wait_for("handshake despite throttling", || {
        client_plane.added_count() == 1 && server_plane.added_count() == 1
    })
    .await;
}

#[tokio::test]
async fn dh_group_redirect_recovers() {
    let (client_plane, server_plane, _client) = establish(false, |cfg| {
        // propose MODP-1024 against a gateway that requires MODP-2048
        cfg.proposal_ike.0.insert(
            TransformType::Dh,
            Transform::new(TransformType::Dh, dh::MODP_1024),
        );
    })
    .await;

    wait_for("handshake after INVALID_KE_PAYLOAD", || {
        client_plane.added_count() == 1 && server_plane.added_count() == 1
    })
    .await;

    // the installed SA came from the negotiated (redirected) group
    let a = &client_plane.added.lock().unwrap()[0];
    let b = &server_plane.added.lock().unwrap()[0];
    assert_eq!(a.esp_ei, b.esp_ei);
}

#[tokio::test]
async fn wrong_psk_never_installs() {
    let (client_plane, server_plane, _client) = establish(false, |cfg| {
        cfg.auth = AuthConfig::SharedKey(Zeroizing::new(b"something else".to_vec()));
    })
    .await;

    // the responder rejects AUTH; give the exchange time to play out
    sleep(Duration::from_millis(300)).await;
    assert_eq!(client_plane.added_count(), 0);
    assert_eq!(server_plane.added_count(), 0);
}
