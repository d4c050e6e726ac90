//! IKE SA session: one peer pairing, one task
//!
//! A session owns three queues and drains them in strict priority order:
//! wire bytes waiting for the writer first, then inbound messages, then
//! state-machine events, then the cancellation signal. That ordering is
//! what guarantees a shutdown never strands bytes that were already
//! queued.
//!
//! All side effects live here. The state machine itself
//! ([`super::state::transition`]) is a pure table; the session interprets
//! the [`Action`] it returns.

use super::config::Config;
use super::constants::{ExchangeType, PayloadType};
use super::error::{Error, IkeError, Result};
use super::message::Message;
use super::state::{transition, Action, Event, State};
use super::tkm::Tkm;
use crate::ike::crypto::CipherSuite;
use crate::ike::payload::Selector;
use osprey_platform::{DataPlane, SaParams, SelectorParams};
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Bound on the outgoing wire-bytes queue
const OUTGOING_QUEUE_LEN: usize = 10;

/// Bound on the inbound message queue
const INCOMING_QUEUE_LEN: usize = 10;

/// Generate a random 8-octet IKE SPI
pub fn make_ike_spi() -> [u8; 8] {
    let mut spi = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut spi);
    spi
}

/// Generate a random non-zero 4-octet ESP SPI
pub fn make_esp_spi() -> u32 {
    loop {
        let spi = rand::thread_rng().next_u32();
        // values 0-255 are reserved
        if spi > 255 {
            return spi;
        }
    }
}

/// Cheap handle for the dispatcher and other tasks: enqueue messages,
/// request shutdown, observe completion.
#[derive(Clone)]
pub struct SessionHandle {
    spi_i: [u8; 8],
    incoming_tx: mpsc::Sender<Message>,
    events_tx: mpsc::UnboundedSender<Event>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionHandle {
    /// The initiator SPI this session is keyed by
    pub fn spi_i(&self) -> [u8; 8] {
        self.spi_i
    }

    /// Hand a routed message to the session task.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` once the session has shut down.
    pub async fn post_message(&self, msg: Message) -> Result<()> {
        self.incoming_tx
            .send(msg)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Ask the session to tear down. Idempotent; the queued Delete and
    /// callbacks run on the session task.
    pub fn close(&self, err: Option<Error>) {
        let _ = self.events_tx.send(Event::DeleteIkeSa(err));
    }

    /// Whether the session task has finished
    pub fn is_finished(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Completes when the session reaches its terminal state
    pub async fn finished(&mut self) {
        while !*self.shutdown_rx.borrow_and_update() {
            if self.shutdown_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One IKE SA negotiation with a single peer
pub struct Session {
    pub(super) is_initiator: bool,
    pub(super) state: State,
    pub(super) cfg: Config,
    pub(super) tkm: Tkm,

    pub(super) spi_i: [u8; 8],
    pub(super) spi_r: [u8; 8],
    pub(super) esp_spi_i: u32,
    pub(super) esp_spi_r: u32,

    /// Next MessageID for a request we originate
    pub(super) msg_id_req: u32,
    /// Next MessageID we expect on a request from the peer
    pub(super) msg_id_resp: u32,

    /// Raw wire bytes of the initiator's IKE_SA_INIT message
    pub(super) init_ib: Zeroizing<Vec<u8>>,
    /// Raw wire bytes of the responder's IKE_SA_INIT message
    pub(super) init_rb: Zeroizing<Vec<u8>>,

    pub(super) is_closing: bool,
    sa_installed: bool,
    sa_removed: bool,

    /// Cookie the responder asked us to echo
    pub(super) responder_cookie: Option<Vec<u8>>,
    pub(super) local_addr: Option<SocketAddr>,
    pub(super) remote_addr: Option<SocketAddr>,
    /// NAT in front of the local endpoint
    pub(super) nat_local: bool,
    /// NAT in front of the peer
    pub(super) nat_peer: bool,
    pub(super) peer_offers_rfc7427: bool,

    incoming_tx: mpsc::Sender<Message>,
    incoming_rx: mpsc::Receiver<Message>,
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    outgoing_rx: mpsc::Receiver<Vec<u8>>,
    outgoing_queued: usize,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    data_plane: Option<Arc<dyn DataPlane>>,
    retry_hook: Option<Box<dyn FnMut(u32) + Send>>,
    /// Encoded bytes of our last request, for idempotent resend
    last_request: Option<Vec<u8>>,
    /// (request MessageID, encoded bytes) of our last response, replayed
    /// when the peer retransmits a request we already answered
    last_response: Option<(u32, Vec<u8>)>,
}

impl Session {
    fn new(
        cfg: Config,
        is_initiator: bool,
        spi_i: [u8; 8],
        spi_r: [u8; 8],
        data_plane: Option<Arc<dyn DataPlane>>,
    ) -> Result<Self> {
        cfg.validate()?;
        let suite = CipherSuite::new(&cfg.proposal_ike.as_list())?;
        let esp_suite = CipherSuite::new(&cfg.proposal_esp.as_list())?;
        let tkm = Tkm::new(suite, esp_suite, is_initiator)?;

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_LEN);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_LEN);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Session {
            is_initiator,
            state: if is_initiator { State::Idle } else { State::Start },
            cfg,
            tkm,
            spi_i,
            spi_r,
            esp_spi_i: if is_initiator { make_esp_spi() } else { 0 },
            esp_spi_r: if is_initiator { 0 } else { make_esp_spi() },
            msg_id_req: 0,
            msg_id_resp: 0,
            init_ib: Zeroizing::new(Vec::new()),
            init_rb: Zeroizing::new(Vec::new()),
            is_closing: false,
            sa_installed: false,
            sa_removed: false,
            responder_cookie: None,
            local_addr: None,
            remote_addr: None,
            nat_local: false,
            nat_peer: false,
            peer_offers_rfc7427: false,
            incoming_tx,
            incoming_rx,
            outgoing_tx,
            outgoing_rx,
            outgoing_queued: 0,
            events_tx,
            events_rx,
            shutdown_tx,
            shutdown_rx,
            data_plane,
            retry_hook: None,
            last_request: None,
            last_response: None,
        })
    }

    /// Create the initiating side of a peer pairing. The session starts
    /// negotiating once [`Session::run`] is polled.
    pub fn new_initiator(cfg: Config, data_plane: Option<Arc<dyn DataPlane>>) -> Result<Self> {
        let session = Self::new(cfg, true, make_ike_spi(), [0u8; 8], data_plane)?;
        session
            .events_tx
            .send(Event::Start)
            .map_err(|_| Error::ChannelClosed)?;
        Ok(session)
    }

    /// Create the responding side for a peer whose first INIT request
    /// carried `spi_i`.
    pub fn new_responder(
        cfg: Config,
        spi_i: [u8; 8],
        data_plane: Option<Arc<dyn DataPlane>>,
    ) -> Result<Self> {
        Self::new(cfg, false, spi_i, make_ike_spi(), data_plane)
    }

    /// Record the addresses of this pairing; enables NAT detection
    /// payloads in IKE_SA_INIT.
    pub fn set_addresses(&mut self, local: SocketAddr, remote: SocketAddr) {
        self.local_addr = Some(local);
        self.remote_addr = Some(remote);
    }

    /// Hook invoked with the request MessageID every time a request is
    /// queued; external timers drive [`Session::resend_last_request`].
    pub fn set_retry_hook(&mut self, hook: Box<dyn FnMut(u32) + Send>) {
        self.retry_hook = Some(hook);
    }

    /// A handle for the dispatcher
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            spi_i: self.spi_i,
            incoming_tx: self.incoming_tx.clone(),
            events_tx: self.events_tx.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
        }
    }

    /// Initiator SPI
    pub fn spi_i(&self) -> [u8; 8] {
        self.spi_i
    }

    /// Responder SPI (zero until IKE_SA_INIT completes on the initiator)
    pub fn spi_r(&self) -> [u8; 8] {
        self.spi_r
    }

    /// Current state
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether NAT was detected on either side during IKE_SA_INIT
    pub fn nat_detected(&self) -> (bool, bool) {
        (self.nat_local, self.nat_peer)
    }

    fn tag(&self) -> String {
        format!("{}<=>{}", hex::encode(self.spi_i), hex::encode(self.spi_r))
    }

    /// Drive the session until it finishes. `write_fn` is the only
    /// external I/O: it puts encoded datagrams on the wire.
    pub async fn run<W>(&mut self, mut write_fn: W)
    where
        W: FnMut(&[u8]) -> std::io::Result<()>,
    {
        loop {
            tokio::select! {
                biased;
                Some(bytes) = self.outgoing_rx.recv() => {
                    self.outgoing_queued -= 1;
                    if let Err(e) = write_fn(&bytes) {
                        warn!(session = %self.tag(), error = %e, "write failed");
                        self.step(Event::DeleteIkeSa(Some(Error::Io(e.to_string()))));
                    }
                }
                Some(msg) = self.incoming_rx.recv() => {
                    self.process_incoming(msg);
                }
                Some(ev) = self.events_rx.recv() => {
                    self.step(ev);
                }
                _ = self.shutdown_rx.changed() => {}
            }
            if *self.shutdown_rx.borrow() && self.outgoing_queued == 0 {
                info!(session = %self.tag(), "finished IKE SA");
                return;
            }
        }
    }

    /// Apply one event to the state machine and interpret the action
    pub(super) fn step(&mut self, event: Event) {
        let from = self.state;
        let (next, action) = transition(from, event);
        if next != from {
            debug!(session = %self.tag(), from = ?from, to = ?next, "state transition");
        }
        self.state = next;
        self.execute(action);
    }

    fn post(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    fn execute(&mut self, action: Action) {
        let outcome = match action {
            Action::SendInit => self.send_init(),
            Action::HandleInitRequest(m) => match self.handle_init_request(&m) {
                Ok(()) => self.send_init(),
                Err(e) => {
                    self.post(Event::InitFail(Self::reportable(e)));
                    Ok(())
                }
            },
            Action::HandleInitResponse(m) => match self.handle_init_response(&m) {
                Ok(super::init::InitOutcome::Proceed) => self.send_auth(),
                Ok(super::init::InitOutcome::Retry) => {
                    // the exchange starts over: back to waiting, and the
                    // reissued INIT is again message 0
                    self.state = State::InitWait;
                    self.msg_id_req = 0;
                    self.send_init()
                }
                Err(e) => {
                    // peer already reported an error; do not answer it
                    self.begin_teardown(Some(e), false);
                    Ok(())
                }
            },
            Action::HandleAuthRequest(m) => {
                match self.handle_auth_request(&m) {
                    Ok(()) => self.post(Event::Success),
                    Err(e) => self.post(Event::AuthFail(Self::reportable(e))),
                }
                Ok(())
            }
            Action::HandleAuthResponse(m) => {
                match self.handle_auth_response(&m) {
                    Ok(super::auth_exchange::AuthOutcome::Proceed) => self.post(Event::Success),
                    Ok(super::auth_exchange::AuthOutcome::PeerRejected(code)) => {
                        self.begin_teardown(Some(Error::Protocol(code)), false)
                    }
                    Err(e) => self.post(Event::AuthFail(Self::reportable(e))),
                }
                Ok(())
            }
            Action::InstallSa => self.install_sa(),
            Action::InstallSaAndReplyAuth => {
                self.install_sa().and_then(|()| self.send_auth())
            }
            Action::RefuseChildSa(m) => self.refuse_child_sa(&m),
            Action::HandleInformational(m) => self.handle_informational(&m),
            Action::Teardown(err) => {
                self.begin_teardown(err, true);
                Ok(())
            }
            Action::NotifyPeerCleanup(e) => {
                let res = self.send_notify(e);
                self.begin_teardown(Some(Error::Protocol(e)), false);
                res
            }
            Action::CloseChannels => {
                self.finish_if_drained();
                Ok(())
            }
            Action::Drop => Ok(()),
        };
        if let Err(e) = outcome {
            warn!(session = %self.tag(), error = %e, "action failed");
            if !self.is_closing {
                self.post(Event::Fail(e));
            }
        }
    }

    /// Collapse an internal error into the code we report on the wire
    fn reportable(e: Error) -> IkeError {
        match e {
            Error::Protocol(code) => code,
            Error::UnsupportedAlgorithm(_) => IkeError::NoProposalChosen,
            _ => IkeError::InvalidSyntax,
        }
    }

    /// Validate, decrypt and classify one inbound message
    fn process_incoming(&mut self, mut msg: Message) {
        if let Err(e) = self.check_message(&msg) {
            debug!(session = %self.tag(), error = %e, "drop message");
            return;
        }

        if msg.header.next_payload == PayloadType::Sk.to_u8() {
            match msg.decrypt_in_place(&self.tkm, self.is_initiator) {
                Ok(()) => {}
                Err(Error::Protocol(IkeError::InvalidSyntax)) => {
                    // authenticated but malformed inside; tell the peer
                    let is_response = !msg.header.flags.response;
                    let _ = self.send_notify_message(
                        IkeError::InvalidSyntax,
                        None,
                        is_response,
                        Some(msg.header.exchange_type),
                    );
                    return;
                }
                Err(e) => {
                    warn!(session = %self.tag(), error = %e, "SK verification failed");
                    return;
                }
            }
        }

        if let Some(pt) = msg.unknown_critical() {
            debug!(session = %self.tag(), payload_type = pt, "unknown critical payload");
            let is_response = !msg.header.flags.response;
            let _ = self.send_notify_message(
                IkeError::UnsupportedCriticalPayload,
                None,
                is_response,
                Some(msg.header.exchange_type),
            );
            return;
        }

        let msg = Box::new(msg);
        let event = match msg.header.exchange_type {
            ExchangeType::IkeSaInit => Event::MsgInit(msg),
            ExchangeType::IkeAuth => Event::MsgAuth(msg),
            ExchangeType::CreateChildSa => Event::MsgChildSa(msg),
            ExchangeType::Informational => Event::MsgInformational(msg),
        };
        self.step(event);
    }

    /// SPI, cleartext-state and message-ID discipline. A mismatched ID is
    /// dropped silently; a retransmitted request replays our cached
    /// response.
    fn check_message(&mut self, msg: &Message) -> Result<()> {
        if msg.header.spi_i != self.spi_i {
            return Err(Error::Protocol(IkeError::InvalidIkeSpi));
        }
        if msg.header.next_payload != PayloadType::Sk.to_u8() && !self.state.allows_clear() {
            return Err(Error::invalid_syntax());
        }
        let seq = msg.header.msg_id;
        if msg.header.flags.response {
            if seq != self.msg_id_req {
                return Err(Error::Protocol(IkeError::InvalidMessageId));
            }
            // response accepted; this request slot is done
            self.msg_id_req += 1;
            self.last_request = None;
        } else {
            if seq == self.msg_id_resp.wrapping_sub(1) {
                if let Some((id, bytes)) = &self.last_response {
                    if *id == seq {
                        debug!(session = %self.tag(), msg_id = seq, "replaying cached response");
                        let replay = bytes.clone();
                        self.enqueue(replay);
                    }
                }
                return Err(Error::Protocol(IkeError::InvalidMessageId));
            }
            if seq != self.msg_id_resp {
                return Err(Error::Protocol(IkeError::InvalidMessageId));
            }
            // msg_id_resp advances when we queue the response
        }
        Ok(())
    }

    /// Allocate the MessageID for an outgoing message
    pub(super) fn msg_id_inc(&mut self, is_response: bool) -> u32 {
        if is_response {
            let id = self.msg_id_resp;
            self.msg_id_resp += 1;
            id
        } else {
            self.msg_id_req
        }
    }

    /// Queue wire bytes for the writer
    pub(super) fn enqueue(&mut self, bytes: Vec<u8>) {
        match self.outgoing_tx.try_send(bytes) {
            Ok(()) => self.outgoing_queued += 1,
            Err(_) => {
                warn!(session = %self.tag(), "outgoing queue full, closing");
                self.post(Event::DeleteIkeSa(Some(Error::ChannelClosed)));
            }
        }
    }

    /// Queue an outgoing request: remembers it for resend and arms the
    /// retry hook.
    pub(super) fn enqueue_request(&mut self, bytes: Vec<u8>) {
        self.last_request = Some(bytes.clone());
        let id = self.msg_id_req;
        if let Some(hook) = self.retry_hook.as_mut() {
            hook(id);
        }
        self.enqueue(bytes);
    }

    /// Queue an outgoing response and cache it for retransmit replay
    pub(super) fn enqueue_response(&mut self, request_id: u32, bytes: Vec<u8>) {
        self.last_response = Some((request_id, bytes.clone()));
        self.enqueue(bytes);
    }

    /// Re-send the last request verbatim; used by external retry timers.
    /// No-op when the request was already answered.
    pub fn resend_last_request(&mut self) {
        if let Some(bytes) = self.last_request.clone() {
            debug!(session = %self.tag(), msg_id = self.msg_id_req, "resending request");
            self.enqueue(bytes);
        }
    }

    /// Send an encrypted (or clear, pre-keys) notify carrying `code`
    pub(super) fn send_notify(&mut self, code: IkeError) -> Result<()> {
        // a responder answers the failed request in its own exchange: the
        // keyed case can only be a rejected IKE_AUTH. An initiator opens
        // an informational exchange instead.
        let exchange = (!self.is_initiator && self.tkm.has_keys())
            .then_some(super::constants::ExchangeType::IkeAuth);
        self.send_notify_message(code, None, !self.is_initiator, exchange)
    }

    fn install_sa(&mut self) -> Result<()> {
        if self.sa_installed {
            return Ok(());
        }
        let params = self.sa_params()?;
        if let Some(plane) = &self.data_plane {
            plane
                .add_sa(&params)
                .map_err(|e| Error::Io(e.to_string()))?;
        }
        self.sa_installed = true;
        info!(
            session = %self.tag(),
            esp_spi_i = format_args!("{:#010x}", self.esp_spi_i),
            esp_spi_r = format_args!("{:#010x}", self.esp_spi_r),
            "child SA installed; IKE SA mature"
        );
        Ok(())
    }

    fn remove_sa(&mut self) {
        if self.sa_removed {
            return;
        }
        self.sa_removed = true;
        if let Some(plane) = &self.data_plane {
            match self.sa_params() {
                Ok(params) => {
                    if let Err(e) = plane.remove_sa(&params) {
                        warn!(session = %self.tag(), error = %e, "remove SA failed");
                    }
                }
                Err(_) => {
                    // teardown before keys existed; report the SPIs alone
                    if let Ok(params) = self.bare_sa_params() {
                        let _ = plane.remove_sa(&params);
                    }
                }
            }
        }
    }

    fn selector_params(list: &[Selector]) -> Vec<SelectorParams> {
        list.iter()
            .map(|s| SelectorParams {
                start_addr: s.start_addr,
                end_addr: s.end_addr,
                start_port: s.start_port,
                end_port: s.end_port,
                protocol: s.ip_protocol,
            })
            .collect()
    }

    fn sa_params(&self) -> Result<SaParams> {
        let keys = self.tkm.derive_esp_keys(None)?;
        let (encr, integ) = self.tkm.esp_transform_ids();
        Ok(SaParams {
            spi_i: self.spi_i,
            spi_r: self.spi_r,
            esp_spi_i: self.esp_spi_i,
            esp_spi_r: self.esp_spi_r,
            esp_ei: keys.esp_ei.to_vec(),
            esp_ai: keys.esp_ai.to_vec(),
            esp_er: keys.esp_er.to_vec(),
            esp_ar: keys.esp_ar.to_vec(),
            encr_transform: encr,
            integ_transform: integ,
            ts_i: Self::selector_params(&self.cfg.ts_i),
            ts_r: Self::selector_params(&self.cfg.ts_r),
            is_transport: self.cfg.is_transport_mode,
            is_initiator: self.is_initiator,
        })
    }

    fn bare_sa_params(&self) -> Result<SaParams> {
        let (encr, integ) = self.tkm.esp_transform_ids();
        Ok(SaParams {
            spi_i: self.spi_i,
            spi_r: self.spi_r,
            esp_spi_i: self.esp_spi_i,
            esp_spi_r: self.esp_spi_r,
            esp_ei: Vec::new(),
            esp_ai: Vec::new(),
            esp_er: Vec::new(),
            esp_ar: Vec::new(),
            encr_transform: encr,
            integ_transform: integ,
            ts_i: Self::selector_params(&self.cfg.ts_i),
            ts_r: Self::selector_params(&self.cfg.ts_r),
            is_transport: self.cfg.is_transport_mode,
            is_initiator: self.is_initiator,
        })
    }

    /// Start teardown: optionally send a Delete, run the remove-SA
    /// callback, then let the drain loop finish the session. Idempotent.
    pub(super) fn begin_teardown(&mut self, err: Option<Error>, send_delete: bool) {
        if self.is_closing {
            return;
        }
        self.is_closing = true;
        match &err {
            Some(e) => info!(session = %self.tag(), error = %e, "closing session"),
            None => info!(session = %self.tag(), "closing session"),
        }
        if send_delete && self.tkm.has_keys() {
            if let Err(e) = self.send_delete() {
                debug!(session = %self.tag(), error = %e, "delete not sent");
            }
        }
        self.remove_sa();
        self.state = State::Closing;
        self.post(Event::Finished);
    }

    /// Final drain: close once nothing is queued, otherwise go around the
    /// loop again (outgoing drains before events).
    fn finish_if_drained(&mut self) {
        if self.outgoing_queued > 0 {
            self.post(Event::Finished);
            return;
        }
        self.state = State::Finished;
        self.incoming_rx.close();
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // init message captures and keys zeroize via their own wrappers
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ike::config::{AuthConfig, Identity};

    fn cfg() -> Config {
        Config::new(
            Identity::Email("ini@test".into()),
            Identity::Email("res@test".into()),
            AuthConfig::SharedKey(Zeroizing::new(b"secret".to_vec())),
        )
    }

    #[test]
    fn test_spi_generation() {
        let a = make_ike_spi();
        let b = make_ike_spi();
        assert_ne!(a, b);
        assert!(make_esp_spi() > 255);
    }

    #[tokio::test]
    async fn test_initiator_starts_idle() {
        let s = Session::new_initiator(cfg(), None).unwrap();
        assert_eq!(s.state(), State::Idle);
        assert!(s.is_initiator);
        assert_eq!(s.spi_r(), [0u8; 8]);
        assert_ne!(s.esp_spi_i, 0);
    }

    #[tokio::test]
    async fn test_responder_starts_in_start() {
        let s = Session::new_responder(cfg(), [9u8; 8], None).unwrap();
        assert_eq!(s.state(), State::Start);
        assert_eq!(s.spi_i(), [9u8; 8]);
        assert_ne!(s.spi_r(), [0u8; 8]);
        assert_ne!(s.esp_spi_r, 0);
    }

    #[tokio::test]
    async fn test_message_id_discipline() {
        use crate::ike::constants::{IkeFlags, IKE_HEADER_LEN};
        use crate::ike::message::IkeHeader;

        let mut s = Session::new_responder(cfg(), [9u8; 8], None).unwrap();
        let mk = |id: u32, response: bool| {
            Message::new(
                IkeHeader {
                    spi_i: [9u8; 8],
                    spi_r: [0u8; 8],
                    next_payload: PayloadType::None.to_u8(),
                    major_version: 2,
                    minor_version: 0,
                    exchange_type: ExchangeType::Informational,
                    flags: IkeFlags::outbound(true, response),
                    msg_id: id,
                    length: IKE_HEADER_LEN as u32,
                },
                vec![],
            )
        };

        // out-of-window request dropped
        assert!(s.check_message(&mk(5, false)).is_err());
        // expected request accepted
        assert!(s.check_message(&mk(0, false)).is_ok());
        // unexpected response dropped; counters untouched
        assert!(s.check_message(&mk(3, true)).is_err());
        assert_eq!(s.msg_id_req, 0);
        assert_eq!(s.msg_id_resp, 0);
    }

    #[tokio::test]
    async fn test_wrong_spi_dropped() {
        use crate::ike::constants::{IkeFlags, IKE_HEADER_LEN};
        use crate::ike::message::IkeHeader;

        let mut s = Session::new_responder(cfg(), [9u8; 8], None).unwrap();
        let msg = Message::new(
            IkeHeader {
                spi_i: [7u8; 8],
                spi_r: [0u8; 8],
                next_payload: PayloadType::None.to_u8(),
                major_version: 2,
                minor_version: 0,
                exchange_type: ExchangeType::IkeSaInit,
                flags: IkeFlags::outbound(true, false),
                msg_id: 0,
                length: IKE_HEADER_LEN as u32,
            },
            vec![],
        );
        assert!(s.check_message(&msg).is_err());
    }

    use crate::ike::constants::{IkeFlags, NotifyType as Nt};
    use crate::ike::message::IkeHeader;
    use osprey_platform::{PlatformResult, SaParams};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPlane {
        added: Mutex<Vec<SaParams>>,
        removed: Mutex<Vec<SaParams>>,
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

    /// Drive one session until quiet, collecting everything it put on the
    /// wire. Mirrors the run loop's priority: outgoing drains before the
    /// next event is processed.
    fn collect_out(s: &mut Session) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            while let Ok(bytes) = s.outgoing_rx.try_recv() {
                s.outgoing_queued -= 1;
                out.push(bytes);
            }
            match s.events_rx.try_recv() {
                Ok(ev) => s.step(ev),
                Err(_) => break,
            }
        }
        while let Ok(bytes) = s.outgoing_rx.try_recv() {
            s.outgoing_queued -= 1;
            out.push(bytes);
        }
        out
    }

    fn deliver(s: &mut Session, bytes: &[u8]) {
        let msg = Message::decode(bytes).expect("peer sent a decodable message");
        s.process_incoming(msg);
    }

    fn paired_configs() -> (Config, Config) {
        let ini = Config::new(
            Identity::Email("ini@test".into()),
            Identity::Email("res@test".into()),
            AuthConfig::SharedKey(Zeroizing::new(b"shared secret".to_vec())),
        );
        let res = Config::new(
            Identity::Email("res@test".into()),
            Identity::Email("ini@test".into()),
            AuthConfig::SharedKey(Zeroizing::new(b"shared secret".to_vec())),
        );
        (ini, res)
    }

    /// Run the four-message handshake, returning the sessions and the
    /// wire messages (init_req, init_resp, auth_req, auth_resp)
    fn handshake(
        plane_a: Arc<RecordingPlane>,
        plane_b: Arc<RecordingPlane>,
    ) -> (Session, Session, [Vec<u8>; 4]) {
        let (cfg_a, cfg_b) = paired_configs();
        let addr_a: SocketAddr = "10.0.0.1:500".parse().unwrap();
        let addr_b: SocketAddr = "10.0.0.2:500".parse().unwrap();

        let mut a = Session::new_initiator(cfg_a, Some(plane_a)).unwrap();
        a.set_addresses(addr_a, addr_b);
        let mut b = Session::new_responder(cfg_b, a.spi_i(), Some(plane_b)).unwrap();
        b.set_addresses(addr_b, addr_a);

        let init_req = collect_out(&mut a).remove(0);
        deliver(&mut b, &init_req);
        let init_resp = collect_out(&mut b).remove(0);
        deliver(&mut a, &init_resp);
        let auth_req = collect_out(&mut a).remove(0);
        deliver(&mut b, &auth_req);
        let auth_resp = collect_out(&mut b).remove(0);
        deliver(&mut a, &auth_resp);
        assert!(collect_out(&mut a).is_empty());
        assert!(collect_out(&mut b).is_empty());

        (a, b, [init_req, init_resp, auth_req, auth_resp])
    }

    #[tokio::test]
    async fn test_full_handshake() {
        let plane_a = Arc::new(RecordingPlane::default());
        let plane_b = Arc::new(RecordingPlane::default());
        let (a, b, wire) = handshake(plane_a.clone(), plane_b.clone());

        assert_eq!(a.state(), State::Mature);
        assert_eq!(b.state(), State::Mature);
        assert_eq!(a.spi_r(), b.spi_r());

        // the AUTH pair is encrypted, the INIT pair is not
        assert_eq!(wire[0][16], PayloadType::Sa.to_u8());
        assert_eq!(wire[2][16], PayloadType::Sk.to_u8());
        assert_eq!(wire[3][16], PayloadType::Sk.to_u8());

        // exactly one install per side, with matching key material
        let added_a = plane_a.added.lock().unwrap();
        let added_b = plane_b.added.lock().unwrap();
        assert_eq!(added_a.len(), 1);
        assert_eq!(added_b.len(), 1);
        let (sa_a, sa_b) = (&added_a[0], &added_b[0]);
        assert_eq!(sa_a.esp_ei, sa_b.esp_ei);
        assert_eq!(sa_a.esp_ai, sa_b.esp_ai);
        assert_eq!(sa_a.esp_er, sa_b.esp_er);
        assert_eq!(sa_a.esp_ar, sa_b.esp_ar);
        assert_eq!(sa_a.esp_spi_i, sa_b.esp_spi_i);
        assert_eq!(sa_a.esp_spi_r, sa_b.esp_spi_r);
        assert!(sa_a.is_initiator);
        assert!(!sa_b.is_initiator);
        assert!(plane_a.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_request_replays_response() {
        let plane = Arc::new(RecordingPlane::default());
        let (_a, mut b, wire) = handshake(plane.clone(), plane.clone());

        // the peer retransmits its AUTH request: our cached response goes
        // out again byte for byte, and nothing else changes
        deliver(&mut b, &wire[2]);
        let replayed = collect_out(&mut b);
        assert_eq!(replayed, vec![wire[3].clone()]);
        assert_eq!(b.state(), State::Mature);
        assert_eq!(plane.added.lock().unwrap().len(), 2); // one per side
    }

    #[tokio::test]
    async fn test_out_of_order_request_dropped() {
        let plane = Arc::new(RecordingPlane::default());
        let (a, mut b, _) = handshake(plane.clone(), plane.clone());

        // a request with MessageID 5 while 2 is expected: silence
        let header = IkeHeader {
            spi_i: a.spi_i(),
            spi_r: a.spi_r(),
            next_payload: PayloadType::Sk.to_u8(),
            major_version: 2,
            minor_version: 0,
            exchange_type: ExchangeType::Informational,
            flags: IkeFlags::outbound(true, false),
            msg_id: 5,
            length: 0,
        };
        let msg = Message::new(header, vec![]);
        let bytes = a.tkm.encrypt_mac(&msg, true).unwrap();
        deliver(&mut b, &bytes);
        assert!(collect_out(&mut b).is_empty());
        assert_eq!(b.state(), State::Mature);
        assert_eq!(b.msg_id_resp, 2);
    }

    #[tokio::test]
    async fn test_peer_create_child_sa_refused() {
        let plane = Arc::new(RecordingPlane::default());
        let (a, mut b, _) = handshake(plane.clone(), plane.clone());

        let header = IkeHeader {
            spi_i: a.spi_i(),
            spi_r: a.spi_r(),
            next_payload: PayloadType::Sk.to_u8(),
            major_version: 2,
            minor_version: 0,
            exchange_type: ExchangeType::CreateChildSa,
            flags: IkeFlags::outbound(true, false),
            msg_id: 2,
            length: 0,
        };
        let msg = Message::new(header, vec![]);
        let bytes = a.tkm.encrypt_mac(&msg, true).unwrap();
        deliver(&mut b, &bytes);

        let replies = collect_out(&mut b);
        assert_eq!(replies.len(), 1);
        assert_eq!(b.state(), State::Mature);

        // decrypt the refusal with the initiator's keys
        let mut reply = Message::decode(&replies[0]).unwrap();
        assert_eq!(reply.header.exchange_type, ExchangeType::CreateChildSa);
        assert!(reply.header.flags.response);
        reply.decrypt_in_place(&a.tkm, true).unwrap();
        let n = reply.notify(Nt::NoAdditionalSas).unwrap();
        assert!(n.notify_type.is_error());
    }

    #[tokio::test]
    async fn test_orderly_shutdown_flushes_queue() {
        let plane_a = Arc::new(RecordingPlane::default());
        let plane_b = Arc::new(RecordingPlane::default());
        let (mut a, _b, _) = handshake(plane_a.clone(), plane_b);

        // three keepalives sit in the queue when close arrives
        for _ in 0..3 {
            a.send_empty_informational(false).unwrap();
        }
        a.handle().close(None);
        let flushed = collect_out(&mut a);

        // all three flush, then the Delete goes out last
        assert_eq!(flushed.len(), 4);
        let delete = Message::decode(&flushed[3]).unwrap();
        assert_eq!(delete.header.exchange_type, ExchangeType::Informational);
        assert!(!delete.header.flags.response);

        assert_eq!(plane_a.removed.lock().unwrap().len(), 1);
        assert_eq!(a.state(), State::Finished);

        // closing again changes nothing and emits nothing
        a.handle().close(Some(Error::Cancelled));
        assert!(collect_out(&mut a).is_empty());
        assert_eq!(plane_a.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_delete_acknowledged() {
        let plane_a = Arc::new(RecordingPlane::default());
        let plane_b = Arc::new(RecordingPlane::default());
        let (mut a, mut b, _) = handshake(plane_a.clone(), plane_b.clone());

        a.handle().close(None);
        let from_a = collect_out(&mut a);
        for m in &from_a {
            deliver(&mut b, m);
        }
        let from_b = collect_out(&mut b);
        // the peer acknowledges with an empty INFORMATIONAL response
        assert_eq!(from_b.len(), 1);
        assert_eq!(plane_b.removed.lock().unwrap().len(), 1);
        for m in &from_b {
            deliver(&mut a, m);
        }
        let _ = collect_out(&mut a);
        assert_eq!(a.state(), State::Finished);
        assert_eq!(plane_a.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cookie_challenge_reissues_init() {
        let (cfg_a, _) = paired_configs();
        let mut a = Session::new_initiator(cfg_a, None).unwrap();
        let first_init = collect_out(&mut a).remove(0);
        let first = Message::decode(&first_init).unwrap();
        assert!(first.notify(Nt::Cookie).is_none());

        let cookie = vec![0xC0; 32];
        let challenge = crate::ike::notification_response(
            a.spi_i(),
            Nt::Cookie,
            cookie.clone(),
        );
        deliver(&mut a, &challenge.encode(None, false).unwrap());

        let retry_bytes = collect_out(&mut a).remove(0);
        let retry = Message::decode(&retry_bytes).unwrap();
        // reissued INIT: message 0, cookie first in the chain
        assert_eq!(retry.header.msg_id, 0);
        assert_eq!(retry.header.next_payload, PayloadType::Notify.to_u8());
        assert_eq!(retry.notify(Nt::Cookie).unwrap().data, cookie);
        assert_eq!(a.state(), State::InitWait);
    }

    #[tokio::test]
    async fn test_invalid_ke_redirect_switches_group() {
        use crate::ike::constants::dh;
        use crate::ike::constants::TransformType;
        use crate::ike::proposal::Transform;

        let (mut cfg_a, _) = paired_configs();
        cfg_a.proposal_ike.0.insert(
            TransformType::Dh,
            Transform::new(TransformType::Dh, dh::MODP_1024),
        );
        let mut a = Session::new_initiator(cfg_a, None).unwrap();
        let first = Message::decode(&collect_out(&mut a).remove(0)).unwrap();
        assert_eq!(first.ke().unwrap().dh_group, dh::MODP_1024);
        assert_eq!(first.ke().unwrap().key_data.len(), 128);

        let redirect = crate::ike::notification_response(
            a.spi_i(),
            Nt::InvalidKePayload,
            dh::MODP_2048.to_be_bytes().to_vec(),
        );
        deliver(&mut a, &redirect.encode(None, false).unwrap());

        let retry = Message::decode(&collect_out(&mut a).remove(0)).unwrap();
        assert_eq!(retry.header.msg_id, 0);
        assert_eq!(retry.ke().unwrap().dh_group, dh::MODP_2048);
        assert_eq!(retry.ke().unwrap().key_data.len(), 256);
        let sa = retry.sa().unwrap();
        assert_eq!(sa.proposals[0].dh_group(), Some(dh::MODP_2048));
        assert_eq!(a.state(), State::InitWait);
    }

    #[tokio::test]
    async fn test_unknown_critical_payload_answered_once() {
        // an INIT-stage request whose only payload is critical and unknown
        let (_, cfg_b) = paired_configs();
        let mut fresh = Session::new_responder(cfg_b, [3u8; 8], None).unwrap();
        let clear_header = IkeHeader {
            spi_i: [3u8; 8],
            spi_r: [0u8; 8],
            next_payload: 49,
            major_version: 2,
            minor_version: 0,
            exchange_type: ExchangeType::IkeSaInit,
            flags: IkeFlags::outbound(true, false),
            msg_id: 0,
            length: 0,
        };
        let mut wire = Vec::new();
        wire.extend_from_slice(&clear_header.encode());
        wire.extend_from_slice(&[0u8, 0x80, 0, 4]); // critical unknown, empty
        let total = wire.len() as u32;
        wire[24..28].copy_from_slice(&total.to_be_bytes());
        deliver(&mut fresh, &wire);

        let replies = collect_out(&mut fresh);
        assert_eq!(replies.len(), 1);
        let reply = Message::decode(&replies[0]).unwrap();
        let n = reply.notify(Nt::UnsupportedCriticalPayload).unwrap();
        assert!(n.notify_type.is_error());
        // and the message is otherwise discarded: still waiting for INIT
        assert_eq!(fresh.state(), State::Start);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut s = Session::new_initiator(cfg(), None).unwrap();
        s.begin_teardown(None, true);
        assert!(s.is_closing);
        let state = s.state();
        s.begin_teardown(Some(Error::Cancelled), true);
        assert_eq!(s.state(), state);
    }

    #[tokio::test]
    async fn test_handle_close_signals_task() {
        let mut s = Session::new_initiator(cfg(), None).unwrap();
        let handle = s.handle();
        assert!(!handle.is_finished());
        handle.close(None);
        // run drains the event and finishes
        tokio::time::timeout(std::time::Duration::from_secs(1), s.run(|_| Ok(())))
            .await
            .expect("session must finish");
        assert!(handle.is_finished());
    }
}
