//! Session state machine
//!
//! The machine is a pure transition table: [`transition`] maps
//! `(State, Event)` to `(State, Action)` and nothing else. The session's
//! run loop owns all the side effects and interprets the returned action;
//! no callback ever reaches back into the machine.
//!
//! ```text
//!            initiator                      responder
//!   Idle --Start--> InitWait        Start --MsgInit--> ResponderInit
//!   InitWait --MsgInit--> AuthWait  ResponderInit --MsgAuth--> ResponderAuth
//!   AuthWait --MsgAuth--> AuthWait  ResponderAuth --Success--> Mature
//!   AuthWait --Success--> Mature
//!
//!   any --DeleteIkeSa--> Closing --Finished--> Finished
//!   any --InitFail/AuthFail--> Closing
//! ```

use super::error::{Error, IkeError};
use super::message::Message;

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Initiator created, nothing sent yet
    Idle,
    /// Responder created, waiting for the first INIT request
    Start,
    /// Initiator sent INIT, waiting for the response
    InitWait,
    /// Initiator sent AUTH, waiting for the response
    AuthWait,
    /// Responder answered INIT, waiting for AUTH
    ResponderInit,
    /// Responder accepted AUTH, reply not yet queued
    ResponderAuth,
    /// IKE SA established, child SA installed
    Mature,
    /// Teardown in progress, queues draining
    Closing,
    /// Terminal; the session task exits here
    Finished,
}

impl State {
    /// Whether unencrypted messages are acceptable in this state
    pub fn allows_clear(self) -> bool {
        matches!(self, State::Idle | State::Start | State::InitWait)
    }

    /// Whether this is the terminal state
    pub fn is_terminal(self) -> bool {
        self == State::Finished
    }
}

/// State machine events
#[derive(Debug)]
pub enum Event {
    /// Kick off the initiator
    Start,
    /// IKE_SA_INIT message arrived
    MsgInit(Box<Message>),
    /// IKE_AUTH message arrived
    MsgAuth(Box<Message>),
    /// CREATE_CHILD_SA message arrived
    MsgChildSa(Box<Message>),
    /// INFORMATIONAL message arrived
    MsgInformational(Box<Message>),
    /// INIT handling failed with a reportable error
    InitFail(IkeError),
    /// AUTH handling failed with a reportable error
    AuthFail(IkeError),
    /// The previous handler step completed
    Success,
    /// Local or peer-requested teardown
    DeleteIkeSa(Option<Error>),
    /// Teardown complete, queues drained
    Finished,
    /// Unrecoverable internal failure
    Fail(Error),
}

/// What the run loop must do next
#[derive(Debug)]
pub enum Action {
    /// Build and send our IKE_SA_INIT (request or response by role)
    SendInit,
    /// Validate a peer INIT request, then send our INIT response
    HandleInitRequest(Box<Message>),
    /// Validate the peer's INIT response, then send our AUTH request
    HandleInitResponse(Box<Message>),
    /// Validate a peer AUTH request (posts Success / AuthFail)
    HandleAuthRequest(Box<Message>),
    /// Validate the peer's AUTH response (posts Success / AuthFail)
    HandleAuthResponse(Box<Message>),
    /// Derive ESP keys and invoke the add-SA callback
    InstallSa,
    /// Install the SA and send our AUTH response
    InstallSaAndReplyAuth,
    /// Answer a CREATE_CHILD_SA request with NO_ADDITIONAL_SAS
    RefuseChildSa(Box<Message>),
    /// Process an INFORMATIONAL message (delete, keepalive, error notify)
    HandleInformational(Box<Message>),
    /// Remove the SA, send a Delete if we have not already, drain
    Teardown(Option<Error>),
    /// Report a negotiation failure to the peer and tear down
    NotifyPeerCleanup(IkeError),
    /// Close the queues and cancel the session context
    CloseChannels,
    /// Nothing; the event was dropped in this state
    Drop,
}

/// The transition table. Events that make no sense in the current state
/// return `(state, Action::Drop)` so the loop just logs them.
pub fn transition(state: State, event: Event) -> (State, Action) {
    use Action as A;
    use State as S;

    match (state, event) {
        (S::Idle, Event::Start) => (S::InitWait, A::SendInit),
        (S::Start, Event::MsgInit(m)) => (S::ResponderInit, A::HandleInitRequest(m)),
        (S::InitWait, Event::MsgInit(m)) => (S::AuthWait, A::HandleInitResponse(m)),
        (S::ResponderInit, Event::MsgAuth(m)) => (S::ResponderAuth, A::HandleAuthRequest(m)),
        (S::ResponderAuth, Event::Success) => (S::Mature, A::InstallSaAndReplyAuth),
        (S::AuthWait, Event::MsgAuth(m)) => (S::AuthWait, A::HandleAuthResponse(m)),
        (S::AuthWait, Event::Success) => (S::Mature, A::InstallSa),

        (S::Mature, Event::MsgChildSa(m)) => (S::Mature, A::RefuseChildSa(m)),
        // informationals are meaningful while negotiating too: an error
        // notify or a peer delete can arrive at any point after INIT
        (s, Event::MsgInformational(m)) if s != S::Finished => {
            (s, A::HandleInformational(m))
        }

        // stays in Closing: the run loop flips to Finished once the
        // outgoing queue has drained
        (S::Closing, Event::Finished) => (S::Closing, A::CloseChannels),
        (S::Closing, Event::DeleteIkeSa(_)) => (S::Closing, A::Drop),
        (S::Finished, _) => (S::Finished, A::Drop),
        (_, Event::DeleteIkeSa(err)) => (S::Closing, A::Teardown(err)),

        (_, Event::InitFail(e)) => (S::Closing, A::NotifyPeerCleanup(e)),
        (_, Event::AuthFail(e)) => (S::Closing, A::NotifyPeerCleanup(e)),
        (s, Event::Fail(err)) => {
            tracing::warn!(state = ?s, error = %err, "fatal state machine event");
            (S::Closing, A::Teardown(Some(err)))
        }

        (s, ev) => {
            tracing::debug!(state = ?s, event = ?ev, "event dropped in this state");
            (s, A::Drop)
        }
    }
}
