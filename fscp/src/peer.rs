/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Per-endpoint protocol state.
//!
//! One Peer exists for every endpoint we are talking to, created on the
//! first inbound or outbound message and destroyed on inactivity, close, or
//! repeated authentication faults. All fields are owned and mutated by the
//! server strand.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;

use fscp_crypto::cipher::CipherSuite;
use fscp_crypto::ecdhe::{EllipticCurve, EphemeralKeyPair};

use fscp_utils::gate::IntervalGate;

use crate::constants::REKEY_ATTEMPT_INTERVAL_MS;
use crate::error::Error;
use crate::session::{SessionInfo, SessionPair, SessionStore};

/// Where the exchange with a peer currently stands.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectionPhase {
    Idle,
    HelloWait,
    PresentWait,
    SessionRequestWait,
    Established,
}

/// An outstanding HELLO, keyed by its unique number.
pub(crate) struct PendingHello {
    pub started_at: i64,
    pub deadline: i64,
    /// None for internally initiated greetings (contact follow-ups).
    pub reply: Option<oneshot::Sender<Result<Duration, Error>>>,
}

/// An in-flight session negotiation, either as requester or responder.
pub(crate) struct PendingSession {
    /// The session number our next local session will carry.
    pub local_session_number: u32,
    /// What we offered in our SESSION_REQUEST (used to validate the
    /// responder's choice).
    pub offered_suites: Vec<CipherSuite>,
    pub offered_curves: Vec<EllipticCurve>,
    /// Our ephemeral keypair; generated immediately as responder, and only
    /// once the curve is known as requester.
    pub ephemeral: Option<EphemeralKeyPair>,
    pub chosen: Option<(CipherSuite, EllipticCurve)>,
    /// Whether our SESSION message for this exchange already went out.
    pub session_sent: bool,
    pub deadline: i64,
    pub waiters: Vec<oneshot::Sender<Result<SessionInfo, Error>>>,
}

impl PendingSession {
    pub fn fail(self, err_for: impl Fn() -> Error) {
        for w in self.waiters {
            let _ = w.send(Err(err_for()));
        }
    }
}

pub(crate) struct Peer {
    pub phase: ConnectionPhase,
    pub sessions: SessionPair,
    /// The superseded remote session, kept through a grace window so
    /// in-flight datagrams that crossed the rekey still decrypt.
    pub old_remote_session: Option<(SessionStore, i64)>,
    pub pending_hellos: HashMap<u32, PendingHello>,
    pub pending_session: Option<PendingSession>,
    /// Capabilities last advertised by this peer in a SESSION_REQUEST,
    /// kept even when the request was refused so a local request can fail
    /// fast on a known-empty intersection.
    pub remote_capabilities: Option<(Vec<CipherSuite>, Vec<EllipticCurve>)>,
    /// Whether we already sent our PRESENTATION to this peer.
    pub introduced: bool,
    pub last_send: i64,
    pub last_receive: i64,
    pub auth_failures: u32,
    pub rekey_gate: IntervalGate,
}

impl Peer {
    pub fn new(now: i64) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            sessions: SessionPair::default(),
            old_remote_session: None,
            pending_hellos: HashMap::new(),
            pending_session: None,
            remote_capabilities: None,
            introduced: false,
            last_send: now,
            last_receive: now,
            auth_failures: 0,
            rekey_gate: IntervalGate::new(REKEY_ATTEMPT_INTERVAL_MS),
        }
    }

    #[inline]
    pub fn record_send(&mut self, now: i64) {
        self.last_send = now;
    }

    #[inline]
    pub fn record_receive(&mut self, now: i64) {
        self.last_receive = now;
        self.auth_failures = 0;
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        self.phase == ConnectionPhase::Established
            && self.sessions.has_local_session()
            && self.sessions.has_remote_session()
    }

    /// The session number for the next locally originated session:
    /// strictly above both the current one and any in-flight attempt.
    pub fn next_local_session_number(&self) -> u32 {
        let current = self.sessions.local.as_ref().map_or(0, SessionStore::session_number);
        let pending = self.pending_session.as_ref().map_or(0, |p| p.local_session_number);
        current.max(pending).wrapping_add(1)
    }

    /// Count an authentication fault; true once the configured tolerance is
    /// crossed and the channel must be torn down.
    pub fn fault(&mut self, max_auth_failures: u32) -> bool {
        self.auth_failures += 1;
        self.auth_failures >= max_auth_failures
    }

    /// Find the inbound session a datagram belongs to: the current remote
    /// session, or the superseded one while its grace window lasts.
    pub fn remote_session_for(&mut self, session_number: u32) -> Option<&mut SessionStore> {
        if self.sessions.remote.as_ref().map_or(false, |s| s.session_number() == session_number) {
            return self.sessions.remote.as_mut();
        }
        match &mut self.old_remote_session {
            Some((old, _)) if old.session_number() == session_number => Some(old),
            _ => None,
        }
    }

    /// Fail every outstanding operation, used at close and teardown.
    pub fn abort_pending(&mut self, err: fn() -> Error) {
        for (_, pending) in self.pending_hellos.drain() {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(err()));
            }
        }
        if let Some(pending) = self.pending_session.take() {
            pending.fail(err);
        }
    }

    /// Whether this record still holds anything worth keeping. Cached
    /// remote capabilities count: they let a later session request fail
    /// fast instead of timing out.
    pub fn is_dormant(&self) -> bool {
        self.phase == ConnectionPhase::Idle
            && self.pending_hellos.is_empty()
            && self.pending_session.is_none()
            && self.remote_capabilities.is_none()
            && !self.sessions.has_local_session()
            && !self.sessions.has_remote_session()
    }
}
