/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The FSCP server: one UDP socket, one strand.
//!
//! All protocol state (peers, presentations, sessions, timers) is owned by
//! a single strand task fed through a channel; socket receive loops and
//! public API calls only ever post inputs to it. This removes any need for
//! per-peer locking and gives every peer receipt-order processing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use fscp_crypto::cipher::CipherSuite;
use fscp_crypto::ecdhe::{EllipticCurve, EphemeralKeyPair};
use fscp_crypto::kdf::derive_session_keys;
use fscp_crypto::random;
use fscp_crypto::x509::Certificate;

use fscp_utils::pool::{BufferFactory, BufferPool, PooledBuffer};
use fscp_utils::{ms_monotonic, ms_until};

use crate::constants::{KEEP_ALIVE_PADDING_SIZE, SERVICE_INTERVAL_MS};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::identity::IdentityStore;
use crate::messages::{self, Message, SecureEnvelopeRef, SecureKind, SessionRef, SessionRequestRef};
use crate::peer::{ConnectionPhase, PendingHello, PendingSession, Peer};
use crate::presentation::{CertHash, PresentationStore};
use crate::rate_limit::RateLimiter;
use crate::session::{SessionInfo, SessionStore};
use crate::settings::ServerSettings;

/// Why an established channel went away.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionLossReason {
    InactivityTimeout,
    AuthenticationFailures,
}

pub type HelloReceivedHandler = Box<dyn Fn(Endpoint, bool) -> bool + Send>;
pub type PresentationReceivedHandler = Box<dyn Fn(Endpoint, &Certificate, Option<&Certificate>, bool) -> bool + Send>;
pub type SessionRequestReceivedHandler = Box<dyn Fn(Endpoint, &[CipherSuite], &[EllipticCurve], bool) -> bool + Send>;
pub type SessionEstablishedHandler = Box<dyn Fn(Endpoint, &SessionInfo) + Send>;
pub type SessionLostHandler = Box<dyn Fn(Endpoint, SessionLossReason) + Send>;
pub type DataReceivedHandler = Box<dyn Fn(Endpoint, u8, &[u8]) + Send>;
pub type ContactRequestReceivedHandler = Box<dyn Fn(Endpoint, &CertHash, Endpoint) -> bool + Send>;
pub type ContactReceivedHandler = Box<dyn Fn(Endpoint, &CertHash, Endpoint) -> bool + Send>;

/// The server's event surface, held as values and invoked from the strand.
///
/// Every handler that returns bool is a gate: returning false drops the
/// triggering message. Handlers installed after open go through the strand
/// like any other state change (see Server::update_handlers).
#[derive(Default)]
pub struct Handlers {
    /// Gate for inbound HELLO; receives the configured default.
    pub hello_received: Option<HelloReceivedHandler>,

    /// Validation for inbound PRESENTATION. When absent, the built-in
    /// policy applies: certificates must parse, share subject and issuer,
    /// chain to `certificate_authorities` when that list is non-empty, and
    /// never replace an existing differing record.
    pub presentation_received: Option<PresentationReceivedHandler>,

    /// Gate for inbound SESSION_REQUEST; receives the configured default.
    pub session_request_received: Option<SessionRequestReceivedHandler>,

    pub session_established: Option<SessionEstablishedHandler>,
    pub session_lost: Option<SessionLostHandler>,

    /// Cleartext delivery: (peer, channel, payload).
    pub data_received: Option<DataReceivedHandler>,

    /// Per-entry gate for serving CONTACT_REQUEST lookups.
    pub contact_request_received: Option<ContactRequestReceivedHandler>,

    /// Per-entry gate before greeting an endpoint learned from CONTACT.
    pub contact_received: Option<ContactReceivedHandler>,

    /// Trust anchors for the built-in presentation validation.
    pub certificate_authorities: Vec<Certificate>,
}

enum Command {
    Greet { target: SocketAddr, timeout: Duration, reply: oneshot::Sender<Result<Duration, Error>> },
    CancelAllGreetings,
    IntroduceTo { target: SocketAddr, reply: oneshot::Sender<Result<(), Error>> },
    RequestSession { target: SocketAddr, reply: oneshot::Sender<Result<SessionInfo, Error>> },
    SendData { target: SocketAddr, channel: u8, data: Vec<u8>, reply: oneshot::Sender<Result<(), Error>> },
    SendContactRequest { target: SocketAddr, hashes: Vec<CertHash>, reply: oneshot::Sender<Result<(), Error>> },
    SendContact {
        target: SocketAddr,
        contacts: Vec<(CertHash, SocketAddr)>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    GetPresentation { target: SocketAddr, reply: oneshot::Sender<Option<PresentationStore>> },
    SetPresentation {
        target: SocketAddr,
        sig_cert: Certificate,
        enc_cert: Option<Certificate>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    ClearPresentation { target: SocketAddr, reply: oneshot::Sender<bool> },
    UpdateSettings(Box<dyn FnOnce(&mut ServerSettings) + Send>),
    UpdateHandlers(Box<dyn FnOnce(&mut Handlers) + Send>),
    Close { reply: oneshot::Sender<()> },
}

enum Input {
    Command(Command),
    Datagram { source: SocketAddr, buffer: PooledBuffer, len: usize },
}

/// A running FSCP server.
///
/// Async methods complete when the strand has processed the operation (and,
/// for request/response operations, when the peer answered or the deadline
/// passed). The sync_* variants block the calling thread and must never be
/// invoked from inside a handler or any task of the server's runtime.
pub struct Server {
    tx: mpsc::Sender<Input>,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Bind the socket and start the strand.
    ///
    /// Fails fast on an unusable identity or a bind error; those are not
    /// recoverable conditions the protocol can heal.
    pub async fn open(
        listen: SocketAddr,
        identity: IdentityStore,
        settings: ServerSettings,
        handlers: Handlers,
    ) -> Result<Server, Error> {
        if !identity.is_valid() {
            return Err(Error::IdentityRequired);
        }

        let socket = bind_udp(listen)?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let local_addr = socket.local_addr()?;

        let pool = BufferPool::new(settings.pool_block_count, BufferFactory::new(settings.pool_block_size));
        let (tx, rx) = mpsc::channel(1024);

        let rate_limiter = RateLimiter::new(settings.max_unauthenticated_messages_per_second);
        let state = State {
            socket: socket.clone(),
            identity,
            settings,
            handlers,
            peers: HashMap::new(),
            presentations: HashMap::new(),
            rate_limiter,
            hello_counter: random::next_u32_secure(),
            next_service_at: ms_monotonic(),
        };

        let strand = tokio::spawn(state.run(rx));
        let receiver = tokio::spawn(receive_loop(socket, pool, tx.clone()));

        info!("fscp server listening on {}", local_addr);
        Ok(Server { tx, local_addr, tasks: Mutex::new(vec![strand, receiver]) })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Probe an endpoint's liveness and measure the round trip.
    pub async fn greet(&self, target: SocketAddr, timeout: Duration) -> Result<Duration, Error> {
        self.roundtrip(|reply| Command::Greet { target, timeout, reply }).await?
    }

    /// Abort every outstanding greeting with a cancellation error.
    pub async fn cancel_all_greetings(&self) -> Result<(), Error> {
        self.post(Command::CancelAllGreetings).await
    }

    /// Send our certificates to the target.
    pub async fn introduce_to(&self, target: SocketAddr) -> Result<(), Error> {
        self.roundtrip(|reply| Command::IntroduceTo { target, reply }).await?
    }

    /// Negotiate (or renegotiate) session keys with the target.
    pub async fn request_session(&self, target: SocketAddr) -> Result<SessionInfo, Error> {
        self.roundtrip(|reply| Command::RequestSession { target, reply }).await?
    }

    /// Send application data on a channel of the established session.
    pub async fn send_data(&self, target: SocketAddr, channel: u8, data: Vec<u8>) -> Result<(), Error> {
        self.roundtrip(|reply| Command::SendData { target, channel, data, reply }).await?
    }

    /// Ask a peer for the endpoints of the given certificate hashes.
    pub async fn send_contact_request(&self, target: SocketAddr, hashes: Vec<CertHash>) -> Result<(), Error> {
        self.roundtrip(|reply| Command::SendContactRequest { target, hashes, reply }).await?
    }

    /// Push (hash, endpoint) hints to a peer.
    pub async fn send_contact(&self, target: SocketAddr, contacts: Vec<(CertHash, SocketAddr)>) -> Result<(), Error> {
        self.roundtrip(|reply| Command::SendContact { target, contacts, reply }).await?
    }

    pub async fn get_presentation(&self, target: SocketAddr) -> Result<Option<PresentationStore>, Error> {
        self.roundtrip(|reply| Command::GetPresentation { target, reply }).await
    }

    /// Seed or replace the presentation record for an endpoint.
    pub async fn set_presentation(
        &self,
        target: SocketAddr,
        sig_cert: Certificate,
        enc_cert: Option<Certificate>,
    ) -> Result<(), Error> {
        self.roundtrip(|reply| Command::SetPresentation { target, sig_cert, enc_cert, reply }).await?
    }

    pub async fn clear_presentation(&self, target: SocketAddr) -> Result<bool, Error> {
        self.roundtrip(|reply| Command::ClearPresentation { target, reply }).await
    }

    /// Mutate the settings on the strand; takes effect for all subsequent
    /// messages.
    pub async fn update_settings<F: FnOnce(&mut ServerSettings) + Send + 'static>(&self, f: F) -> Result<(), Error> {
        self.post(Command::UpdateSettings(Box::new(f))).await
    }

    /// Replace or clear handlers on the strand.
    pub async fn update_handlers<F: FnOnce(&mut Handlers) + Send + 'static>(&self, f: F) -> Result<(), Error> {
        self.post(Command::UpdateHandlers(Box::new(f))).await
    }

    pub async fn set_accept_hello_messages_default(&self, value: bool) -> Result<(), Error> {
        self.update_settings(move |s| s.accept_hello_messages_default = value).await
    }

    pub async fn set_accept_session_request_messages_default(&self, value: bool) -> Result<(), Error> {
        self.update_settings(move |s| s.accept_session_request_messages_default = value).await
    }

    /// Stop the strand, cancel all pending operations, and close the
    /// socket. Operations posted after this fail with Closed.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Input::Command(Command::Close { reply })).await.is_ok() {
            let _ = rx.await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    // Blocking variants for non-async callers. Calling one from a strand
    // handler would deadlock, so debug builds refuse to run them on any
    // async runtime thread.

    pub fn sync_greet(&self, target: SocketAddr, timeout: Duration) -> Result<Duration, Error> {
        self.blocking_roundtrip(|reply| Command::Greet { target, timeout, reply })?
    }

    pub fn sync_introduce_to(&self, target: SocketAddr) -> Result<(), Error> {
        self.blocking_roundtrip(|reply| Command::IntroduceTo { target, reply })?
    }

    pub fn sync_request_session(&self, target: SocketAddr) -> Result<SessionInfo, Error> {
        self.blocking_roundtrip(|reply| Command::RequestSession { target, reply })?
    }

    pub fn sync_send_data(&self, target: SocketAddr, channel: u8, data: Vec<u8>) -> Result<(), Error> {
        self.blocking_roundtrip(|reply| Command::SendData { target, channel, data, reply })?
    }

    pub fn sync_get_presentation(&self, target: SocketAddr) -> Result<Option<PresentationStore>, Error> {
        self.blocking_roundtrip(|reply| Command::GetPresentation { target, reply })
    }

    pub fn sync_set_presentation(
        &self,
        target: SocketAddr,
        sig_cert: Certificate,
        enc_cert: Option<Certificate>,
    ) -> Result<(), Error> {
        self.blocking_roundtrip(|reply| Command::SetPresentation { target, sig_cert, enc_cert, reply })?
    }

    pub fn sync_clear_presentation(&self, target: SocketAddr) -> Result<bool, Error> {
        self.blocking_roundtrip(|reply| Command::ClearPresentation { target, reply })
    }

    async fn post(&self, command: Command) -> Result<(), Error> {
        self.tx.send(Input::Command(command)).await.map_err(|_| Error::Closed)
    }

    async fn roundtrip<T, F: FnOnce(oneshot::Sender<T>) -> Command>(&self, make: F) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.post(make(reply)).await?;
        rx.await.map_err(|_| Error::Closed)
    }

    fn blocking_roundtrip<T, F: FnOnce(oneshot::Sender<T>) -> Command>(&self, make: F) -> Result<T, Error> {
        debug_assert!(
            tokio::runtime::Handle::try_current().is_err(),
            "sync_* must not be called from an async context; use the async variant"
        );
        let (reply, rx) = oneshot::channel();
        self.tx.blocking_send(Input::Command(make(reply))).map_err(|_| Error::Closed)?;
        rx.blocking_recv().map_err(|_| Error::Closed)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn bind_udp(listen: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let domain = socket2::Domain::for_address(listen);
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    if listen.is_ipv6() {
        // Dual stack where the OS permits; IPv4 senders then appear in
        // mapped form and are folded by Endpoint::normalize.
        let _ = socket.set_only_v6(false);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&listen.into())?;
    Ok(socket.into())
}

/// Receive datagrams into pooled buffers and post them to the strand. The
/// receive path never touches protocol state.
async fn receive_loop(socket: Arc<UdpSocket>, pool: BufferPool, tx: mpsc::Sender<Input>) {
    loop {
        let mut buffer = pool.get();
        match socket.recv_from(&mut buffer[..]).await {
            Ok((len, source)) => {
                if tx.send(Input::Datagram { source, buffer, len }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if tx.is_closed() {
                    break;
                }
                debug!("udp receive error (retrying): {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

struct State {
    socket: Arc<UdpSocket>,
    identity: IdentityStore,
    settings: ServerSettings,
    handlers: Handlers,
    peers: HashMap<Endpoint, Peer>,
    presentations: HashMap<Endpoint, PresentationStore>,
    rate_limiter: RateLimiter,
    hello_counter: u32,
    next_service_at: i64,
}

impl State {
    async fn run(mut self, mut rx: mpsc::Receiver<Input>) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                input = rx.recv() => match input {
                    Some(Input::Command(Command::Close { reply })) => {
                        self.close();
                        let _ = reply.send(());
                        break;
                    }
                    Some(input) => self.handle(input),
                    None => {
                        self.close();
                        break;
                    }
                },
                _ = tokio::time::sleep(ms_until(deadline)) => {}
            }
            self.run_timers(ms_monotonic());
        }
    }

    /// Earliest instant anything needs attention: an exact per-operation
    /// deadline or the next periodic service pass.
    fn next_deadline(&self) -> i64 {
        let mut deadline = self.next_service_at;
        for peer in self.peers.values() {
            for pending in peer.pending_hellos.values() {
                deadline = deadline.min(pending.deadline);
            }
            if let Some(pending) = &peer.pending_session {
                deadline = deadline.min(pending.deadline);
            }
        }
        deadline
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Datagram { source, buffer, len } => {
                if len <= buffer.len() {
                    self.handle_datagram(Endpoint::normalize(source), &buffer[..len]);
                }
            }
            Input::Command(command) => self.handle_command(command),
        }
    }

    fn handle_command(&mut self, command: Command) {
        let now = ms_monotonic();
        match command {
            Command::Greet { target, timeout, reply } => self.do_greet(target.into(), timeout, Some(reply), now),
            Command::CancelAllGreetings => {
                for peer in self.peers.values_mut() {
                    for (_, pending) in peer.pending_hellos.drain() {
                        if let Some(reply) = pending.reply {
                            let _ = reply.send(Err(Error::Cancelled));
                        }
                    }
                    if peer.phase == ConnectionPhase::HelloWait {
                        peer.phase = ConnectionPhase::Idle;
                    }
                }
            }
            Command::IntroduceTo { target, reply } => {
                let _ = reply.send(self.do_introduce_to(target.into(), now));
            }
            Command::RequestSession { target, reply } => {
                self.start_session_negotiation(target.into(), Some(reply), now);
            }
            Command::SendData { target, channel, data, reply } => {
                let _ = reply.send(self.do_send_secure(target.into(), SecureKind::Data, channel, &data, now));
            }
            Command::SendContactRequest { target, hashes, reply } => {
                let payload = messages::encode_contact_request_payload(&hashes);
                let _ = reply.send(self.do_send_secure(
                    target.into(),
                    SecureKind::ContactRequest,
                    SecureKind::ContactRequest.channel(),
                    &payload,
                    now,
                ));
            }
            Command::SendContact { target, contacts, reply } => {
                let payload = messages::encode_contact_payload(&contacts);
                let _ = reply.send(self.do_send_secure(
                    target.into(),
                    SecureKind::Contact,
                    SecureKind::Contact.channel(),
                    &payload,
                    now,
                ));
            }
            Command::GetPresentation { target, reply } => {
                let _ = reply.send(self.presentations.get(&Endpoint::normalize(target)).cloned());
            }
            Command::SetPresentation { target, sig_cert, enc_cert, reply } => {
                let result = PresentationStore::new(sig_cert, enc_cert)
                    .map(|store| {
                        self.presentations.insert(Endpoint::normalize(target), store);
                    });
                let _ = reply.send(result);
            }
            Command::ClearPresentation { target, reply } => {
                let _ = reply.send(self.presentations.remove(&Endpoint::normalize(target)).is_some());
            }
            Command::UpdateSettings(f) => {
                f(&mut self.settings);
                self.rate_limiter = RateLimiter::new(self.settings.max_unauthenticated_messages_per_second);
            }
            Command::UpdateHandlers(f) => f(&mut self.handlers),
            Command::Close { .. } => unreachable!("Close is intercepted by the run loop"),
        }
    }

    fn close(&mut self) {
        info!("fscp server closing; cancelling pending operations");
        for peer in self.peers.values_mut() {
            peer.abort_pending(|| Error::Closed);
        }
        self.peers.clear();
    }

    // ---- outbound operations ----

    fn do_greet(
        &mut self,
        ep: Endpoint,
        timeout: Duration,
        reply: Option<oneshot::Sender<Result<Duration, Error>>>,
        now: i64,
    ) {
        let unique_number = self.hello_counter;
        self.hello_counter = self.hello_counter.wrapping_add(1);

        let mut buf = Vec::new();
        messages::write_hello_request(&mut buf, unique_number);
        self.send_raw(ep, &buf);

        let peer = self.peers.entry(ep).or_insert_with(|| Peer::new(now));
        peer.record_send(now);
        peer.pending_hellos.insert(
            unique_number,
            PendingHello { started_at: now, deadline: now + timeout.as_millis() as i64, reply },
        );
        if peer.phase == ConnectionPhase::Idle {
            peer.phase = ConnectionPhase::HelloWait;
        }
        debug!("greeting {} (unique number {})", ep, unique_number);
    }

    fn do_introduce_to(&mut self, ep: Endpoint, now: i64) -> Result<(), Error> {
        let sig_cert = self.identity.signature_certificate().ok_or(Error::IdentityRequired)?;
        let enc_cert =
            if self.identity.has_distinct_encryption_certificate() { self.identity.encryption_certificate() } else { None };

        let mut buf = Vec::new();
        messages::write_presentation(&mut buf, sig_cert.der(), enc_cert.map(Certificate::der))?;
        self.send_raw(ep, &buf);

        let peer = self.peers.entry(ep).or_insert_with(|| Peer::new(now));
        peer.introduced = true;
        peer.record_send(now);
        Ok(())
    }

    /// Begin (or join) a session negotiation toward `ep`.
    fn start_session_negotiation(
        &mut self,
        ep: Endpoint,
        waiter: Option<oneshot::Sender<Result<SessionInfo, Error>>>,
        now: i64,
    ) {
        let fail = |waiter: Option<oneshot::Sender<Result<SessionInfo, Error>>>, e: Error| {
            if let Some(w) = waiter {
                let _ = w.send(Err(e));
            }
        };

        if !self.identity.is_valid() {
            return fail(waiter, Error::IdentityRequired);
        }

        let peer = self.peers.entry(ep).or_insert_with(|| Peer::new(now));

        // A known-empty capability intersection fails fast instead of
        // waiting out a timeout the peer will never answer.
        if let Some((their_suites, their_curves)) = &peer.remote_capabilities {
            let no_suite = !self.settings.cipher_suite_capabilities.iter().any(|c| their_suites.contains(c));
            let no_curve = !self.settings.elliptic_curve_capabilities.iter().any(|c| their_curves.contains(c));
            if no_suite || no_curve {
                return fail(waiter, Error::NegotiationFailed);
            }
        }

        if let Some(pending) = &mut peer.pending_session {
            if let Some(w) = waiter {
                pending.waiters.push(w);
            }
            return;
        }

        let local_session_number = peer.next_local_session_number();
        let offered_suites = self.settings.cipher_suite_capabilities.clone();
        let offered_curves = self.settings.elliptic_curve_capabilities.clone();

        let mut buf = Vec::new();
        let identity = &self.identity;
        if let Err(e) = messages::write_session_request(
            &mut buf,
            local_session_number,
            &offered_suites,
            &offered_curves,
            |signed| identity.sign(signed).unwrap_or_default(),
        ) {
            return fail(waiter, e);
        }
        self.send_raw(ep, &buf);

        let deadline = now + self.settings.session_request_timeout;
        let peer = self.peers.get_mut(&ep).expect("peer was just inserted");
        peer.record_send(now);
        peer.pending_session = Some(PendingSession {
            local_session_number,
            offered_suites,
            offered_curves,
            ephemeral: None,
            chosen: None,
            session_sent: false,
            deadline,
            waiters: waiter.into_iter().collect(),
        });
        if peer.phase != ConnectionPhase::Established {
            peer.phase = ConnectionPhase::SessionRequestWait;
        }
        debug!("session request {} -> {}", local_session_number, ep);
    }

    fn do_send_secure(&mut self, ep: Endpoint, kind: SecureKind, channel: u8, payload: &[u8], now: i64) -> Result<(), Error> {
        let max_payload = self
            .settings
            .pool_block_size
            .saturating_sub(messages::ENVELOPE_AAD_SIZE + fscp_crypto::cipher::GCM_TAG_SIZE);
        if payload.len() > max_payload {
            return Err(Error::DataTooLarge);
        }

        let peer = self.peers.get_mut(&ep).ok_or(Error::SessionNotEstablished)?;
        if !peer.is_established() {
            return Err(Error::SessionNotEstablished);
        }
        let session = peer.sessions.local.as_mut().ok_or(Error::SessionNotEstablished)?;
        let datagram = session.seal(kind, channel, payload)?;
        peer.record_send(now);
        let _ = self.socket.try_send_to(&datagram, ep.socket_addr());
        Ok(())
    }

    /// Fire-and-forget send; a failed or would-block send is a transient
    /// condition the protocol absorbs.
    fn send_raw(&self, ep: Endpoint, datagram: &[u8]) {
        let _ = self.socket.try_send_to(datagram, ep.socket_addr());
    }

    // ---- inbound dispatch ----

    fn handle_datagram(&mut self, ep: Endpoint, data: &[u8]) {
        let now = ms_monotonic();
        match messages::parse(data) {
            Ok(Message::HelloRequest { unique_number }) => self.handle_hello_request(ep, unique_number, now),
            Ok(Message::HelloResponse { unique_number }) => self.handle_hello_response(ep, unique_number, now),
            Ok(Message::Presentation { sig_cert, enc_cert }) => self.handle_presentation(ep, sig_cert, enc_cert, now),
            Ok(Message::SessionRequest(sr)) => self.handle_session_request(ep, &sr, now),
            Ok(Message::Session(s)) => self.handle_session(ep, &s, now),
            Ok(Message::Secure(env)) => self.handle_secure(ep, &env, now),
            Err(_) => {
                // Malformed traffic is charged against the source.
                let _ = self.rate_limiter.allow(ep, now);
            }
        }
    }

    fn handle_hello_request(&mut self, ep: Endpoint, unique_number: u32, now: i64) {
        if !self.rate_limiter.allow(ep, now) {
            return;
        }
        let default = self.settings.accept_hello_messages_default;
        let accept = match &self.handlers.hello_received {
            Some(cb) => cb(ep, default),
            None => default,
        };
        if accept {
            // Echo the correlator verbatim; HELLO carries no authentication
            // and must not touch any security state.
            let mut buf = Vec::new();
            messages::write_hello_response(&mut buf, unique_number);
            self.send_raw(ep, &buf);
        }
    }

    fn handle_hello_response(&mut self, ep: Endpoint, unique_number: u32, now: i64) {
        let peer = match self.peers.get_mut(&ep) {
            Some(p) => p,
            None => return,
        };
        let pending = match peer.pending_hellos.remove(&unique_number) {
            Some(p) => p,
            None => return, // unsolicited or expired; silently ignored
        };
        let rtt = Duration::from_millis((now - pending.started_at).max(0) as u64);
        if let Some(reply) = pending.reply {
            let _ = reply.send(Ok(rtt));
        }
        debug!("hello response from {} after {:?}", ep, rtt);

        if peer.phase == ConnectionPhase::HelloWait {
            peer.phase = ConnectionPhase::PresentWait;
            let introduce = self.settings.auto_introduce && self.identity.has_certificates() && !peer.introduced;
            if introduce {
                let _ = self.do_introduce_to(ep, now);
            }
        }
    }

    fn handle_presentation(&mut self, ep: Endpoint, sig_der: &[u8], enc_der: Option<&[u8]>, now: i64) {
        if !self.rate_limiter.allow(ep, now) {
            return;
        }
        let sig_cert = match Certificate::from_der(sig_der.to_vec()) {
            Ok(c) => c,
            Err(_) => return,
        };
        let enc_cert = match enc_der {
            Some(der) => match Certificate::from_der(der.to_vec()) {
                Ok(c) => Some(c),
                Err(_) => return,
            },
            None => None,
        };
        if let Some(enc) = &enc_cert {
            if !sig_cert.same_subject_and_issuer(enc) {
                return;
            }
        }

        let existing = self.presentations.get(&ep);
        let is_new = existing.is_none();
        let differs = existing.map_or(false, |e| e.differs_from(&sig_cert, enc_cert.as_ref()));

        let accept = match &self.handlers.presentation_received {
            Some(cb) => cb(ep, &sig_cert, enc_cert.as_ref(), is_new),
            None => {
                // Built-in policy: replacement of a differing record needs an
                // explicit callback decision, so refuse it here.
                !differs && self.default_validate(&sig_cert, enc_cert.as_ref())
            }
        };
        if !accept {
            debug!("presentation from {} rejected", ep);
            return;
        }

        let store = match PresentationStore::new(sig_cert, enc_cert) {
            Ok(s) => s,
            Err(_) => return,
        };
        info!("presentation from {} accepted ({})", ep, store.cert_hash());
        self.presentations.insert(ep, store);

        let peer = self.peers.entry(ep).or_insert_with(|| Peer::new(now));
        match peer.phase {
            ConnectionPhase::PresentWait => {
                // We initiated: answer with our own certificates if that has
                // not happened yet, then move straight to key agreement.
                if !peer.introduced && self.identity.has_certificates() {
                    let _ = self.do_introduce_to(ep, now);
                }
                self.start_session_negotiation(ep, None, now);
            }
            ConnectionPhase::Idle => {
                if self.settings.auto_introduce && self.identity.has_certificates() && !peer.introduced {
                    let _ = self.do_introduce_to(ep, now);
                }
            }
            _ => {}
        }
    }

    /// Built-in presentation validation: parseable, currently valid, and
    /// chained to a configured authority when any are configured.
    fn default_validate(&self, sig_cert: &Certificate, enc_cert: Option<&Certificate>) -> bool {
        if self.handlers.certificate_authorities.is_empty() {
            return true;
        }
        let chained = |cert: &Certificate| {
            self.handlers
                .certificate_authorities
                .iter()
                .any(|ca| cert.issued_by(ca) && cert.verify_signed_by(ca).is_ok())
        };
        chained(sig_cert) && enc_cert.map_or(true, chained)
    }

    fn handle_session_request(&mut self, ep: Endpoint, sr: &SessionRequestRef<'_>, now: i64) {
        if !self.rate_limiter.allow(ep, now) {
            return;
        }
        if self.verify_peer_signature(ep, sr.signed, sr.signature).is_err() {
            self.register_auth_failure(ep, now);
            return;
        }

        let their_suites: Vec<CipherSuite> =
            sr.cipher_suites.iter().filter_map(|t| CipherSuite::from_wire_tag(*t)).collect();
        let their_curves: Vec<EllipticCurve> =
            sr.elliptic_curves.iter().filter_map(|t| EllipticCurve::from_wire_tag(*t)).collect();

        let peer = self.peers.entry(ep).or_insert_with(|| Peer::new(now));
        peer.remote_capabilities = Some((their_suites.clone(), their_curves.clone()));
        peer.record_receive(now);

        // Stale or replayed request for a direction we already moved past.
        if peer.sessions.remote.as_ref().map_or(false, |s| sr.session_number <= s.session_number()) {
            debug!("session request from {} with stale session number {}", ep, sr.session_number);
            return;
        }

        let suite = self.settings.cipher_suite_capabilities.iter().copied().find(|c| their_suites.contains(c));
        let curve = self.settings.elliptic_curve_capabilities.iter().copied().find(|c| their_curves.contains(c));
        let (suite, curve) = match (suite, curve) {
            (Some(s), Some(c)) => (s, c),
            _ => {
                info!("no common cipher suite or curve with {}; dropping session request", ep);
                return;
            }
        };

        let default = self.settings.accept_session_request_messages_default;
        let accept = match &self.handlers.session_request_received {
            Some(cb) => cb(ep, &their_suites, &their_curves, default),
            None => default,
        };
        if !accept {
            debug!("session request from {} refused by policy", ep);
            return;
        }

        let peer = self.peers.get_mut(&ep).expect("peer exists");
        let local_session_number = peer.next_local_session_number().max(sr.session_number.wrapping_add(1));
        let ephemeral = EphemeralKeyPair::generate(curve);
        let public_key = ephemeral.public_key_bytes();

        let mut buf = Vec::new();
        let identity = &self.identity;
        if messages::write_session(&mut buf, local_session_number, suite, curve, &public_key, |signed| {
            identity.sign(signed).unwrap_or_default()
        })
        .is_err()
        {
            return;
        }
        self.send_raw(ep, &buf);

        let deadline = now + self.settings.session_request_timeout;
        let peer = self.peers.get_mut(&ep).expect("peer exists");
        let waiters = peer.pending_session.take().map_or(Vec::new(), |p| p.waiters);
        peer.pending_session = Some(PendingSession {
            local_session_number,
            offered_suites: vec![suite],
            offered_curves: vec![curve],
            ephemeral: Some(ephemeral),
            chosen: Some((suite, curve)),
            session_sent: true,
            deadline,
            waiters,
        });
        peer.record_send(now);
        if peer.phase != ConnectionPhase::Established {
            peer.phase = ConnectionPhase::SessionRequestWait;
        }
        debug!("session {} ({}, {}) offered to {}", local_session_number, suite, curve, ep);
    }

    fn handle_session(&mut self, ep: Endpoint, s: &SessionRef<'_>, now: i64) {
        if self.verify_peer_signature(ep, s.signed, s.signature).is_err() {
            self.register_auth_failure(ep, now);
            return;
        }

        let suite = CipherSuite::from_wire_tag(s.cipher_suite);
        let curve = EllipticCurve::from_wire_tag(s.elliptic_curve);
        let (suite, curve) = match (suite, curve) {
            (Some(su), Some(cu)) => (su, cu),
            _ => return,
        };

        let peer = match self.peers.get_mut(&ep) {
            Some(p) => p,
            None => return,
        };
        if peer.pending_session.is_none() {
            debug!("unsolicited session message from {}", ep);
            return;
        }
        // Strictly increasing per direction; the grace-window session stays
        // valid for decryption but can never be renewed in place.
        if peer.sessions.remote.as_ref().map_or(false, |r| s.session_number <= r.session_number()) {
            return;
        }

        let pending = peer.pending_session.as_mut().expect("checked above");
        match pending.chosen {
            Some((cs, ec)) => {
                if cs != suite || ec != curve {
                    return;
                }
            }
            None => {
                // We are the requester: the responder's choice must be one
                // of the capabilities we offered.
                if !pending.offered_suites.contains(&suite) || !pending.offered_curves.contains(&curve) {
                    let pending = peer.pending_session.take().expect("checked above");
                    pending.fail(|| Error::NegotiationFailed);
                    if peer.phase == ConnectionPhase::SessionRequestWait {
                        peer.phase = ConnectionPhase::Idle;
                    }
                    return;
                }
                pending.chosen = Some((suite, curve));
            }
        }

        if pending.ephemeral.is_none() {
            pending.ephemeral = Some(EphemeralKeyPair::generate(curve));
        }

        // Requester side: our SESSION goes out exactly once per exchange.
        if !pending.session_sent {
            let local_session_number = pending.local_session_number;
            let public_key = pending.ephemeral.as_ref().expect("just generated").public_key_bytes();
            let mut buf = Vec::new();
            let identity = &self.identity;
            if messages::write_session(&mut buf, local_session_number, suite, curve, &public_key, |signed| {
                identity.sign(signed).unwrap_or_default()
            })
            .is_err()
            {
                return;
            }
            self.send_raw(ep, &buf);
            let peer = self.peers.get_mut(&ep).expect("peer exists");
            peer.record_send(now);
            peer.pending_session.as_mut().expect("still pending").session_sent = true;
        }

        let peer = self.peers.get_mut(&ep).expect("peer exists");
        let pending = peer.pending_session.as_mut().expect("still pending");
        let shared = match pending.ephemeral.as_ref().expect("generated above").agree(s.public_key) {
            Ok(shared) => shared,
            Err(_) => {
                self.register_auth_failure(ep, now);
                return;
            }
        };

        let pending = peer.pending_session.take().expect("still pending");
        let local_sn = pending.local_session_number;
        let remote_sn = s.session_number;
        let psk = self.identity.psk();
        let local_material = derive_session_keys(&shared, psk, local_sn, remote_sn);
        let remote_material = derive_session_keys(&shared, psk, remote_sn, local_sn);
        drop(shared);

        let local = SessionStore::new(local_sn, suite, curve, local_material, now);
        let remote = SessionStore::new(remote_sn, suite, curve, remote_material, now);
        if let Some(previous) = peer.sessions.install(local, remote) {
            peer.old_remote_session = Some((previous, now + self.settings.inactivity_timeout));
        }
        peer.phase = ConnectionPhase::Established;
        peer.record_receive(now);

        let info = SessionInfo {
            local_session_number: local_sn,
            remote_session_number: remote_sn,
            cipher_suite: suite,
            elliptic_curve: curve,
        };
        for waiter in pending.waiters {
            let _ = waiter.send(Ok(info));
        }
        info!("session established with {} (local {}, remote {}, {}, {})", ep, local_sn, remote_sn, suite, curve);
        if let Some(cb) = &self.handlers.session_established {
            cb(ep, &info);
        }
    }

    fn handle_secure(&mut self, ep: Endpoint, env: &SecureEnvelopeRef<'_>, now: i64) {
        enum Opened {
            Payload(Vec<u8>),
            Replayed,
            UnknownSession,
            AuthFailed,
            NoPeer,
        }

        let opened = match self.peers.get_mut(&ep) {
            None => Opened::NoPeer,
            Some(peer) => match peer.remote_session_for(env.session_number) {
                None => Opened::UnknownSession,
                Some(session) => match session.open(env) {
                    Ok(payload) => {
                        peer.record_receive(now);
                        Opened::Payload(payload)
                    }
                    Err(Error::Replayed) => Opened::Replayed,
                    Err(_) => Opened::AuthFailed,
                },
            },
        };

        match opened {
            Opened::NoPeer => {}
            // Silent drop: the data callback must not fire twice for a
            // re-injected datagram, and a replay is not a peer fault.
            Opened::Replayed => {}
            Opened::UnknownSession => {
                debug!("datagram from {} for unknown session {}", ep, env.session_number);
                self.register_auth_failure(ep, now);
            }
            Opened::AuthFailed => self.register_auth_failure(ep, now),
            Opened::Payload(payload) => match env.kind {
                SecureKind::Data => {
                    if let Some(cb) = &self.handlers.data_received {
                        cb(ep, env.channel, &payload);
                    }
                }
                SecureKind::KeepAlive => {
                    // Liveness only; padding is discarded.
                }
                SecureKind::ContactRequest => self.handle_contact_request(ep, &payload, now),
                SecureKind::Contact => self.handle_contact(ep, &payload, now),
            },
        }
    }

    fn handle_contact_request(&mut self, ep: Endpoint, payload: &[u8], now: i64) {
        if !self.settings.accept_contact_requests {
            return;
        }
        let hashes = match messages::decode_contact_request_payload(payload) {
            Ok(h) => h,
            Err(_) => return,
        };
        let mut entries: Vec<(CertHash, SocketAddr)> = Vec::new();
        for hash in hashes {
            for (candidate_ep, presentation) in self.presentations.iter() {
                if *candidate_ep == ep || presentation.cert_hash() != hash {
                    continue;
                }
                let serve = match &self.handlers.contact_request_received {
                    Some(cb) => cb(ep, &hash, *candidate_ep),
                    None => true,
                };
                if serve {
                    entries.push((hash, candidate_ep.socket_addr()));
                }
            }
        }
        if entries.is_empty() {
            return;
        }
        debug!("answering contact request from {} with {} endpoints", ep, entries.len());
        let reply = messages::encode_contact_payload(&entries);
        let _ = self.do_send_secure(ep, SecureKind::Contact, SecureKind::Contact.channel(), &reply, now);
    }

    fn handle_contact(&mut self, ep: Endpoint, payload: &[u8], now: i64) {
        if !self.settings.accept_contacts {
            return;
        }
        let entries = match messages::decode_contact_payload(payload) {
            Ok(e) => e,
            Err(_) => return,
        };
        let hello_timeout = Duration::from_millis(self.settings.hello_timeout as u64);
        for (hash, addr) in entries {
            let candidate = Endpoint::normalize(addr);
            if candidate == ep {
                continue;
            }
            if self.settings.never_contact.iter().any(|net| net.contains(candidate.ip())) {
                debug!("contact hint {} for {} excluded by never_contact", candidate, hash);
                continue;
            }
            if self.peers.get(&candidate).map_or(false, Peer::is_established) {
                continue;
            }
            let accept = match &self.handlers.contact_received {
                Some(cb) => cb(ep, &hash, candidate),
                None => true,
            };
            if accept {
                debug!("contacting {} on hint from {}", candidate, ep);
                self.do_greet(candidate, hello_timeout, None, now);
            }
        }
    }

    /// Check a SESSION_REQUEST/SESSION signature: the presentation record's
    /// certificate when one exists, the PSK HMAC otherwise.
    fn verify_peer_signature(&self, ep: Endpoint, signed: &[u8], signature: &[u8]) -> Result<(), Error> {
        if let Some(presentation) = self.presentations.get(&ep) {
            presentation
                .signature_certificate()
                .verifier()
                .and_then(|v| v.verify_message(signed, signature))
                .map_err(|_| Error::FailedAuthentication)
        } else if let Some(psk) = self.identity.psk() {
            fscp_crypto::hash::hmac_sha256_verify(psk.as_bytes(), signed, signature)
                .map_err(|_| Error::FailedAuthentication)
        } else {
            Err(Error::PresentationRequired)
        }
    }

    /// Count an authentication fault against a peer; past the tolerance the
    /// channel is torn down and a fresh handshake is forced.
    fn register_auth_failure(&mut self, ep: Endpoint, now: i64) {
        let max = self.settings.max_auth_failures;
        let peer = match self.peers.get_mut(&ep) {
            Some(p) => p,
            None => return,
        };
        if !peer.fault(max) {
            return;
        }
        warn!("{} consecutive authentication failures from {}; forcing rehandshake", peer.auth_failures, ep);
        let was_established = peer.is_established();
        peer.sessions.clear();
        peer.old_remote_session = None;
        peer.auth_failures = 0;
        peer.phase = ConnectionPhase::Idle;
        if was_established {
            if let Some(cb) = &self.handlers.session_lost {
                cb(ep, SessionLossReason::AuthenticationFailures);
            }
            // Self-healing: the next successful SESSION_REQUEST round
            // unconditionally supersedes the lost state.
            self.start_session_negotiation(ep, None, now);
        }
    }

    // ---- timers ----

    fn run_timers(&mut self, now: i64) {
        let endpoints: Vec<Endpoint> = self.peers.keys().copied().collect();
        for ep in endpoints {
            self.expire_hellos(ep, now);
            self.expire_pending_session(ep, now);
        }
        if now >= self.next_service_at {
            self.next_service_at = now + SERVICE_INTERVAL_MS;
            self.service(now);
        }
    }

    fn expire_hellos(&mut self, ep: Endpoint, now: i64) {
        let peer = match self.peers.get_mut(&ep) {
            Some(p) => p,
            None => return,
        };
        let expired: Vec<u32> =
            peer.pending_hellos.iter().filter(|(_, p)| p.deadline <= now).map(|(n, _)| *n).collect();
        for unique_number in expired {
            if let Some(pending) = peer.pending_hellos.remove(&unique_number) {
                debug!("hello {} to {} timed out", unique_number, ep);
                if let Some(reply) = pending.reply {
                    let _ = reply.send(Err(Error::Timeout));
                }
            }
        }
        if peer.phase == ConnectionPhase::HelloWait && peer.pending_hellos.is_empty() {
            peer.phase = ConnectionPhase::Idle;
        }
    }

    fn expire_pending_session(&mut self, ep: Endpoint, now: i64) {
        let peer = match self.peers.get_mut(&ep) {
            Some(p) => p,
            None => return,
        };
        if peer.pending_session.as_ref().map_or(true, |p| p.deadline > now) {
            return;
        }
        let pending = peer.pending_session.take().expect("checked above");
        debug!("session negotiation {} with {} timed out", pending.local_session_number, ep);
        pending.fail(|| Error::Timeout);
        if peer.phase == ConnectionPhase::SessionRequestWait {
            peer.phase = if peer.is_established() { ConnectionPhase::Established } else { ConnectionPhase::Idle };
        }
    }

    fn service(&mut self, now: i64) {
        self.rate_limiter.collect_garbage(now);
        let endpoints: Vec<Endpoint> = self.peers.keys().copied().collect();
        for ep in endpoints {
            self.retire_old_remote_session(ep, now);
            self.send_keep_alive_if_due(ep, now);
            self.rekey_if_due(ep, now);
            self.expire_peer_if_inactive(ep, now);
        }
    }

    fn retire_old_remote_session(&mut self, ep: Endpoint, now: i64) {
        if let Some(peer) = self.peers.get_mut(&ep) {
            if peer.old_remote_session.as_ref().map_or(false, |(_, deadline)| *deadline <= now) {
                peer.old_remote_session = None;
            }
        }
    }

    fn send_keep_alive_if_due(&mut self, ep: Endpoint, now: i64) {
        let due = self.peers.get(&ep).map_or(false, |p| {
            p.is_established() && (now - p.last_send) >= self.settings.keep_alive_period()
        });
        if due {
            let mut padding = [0_u8; KEEP_ALIVE_PADDING_SIZE];
            random::fill_bytes_secure(&mut padding);
            let _ = self.do_send_secure(ep, SecureKind::KeepAlive, SecureKind::KeepAlive.channel(), &padding, now);
        }
    }

    fn rekey_if_due(&mut self, ep: Endpoint, now: i64) {
        let peer = match self.peers.get_mut(&ep) {
            Some(p) => p,
            None => return,
        };
        if !peer.is_established() || peer.pending_session.is_some() {
            return;
        }
        let old = peer
            .sessions
            .local
            .as_ref()
            .map_or(false, |s| s.is_old(now, self.settings.max_session_age, self.settings.max_sequence_number));
        if old && peer.rekey_gate.gate(now) {
            debug!("local session with {} is old; rekeying", ep);
            self.start_session_negotiation(ep, None, now);
        }
    }

    fn expire_peer_if_inactive(&mut self, ep: Endpoint, now: i64) {
        let peer = match self.peers.get(&ep) {
            Some(p) => p,
            None => return,
        };
        // Outstanding operations carry their own deadlines; let those fire
        // first.
        if !peer.pending_hellos.is_empty() || peer.pending_session.is_some() {
            return;
        }
        // A record holding nothing at all (e.g. after a failed greeting) is
        // dropped right away; anything else waits out the inactivity timer.
        if !peer.is_dormant() && (now - peer.last_receive) < self.settings.inactivity_timeout {
            return;
        }
        let was_established = peer.is_established();
        info!("peer {} expired after inactivity", ep);
        self.peers.remove(&ep);
        if was_established {
            if let Some(cb) = &self.handlers.session_lost {
                cb(ep, SessionLossReason::InactivityTimeout);
            }
        }
    }
}
