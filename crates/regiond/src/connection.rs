//! # Connection with Async Pump
//!
//! A `Connection` is one authenticated, bidirectional channel to one remote
//! event loop. A background pump task reads frames off the transport and:
//!
//! - routes answers and errors to pending outbound calls by sequence number,
//! - spawns a task per inbound call, looking the handler up in the shared table.
//!
//! ## Lifecycle
//!
//! `Connecting → Authenticating → Open → Closed`.
//!
//! The handshake is symmetric. Each side calls `Identify` to learn who is on the
//! other end, then `Authenticate` with a random challenge. The digest in the
//! answer is verified inside the pump, before the next frame is read, so the
//! remote counts as proven before any of its later calls can be dispatched.
//! A side is `Open` once it has verified the remote *and* answered the
//! remote's own challenge. An inbound `Authenticate` carrying our own
//! challenge is refused, so a remote cannot reflect it back at us and relay
//! our digest as its proof.
//!
//! Closing, locally or by transport loss, fails every pending call with
//! `ConnectionLost` and leaves the pending table empty.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use rackrpc::AnswerEncoder;
use rackrpc::CallEncoder;
use rackrpc::Command;
use rackrpc::CommandSpec;
use rackrpc::ErrorEncoder;
use rackrpc::ErrorKind;
use rackrpc::Frame;
use rackrpc::ProtocolFailure;
use rackrpc::Record;
use rackrpc::auth;
use rackrpc::catalog;
use rackrpc::catalog::Authenticate;
use rackrpc::catalog::Identify;
use rackrpc::codec;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;
use wirepack::Encoder;

use crate::handlers::Handlers;
use crate::handlers::Outcome;
use crate::transport;
use crate::transport::MAX_FRAME_LEN;
use crate::transport::Transport;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Authenticating,
    Open,
    Closed,
}

/// Why an outbound call failed.
#[derive(Debug, Clone)]
pub enum CallError {
    /// The remote raised an error the command declares.
    Remote { kind: ErrorKind, message: String },
    /// The remote's RPC machinery refused the call, or the handler failed generically.
    Protocol { failure: ProtocolFailure, message: String },
    /// The connection closed before an answer arrived.
    ConnectionLost,
    /// Arguments failed to encode, or the answer failed to decode.
    Codec(rackrpc::Error),
    Transport(transport::Error),
    /// The encoded call would exceed the transport's frame limit.
    FrameTooLarge(usize),
    /// The handshake has not finished yet.
    NotOpen,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote { kind, message } => write!(f, "{}: {}", kind, message),
            Self::Protocol { failure, message } if message.is_empty() => write!(f, "{}", failure),
            Self::Protocol { failure, message } => write!(f, "{}: {}", failure, message),
            Self::ConnectionLost => write!(f, "Connection lost"),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::FrameTooLarge(len) => write!(f, "Call of {} bytes exceeds the frame limit", len),
            Self::NotOpen => write!(f, "Connection is not open"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<rackrpc::Error> for CallError {
    fn from(e: rackrpc::Error) -> Self {
        Self::Codec(e)
    }
}

impl From<wirepack::Error> for CallError {
    fn from(e: wirepack::Error) -> Self {
        Self::Codec(e.into())
    }
}

impl From<transport::Error> for CallError {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

/// Why a handshake failed. The transport is always closed afterwards.
#[derive(Debug, Clone)]
pub enum HandshakeError {
    /// The exchange did not finish within the handshake timeout.
    Timeout,
    /// The remote identifies as someone other than who we dialled.
    IdentMismatch { expected: String, found: String },
    /// The remote's digest does not prove the shared secret.
    BadDigest,
    /// A handshake call failed.
    Call(CallError),
    /// The transport closed mid-handshake.
    Closed,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "Handshake timed out"),
            Self::IdentMismatch { expected, found } => write!(
                f,
                "The remote event-loop identifies itself as {}, but {} was expected",
                found, expected
            ),
            Self::BadDigest => write!(f, "Remote failed to prove the shared secret"),
            Self::Call(e) => write!(f, "Handshake call failed: {}", e),
            Self::Closed => write!(f, "Connection closed during handshake"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<CallError> for HandshakeError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::ConnectionLost => Self::Closed,
            other => Self::Call(other),
        }
    }
}

/// Everything needed to run the handshake on a fresh transport.
#[derive(Clone)]
pub struct Handshake {
    pub handlers: Handlers,
    pub secret: Arc<[u8]>,
    /// When set, the remote must identify as exactly this.
    pub expected_ident: Option<String>,
    pub timeout: Duration,
}

/// A pending outbound call, waiting for its answer.
struct PendingCall {
    spec: &'static CommandSpec,
    /// Set for our own `Authenticate` calls; the digest is checked against it.
    challenge: Option<Vec<u8>>,
    tx: oneshot::Sender<Result<Record, CallError>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    handlers: Handlers,
    secret: Arc<[u8]>,
    pending: DashMap<u64, PendingCall>,
    seq_gen: AtomicU64,
    state: watch::Sender<State>,
    remote_ident: OnceLock<String>,
    /// The challenge we sent in our own `Authenticate` call.
    own_challenge: OnceLock<Vec<u8>>,
    peer_verified: AtomicBool,
    answered_challenge: AtomicBool,
}

/// A cheap, cloneable handle to one live channel.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_ident", &self.remote_ident())
            .field("peer_addr", &self.peer_addr())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Starts the pump on `transport` and runs the handshake.
    ///
    /// On any failure the transport is closed before returning.
    pub async fn establish(
        transport: Arc<dyn Transport>,
        handshake: Handshake,
    ) -> Result<Connection, HandshakeError> {
        let (state, _) = watch::channel(State::Connecting);
        let shared = Arc::new(Shared {
            transport,
            handlers: handshake.handlers,
            secret: handshake.secret,
            pending: DashMap::new(),
            seq_gen: AtomicU64::new(1),
            state,
            remote_ident: OnceLock::new(),
            own_challenge: OnceLock::new(),
            peer_verified: AtomicBool::new(false),
            answered_challenge: AtomicBool::new(false),
        });

        tokio::spawn(Shared::pump(shared.clone()));

        let conn = Connection { shared };
        let result = tokio::time::timeout(
            handshake.timeout,
            conn.handshake(handshake.expected_ident.as_deref()),
        )
        .await
        .unwrap_or(Err(HandshakeError::Timeout));

        match result {
            Ok(()) => {
                info!(
                    remote = conn.remote_ident().unwrap_or_default(),
                    peer = ?conn.peer_addr(),
                    "Connection open"
                );
                Ok(conn)
            }
            Err(e) => {
                conn.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, expected: Option<&str>) -> Result<(), HandshakeError> {
        self.shared.set_state_from(State::Connecting, State::Authenticating);

        let answer = self.shared.call(Identify::SPEC, Record::new(), None).await?;
        let found = answer.unicode("ident").map_err(CallError::Codec)?.to_owned();
        if let Some(expected) = expected {
            if expected != found {
                return Err(HandshakeError::IdentMismatch { expected: expected.to_owned(), found });
            }
        }
        let _ = self.shared.remote_ident.set(found);

        let challenge = auth::challenge();
        let _ = self.shared.own_challenge.set(challenge.clone());
        let args = Record::new().with("message", challenge.clone());
        self.shared.call(Authenticate::SPEC, args, Some(challenge)).await?;
        if !self.shared.peer_verified.load(Ordering::Acquire) {
            return Err(HandshakeError::BadDigest);
        }

        // Wait until we have also answered the remote's challenge.
        let mut state = self.shared.state.subscribe();
        self.shared.try_open();
        match state.wait_for(|s| matches!(s, State::Open | State::Closed)).await {
            Ok(s) if *s == State::Open => Ok(()),
            _ => Err(HandshakeError::Closed),
        }
    }

    /// Calls command `C` on the remote. Only valid once the connection is open.
    pub async fn call<C: Command>(&self, args: Record) -> Result<Record, CallError> {
        match self.state() {
            State::Open => self.shared.call(C::SPEC, args, None).await,
            State::Closed => Err(CallError::ConnectionLost),
            _ => Err(CallError::NotOpen),
        }
    }

    /// Closes the transport and fails every pending call.
    pub async fn close(&self) {
        self.shared.shutdown().await;
    }

    /// Resolves once the connection has closed, for whatever reason.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == State::Closed).await;
    }

    pub fn state(&self) -> State {
        *self.shared.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    /// The identity the remote reported during the handshake.
    pub fn remote_ident(&self) -> Option<&str> {
        self.shared.remote_ident.get().map(String::as_str)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.transport.peer_addr()
    }

    /// Number of calls still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Whether two handles refer to the same underlying channel.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Shared {
    fn set_state_from(&self, from: State, to: State) {
        self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
    }

    fn try_open(&self) {
        if self.peer_verified.load(Ordering::Acquire) && self.answered_challenge.load(Ordering::Acquire) {
            self.set_state_from(State::Authenticating, State::Open);
        }
    }

    fn is_closed(&self) -> bool {
        *self.state.borrow() == State::Closed
    }

    async fn call(
        &self,
        spec: &'static CommandSpec,
        args: Record,
        challenge: Option<Vec<u8>>,
    ) -> Result<Record, CallError> {
        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);

        let mut enc = Encoder::new();
        CallEncoder::new(seq, spec, &args).encode(&mut enc)?;
        let payload = enc.into_bytes()?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(CallError::FrameTooLarge(payload.len()));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, PendingCall { spec, challenge, tx });

        // A close that raced the insert has already drained the table.
        if self.is_closed() {
            self.pending.remove(&seq);
            return Err(CallError::ConnectionLost);
        }

        debug!(command = spec.name, seq, "Sending call");
        if let Err(e) = self.transport.send(&payload).await {
            self.pending.remove(&seq);
            return Err(e.into());
        }

        rx.await.unwrap_or(Err(CallError::ConnectionLost))
    }

    async fn pump(shared: Arc<Shared>) {
        let mut state = shared.state.subscribe();

        let reason = loop {
            let msg = tokio::select! {
                msg = shared.transport.recv() => msg,
                _ = state.wait_for(|s| *s == State::Closed) => break "closed locally".to_owned(),
            };

            match msg {
                Ok(Some(bytes)) => {
                    if let Err(e) = Shared::handle_frame(&shared, bytes).await {
                        break format!("undecodable frame: {}", e);
                    }
                }
                Ok(None) => break "stream closed".to_owned(),
                Err(e) => break e.to_string(),
            }
        };

        debug!(remote = shared.remote_ident.get().map(String::as_str), %reason, "Pump stopped");
        shared.shutdown().await;
    }

    async fn handle_frame(shared: &Arc<Shared>, bytes: Vec<u8>) -> rackrpc::Result<()> {
        match Frame::decode(&bytes)? {
            Frame::Call(mut call) => {
                let seq = call.seq;
                let Some(spec) = catalog::lookup(call.command) else {
                    debug!(command = call.command, seq, "Unknown command");
                    let outcome = Outcome::protocol(ProtocolFailure::UnknownCommand, call.command);
                    shared.reply(seq, None, outcome).await;
                    return Ok(());
                };

                let handshake = spec.name == Identify::SPEC.name || spec.name == Authenticate::SPEC.name;
                if !handshake && !shared.peer_verified.load(Ordering::Acquire) {
                    warn!(command = spec.name, seq, "Call before authentication");
                    let outcome = Outcome::protocol(ProtocolFailure::Unauthenticated, "");
                    shared.reply(seq, None, outcome).await;
                    return Ok(());
                }

                let args = match codec::decode_record(&mut call.args, spec.arguments) {
                    Ok(args) => args,
                    Err(e) => {
                        debug!(command = spec.name, seq, error = %e, "Bad arguments");
                        let outcome = Outcome::protocol(ProtocolFailure::BadArguments, e.to_string());
                        shared.reply(seq, None, outcome).await;
                        return Ok(());
                    }
                };

                if spec.name == Authenticate::SPEC.name && shared.is_reflected(&args) {
                    warn!(seq, "Remote reflected our own challenge");
                    let outcome = Outcome::protocol(ProtocolFailure::Unauthenticated, "");
                    shared.reply(seq, None, outcome).await;
                    return Ok(());
                }

                let shared = shared.clone();
                tokio::spawn(async move {
                    let outcome = shared.handlers.invoke(spec, args).await;
                    let answered = matches!(outcome, Outcome::Answer(_));
                    let sent = shared.reply(seq, Some(spec), outcome).await;
                    if sent && answered && spec.name == Authenticate::SPEC.name {
                        shared.answered_challenge.store(true, Ordering::Release);
                        shared.try_open();
                    }
                });
            }

            Frame::Answer(mut answer) => {
                let Some((_, pending)) = shared.pending.remove(&answer.seq) else {
                    debug!(seq = answer.seq, "Answer for unknown call");
                    return Ok(());
                };

                let result = codec::decode_record(&mut answer.fields, pending.spec.response)
                    .map_err(CallError::Codec);

                if let (Ok(record), Some(challenge)) = (&result, &pending.challenge) {
                    shared.verify_proof(challenge, record);
                }

                let _ = pending.tx.send(result);
            }

            Frame::Error(err) => {
                let Some((_, pending)) = shared.pending.remove(&err.seq) else {
                    debug!(seq = err.seq, "Error for unknown call");
                    return Ok(());
                };

                let message = err.description.to_owned();
                let error = match pending.spec.classify_error(err.code) {
                    Ok(kind) => CallError::Remote { kind, message },
                    Err(failure) => CallError::Protocol { failure, message },
                };
                let _ = pending.tx.send(Err(error));
            }
        }
        Ok(())
    }

    fn is_reflected(&self, args: &Record) -> bool {
        match (self.own_challenge.get(), args.bytes("message")) {
            (Some(ours), Ok(message)) => ours.as_slice() == message,
            _ => false,
        }
    }

    fn verify_proof(&self, challenge: &[u8], record: &Record) {
        let proof = match (record.bytes("digest"), record.bytes("salt")) {
            (Ok(digest), Ok(salt)) => auth::Proof { digest: digest.to_vec(), salt: salt.to_vec() },
            _ => return,
        };
        if auth::verify(&self.secret, challenge, &proof) {
            self.peer_verified.store(true, Ordering::Release);
            self.try_open();
        } else {
            warn!(remote = self.remote_ident.get().map(String::as_str), "Remote failed authentication");
        }
    }

    /// Frames and sends an outcome. Returns whether the frame went out.
    async fn reply(&self, seq: u64, spec: Option<&'static CommandSpec>, outcome: Outcome) -> bool {
        let payload = match (spec, outcome) {
            (Some(spec), Outcome::Answer(record)) => match encode_answer(seq, spec, &record) {
                Ok(payload) => payload,
                Err(failure) => {
                    warn!(command = spec.name, seq, %failure, "Answer could not be sent");
                    match encode_error(seq, failure.tag(), "") {
                        Ok(payload) => payload,
                        Err(_) => return false,
                    }
                }
            },
            (_, Outcome::Failure { code, description }) => match encode_error(seq, code, &description) {
                Ok(payload) => payload,
                Err(_) => return false,
            },
            (None, Outcome::Answer(_)) => return false,
        };

        match self.transport.send(&payload).await {
            Ok(()) => true,
            Err(e) => {
                debug!(seq, error = %e, "Reply not delivered");
                false
            }
        }
    }

    async fn shutdown(&self) {
        let previous = self.state.send_replace(State::Closed);
        self.transport.close().await;

        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                let _ = pending.tx.send(Err(CallError::ConnectionLost));
            }
        }

        if previous != State::Closed {
            info!(remote = self.remote_ident.get().map(String::as_str), "Connection closed");
        }
    }
}

fn encode_answer(seq: u64, spec: &'static CommandSpec, record: &Record) -> Result<Vec<u8>, ProtocolFailure> {
    let mut enc = Encoder::new();
    match AnswerEncoder::new(seq, spec, record).encode(&mut enc) {
        Ok(()) => {}
        Err(rackrpc::Error::ValueTooLong { .. }) => return Err(ProtocolFailure::TooLong),
        Err(_) => return Err(ProtocolFailure::Unhandled),
    }
    let payload = enc.into_bytes().map_err(|_| ProtocolFailure::Unhandled)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolFailure::TooLong);
    }
    Ok(payload)
}

fn encode_error(seq: u64, code: &str, description: &str) -> rackrpc::Result<Vec<u8>> {
    let mut enc = Encoder::new();
    ErrorEncoder::new(seq, code, description).encode(&mut enc)?;
    Ok(enc.into_bytes()?)
}
