//! # Handler Table
//!
//! Inbound commands are dispatched through a table keyed by command marker
//! type, so only commands from the catalog can ever be wired up:
//!
//! ```ignore
//! handlers.register::<PowerOn, _, _>(|args| async move {
//!     let system_id = args.unicode("system_id")?.to_owned();
//!     power_on(&system_id).await?;
//!     Ok(Record::new())
//! });
//! ```
//!
//! A declared command with nothing registered answers `NO_IMPLEMENTATION`.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use rackrpc::Command;
use rackrpc::CommandSpec;
use rackrpc::ErrorKind;
use rackrpc::ProtocolFailure;
use rackrpc::Record;
use rackrpc::auth;
use rackrpc::catalog::Authenticate;
use rackrpc::catalog::Identify;
use tracing::error;

/// How a handler fails.
#[derive(Debug)]
pub enum HandlerError {
    /// A failure the command declares. Sent to the caller as its tag plus message.
    Declared { kind: ErrorKind, message: String },
    /// Anything else. Logged here; the caller only learns `UNHANDLED`.
    Internal(anyhow::Error),
}

impl HandlerError {
    pub fn declared(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Declared { kind, message: message.into() }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Declared { kind, message } => write!(f, "{}: {}", kind, message),
            Self::Internal(e) => write!(f, "{:#}", e),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl From<rackrpc::Error> for HandlerError {
    fn from(e: rackrpc::Error) -> Self {
        Self::Internal(e.into())
    }
}

pub type HandlerResult = std::result::Result<Record, HandlerError>;

type BoxHandler = Arc<dyn Fn(Record) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// What to send back for one inbound call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Answer(Record),
    Failure { code: &'static str, description: String },
}

impl Outcome {
    pub fn protocol(failure: ProtocolFailure, description: impl Into<String>) -> Self {
        Self::Failure { code: failure.tag(), description: description.into() }
    }
}

/// The shared, process-wide table of inbound command handlers.
#[derive(Clone, Default)]
pub struct Handlers {
    table: Arc<DashMap<&'static str, BoxHandler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table pre-wired with the handshake responders.
    pub fn with_handshake(ident: impl Into<String>, secret: Arc<[u8]>) -> Self {
        let handlers = Self::new();
        let ident = ident.into();

        handlers.register::<Identify, _, _>(move |_| {
            let ident = ident.clone();
            async move { Ok(Record::new().with("ident", ident)) }
        });

        handlers.register::<Authenticate, _, _>(move |args| {
            let secret = secret.clone();
            async move {
                let proof = auth::respond(&secret, args.bytes("message")?);
                Ok(Record::new().with("digest", proof.digest).with("salt", proof.salt))
            }
        });

        handlers
    }

    /// Wires `handler` to command `C`, replacing any previous handler.
    pub fn register<C, F, Fut>(&self, handler: F)
    where
        C: Command,
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: BoxHandler = Arc::new(move |args| handler(args).boxed());
        self.table.insert(C::SPEC.name, boxed);
    }

    pub fn unregister<C: Command>(&self) {
        self.table.remove(C::SPEC.name);
    }

    pub fn is_registered<C: Command>(&self) -> bool {
        self.table.contains_key(C::SPEC.name)
    }

    /// Runs the handler for `spec` and maps its result onto the wire vocabulary.
    pub async fn invoke(&self, spec: &'static CommandSpec, args: Record) -> Outcome {
        // Clone out so no map guard is held across the await.
        let handler = match self.table.get(spec.name) {
            Some(entry) => entry.value().clone(),
            None => return Outcome::protocol(ProtocolFailure::NoImplementation, spec.name),
        };

        match handler(args).await {
            Ok(record) => Outcome::Answer(record),
            Err(HandlerError::Declared { kind, message }) if spec.declares(kind) => {
                Outcome::Failure { code: kind.tag(), description: message }
            }
            Err(e) => {
                error!(command = spec.name, error = %e, "Unhandled failure in handler");
                Outcome::protocol(ProtocolFailure::Unhandled, "")
            }
        }
    }
}
