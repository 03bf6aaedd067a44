//! # Client Selector
//!
//! Answers "which live connection reaches X?" by cross-referencing the
//! directory of advertised event loops with the connections currently open.
//!
//! ## Resolution
//!
//! - **Event loop**: must have a fresh advertisement. An open connection to
//!   that identity is preferred, otherwise its endpoints are dialled in order.
//! - **Rack controller**: any open connection whose remote identifies as that
//!   rack controller. Rack controllers do not advertise, so nothing is dialled.
//! - **Any**: any open connection to an advertised event loop.
//!
//! Among several candidates one is chosen uniformly at random.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use rackrpc::Command;
use rackrpc::Record;
use rand::seq::SliceRandom;
use tracing::debug;
use tracing::warn;

use crate::connection::CallError;
use crate::connection::Connection;
use crate::context::RegionContext;
use crate::database;
use crate::transport::TcpTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    EventLoop(String),
    RackController(String),
    Any,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EventLoop(ident) => write!(f, "event-loop {}", ident),
            Self::RackController(ident) => write!(f, "rack controller {}", ident),
            Self::Any => write!(f, "any event-loop"),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// Nothing open reaches the target and every dial failed.
    NoConnectionsAvailable(String),
    Database(database::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoConnectionsAvailable(target) => write!(f, "No connections available to {}", target),
            Self::Database(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<database::Error> for Error {
    fn from(e: database::Error) -> Self {
        Self::Database(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One endpoint that could not be dialled, and why.
#[derive(Debug, Clone)]
pub struct DialFailure {
    pub addr: SocketAddr,
    pub reason: String,
}

/// Dials `ident` at each endpoint in turn until one completes the handshake.
///
/// The connection is not added to any table. On failure every attempt is
/// returned, in order.
pub async fn dial(
    ctx: &RegionContext,
    ident: &str,
    endpoints: &[(IpAddr, u16)],
) -> std::result::Result<Connection, Vec<DialFailure>> {
    let mut failures = Vec::new();
    for &(ip, port) in endpoints {
        let addr = SocketAddr::new(ip, port);
        let transport = match TcpTransport::connect(addr, ctx.config().rpc.connect_timeout()).await {
            Ok(transport) => transport,
            Err(e) => {
                failures.push(DialFailure { addr, reason: e.to_string() });
                continue;
            }
        };
        match Connection::establish(Arc::new(transport), ctx.handshake(Some(ident.to_owned()))).await {
            Ok(conn) => return Ok(conn),
            Err(e) => failures.push(DialFailure { addr, reason: e.to_string() }),
        }
    }
    Err(failures)
}

/// Dials and files the result, keeping any connection that won a race.
pub async fn connect(
    ctx: &RegionContext,
    ident: &str,
    endpoints: &[(IpAddr, u16)],
) -> std::result::Result<Connection, Vec<DialFailure>> {
    let fresh = dial(ctx, ident, endpoints).await?;
    let (conn, inserted) = ctx.connections().insert_unique(fresh.clone());
    if !inserted {
        debug!(eventloop = ident, "Already connected; dropping the duplicate");
        fresh.close().await;
    }
    Ok(conn)
}

/// A connection chosen to reach some target.
#[derive(Clone, Debug)]
pub struct Client {
    conn: Connection,
}

impl Client {
    pub async fn call<C: Command>(&self, args: Record) -> std::result::Result<Record, CallError> {
        self.conn.call::<C>(args).await
    }

    /// Who the remote identified as.
    pub fn ident(&self) -> Option<&str> {
        self.conn.remote_ident()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[derive(Clone)]
pub struct ClientSelector {
    ctx: RegionContext,
}

impl ClientSelector {
    pub fn new(ctx: RegionContext) -> Self {
        Self { ctx }
    }

    pub async fn get_client(&self, target: &Target) -> Result<Client> {
        let none = || Error::NoConnectionsAvailable(target.to_string());
        let connections = self.ctx.connections();

        match target {
            Target::RackController(ident) => choose(connections.by_ident(ident)).ok_or_else(none),

            Target::EventLoop(ident) => {
                if ident == self.ctx.ident() {
                    return Err(none());
                }

                // Only event loops with a fresh advertisement are selectable.
                let cutoff = self.ctx.config().advertising.cutoff(SystemTime::now());
                let entries = self.ctx.pool().fresh_entries(cutoff).await?;
                let Some(entry) = entries.into_iter().find(|e| e.ident == *ident) else {
                    return Err(none());
                };
                if let Some(client) = choose(connections.by_ident(ident)) {
                    return Ok(client);
                }

                match connect(&self.ctx, ident, &entry.endpoints).await {
                    Ok(conn) => Ok(Client { conn }),
                    Err(failures) => {
                        for failure in failures {
                            warn!(eventloop = %ident, addr = %failure.addr, "{}", failure.reason);
                        }
                        Err(none())
                    }
                }
            }

            Target::Any => {
                let cutoff = self.ctx.config().advertising.cutoff(SystemTime::now());
                let entries = self.ctx.pool().fresh_entries(cutoff).await?;
                let candidates = connections
                    .all()
                    .into_iter()
                    .filter(|conn| {
                        conn.remote_ident()
                            .is_some_and(|id| id != self.ctx.ident() && entries.iter().any(|e| e.ident == id))
                    })
                    .collect();
                choose(candidates).ok_or_else(none)
            }
        }
    }
}

fn choose(candidates: Vec<Connection>) -> Option<Client> {
    let conn = candidates.choose(&mut rand::thread_rng())?;
    Some(Client { conn: conn.clone() })
}
