//! # Connection Table
//!
//! Every open connection this process holds, inbound or dialled. Each entry is
//! removed by a watcher task as soon as its connection closes, so the table
//! only ever describes live channels.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tracing::debug;

use crate::connection::Connection;

/// Strong type for connection identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection-{}", self.0)
    }
}

#[derive(Default)]
struct Inner {
    connections: DashMap<ConnectionId, Connection>,
    next_id: AtomicU64,
    /// Serialises the check-then-insert of `insert_unique`.
    unique: Mutex<()>,
}

#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<Inner>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` and arranges for it to be removed when it closes.
    pub fn insert(&self, conn: Connection) -> ConnectionId {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner.connections.insert(id, conn.clone());

        let table = self.clone();
        tokio::spawn(async move {
            conn.closed().await;
            table.inner.connections.remove(&id);
            debug!(%id, "Connection removed from table");
        });

        id
    }

    /// Adds `conn` unless an open connection to the same event loop exists.
    ///
    /// Returns the connection the caller should use: the existing one when
    /// there is a duplicate (the new one is then left for the caller to close),
    /// otherwise `conn` itself.
    pub fn insert_unique(&self, conn: Connection) -> (Connection, bool) {
        let _guard = self.inner.unique.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(ident) = conn.remote_ident() {
            if let Some(existing) = self.by_ident(ident).into_iter().next() {
                return (existing, false);
            }
        }

        self.insert(conn.clone());
        (conn, true)
    }

    /// Open connections whose remote identifies as `ident`.
    pub fn by_ident(&self, ident: &str) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .filter(|e| e.value().is_open() && e.value().remote_ident() == Some(ident))
            .map(|e| e.value().clone())
            .collect()
    }

    /// All open connections.
    pub fn all(&self) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .filter(|e| e.value().is_open())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Identities of everything we are connected to.
    pub fn idents(&self) -> BTreeSet<String> {
        self.all()
            .iter()
            .filter_map(|c| c.remote_ident().map(str::to_owned))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn close_all(&self) {
        let conns: Vec<Connection> = self.inner.connections.iter().map(|e| e.value().clone()).collect();
        for conn in conns {
            conn.close().await;
        }
        self.inner.connections.clear();
    }
}
