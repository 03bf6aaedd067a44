//! # Region Context
//!
//! The state every service in one event loop shares: identity, configuration,
//! the secret, the directory, open connections, handlers and listener addresses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use crate::advertising::AddressSource;
use crate::advertising::InterfaceAddresses;
use crate::config;
use crate::config::RegionConfig;
use crate::connection::Handshake;
use crate::connections::ConnectionTable;
use crate::database::DatabasePool;
use crate::database::DirectoryStore;
use crate::database::InMemoryStore;
use crate::handlers::Handlers;

/// This machine's hostname, or `localhost` if it cannot be read.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned())
}

/// Formats an event-loop identity.
pub fn eventloop_ident(hostname: &str, pid: u32) -> String {
    format!("{}:pid={}", hostname, pid)
}

/// Splits an event-loop identity into hostname and pid.
pub fn parse_eventloop_ident(ident: &str) -> Option<(&str, u32)> {
    let (host, pid) = ident.rsplit_once(":pid=")?;
    Some((host, pid.parse().ok()?))
}

/// Addresses the RPC listeners are bound to.
#[derive(Clone, Default)]
pub struct ListenerSet {
    addrs: Arc<RwLock<Vec<SocketAddr>>>,
}

impl ListenerSet {
    pub fn add(&self, addr: SocketAddr) {
        self.addrs.write().unwrap_or_else(PoisonError::into_inner).push(addr);
    }

    pub fn remove(&self, addr: SocketAddr) {
        self.addrs.write().unwrap_or_else(PoisonError::into_inner).retain(|a| *a != addr);
    }

    pub fn snapshot(&self) -> Vec<SocketAddr> {
        self.addrs.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct Inner {
    ident: String,
    hostname: String,
    config: RegionConfig,
    secret: Arc<[u8]>,
    pool: DatabasePool,
    connections: ConnectionTable,
    handlers: Handlers,
    listeners: ListenerSet,
    addresses: Arc<dyn AddressSource>,
}

#[derive(Clone)]
pub struct RegionContext {
    inner: Arc<Inner>,
}

impl RegionContext {
    pub fn builder(config: RegionConfig) -> ContextBuilder {
        ContextBuilder::new(config)
    }

    /// This event loop's identity.
    pub fn ident(&self) -> &str {
        &self.inner.ident
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn config(&self) -> &RegionConfig {
        &self.inner.config
    }

    pub fn secret(&self) -> &Arc<[u8]> {
        &self.inner.secret
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.inner.pool
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.inner.connections
    }

    pub fn handlers(&self) -> &Handlers {
        &self.inner.handlers
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.inner.listeners
    }

    pub fn addresses(&self) -> &Arc<dyn AddressSource> {
        &self.inner.addresses
    }

    /// Handshake parameters for a new connection.
    pub fn handshake(&self, expected_ident: Option<String>) -> Handshake {
        Handshake {
            handlers: self.inner.handlers.clone(),
            secret: self.inner.secret.clone(),
            expected_ident,
            timeout: self.inner.config.rpc.handshake_timeout(),
        }
    }
}

/// Builds a `RegionContext`, filling unset parts from configuration and defaults.
pub struct ContextBuilder {
    config: RegionConfig,
    secret: Option<Arc<[u8]>>,
    store: Option<Arc<dyn DirectoryStore>>,
    addresses: Option<Arc<dyn AddressSource>>,
    ident: Option<String>,
}

impl ContextBuilder {
    pub fn new(config: RegionConfig) -> Self {
        Self {
            config,
            secret: None,
            store: None,
            addresses: None,
            ident: None,
        }
    }

    /// Uses `secret` instead of reading the configured secret file.
    pub fn secret(mut self, secret: impl Into<Arc<[u8]>>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// The shared directory. Defaults to a fresh in-memory store.
    pub fn store(mut self, store: Arc<dyn DirectoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Where local IPv4 addresses come from. Defaults to the network interfaces.
    pub fn addresses(mut self, addresses: Arc<dyn AddressSource>) -> Self {
        self.addresses = Some(addresses);
        self
    }

    /// Overrides both the configured identity and `hostname:pid=N`.
    pub fn ident(mut self, ident: impl Into<String>) -> Self {
        self.ident = Some(ident.into());
        self
    }

    pub fn build(self) -> config::Result<RegionContext> {
        let hostname = local_hostname();
        let ident = self
            .ident
            .or_else(|| self.config.identity.clone())
            .unwrap_or_else(|| eventloop_ident(&hostname, std::process::id()));

        let secret = match self.secret {
            Some(secret) => secret,
            None => config::load_secret(&self.config.paths.shared_secret)?,
        };

        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let pool = DatabasePool::new(store, self.config.database.workers);
        let addresses = self.addresses.unwrap_or_else(|| Arc::new(InterfaceAddresses));
        let handlers = Handlers::with_handshake(ident.clone(), secret.clone());

        Ok(RegionContext {
            inner: Arc::new(Inner {
                ident,
                hostname,
                config: self.config,
                secret,
                pool,
                connections: ConnectionTable::new(),
                handlers,
                listeners: ListenerSet::default(),
                addresses,
            }),
        })
    }
}
