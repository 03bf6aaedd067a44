//! # Event Loop
//!
//! The process-local registry of named services. Services are built from an
//! ordered factory list, started in that order and stopped in reverse.
//!
//! ```text
//! populate ─→ start ─→ stop ─→ start ─→ … ─→ reset
//!   (idempotent)           (services kept)    (services dropped,
//!                                              default factories restored)
//! ```
//!
//! Starting installs a hook that stops everything on `SIGINT` or `SIGTERM`.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;

use tokio::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::advertising::AdvertisingService;
use crate::context::RegionContext;
use crate::rpc::RpcService;
use crate::service::Service;
use crate::service::TaskSlot;

#[derive(Debug)]
pub enum Error {
    /// Two factories produced services with the same name.
    DuplicateService(String),
    /// A service failed to start. Services started before it have been stopped.
    Start { service: String, reason: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateService(name) => write!(f, "Duplicate service name: {}", name),
            Self::Start { service, reason } => write!(f, "Service {} failed to start: {}", service, reason),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Live event loops and their advertised endpoints, keyed by identity.
pub type RpcInfo = BTreeMap<String, Vec<(IpAddr, u16)>>;

/// Builds one service for an event loop.
pub type Factory = Arc<dyn Fn(&RegionContext) -> Arc<dyn Service> + Send + Sync>;

/// The ordered list of service factories.
#[derive(Clone)]
pub struct Factories {
    entries: Vec<(String, Factory)>,
}

impl Factories {
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// `rpc` then `rpc-advertise`.
    pub fn defaults() -> Self {
        let mut factories = Self::empty();
        factories.add(RpcService::NAME, |ctx| Arc::new(RpcService::new(ctx.clone())));
        factories.add(AdvertisingService::NAME, |ctx| Arc::new(AdvertisingService::new(ctx.clone())));
        factories
    }

    /// Appends a factory, or replaces the one registered under `name` in place.
    pub fn add<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&RegionContext) -> Arc<dyn Service> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory: Factory = Arc::new(factory);
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((name, factory)),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Factories {
    fn default() -> Self {
        Self::defaults()
    }
}

pub struct EventLoop {
    ctx: RegionContext,
    factories: RwLock<Factories>,
    services: RwLock<Vec<Arc<dyn Service>>>,
    /// Serialises populate, start, stop and reset.
    lifecycle: Mutex<()>,
    started: watch::Sender<bool>,
    hook: TaskSlot,
}

impl EventLoop {
    pub fn new(ctx: RegionContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            factories: RwLock::new(Factories::defaults()),
            services: RwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
            started: watch::Sender::new(false),
            hook: TaskSlot::default(),
        })
    }

    /// This event loop's identity, `hostname:pid=N` unless overridden.
    pub fn name(&self) -> &str {
        self.ctx.ident()
    }

    pub fn context(&self) -> &RegionContext {
        &self.ctx
    }

    /// Whether the event loop has been started and not stopped since.
    pub fn running(&self) -> bool {
        *self.started.borrow()
    }

    /// Resolves once the event loop is not running.
    pub async fn stopped(&self) {
        let mut started = self.started.subscribe();
        let _ = started.wait_for(|s| !*s).await;
    }

    pub fn set_factories(&self, factories: Factories) {
        *self.factories.write().unwrap_or_else(PoisonError::into_inner) = factories;
    }

    pub fn add_factory<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&RegionContext) -> Arc<dyn Service> + Send + Sync + 'static,
    {
        self.factories.write().unwrap_or_else(PoisonError::into_inner).add(name, factory);
    }

    pub fn factory_names(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        factories.names().into_iter().map(str::to_owned).collect()
    }

    /// Names of the populated services, in start order.
    pub fn service_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.name().to_owned()).collect()
    }

    pub fn get_service_named(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.snapshot().into_iter().find(|s| s.name() == name)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Service>> {
        self.services.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Builds the service for every factory not yet instantiated under its
    /// name, appending in factory order. Repeated calls are no-ops.
    pub async fn populate(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.populate_locked()
    }

    fn populate_locked(&self) -> Result<()> {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        let mut seen: HashSet<String> = services.iter().map(|s| s.name().to_owned()).collect();

        let mut built = Vec::new();
        for (name, factory) in &factories.entries {
            if seen.contains(name) {
                continue;
            }
            let service = factory(&self.ctx);
            if !seen.insert(service.name().to_owned()) {
                return Err(Error::DuplicateService(service.name().to_owned()));
            }
            built.push(service);
        }

        if !built.is_empty() {
            let added: Vec<&str> = built.iter().map(|s| s.name()).collect();
            debug!(eventloop = self.name(), services = ?added, "Populated");
            services.extend(built);
        }
        Ok(())
    }

    /// Populates, starts every service in order and installs the signal hook.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.running() {
            return Ok(());
        }
        self.populate_locked()?;

        let services = self.snapshot();
        for (i, service) in services.iter().enumerate() {
            if let Err(e) = service.start().await {
                for started in services[..i].iter().rev() {
                    started.stop().await;
                }
                return Err(Error::Start { service: service.name().to_owned(), reason: format!("{:#}", e) });
            }
        }

        let weak = Arc::downgrade(self);
        self.hook.set(tokio::spawn(shutdown_hook(weak)));
        self.started.send_replace(true);
        info!(eventloop = self.name(), "Event loop started");
        Ok(())
    }

    /// Stops every service in reverse order and removes the signal hook.
    pub async fn stop(&self) {
        self.hook.abort();
        self.stop_services().await;
    }

    async fn stop_services(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.running() {
            return;
        }
        for service in self.snapshot().iter().rev() {
            service.stop().await;
        }
        self.started.send_replace(false);
        info!(eventloop = self.name(), "Event loop stopped");
    }

    /// Stops, drops every service and restores the default factories.
    pub async fn reset(&self) {
        self.stop().await;
        let _lifecycle = self.lifecycle.lock().await;
        self.services.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.set_factories(Factories::defaults());
    }

    /// Per live event loop, its advertised endpoints.
    ///
    /// `None` when the advertising service is absent or not running.
    pub async fn rpc_info(&self) -> Option<RpcInfo> {
        let service = self.get_service_named(AdvertisingService::NAME)?;
        if !service.running() {
            return None;
        }
        let advertising = service.as_any().downcast_ref::<AdvertisingService>()?;
        match advertising.directory().await {
            Ok(entries) => Some(entries.into_iter().map(|e| (e.ident, e.endpoints)).collect()),
            Err(e) => {
                warn!(error = %e, "Could not read the directory");
                None
            }
        }
    }
}

async fn shutdown_hook(eventloop: Weak<EventLoop>) {
    termination().await;
    if let Some(eventloop) = eventloop.upgrade() {
        info!(eventloop = eventloop.name(), "Termination requested");
        // Not `stop()`: that would abort this very task half way.
        eventloop.hook.detach();
        eventloop.stop_services().await;
    }
}

async fn termination() {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
