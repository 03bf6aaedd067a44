//! # Advertising Service
//!
//! Periodically publishes this event loop's reachable endpoints to the shared
//! directory and prunes entries of event loops that are gone.
//!
//! One cycle:
//! 1. Work out `(address, port)` pairs for every RPC listener.
//! 2. First cycle only: drop entries for this host whose pid is not running,
//!    matching both the current hostname and the one in the region-id marker,
//!    then rewrite the marker.
//! 3. Upsert our own entry with a fresh timestamp.
//! 4. Remove any entry older than the staleness threshold.
//!
//! Stopping cancels the timer and withdraws our own entry.

use std::any::Any;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::context::RegionContext;
use crate::context::parse_eventloop_ident;
use crate::database;
use crate::database::Advertisement;
use crate::database::DirectoryStore;
use crate::service::Service;
use crate::service::TaskSlot;

#[derive(Debug)]
pub enum Error {
    Database(database::Error),
    /// Local interface addresses could not be listed.
    Addresses(String),
    /// The region-id marker could not be written.
    Marker { path: PathBuf, reason: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "{}", e),
            Self::Addresses(reason) => write!(f, "Could not list interface addresses: {}", reason),
            Self::Marker { path, reason } => {
                write!(f, "Could not write region marker {}: {}", path.display(), reason)
            }
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

/// Supplies the local addresses to advertise.
pub trait AddressSource: Send + Sync + 'static {
    fn addresses(&self) -> std::io::Result<Vec<IpAddr>>;
}

/// Reads addresses off the host's network interfaces.
pub struct InterfaceAddresses;

impl AddressSource for InterfaceAddresses {
    fn addresses(&self) -> std::io::Result<Vec<IpAddr>> {
        let interfaces = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
        let mut found: Vec<IpAddr> = interfaces
            .filter_map(|iface| iface.address)
            .filter_map(|addr| addr.as_sockaddr_in().map(|sin| IpAddr::V4(sin.ip())))
            .collect();
        found.sort();
        found.dedup();
        Ok(found)
    }
}

/// A fixed address list.
pub struct FixedAddresses(pub Vec<IpAddr>);

impl AddressSource for FixedAddresses {
    fn addresses(&self) -> std::io::Result<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

/// IPv4, and neither loopback, link-local nor unspecified.
pub fn is_advertisable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()),
        IpAddr::V6(_) => false,
    }
}

/// Pairs each listener with the addresses it is reachable on.
///
/// A listener bound to a specific address is advertised as exactly that.
pub fn endpoints_for(listeners: &[SocketAddr], local: &[IpAddr]) -> Vec<(IpAddr, u16)> {
    let mut endpoints = Vec::new();
    for listener in listeners {
        if listener.ip().is_unspecified() {
            endpoints.extend(
                local.iter().filter(|ip| is_advertisable(ip)).map(|ip| (*ip, listener.port())),
            );
        } else {
            endpoints.push((listener.ip(), listener.port()));
        }
    }
    endpoints
}

/// Whether a process with this pid exists.
pub fn pid_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Zero and negative pids address process groups, not processes.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// Removes entries for `hosts` whose pid is not running. Returns what was removed.
fn sweep_dead(store: &dyn DirectoryStore, hosts: &[String], own: &str) -> database::Result<Vec<String>> {
    let mut removed = Vec::new();
    for entry in store.list_all()? {
        if entry.ident == own {
            continue;
        }
        let Some((host, pid)) = parse_eventloop_ident(&entry.ident) else {
            continue;
        };
        if hosts.iter().any(|h| h == host) && !pid_is_alive(pid) {
            store.delete(&entry.ident)?;
            removed.push(entry.ident);
        }
    }
    Ok(removed)
}

fn read_marker(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let host = text.trim();
    (!host.is_empty()).then(|| host.to_owned())
}

fn write_marker(path: &Path, hostname: &str) -> Result<()> {
    let marker_err = |e: std::io::Error| Error::Marker { path: path.to_owned(), reason: e.to_string() };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(marker_err)?;
    }
    std::fs::write(path, format!("{}\n", hostname)).map_err(marker_err)
}

struct Inner {
    ctx: RegionContext,
    swept: AtomicBool,
    task: TaskSlot,
    running: AtomicBool,
}

/// Publishes this event loop to the directory. Registered as `rpc-advertise`.
#[derive(Clone)]
pub struct AdvertisingService {
    inner: Arc<Inner>,
}

impl AdvertisingService {
    pub const NAME: &'static str = "rpc-advertise";

    pub fn new(ctx: RegionContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                swept: AtomicBool::new(false),
                task: TaskSlot::default(),
                running: AtomicBool::new(false),
            }),
        }
    }

    fn interval(&self) -> Duration {
        self.inner.ctx.config().advertising.interval()
    }


    /// The endpoints this event loop would advertise right now.
    pub fn endpoints(&self) -> Result<Vec<(IpAddr, u16)>> {
        let ctx = &self.inner.ctx;
        let local = ctx.addresses().addresses().map_err(|e| Error::Addresses(e.to_string()))?;
        Ok(endpoints_for(&ctx.listeners().snapshot(), &local))
    }

    /// Runs one advertising cycle now and returns the entry written.
    pub async fn update(&self) -> Result<Advertisement> {
        let ctx = &self.inner.ctx;
        let now = SystemTime::now();
        let entry = Advertisement {
            ident: ctx.ident().to_owned(),
            endpoints: self.endpoints()?,
            updated: now,
        };
        let cutoff = ctx.config().advertising.cutoff(now);

        let sweep = !self.inner.swept.load(Ordering::Acquire);
        let hostname = ctx.hostname().to_owned();
        let marker = ctx.config().paths.region_id.clone();
        let written = entry.clone();

        let (dead, stale) = ctx
            .pool()
            .run(move |store| -> Result<_> {
                let mut dead = Vec::new();
                if sweep {
                    let mut hosts = vec![hostname.clone()];
                    hosts.extend(read_marker(&marker).filter(|h| *h != hostname));
                    dead = sweep_dead(store, &hosts, &written.ident)?;
                    write_marker(&marker, &hostname)?;
                }
                store.upsert(written)?;
                let stale = store.delete_older_than(cutoff)?;
                Ok((dead, stale))
            })
            .await?;

        if sweep {
            self.inner.swept.store(true, Ordering::Release);
        }
        if !dead.is_empty() {
            info!(removed = ?dead, "Removed advertisements of dead processes on this host");
        }
        if !stale.is_empty() {
            info!(removed = ?stale, "Removed stale advertisements");
        }
        debug!(eventloop = %entry.ident, endpoints = ?entry.endpoints, "Advertised");
        Ok(entry)
    }

    /// Live entries in the directory, keyed by identity.
    pub async fn directory(&self) -> database::Result<Vec<Advertisement>> {
        let cutoff = self.inner.ctx.config().advertising.cutoff(SystemTime::now());
        self.inner.ctx.pool().fresh_entries(cutoff).await
    }
}

#[async_trait::async_trait]
impl Service for AdvertisingService {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let this = self.clone();
        let interval = self.interval();
        self.inner.task.set(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = this.update().await {
                    warn!(error = %e, "Advertising cycle failed");
                }
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.task.abort();

        let ident = self.inner.ctx.ident().to_owned();
        let withdrawn = self
            .inner
            .ctx
            .pool()
            .run(move |store| store.delete(&ident))
            .await;
        if let Err(e) = withdrawn {
            warn!(error = %e, "Could not withdraw advertisement");
        }
    }

    fn running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
