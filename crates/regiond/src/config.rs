//! # Configuration
//!
//! Loaded in the following order (later sources override earlier):
//! 1. Default values
//! 2. A TOML file, when one is given and exists
//! 3. Environment variables with the `REGIOND_` prefix, `__` separating sections
//!    (`REGIOND_RPC__BIND=0.0.0.0:5250`)

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use figment::Figment;
use figment::providers::Env;
use figment::providers::Format;
use figment::providers::Serialized;
use figment::providers::Toml;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug)]
pub enum Error {
    /// The configuration sources could not be merged or deserialized.
    Figment(Box<figment::Error>),
    /// The shared secret file could not be read.
    SecretUnreadable { path: PathBuf, reason: String },
    /// The shared secret file is not hex.
    SecretMalformed { path: PathBuf, reason: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Figment(e) => write!(f, "Configuration error: {}", e),
            Self::SecretUnreadable { path, reason } => {
                write!(f, "Shared secret {} unreadable: {}", path.display(), reason)
            }
            Self::SecretMalformed { path, reason } => {
                write!(f, "Shared secret {} is not hex: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Self::Figment(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level region daemon configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegionConfig {
    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub advertising: AdvertisingConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Overrides the `hostname:pid=N` event-loop identity.
    #[serde(default)]
    pub identity: Option<String>,
}

impl RegionConfig {
    /// Loads defaults, then `path` if it exists, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(RegionConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Ok(figment.merge(Env::prefixed("REGIOND_").split("__")).extract()?)
    }

    /// Parses configuration from a TOML string, without the environment.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(Figment::from(Serialized::defaults(RegionConfig::default()))
            .merge(Toml::string(content))
            .extract()?)
    }
}

/// RPC listener and handshake settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcConfig {
    /// Where to listen. Port 0 picks an ephemeral port.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

const fn default_handshake_timeout_secs() -> u64 {
    30
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl RpcConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Advertising cadence and staleness.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdvertisingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Entries older than this many intervals are dead.
    #[serde(default = "default_stale_after_intervals")]
    pub stale_after_intervals: u32,
}

const fn default_interval_secs() -> u64 {
    60
}

const fn default_stale_after_intervals() -> u32 {
    3
}

impl Default for AdvertisingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            stale_after_intervals: default_stale_after_intervals(),
        }
    }
}

impl AdvertisingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        self.interval() * self.stale_after_intervals
    }

    /// The oldest update time still considered alive at `now`.
    pub fn cutoff(&self, now: SystemTime) -> SystemTime {
        now.checked_sub(self.stale_after()).unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

/// Files the daemon reads and writes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Marker recording which host this region last ran as.
    #[serde(default = "default_region_id")]
    pub region_id: PathBuf,

    /// Hex-encoded shared secret.
    #[serde(default = "default_shared_secret")]
    pub shared_secret: PathBuf,
}

fn default_region_id() -> PathBuf {
    PathBuf::from("/var/lib/maas/region_id")
}

fn default_shared_secret() -> PathBuf {
    PathBuf::from("/var/lib/maas/secret")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            region_id: default_region_id(),
            shared_secret: default_shared_secret(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Blocking workers available to directory calls.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

const fn default_workers() -> usize {
    4
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { workers: default_workers() }
    }
}

/// Reads and hex-decodes the shared secret.
pub fn load_secret(path: &Path) -> Result<Arc<[u8]>> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::SecretUnreadable {
        path: path.to_owned(),
        reason: e.to_string(),
    })?;
    let secret = hex::decode(text.trim()).map_err(|e| Error::SecretMalformed {
        path: path.to_owned(),
        reason: e.to_string(),
    })?;
    Ok(secret.into())
}
