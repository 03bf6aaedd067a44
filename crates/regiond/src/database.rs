//! # Directory Store
//!
//! The shared directory of advertised event loops, behind a synchronous
//! repository trait. Store calls may block, so they only ever run through
//! [`DatabasePool::run`], which moves them onto tokio's blocking pool with a
//! bounded number of workers.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The backing store failed.
    Store(String),
    /// The worker running the closure panicked or was cancelled.
    Worker(String),
    /// The pool has been shut down.
    Closed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(msg) => write!(f, "Directory store error: {}", msg),
            Self::Worker(msg) => write!(f, "Database worker failed: {}", msg),
            Self::Closed => write!(f, "Database pool is closed"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One event loop's advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// `hostname:pid=N`.
    pub ident: String,
    pub endpoints: Vec<(IpAddr, u16)>,
    pub updated: SystemTime,
}

impl Advertisement {
    /// Whether this entry was refreshed at or after `cutoff`.
    pub fn is_fresh(&self, cutoff: SystemTime) -> bool {
        self.updated >= cutoff
    }
}

/// The repository for advertisements. Implementations may block.
pub trait DirectoryStore: Send + Sync + 'static {
    /// Inserts or replaces the entry keyed by `entry.ident`.
    fn upsert(&self, entry: Advertisement) -> Result<()>;

    /// Removes one entry. Returns whether it existed.
    fn delete(&self, ident: &str) -> Result<bool>;

    /// Removes every entry last updated before `cutoff`, returning their identities.
    fn delete_older_than(&self, cutoff: SystemTime) -> Result<Vec<String>>;

    /// Every entry, ordered by identity.
    fn list_all(&self) -> Result<Vec<Advertisement>>;
}

/// A process-local directory, shared by handing out clones of one `Arc`.
#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<String, Advertisement>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DirectoryStore for InMemoryStore {
    fn upsert(&self, entry: Advertisement) -> Result<()> {
        self.entries.insert(entry.ident.clone(), entry);
        Ok(())
    }

    fn delete(&self, ident: &str) -> Result<bool> {
        Ok(self.entries.remove(ident).is_some())
    }

    fn delete_older_than(&self, cutoff: SystemTime) -> Result<Vec<String>> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_fresh(cutoff))
            .map(|e| e.key().clone())
            .collect();
        for ident in &stale {
            self.entries.remove(ident);
        }
        Ok(stale)
    }

    fn list_all(&self) -> Result<Vec<Advertisement>> {
        let mut all: Vec<Advertisement> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.ident.cmp(&b.ident));
        Ok(all)
    }
}

/// Runs directory work on blocking threads.
#[derive(Clone)]
pub struct DatabasePool {
    store: Arc<dyn DirectoryStore>,
    permits: Arc<Semaphore>,
}

impl DatabasePool {
    pub fn new(store: Arc<dyn DirectoryStore>, workers: usize) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Runs `f` against the store on a blocking worker and awaits its result.
    pub async fn run<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&dyn DirectoryStore) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<Error> + Send + 'static,
    {
        let _permit = self.permits.clone().acquire_owned().await.map_err(|_| Error::Closed)?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| Error::Worker(e.to_string()))?
    }

    /// Entries refreshed at or after `cutoff`.
    pub async fn fresh_entries(&self, cutoff: SystemTime) -> Result<Vec<Advertisement>> {
        self.run(move |store| {
            Ok(store.list_all()?.into_iter().filter(|e| e.is_fresh(cutoff)).collect())
        })
        .await
    }
}
