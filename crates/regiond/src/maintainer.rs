//! # Connection Maintainer
//!
//! The rack-side counterpart of advertising. It polls rpc-info and keeps
//! exactly one connection to every advertised event loop: dialling the ones
//! it lacks, and dropping connections to event loops that are no longer
//! advertised. Registered as `rpc-maintainer`.
//!
//! ## Polling interval
//!
//! | condition                                                      | interval |
//! |----------------------------------------------------------------|----------|
//! | started less than `HIGH` ago, no event loops, or no connections | `LOW`    |
//! | fewer connections than event loops                              | `MID`    |
//! | otherwise                                                       | `HIGH`   |

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::connection::Connection;
use crate::context::RegionContext;
use crate::eventloop::EventLoop;
use crate::eventloop::RpcInfo;
use crate::selector;
use crate::service::Service;
use crate::service::TaskSlot;

pub const INTERVAL_LOW: Duration = Duration::from_secs(2);
pub const INTERVAL_MID: Duration = Duration::from_secs(10);
pub const INTERVAL_HIGH: Duration = Duration::from_secs(30);

/// Where the maintainer learns which event loops exist.
#[async_trait::async_trait]
pub trait RpcInfoSource: Send + Sync + 'static {
    /// `None` when the information is not available right now.
    async fn rpc_info(&self) -> Option<RpcInfo>;
}

#[async_trait::async_trait]
impl RpcInfoSource for EventLoop {
    async fn rpc_info(&self) -> Option<RpcInfo> {
        EventLoop::rpc_info(self).await
    }
}

/// rpc-info set by hand.
#[derive(Default)]
pub struct StaticRpcInfo {
    info: Mutex<Option<RpcInfo>>,
}

impl StaticRpcInfo {
    pub fn new(info: RpcInfo) -> Self {
        Self { info: Mutex::new(Some(info)) }
    }

    pub fn set(&self, info: Option<RpcInfo>) {
        *self.info.lock().unwrap_or_else(PoisonError::into_inner) = info;
    }
}

#[async_trait::async_trait]
impl RpcInfoSource for StaticRpcInfo {
    async fn rpc_info(&self) -> Option<RpcInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// How long to wait before the next poll.
pub fn calculate_interval(elapsed: Duration, eventloops: usize, connections: usize) -> Duration {
    if elapsed < INTERVAL_HIGH || eventloops == 0 || connections == 0 {
        INTERVAL_LOW
    } else if connections < eventloops {
        INTERVAL_MID
    } else {
        INTERVAL_HIGH
    }
}

struct Inner {
    ctx: RegionContext,
    source: Arc<dyn RpcInfoSource>,
    /// Connections this service dialled, by event-loop identity.
    maintained: DashMap<String, Connection>,
    started_at: Mutex<Option<Instant>>,
    task: TaskSlot,
    running: AtomicBool,
}

#[derive(Clone)]
pub struct ConnectionMaintainer {
    inner: Arc<Inner>,
}

impl ConnectionMaintainer {
    pub const NAME: &'static str = "rpc-maintainer";

    pub fn new(ctx: RegionContext, source: Arc<dyn RpcInfoSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                source,
                maintained: DashMap::new(),
                started_at: Mutex::new(None),
                task: TaskSlot::default(),
                running: AtomicBool::new(false),
            }),
        }
    }

    fn elapsed(&self) -> Duration {
        self.inner
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map_or(Duration::ZERO, |at| at.elapsed())
    }

    /// Identities of the event loops currently maintained.
    pub fn connected(&self) -> BTreeSet<String> {
        self.inner
            .maintained
            .iter()
            .filter(|e| e.value().is_open())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Runs one maintenance pass and returns the delay before the next.
    pub async fn update(&self) -> Duration {
        let ctx = &self.inner.ctx;
        self.inner.maintained.retain(|_, conn| conn.is_open());

        let Some(mut info) = self.inner.source.rpc_info().await else {
            debug!("No rpc-info available");
            return calculate_interval(self.elapsed(), 0, self.inner.maintained.len());
        };
        info.remove(ctx.ident());

        for (ident, endpoints) in &info {
            if self.inner.maintained.contains_key(ident) {
                continue;
            }
            if let Some(existing) = ctx.connections().by_ident(ident).into_iter().next() {
                self.inner.maintained.insert(ident.clone(), existing);
                continue;
            }

            match selector::connect(ctx, ident, endpoints).await {
                Ok(conn) => {
                    info!(eventloop = %ident, peer = ?conn.peer_addr(), "Connected to event-loop");
                    self.inner.maintained.insert(ident.clone(), conn);
                }
                Err(failures) if failures.is_empty() => {
                    warn!("Event-loop {}: no endpoints advertised", ident);
                }
                Err(failures) => {
                    for failure in failures {
                        warn!("Event-loop {} ({}): {}", ident, failure.addr, failure.reason);
                    }
                }
            }
        }

        let gone: Vec<String> = self
            .inner
            .maintained
            .iter()
            .filter(|e| !info.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for ident in gone {
            if let Some((_, conn)) = self.inner.maintained.remove(&ident) {
                info!(eventloop = %ident, "Event-loop no longer advertised; disconnecting");
                conn.close().await;
            }
        }

        calculate_interval(self.elapsed(), info.len(), self.inner.maintained.len())
    }
}

#[async_trait::async_trait]
impl Service for ConnectionMaintainer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.inner.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        let this = self.clone();
        self.inner.task.set(tokio::spawn(async move {
            loop {
                let next = this.update().await;
                tokio::time::sleep(next).await;
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.task.abort();

        let maintained: Vec<Connection> = self.inner.maintained.iter().map(|e| e.value().clone()).collect();
        self.inner.maintained.clear();
        for conn in maintained {
            conn.close().await;
        }
    }

    fn running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
