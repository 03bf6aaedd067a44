//! # RPC Listener Service
//!
//! Accepts TCP connections from other event loops and rack controllers, runs
//! the handshake on each, and files the survivors in the connection table.
//! Registered as `rpc`.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::connection::Connection;
use crate::context::RegionContext;
use crate::service::Service;
use crate::service::TaskSlot;
use crate::transport::TcpTransport;

struct Inner {
    ctx: RegionContext,
    task: TaskSlot,
    bound: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

#[derive(Clone)]
pub struct RpcService {
    inner: Arc<Inner>,
}

impl RpcService {
    pub const NAME: &'static str = "rpc";

    pub fn new(ctx: RegionContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                task: TaskSlot::default(),
                bound: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// The address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.admit(stream, peer).await });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
    }

    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let ctx = &self.inner.ctx;
        let transport = match TcpTransport::new(stream) {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                warn!(%peer, error = %e, "Could not set up transport");
                return;
            }
        };

        debug!(%peer, "Incoming connection");
        match Connection::establish(transport, ctx.handshake(None)).await {
            Ok(conn) if self.running() => {
                let id = ctx.connections().insert(conn);
                debug!(connection = %id, %peer, "Inbound connection registered");
            }
            Ok(conn) => conn.close().await,
            Err(e) => warn!(%peer, error = %e, "Inbound handshake failed"),
        }
    }
}

#[async_trait::async_trait]
impl Service for RpcService {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.running() {
            return Ok(());
        }

        let ctx = &self.inner.ctx;
        let listener = TcpListener::bind(ctx.config().rpc.bind).await?;
        let addr = listener.local_addr()?;
        *self.inner.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        ctx.listeners().add(addr);
        self.inner.running.store(true, Ordering::Release);

        self.inner.task.set(tokio::spawn(self.clone().accept_loop(listener)));
        info!(eventloop = ctx.ident(), %addr, "RPC listener started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.task.abort();

        let ctx = &self.inner.ctx;
        if let Some(addr) = self.inner.bound.lock().unwrap_or_else(PoisonError::into_inner).take() {
            ctx.listeners().remove(addr);
            info!(eventloop = ctx.ident(), %addr, "RPC listener stopped");
        }
        ctx.connections().close_all().await;
    }

    fn running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
