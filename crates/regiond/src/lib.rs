//! # regiond
//!
//! The region side of the region ⇄ rack RPC core.
//!
//! ## Architecture
//!
//! One process runs one **event loop**: a registry of named services sharing a
//! [`RegionContext`]. The default services are:
//!
//! - **rpc**: a TCP listener that authenticates inbound connections,
//! - **rpc-advertise**: publishes this event loop's endpoints to the shared
//!   directory and prunes dead entries.
//!
//! Rack processes add **rpc-maintainer**, which keeps one connection per
//! advertised event loop. The [`ClientSelector`] picks a live connection for
//! a target, dialling advertised endpoints when none is open.
//!
//! ## Example
//!
//! ```rust,no_run
//! use regiond::{EventLoop, RegionConfig, RegionContext};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let ctx = RegionContext::builder(RegionConfig::load(None)?).build()?;
//! let eventloop = EventLoop::new(ctx);
//! eventloop.start().await?;
//! eventloop.stopped().await;
//! # Ok(())
//! # }
//! ```

pub mod advertising;
pub mod config;
pub mod connection;
pub mod connections;
pub mod context;
pub mod database;
pub mod eventloop;
pub mod handlers;
pub mod maintainer;
pub mod mock_transport;
pub mod rpc;
pub mod selector;
pub mod service;
pub mod transport;

pub use advertising::AddressSource;
pub use advertising::AdvertisingService;
pub use advertising::FixedAddresses;
pub use config::RegionConfig;
pub use connection::CallError;
pub use connection::Connection;
pub use connections::ConnectionTable;
pub use context::RegionContext;
pub use database::Advertisement;
pub use database::DirectoryStore;
pub use database::InMemoryStore;
pub use eventloop::EventLoop;
pub use eventloop::Factories;
pub use handlers::HandlerError;
pub use handlers::Handlers;
pub use maintainer::ConnectionMaintainer;
pub use rpc::RpcService;
pub use selector::ClientSelector;
pub use selector::Target;
pub use service::Service;
pub use transport::Transport;
