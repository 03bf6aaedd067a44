use std::path::PathBuf;

use regiond::EventLoop;
use regiond::RegionConfig;
use regiond::RegionContext;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("regiond=info".parse()?))
        .init();

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("REGIOND_CONFIG").map(PathBuf::from));
    let config = RegionConfig::load(path.as_deref())?;

    let ctx = RegionContext::builder(config).build()?;
    let eventloop = EventLoop::new(ctx);
    info!(eventloop = eventloop.name(), "Starting");

    eventloop.start().await?;
    eventloop.stopped().await;

    info!(eventloop = eventloop.name(), "Exiting");
    Ok(())
}
