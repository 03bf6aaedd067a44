use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use anyhow::Context;
use rackrpc::Record;
use rackrpc::catalog::BootImage;
use rackrpc::catalog::Identify;
use rackrpc::catalog::ListBootImages;
use rackrpc::catalog::ListBootImagesV2;
use rackrpc::catalog::PowerQuery;
use rackrpc::ProtocolFailure;

use regiond::Advertisement;
use regiond::AdvertisingService;
use regiond::CallError;
use regiond::ClientSelector;
use regiond::ConnectionMaintainer;
use regiond::DirectoryStore;
use regiond::EventLoop;
use regiond::InMemoryStore;
use regiond::RegionConfig;
use regiond::RegionContext;
use regiond::RpcService;
use regiond::Service;
use regiond::Target;
use regiond::context::eventloop_ident;
use regiond::context::local_hostname;
use regiond::context::parse_eventloop_ident;
use regiond::eventloop;
use regiond::maintainer::RpcInfoSource;
use regiond::maintainer::StaticRpcInfo;

const SECRET: &[u8] = b"integration secret";

// --- Helpers ---

fn config(dir: &Path) -> RegionConfig {
    let mut config = RegionConfig::default();
    config.rpc.bind = SocketAddr::from(([127, 0, 0, 1], 0));
    config.rpc.handshake_timeout_secs = 5;
    config.rpc.connect_timeout_secs = 2;
    config.advertising.interval_secs = 10;
    config.paths.region_id = dir.join("region_id");
    config
}

fn region(dir: &Path, ident: &str, store: &Arc<InMemoryStore>) -> anyhow::Result<Arc<EventLoop>> {
    let ctx = RegionContext::builder(config(dir))
        .secret(SECRET.to_vec())
        .store(store.clone())
        .ident(ident)
        .build()?;
    Ok(EventLoop::new(ctx))
}

async fn advertise(eventloop: &EventLoop) -> anyhow::Result<Advertisement> {
    let service = eventloop
        .get_service_named(AdvertisingService::NAME)
        .context("no advertising service")?;
    let advertising = service
        .as_any()
        .downcast_ref::<AdvertisingService>()
        .context("advertising service has an unexpected type")?;
    Ok(advertising.update().await?)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    for _ in 0..300 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("condition not reached in time")
}

fn synthetic_images(n: usize) -> Vec<BootImage> {
    (0..n)
        .map(|i| BootImage {
            osystem: "ubuntu".into(),
            architecture: "amd64".into(),
            subarchitecture: "generic".into(),
            release: format!("release-{}", i),
            label: "release".into(),
            purpose: "xinstall".into(),
            xinstall_type: "squashfs".into(),
            xinstall_path: format!("/var/lib/maas/boot-resources/current/ubuntu/amd64/{}/squashfs", i),
        })
        .collect()
}

fn own_ident(name: &str) -> String {
    eventloop_ident(name, std::process::id())
}

// --- Test 1: Two event loops find each other through the directory ---

#[tokio::test]
async fn test_selector_reaches_advertised_eventloop() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryStore::new());
    let a_ident = own_ident("region-a");
    let b_ident = own_ident("region-b");
    let a = region(dir.path(), &a_ident, &store)?;
    let b = region(dir.path(), &b_ident, &store)?;

    a.start().await?;
    b.start().await?;
    advertise(&a).await?;
    let b_entry = advertise(&b).await?;
    assert!(!b_entry.endpoints.is_empty());

    let info = a.rpc_info().await.context("rpc-info unavailable")?;
    assert!(info.contains_key(&a_ident));
    assert_eq!(info.get(&b_ident), Some(&b_entry.endpoints));

    let selector = ClientSelector::new(a.context().clone());
    let client = selector.get_client(&Target::EventLoop(b_ident.clone())).await?;
    assert_eq!(client.ident(), Some(b_ident.as_str()));
    let peer = client.peer_addr().context("no peer address")?;
    assert!(b_entry.endpoints.contains(&(peer.ip(), peer.port())));

    let answer = client.call::<Identify>(Record::new()).await?;
    assert_eq!(answer.unicode("ident")?, b_ident);

    // A second lookup reuses the open connection.
    let again = selector.get_client(&Target::EventLoop(b_ident.clone())).await?;
    assert!(again.connection().same_as(client.connection()));

    // B filed the inbound side under A's identity.
    let b_connections = b.context().connections().clone();
    wait_until(|| !b_connections.by_ident(&a_ident).is_empty()).await?;

    let any = selector.get_client(&Target::Any).await?;
    assert_eq!(any.ident(), Some(b_ident.as_str()));

    a.stop().await;
    b.stop().await;
    Ok(())
}

// --- Test 2: Boot image listings across a real connection ---

#[tokio::test]
async fn test_boot_images_v2_carries_large_catalogues() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryStore::new());
    let a = region(dir.path(), &own_ident("region-a"), &store)?;
    let b_ident = own_ident("region-b");
    let b = region(dir.path(), &b_ident, &store)?;

    let handlers = b.context().handlers();
    handlers.register::<ListBootImages, _, _>(|_| async { Ok(BootImage::to_response(&synthetic_images(500))) });
    handlers.register::<ListBootImagesV2, _, _>(|_| async { Ok(BootImage::to_response(&synthetic_images(500))) });

    a.start().await?;
    b.start().await?;
    advertise(&b).await?;

    let client = ClientSelector::new(a.context().clone())
        .get_client(&Target::EventLoop(b_ident))
        .await?;

    let answer = client.call::<ListBootImagesV2>(Record::new()).await?;
    assert_eq!(BootImage::from_response(&answer)?, synthetic_images(500));

    match client.call::<ListBootImages>(Record::new()).await {
        Err(CallError::Protocol { failure, .. }) => assert_eq!(failure, ProtocolFailure::TooLong),
        other => anyhow::bail!("expected TOO_LONG, got {:?}", other),
    }

    a.stop().await;
    b.stop().await;
    Ok(())
}

// --- Test 3: Selector failures ---

#[tokio::test]
async fn test_selector_without_candidates() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryStore::new());
    let a_ident = own_ident("region-a");
    let a = region(dir.path(), &a_ident, &store)?;
    a.start().await?;
    advertise(&a).await?;

    // An advertisement nobody is listening behind.
    let closed = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    store.upsert(Advertisement {
        ident: own_ident("region-gone"),
        endpoints: vec![(closed.ip(), closed.port())],
        updated: SystemTime::now(),
    })?;

    let selector = ClientSelector::new(a.context().clone());
    for target in [
        Target::EventLoop(own_ident("region-gone")),
        Target::EventLoop(own_ident("region-unknown")),
        Target::EventLoop(a_ident),
        Target::RackController("rack-unknown".into()),
        Target::Any,
    ] {
        assert!(matches!(
            selector.get_client(&target).await,
            Err(regiond::selector::Error::NoConnectionsAvailable(_))
        ));
    }

    a.stop().await;
    Ok(())
}

// --- Test 4: Populate is idempotent ---

#[tokio::test]
async fn test_populate_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryStore::new());
    let a = region(dir.path(), &own_ident("region-a"), &store)?;

    a.populate().await?;
    let rpc = a.get_service_named(RpcService::NAME).context("rpc not populated")?;
    a.populate().await?;

    assert_eq!(a.service_names(), vec![RpcService::NAME, AdvertisingService::NAME]);
    let again = a.get_service_named(RpcService::NAME).context("rpc not populated")?;
    assert!(Arc::ptr_eq(&rpc, &again));

    // A factory added later is built on the next populate; the rest are kept.
    let info = Arc::new(StaticRpcInfo::default());
    a.add_factory(ConnectionMaintainer::NAME, move |ctx| {
        Arc::new(ConnectionMaintainer::new(ctx.clone(), info.clone()))
    });
    a.populate().await?;
    assert_eq!(
        a.service_names(),
        vec![RpcService::NAME, AdvertisingService::NAME, ConnectionMaintainer::NAME]
    );
    let kept = a.get_service_named(RpcService::NAME).context("rpc not populated")?;
    assert!(Arc::ptr_eq(&rpc, &kept));
    assert!(!a.running());
    Ok(())
}

#[tokio::test]
async fn test_duplicate_service_names_are_refused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryStore::new());
    let a = region(dir.path(), &own_ident("region-a"), &store)?;
    a.add_factory("second-rpc", |ctx| Arc::new(RpcService::new(ctx.clone())));

    assert!(matches!(
        a.populate().await,
        Err(eventloop::Error::DuplicateService(name)) if name == RpcService::NAME
    ));
    Ok(())
}

// --- Test 5: Start, stop and reset ---

#[tokio::test]
async fn test_stop_withdraws_and_reset_restores_defaults() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryStore::new());
    let a_ident = own_ident("region-a");
    let a = region(dir.path(), &a_ident, &store)?;

    // Stopping something never started is a no-op.
    a.stop().await;
    assert!(!a.running());

    let info = Arc::new(StaticRpcInfo::default());
    a.add_factory(ConnectionMaintainer::NAME, move |ctx| {
        Arc::new(ConnectionMaintainer::new(ctx.clone(), info.clone()))
    });
    assert_eq!(
        a.factory_names(),
        vec![RpcService::NAME, AdvertisingService::NAME, ConnectionMaintainer::NAME]
    );

    a.start().await?;
    assert!(a.running());
    advertise(&a).await?;
    assert!(store.list_all()?.iter().any(|e| e.ident == a_ident));
    for name in a.service_names() {
        assert!(a.get_service_named(&name).is_some_and(|s| s.running()), "{} not running", name);
    }

    a.stop().await;
    assert!(!a.running());
    assert!(a.rpc_info().await.is_none());
    assert!(!store.list_all()?.iter().any(|e| e.ident == a_ident));
    assert!(a.context().listeners().snapshot().is_empty());

    a.reset().await;
    assert!(a.service_names().is_empty());
    assert_eq!(a.factory_names(), vec![RpcService::NAME, AdvertisingService::NAME]);

    // Services are rebuilt from the restored defaults.
    a.start().await?;
    assert_eq!(a.service_names(), vec![RpcService::NAME, AdvertisingService::NAME]);
    a.stop().await;
    Ok(())
}

// --- Test 6: Directory staleness ---

#[tokio::test]
async fn test_stale_entries_expire() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryStore::new());
    let a = region(dir.path(), &own_ident("region-a"), &store)?;
    let stale_after = a.context().config().advertising.stale_after();
    let now = SystemTime::now();

    let entry = |ident: &str, age: Duration| Advertisement {
        ident: ident.to_owned(),
        endpoints: vec![(std::net::Ipv4Addr::new(10, 0, 0, 9).into(), 5250)],
        updated: now - age,
    };
    store.upsert(entry("region-old:pid=1", stale_after + Duration::from_secs(1)))?;
    store.upsert(entry("region-recent:pid=2", stale_after - Duration::from_secs(5)))?;

    a.start().await?;
    let info = a.rpc_info().await.context("rpc-info unavailable")?;
    assert!(!info.contains_key("region-old:pid=1"));
    assert!(info.contains_key("region-recent:pid=2"));

    advertise(&a).await?;
    let idents: Vec<String> = store.list_all()?.into_iter().map(|e| e.ident).collect();
    assert!(!idents.iter().any(|i| i == "region-old:pid=1"));
    assert!(idents.iter().any(|i| i == "region-recent:pid=2"));

    a.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_stale_eventloop_is_not_selected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryStore::new());
    let a = region(dir.path(), &own_ident("region-a"), &store)?;
    let b_ident = own_ident("region-b");
    let b = region(dir.path(), &b_ident, &store)?;

    // B only listens; its entry is written by hand so its age is under our control.
    let mut listen_only = eventloop::Factories::empty();
    listen_only.add(RpcService::NAME, |ctx| Arc::new(RpcService::new(ctx.clone())));
    b.set_factories(listen_only);
    b.start().await?;
    let rpc = b.get_service_named(RpcService::NAME).context("rpc not populated")?;
    let bound = rpc
        .as_any()
        .downcast_ref::<RpcService>()
        .and_then(RpcService::local_addr)
        .context("rpc not bound")?;
    let entry = |updated: SystemTime| Advertisement {
        ident: b_ident.clone(),
        endpoints: vec![(bound.ip(), bound.port())],
        updated,
    };
    store.upsert(entry(SystemTime::now()))?;

    a.start().await?;
    let selector = ClientSelector::new(a.context().clone());
    let target = Target::EventLoop(b_ident.clone());
    let client = selector.get_client(&target).await?;
    assert!(client.connection().is_open());

    // The connection stays open, but the entry behind it ages out.
    let stale_after = a.context().config().advertising.stale_after();
    store.upsert(entry(SystemTime::now() - stale_after - Duration::from_secs(1)))?;

    let info = a.rpc_info().await.context("rpc-info unavailable")?;
    assert!(!info.contains_key(&b_ident));
    for target in [target, Target::Any] {
        assert!(matches!(
            selector.get_client(&target).await,
            Err(regiond::selector::Error::NoConnectionsAvailable(_))
        ));
    }

    a.stop().await;
    b.stop().await;
    Ok(())
}

// --- Test 7: Dead processes on this host are swept on the first cycle ---

#[tokio::test]
async fn test_first_cycle_sweeps_dead_local_processes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryStore::new());

    let mut child = std::process::Command::new("true").spawn()?;
    let dead = child.id();
    child.wait()?;

    let hostname = local_hostname();
    std::fs::write(dir.path().join("region_id"), "previous-name\n")?;
    for ident in [
        eventloop_ident(&hostname, dead),
        eventloop_ident("previous-name", dead),
        eventloop_ident("elsewhere", dead),
    ] {
        store.upsert(Advertisement { ident, endpoints: vec![], updated: SystemTime::now() })?;
    }

    let ctx = RegionContext::builder(config(dir.path()))
        .secret(SECRET.to_vec())
        .store(store.clone())
        .build()?;
    let a = EventLoop::new(ctx);
    assert_eq!(a.name(), eventloop_ident(&hostname, std::process::id()));
    assert_eq!(parse_eventloop_ident(a.name()), Some((hostname.as_str(), std::process::id())));

    a.start().await?;
    advertise(&a).await?;

    let idents: Vec<String> = store.list_all()?.into_iter().map(|e| e.ident).collect();
    assert_eq!(idents.len(), 2);
    assert!(idents.contains(&a.name().to_owned()));
    assert!(idents.contains(&eventloop_ident("elsewhere", dead)));
    assert_eq!(std::fs::read_to_string(dir.path().join("region_id"))?.trim(), hostname);

    a.stop().await;
    Ok(())
}

// --- Test 8: Rack-side maintenance ---

#[tokio::test]
async fn test_maintainer_connects_and_disconnects() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryStore::new());
    let b_ident = own_ident("region-b");
    let b = region(dir.path(), &b_ident, &store)?;
    b.start().await?;
    advertise(&b).await?;

    let rack = RegionContext::builder(config(dir.path()))
        .secret(SECRET.to_vec())
        .store(Arc::new(InMemoryStore::new()))
        .ident("rack-4y3h7n")
        .build()?;
    rack.handlers()
        .register::<PowerQuery, _, _>(|_| async { Ok(Record::new().with("state", "off")) });

    let source: Arc<dyn RpcInfoSource> = b.clone();
    let info = source.rpc_info().await.context("rpc-info unavailable")?;
    let static_info = Arc::new(StaticRpcInfo::new(info));

    let maintainer = ConnectionMaintainer::new(rack.clone(), static_info.clone());
    maintainer.update().await;
    assert!(maintainer.connected().contains(&b_ident));

    // The region can now reach the rack controller by its identity.
    let b_connections = b.context().connections().clone();
    wait_until(|| !b_connections.by_ident("rack-4y3h7n").is_empty()).await?;
    let client = ClientSelector::new(b.context().clone())
        .get_client(&Target::RackController("rack-4y3h7n".into()))
        .await?;
    let answer = client
        .call::<PowerQuery>(
            Record::new()
                .with("system_id", "node-1")
                .with("hostname", "node-1")
                .with("power_type", "virsh")
                .with("context", serde_json::json!({})),
        )
        .await?;
    assert_eq!(answer.unicode("state")?, "off");

    // A second pass keeps the one connection.
    maintainer.update().await;
    assert_eq!(rack.connections().by_ident(&b_ident).len(), 1);

    static_info.set(Some(Default::default()));
    maintainer.update().await;
    assert!(maintainer.connected().is_empty());
    let rack_connections = rack.connections().clone();
    wait_until(|| rack_connections.by_ident(&b_ident).is_empty()).await?;

    b.stop().await;
    Ok(())
}
