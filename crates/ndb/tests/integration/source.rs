//! Source life cycle integration tests.

use std::sync::Arc;
use std::time::Duration;

use ndb::lab::SimKernel;
use ndb::{
    Attrs, EventKind, Ndb, NdbConfig, Result, SourceKind, SourceSpec, SourceState, Spec, Verb,
};

use crate::common::{config, eventually, start, start_with};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_initial_load() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let source = ndb.sources().get("localhost")?;
    assert_eq!(source.state(), SourceState::Running);
    // lo, eth0 and the placeholder interface 0
    assert_eq!(ndb.interfaces().count().await?, 3);
    assert_eq!(ndb.addresses().count().await?, 2);
    assert_eq!(ndb.sources().summary().count(), 1);

    ndb.close().await
}

#[tokio::test]
async fn test_external_changes_are_tracked() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    kernel.run(
        SimKernel::ROOT,
        EventKind::Link,
        Verb::Create,
        Attrs::new().with("ifname", "oob0").with("kind", "dummy"),
    )?;
    let db = &ndb;
    assert!(
        eventually(WAIT, || async move {
            db.interfaces().exists("oob0").await.unwrap_or(false)
        })
        .await
    );

    ndb.close().await
}

#[tokio::test]
async fn test_reconnect_after_failure() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = Ndb::builder()
        .config(config())
        .connector(Arc::new(kernel.clone()))
        .source(SourceSpec::new("localhost").backoff(Duration::from_millis(50)))
        .build()
        .await?;

    kernel.fail_next_recv(SimKernel::ROOT);
    // Changes made while the source is down show up after the reload.
    kernel.run(
        SimKernel::ROOT,
        EventKind::Link,
        Verb::Create,
        Attrs::new().with("ifname", "late0").with("kind", "dummy"),
    )?;
    let db = &ndb;
    assert!(
        eventually(WAIT, || async move {
            db.interfaces().exists("late0").await.unwrap_or(false)
        })
        .await
    );
    let source = ndb.sources().get("localhost")?;
    source.wait_state(SourceState::Running, WAIT).await?;

    ndb.close().await
}

#[tokio::test]
async fn test_namespace_sources_follow_the_kernel() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start_with(
        &kernel,
        NdbConfig {
            auto_netns: true,
            ..config()
        },
    )
    .await?;

    let db = &ndb;
    kernel.add_netns("test");
    assert!(eventually(WAIT, || async move { db.sources().contains("netns/test") }).await);
    let lo = Spec::new().with("target", "netns/test").with("ifname", "lo");
    assert!(
        eventually(WAIT, || {
            let lo = lo.clone();
            async move { db.interfaces().exists(lo).await.unwrap_or(false) }
        })
        .await
    );
    assert_eq!(ndb.netns().count().await?, 1);

    kernel.remove_netns("test");
    assert!(eventually(WAIT, || async move { !db.sources().contains("netns/test") }).await);

    ndb.close().await
}

#[tokio::test]
async fn test_explicit_namespace_source() -> Result<()> {
    let kernel = SimKernel::new();
    kernel.add_netns("blue");
    let ndb = Ndb::builder()
        .config(config())
        .connector(Arc::new(kernel.clone()))
        .source(SourceSpec::new("localhost"))
        .source(
            SourceSpec::new("blue")
                .kind(SourceKind::Netns)
                .netns("blue"),
        )
        .build()
        .await?;

    let iface = ndb
        .interfaces()
        .create(
            Spec::new()
                .with("target", "blue")
                .with("ifname", "dummy0")
                .with("kind", "dummy"),
        )
        .await?;
    iface.commit().await?;
    assert!(kernel.link("blue", "dummy0").is_some());
    assert!(kernel.link(SimKernel::ROOT, "dummy0").is_none());
    assert_eq!(iface.target(), "blue");

    ndb.close().await
}

#[tokio::test]
async fn test_close_keeps_store_without_cleanup() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start_with(
        &kernel,
        NdbConfig {
            db_cleanup: false,
            ..config()
        },
    )
    .await?;

    ndb.close().await?;
    ndb.close().await?;
    assert!(ndb.is_closed());
    let export = ndb.export().await?;
    assert!(export.contains("eth0"));

    Ok(())
}

#[tokio::test]
async fn test_start_fails_without_namespace() -> Result<()> {
    let kernel = SimKernel::new();
    let result = Ndb::builder()
        .config(config())
        .connector(Arc::new(kernel))
        .source(
            SourceSpec::new("ghost")
                .kind(SourceKind::Netns)
                .netns("ghost")
                .persistent(false),
        )
        .build()
        .await;
    assert!(result.is_err());
    Ok(())
}
