//! Transaction integration tests.

use async_trait::async_trait;
use ndb::lab::SimKernel;
use ndb::{Commit, Error, Result};

use crate::common::{dummy, start};

/// A check that always fails.
struct Refuse;

#[async_trait]
impl Commit for Refuse {
    async fn commit(&self) -> Result<()> {
        Err(Error::CheckFailed("refused".into()))
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "refuse".into()
    }
}

#[tokio::test]
async fn test_commit_in_order() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let br0 = ndb
        .interfaces()
        .create(dummy("br0").with("kind", "bridge"))
        .await?;
    let port = ndb
        .interfaces()
        .create(dummy("port0").with("master", "br0"))
        .await?;

    let mut tx = ndb.begin();
    tx.push(br0.clone()).push(port.clone());
    assert_eq!(tx.len(), 2);
    tx.commit().await?;
    assert!(tx.done());

    let master = kernel
        .link(SimKernel::ROOT, "port0")
        .and_then(|link| link.get_int("master"));
    assert_eq!(master, br0.get_int("index"));

    ndb.close().await
}

#[tokio::test]
async fn test_failure_rolls_back_committed_members() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let eth0 = ndb.interfaces().get("eth0").await?;
    eth0.set("mtu", 9000)?;
    let extra = ndb.interfaces().create(dummy("tx0")).await?;

    let mut tx = ndb.begin();
    tx.push(eth0.clone()).push(extra.clone()).push(Refuse);
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, Error::CheckFailed(_)), "unexpected {err}");

    assert!(kernel.link(SimKernel::ROOT, "tx0").is_none());
    let mtu = kernel
        .link(SimKernel::ROOT, "eth0")
        .and_then(|link| link.get_int("mtu"));
    assert_eq!(mtu, Some(1500));

    ndb.close().await
}

#[tokio::test]
async fn test_clean_members_are_skipped() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let eth0 = ndb.interfaces().get("eth0").await?;
    let sent = kernel.request_count();

    let mut tx = ndb.begin();
    tx.push(eth0.clone()).push(Refuse);
    assert!(tx.commit().await.is_err());
    assert_eq!(kernel.request_count(), sent);

    ndb.close().await
}
