//! Route and rule integration tests.

use ndb::lab::SimKernel;
use ndb::{Result, Spec, Value};

use crate::common::start;

#[tokio::test]
async fn test_initial_routes() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    assert_eq!(ndb.routes().count().await?, 2);
    assert!(ndb.routes().exists("default").await?);

    let default = ndb.routes().get("default").await?;
    assert_eq!(default.get("gateway"), Some(Value::from("192.168.122.1")));
    assert_eq!(default.get_int("table"), Some(254));

    ndb.close().await
}

#[tokio::test]
async fn test_create_route() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let route = ndb
        .routes()
        .create(
            Spec::new()
                .with("dst", "10.1.0.0/24")
                .with("gateway", "192.168.122.254"),
        )
        .await?;
    route.commit().await?;

    let sim = kernel
        .routes(SimKernel::ROOT)
        .into_iter()
        .find(|r| r.get_str("dst") == Some("10.1.0.0"))
        .expect("route should exist");
    assert_eq!(sim.get_int("table"), Some(254));
    assert_eq!(sim.get_int("oif"), Some(2));

    let summary = ndb
        .routes()
        .summary()
        .await?
        .select_records(&[("dst", Value::from("10.1.0.0"))]);
    assert_eq!(summary.count(), 1);
    let record = summary.iter().next().expect("one record");
    assert_eq!(record.get("ifname"), Some(&Value::from("eth0")));
    assert_eq!(record.get("dst_len"), Some(&Value::Int(24)));

    route.remove();
    route.commit().await?;
    assert!(
        !kernel
            .routes(SimKernel::ROOT)
            .iter()
            .any(|r| r.get_str("dst") == Some("10.1.0.0"))
    );

    ndb.close().await
}

#[tokio::test]
async fn test_unreachable_gateway() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let route = ndb
        .routes()
        .create(
            Spec::new()
                .with("dst", "10.2.0.0/16")
                .with("gateway", "10.9.9.9"),
        )
        .await?;
    let err = route.commit().await.unwrap_err();
    assert_eq!(err.errno(), Some(libc::ENETUNREACH));
    assert_eq!(ndb.routes().count().await?, 2);

    ndb.close().await
}

#[tokio::test]
async fn test_link_down_flushes_routes() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let eth0 = ndb.interfaces().get("eth0").await?;
    eth0.set("state", "down")?;
    eth0.commit().await?;

    // The kernel dropped the routes without a word; the store follows.
    assert!(kernel.routes(SimKernel::ROOT).is_empty());
    assert_eq!(ndb.routes().count().await?, 0);

    eth0.rollback(None).await?;
    assert!(eth0.is_up());
    assert!(
        kernel
            .routes(SimKernel::ROOT)
            .iter()
            .any(|r| r.get_str("gateway") == Some("192.168.122.1")),
        "default route should be restored"
    );
    assert!(ndb.routes().exists("default").await?);

    ndb.close().await
}

#[tokio::test]
async fn test_rules() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    assert_eq!(ndb.rules().count().await?, 3);

    let rule = ndb
        .rules()
        .create(Spec::new().with("priority", 100).with("table", 10))
        .await?;
    rule.commit().await?;
    assert_eq!(kernel.rules(SimKernel::ROOT).len(), 4);
    assert_eq!(ndb.rules().count().await?, 4);

    rule.remove();
    rule.commit().await?;
    assert_eq!(kernel.rules(SimKernel::ROOT).len(), 3);

    ndb.close().await
}
