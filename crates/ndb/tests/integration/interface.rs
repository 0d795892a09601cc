//! Interface integration tests.

use ndb::lab::SimKernel;
use ndb::{Error, ObjectState, Result, Spec, Value};

use crate::common::{dummy, start};

#[tokio::test]
async fn test_create_interface() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let iface = ndb.interfaces().create(dummy("dummy0")).await?;
    assert_eq!(iface.state(), ObjectState::Invalid);
    iface.set("state", "up")?;
    iface.commit().await?;

    assert_eq!(iface.state(), ObjectState::System);
    assert!(iface.is_up());
    assert!(iface.changed().is_empty());

    let link = kernel.link(SimKernel::ROOT, "dummy0").expect("link should exist");
    assert_eq!(link.get_str("state"), Some("up"));
    assert_eq!(iface.get_int("index"), link.get_int("index"));
    assert!(ndb.interfaces().exists("dummy0").await?);

    ndb.close().await
}

#[tokio::test]
async fn test_create_existing_fails() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let err = ndb
        .interfaces()
        .create(Spec::new().with("ifname", "eth0"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ObjectExists(_)), "unexpected {err}");

    let err = ndb
        .interfaces()
        .create(Spec::new().with("kind", "dummy"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidValue { .. }), "unexpected {err}");

    ndb.close().await
}

#[tokio::test]
async fn test_clean_commit_sends_nothing() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let iface = ndb.interfaces().create(dummy("dummy0")).await?;
    iface.commit().await?;
    let sent = kernel.request_count();

    iface.commit().await?;
    assert_eq!(kernel.request_count(), sent);

    // Setting the current value is not a change either.
    iface.set("kind", "dummy")?;
    assert!(iface.is_clean());

    ndb.close().await
}

#[tokio::test]
async fn test_modify_interface() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let iface = ndb.interfaces().create(dummy("dummy0")).await?;
    iface.commit().await?;

    iface.set("mtu", 1400)?.set("alias", "uplink")?;
    iface.commit().await?;

    let link = kernel.link(SimKernel::ROOT, "dummy0").expect("link should exist");
    assert_eq!(link.get_int("mtu"), Some(1400));
    assert_eq!(link.get_str("alias"), Some("uplink"));
    assert_eq!(iface.get("mtu"), Some(Value::Int(1400)));

    ndb.close().await
}

#[tokio::test]
async fn test_key_field_change_refused() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let eth0 = ndb.interfaces().get("eth0").await?;
    let err = eth0.set("index", 42).unwrap_err();
    assert!(matches!(err, Error::KeyFieldChange(_)), "unexpected {err}");

    ndb.close().await
}

#[tokio::test]
async fn test_remove_and_rollback() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let iface = ndb.interfaces().create(dummy("dummy1")).await?;
    iface.set("state", "up")?;
    iface.commit().await?;
    let index = iface.get_int("index");

    iface.remove();
    iface.commit().await?;
    assert!(kernel.link(SimKernel::ROOT, "dummy1").is_none());
    assert_eq!(iface.state(), ObjectState::Invalid);
    assert!(!ndb.interfaces().exists("dummy1").await?);

    iface.rollback(None).await?;
    let link = kernel.link(SimKernel::ROOT, "dummy1").expect("link should be back");
    assert_eq!(link.get_int("index"), index);
    assert_eq!(link.get_str("state"), Some("up"));
    assert!(ndb.interfaces().exists("dummy1").await?);

    ndb.close().await
}

#[tokio::test]
async fn test_rollback_of_created_interface() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let iface = ndb.interfaces().create(dummy("dummy2")).await?;
    iface.commit().await?;
    assert!(kernel.link(SimKernel::ROOT, "dummy2").is_some());

    iface.rollback(None).await?;
    assert!(kernel.link(SimKernel::ROOT, "dummy2").is_none());

    ndb.close().await
}

#[tokio::test]
async fn test_kernel_error_restores_fields() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let iface = ndb
        .interfaces()
        .create(Spec::new().with("ifname", "x0").with("kind", "nosuchkind"))
        .await?;
    let err = iface.commit().await.unwrap_err();
    assert_eq!(err.errno(), Some(libc::EOPNOTSUPP));
    assert_eq!(iface.state(), ObjectState::Invalid);
    assert_eq!(iface.get("kind"), Some(Value::from("nosuchkind")));
    assert!(kernel.link(SimKernel::ROOT, "x0").is_none());

    ndb.close().await
}

#[tokio::test]
async fn test_unconfirmed_change() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    kernel.drop_requests(true);
    let iface = ndb.interfaces().create(dummy("ghost0")).await?;
    let err = iface.commit().await.unwrap_err();
    assert!(matches!(err, Error::CouldNotApply { .. }), "unexpected {err}");
    assert!(kernel.link(SimKernel::ROOT, "ghost0").is_none());

    kernel.drop_requests(false);
    iface.commit().await?;
    assert!(kernel.link(SimKernel::ROOT, "ghost0").is_some());

    ndb.close().await
}

#[tokio::test]
async fn test_object_cache_identity() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let a = ndb.interfaces().get("eth0").await?;
    let b = ndb.interfaces().get("eth0").await?;
    let c = ndb.interfaces().get(2i64).await?;
    assert!(a.ptr_eq(&b));
    assert!(a.ptr_eq(&c));
    assert_eq!(ndb.interfaces().cached(), 1);

    let err = ndb.interfaces().get("nosuch0").await.unwrap_err();
    assert!(err.is_not_found());

    ndb.close().await
}

#[tokio::test]
async fn test_bridge_ports() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let port = ndb.interfaces().create(dummy("port0")).await?;
    port.commit().await?;

    let br0 = ndb
        .interfaces()
        .create(Spec::new().with("ifname", "br0").with("kind", "bridge"))
        .await?;
    br0.set("state", "up")?;
    br0.add_port("port0")?;
    br0.commit().await?;

    let master = kernel
        .link(SimKernel::ROOT, "port0")
        .and_then(|link| link.get_int("master"));
    assert_eq!(master, br0.get_int("index"));
    assert_eq!(br0.ports()?.count().await?, 1);

    br0.del_port("port0")?;
    br0.commit().await?;
    let master = kernel
        .link(SimKernel::ROOT, "port0")
        .and_then(|link| link.get_int("master"));
    assert_eq!(master, Some(0));

    ndb.close().await
}

#[tokio::test]
async fn test_bridge_removal_rolls_back_ports() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let br0 = ndb
        .interfaces()
        .create(Spec::new().with("ifname", "br0").with("kind", "bridge"))
        .await?;
    br0.commit().await?;
    let port = ndb
        .interfaces()
        .create(dummy("port0").with("master", "br0"))
        .await?;
    port.commit().await?;
    assert_eq!(port.get_int("master"), br0.get_int("index"));

    br0.remove();
    br0.commit().await?;
    let master = kernel
        .link(SimKernel::ROOT, "port0")
        .and_then(|link| link.get_int("master"));
    assert_eq!(master, Some(0));

    br0.rollback(None).await?;
    let master = kernel
        .link(SimKernel::ROOT, "port0")
        .and_then(|link| link.get_int("master"));
    assert_eq!(master, br0.get_int("index"));

    ndb.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_state_follows_kernel_across_commits() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    for i in 0..20 {
        let ifname = format!("churn{i}");
        let iface = ndb.interfaces().create(dummy(&ifname)).await?;
        iface.commit().await?;

        iface.set("mtu", 1400)?;
        iface.commit().await?;
        assert_eq!(iface.get("mtu"), Some(Value::Int(1400)), "{ifname}");
        assert_eq!(iface.state(), ObjectState::System, "{ifname}");

        iface.remove();
        iface.commit().await?;
        assert_eq!(iface.state(), ObjectState::Invalid, "{ifname}");
        assert_eq!(
            iface.transition(),
            Some((ObjectState::Remove, ObjectState::Invalid)),
            "{ifname}"
        );
        assert!(kernel.link(SimKernel::ROOT, &ifname).is_none());
    }

    ndb.close().await
}

#[tokio::test]
async fn test_remove_cascades_routes() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let iface = ndb.interfaces().create(dummy("dummy3")).await?;
    iface.set("state", "up")?;
    iface.commit().await?;
    let route = ndb
        .routes()
        .create(
            Spec::new()
                .with("dst", "10.9.0.0/16")
                .with("oif", iface.get_int("index").unwrap_or_default()),
        )
        .await?;
    route.commit().await?;
    assert!(ndb.routes().exists("10.9.0.0/16").await?);

    iface.remove();
    iface.commit().await?;
    assert!(!ndb.interfaces().exists("dummy3").await?);
    assert!(!ndb.routes().exists("10.9.0.0/16").await?);

    iface.rollback(None).await?;
    assert!(ndb.interfaces().exists("dummy3").await?);
    assert!(ndb.routes().exists("10.9.0.0/16").await?);
    assert!(
        kernel
            .routes(SimKernel::ROOT)
            .iter()
            .any(|r| r.get_str("dst") == Some("10.9.0.0"))
    );

    ndb.close().await
}
