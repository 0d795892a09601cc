//! Address and neighbour integration tests.

use ndb::lab::SimKernel;
use ndb::{Result, Spec};

use crate::common::{dummy, start};

#[tokio::test]
async fn test_add_ip() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let iface = ndb.interfaces().create(dummy("dummy0")).await?;
    iface.set("state", "up")?;
    iface.add_ip("10.0.0.1/24")?;
    iface.commit().await?;

    let index = iface.get_int("index");
    let addr = kernel
        .addresses(SimKernel::ROOT)
        .into_iter()
        .find(|a| a.get_str("address") == Some("10.0.0.1"))
        .expect("address should exist");
    assert_eq!(addr.get_int("prefixlen"), Some(24));
    assert_eq!(addr.get_int("index"), index);
    assert_eq!(addr.get_str("local"), Some("10.0.0.1"));

    assert!(ndb.addresses().exists("10.0.0.1/24").await?);
    assert_eq!(iface.ipaddr()?.count().await?, 1);

    // The kernel installs the prefix route.
    let prefix = kernel
        .routes(SimKernel::ROOT)
        .into_iter()
        .any(|r| r.get_str("dst") == Some("10.0.0.0") && r.get_int("oif") == index);
    assert!(prefix);

    ndb.close().await
}

#[tokio::test]
async fn test_add_ip_to_missing_interface_fails() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let addr = ndb
        .addresses()
        .create(Spec::new().with("address", "10.0.0.2/24").with("index", 99))
        .await?;
    let err = addr.commit().await.unwrap_err();
    assert_eq!(err.errno(), Some(libc::ENODEV));

    ndb.close().await
}

#[tokio::test]
async fn test_del_ip_and_rollback() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let eth0 = ndb.interfaces().get("eth0").await?;
    eth0.del_ip("192.168.122.10/24")?;
    eth0.commit().await?;

    assert!(
        !kernel
            .addresses(SimKernel::ROOT)
            .iter()
            .any(|a| a.get_str("address") == Some("192.168.122.10"))
    );
    // Losing the last address took the default route along.
    assert!(kernel.routes(SimKernel::ROOT).is_empty());
    assert!(!ndb.addresses().exists("192.168.122.10/24").await?);

    eth0.rollback(None).await?;
    assert!(
        kernel
            .addresses(SimKernel::ROOT)
            .iter()
            .any(|a| a.get_str("address") == Some("192.168.122.10"))
    );
    assert!(
        kernel
            .routes(SimKernel::ROOT)
            .iter()
            .any(|r| r.get_str("gateway") == Some("192.168.122.1")),
        "default route should be restored"
    );

    ndb.close().await
}

#[tokio::test]
async fn test_del_ip_without_match_fails() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let eth0 = ndb.interfaces().get("eth0").await?;
    eth0.del_ip("10.99.0.1/24")?;
    let err = eth0.commit().await.unwrap_err();
    assert!(err.is_not_found(), "unexpected {err}");

    ndb.close().await
}

#[tokio::test]
async fn test_add_neighbour() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let eth0 = ndb.interfaces().get("eth0").await?;
    eth0.add_neighbour(
        Spec::new()
            .with("dst", "192.168.122.2")
            .with("lladdr", "52:54:00:AA:BB:CC"),
    )?;
    eth0.commit().await?;

    let neigh = kernel
        .neighbours(SimKernel::ROOT)
        .into_iter()
        .find(|n| n.get_str("dst") == Some("192.168.122.2"))
        .expect("neighbour should exist");
    assert_eq!(neigh.get_str("lladdr"), Some("52:54:00:aa:bb:cc"));
    assert_eq!(neigh.get_int("ifindex"), Some(2));
    assert_eq!(eth0.neighbours()?.count().await?, 1);

    eth0.del_neighbour(Spec::new().with("dst", "192.168.122.2"))?;
    eth0.commit().await?;
    assert!(kernel.neighbours(SimKernel::ROOT).is_empty());

    ndb.close().await
}

#[tokio::test]
async fn test_removed_interface_takes_addresses() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;
    let initial = ndb.addresses().count().await?;

    let iface = ndb.interfaces().create(dummy("dummy0")).await?;
    iface.commit().await?;
    iface.set("state", "up")?;
    iface.commit().await?;
    assert!(iface.is_up());

    iface.add_ip("10.0.0.1/24")?;
    iface.commit().await?;
    assert!(ndb.addresses().exists("10.0.0.1/24").await?);
    assert_eq!(ndb.addresses().count().await?, initial + 1);

    iface.remove();
    iface.commit().await?;
    assert!(!ndb.interfaces().exists("dummy0").await?);
    assert!(!ndb.addresses().exists("10.0.0.1/24").await?);
    assert_eq!(ndb.addresses().count().await?, initial);
    assert!(
        !kernel
            .addresses(SimKernel::ROOT)
            .iter()
            .any(|a| a.get_str("address") == Some("10.0.0.1"))
    );

    ndb.close().await
}
