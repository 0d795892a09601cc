//! Authorization, read-only mode, handlers and reports.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ndb::lab::SimKernel;
use ndb::report::Format;
use ndb::{
    Error, EventKind, Filter, NdbConfig, Outcome, Permission, Result, StaticAuthManager, TableId,
    Value,
};

use crate::common::{config, dummy, start, start_with};

#[tokio::test]
async fn test_auth_proxy() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let reader = ndb.auth_proxy(Arc::new(
        StaticAuthManager::new("reader")
            .grant(Permission::Read)
            .grant(Permission::List),
    ));
    let eth0 = reader.interfaces().get("eth0").await?;
    assert_eq!(reader.interfaces().count().await?, ndb.interfaces().count().await?);

    let err = reader.interfaces().create(dummy("dummy0")).await.unwrap_err();
    assert!(err.is_permission_denied(), "unexpected {err}");

    eth0.set("mtu", 1400)?;
    let err = eth0.commit().await.unwrap_err();
    assert!(err.is_permission_denied(), "unexpected {err}");
    assert_eq!(
        kernel.link(SimKernel::ROOT, "eth0").and_then(|l| l.get_int("mtu")),
        Some(1500)
    );

    // Objects are cached per proxy.
    let own = ndb.interfaces().get("eth0").await?;
    assert!(!own.ptr_eq(&eth0));

    assert_eq!(
        reader.fetch(TableId::Interfaces, Filter::new()).await?.len(),
        ndb.interfaces().count().await?
    );

    let nobody = ndb.auth_proxy(Arc::new(StaticAuthManager::new("nobody")));
    assert!(nobody.interfaces().summary().await.is_err());
    let err = nobody
        .fetch(TableId::Addresses, Filter::new())
        .await
        .unwrap_err();
    assert!(err.is_permission_denied(), "unexpected {err}");
    let err = nobody.export().await.unwrap_err();
    assert!(err.is_permission_denied(), "unexpected {err}");
    assert!(ndb.export().await?.contains("eth0"));

    ndb.close().await
}

#[tokio::test]
async fn test_readonly() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start_with(
        &kernel,
        NdbConfig {
            gate_timeout: Duration::from_millis(200),
            ..config()
        },
    )
    .await?;

    let iface = ndb.interfaces().create(dummy("dummy0")).await?;
    {
        let _guard = ndb.readonly();
        let err = iface.commit().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "unexpected {err}");
        // Reads go on.
        assert!(ndb.interfaces().exists("eth0").await?);
    }
    iface.commit().await?;
    assert!(kernel.link(SimKernel::ROOT, "dummy0").is_some());

    ndb.close().await
}

#[tokio::test]
async fn test_event_handler() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let id = ndb
        .register_handler(
            EventKind::Link,
            Box::new(move |_store, _target, event| {
                if event.get_str("ifname") == Some("dummy0") {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Outcome::Continue)
            }),
        )
        .await?;

    let iface = ndb.interfaces().create(dummy("dummy0")).await?;
    iface.commit().await?;
    assert!(seen.load(Ordering::SeqCst) >= 1);

    ndb.unregister_handler(EventKind::Link, id).await?;
    let before = seen.load(Ordering::SeqCst);
    iface.set("mtu", 1400)?;
    iface.commit().await?;
    assert_eq!(seen.load(Ordering::SeqCst), before);

    ndb.close().await
}

#[tokio::test]
async fn test_reports() -> Result<()> {
    let kernel = SimKernel::new();
    let ndb = start(&kernel).await?;

    let summary = ndb.interfaces().summary().await?;
    assert!(summary.names().iter().any(|n| n == "ifname"));
    let eth0 = summary
        .clone()
        .select_records(&[("ifname", Value::from("eth0"))]);
    assert_eq!(eth0.count(), 1);

    let json = eth0.format(Format::Json)?;
    assert!(json.contains("52:54:00:12:34:56"));
    let csv = ndb
        .addresses()
        .summary()
        .await?
        .select_fields(&["ifname", "address", "prefixlen"])
        .format(Format::Csv)?;
    assert!(csv.starts_with("ifname,address,prefixlen\n"));
    assert!(csv.contains("eth0,192.168.122.10,24"));

    let stats = ndb.stats().await?;
    assert_eq!(stats.rows.get("interfaces"), Some(&3));

    let export = ndb.export().await?;
    assert!(export.contains("192.168.122.10"));

    ndb.close().await
}
