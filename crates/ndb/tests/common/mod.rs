//! Common test utilities for integration tests.
//!
//! Provides a fast database configuration, a builder bound to a
//! [`SimKernel`] and polling helpers for asynchronous effects.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ndb::lab::SimKernel;
use ndb::{ApplyConfig, Ndb, NdbConfig, Result, Spec};

/// Configuration with short confirmation waits.
pub fn config() -> NdbConfig {
    NdbConfig {
        start_timeout: Duration::from_secs(5),
        gate_timeout: Duration::from_secs(5),
        apply: ApplyConfig {
            attempts: 5,
            resync_attempts: 1,
            wait_step: Duration::from_millis(20),
            wait_max: Duration::from_millis(100),
            queue_divisor: 10,
        },
        ..NdbConfig::default()
    }
}

/// Start a database on `kernel` with [`config`].
pub async fn start(kernel: &SimKernel) -> Result<Ndb> {
    start_with(kernel, config()).await
}

/// Start a database on `kernel`.
pub async fn start_with(kernel: &SimKernel, config: NdbConfig) -> Result<Ndb> {
    init_tracing();
    Ndb::builder()
        .config(config)
        .connector(Arc::new(kernel.clone()))
        .build()
        .await
}

/// A dummy interface spec.
pub fn dummy(ifname: &str) -> Spec {
    Spec::new().with("ifname", ifname).with("kind", "dummy")
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
