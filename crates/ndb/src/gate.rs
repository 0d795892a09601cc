//! Read and write gates.
//!
//! A gate is an open/closed flag callers can wait on. The read gate is
//! closed while a source restarts so queries do not see a half-loaded
//! target; the write gate is closed by [`Ndb::readonly`](crate::Ndb::readonly).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// An open/closed flag.
#[derive(Debug, Clone)]
pub struct Gate {
    name: &'static str,
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    /// Create a gate in the given initial state.
    pub fn new(name: &'static str, open: bool) -> Self {
        let (tx, _) = watch::channel(open);
        Self {
            name,
            tx: Arc::new(tx),
        }
    }

    /// Open the gate, waking all waiters.
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    /// Close the gate.
    pub fn close(&self) {
        self.tx.send_replace(false);
    }

    /// Check whether the gate is open.
    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open, at most `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.tx.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|open| *open)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout(format!("{} gate closed", self.name))),
        }
    }
}

/// The pair of gates shared by the engine and the API side.
#[derive(Debug, Clone)]
pub struct Gates {
    pub read: Gate,
    pub write: Gate,
}

impl Default for Gates {
    fn default() -> Self {
        Self {
            read: Gate::new("read", true),
            write: Gate::new("write", true),
        }
    }
}

/// Keeps the database read-only while alive.
///
/// Returned by [`Ndb::readonly`](crate::Ndb::readonly); dropping it reopens
/// the write gate.
#[derive(Debug)]
#[must_use = "the database is writable again as soon as the guard is dropped"]
pub struct ReadOnlyGuard {
    gate: Gate,
}

impl ReadOnlyGuard {
    pub(crate) fn new(gate: Gate) -> Self {
        gate.close();
        Self { gate }
    }
}

impl Drop for ReadOnlyGuard {
    fn drop(&mut self) {
        self.gate.open();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_open() {
        let gate = Gate::new("read", true);
        gate.wait(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let gate = Gate::new("read", false);
        let err = gate.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_open() {
        let gate = Gate::new("read", false);
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        gate.open();
        waiter.await.unwrap().unwrap();
    }

    #[test]
    fn test_readonly_guard() {
        let gates = Gates::default();
        {
            let _guard = ReadOnlyGuard::new(gates.write.clone());
            assert!(!gates.write.is_open());
        }
        assert!(gates.write.is_open());
    }
}
