//! Multi-object transactions.
//!
//! A [`Transaction`] commits its members in order. When one fails, the
//! members committed before it are rolled back, newest first; the failing
//! object rolls itself back as part of its own commit.
//!
//! External checks ([`CheckProcess`], [`PingAddress`]) take part like any
//! other member: a failing check rolls back everything committed before it.
//!
//! ```ignore
//! let mut tx = ndb.begin();
//! tx.push(ndb.interfaces().create(Spec::new().with("ifname", "br0").with("kind", "bridge")).await?);
//! tx.push(PingAddress::new("10.0.0.1"));
//! tx.commit().await?;
//! ```

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::object::RtnlObject;

/// A member of a transaction.
#[async_trait]
pub trait Commit: Send + Sync {
    /// Apply the member.
    async fn commit(&self) -> Result<()>;

    /// Undo a successful [`commit`](Commit::commit).
    async fn rollback(&self) -> Result<()>;

    /// Whether committing would change anything. Members that had nothing
    /// to do are not rolled back.
    fn is_pending(&self) -> bool {
        true
    }

    /// Short description for logs.
    fn describe(&self) -> String;
}

#[async_trait]
impl Commit for RtnlObject {
    async fn commit(&self) -> Result<()> {
        RtnlObject::commit(self).await.map(|_| ())
    }

    async fn rollback(&self) -> Result<()> {
        RtnlObject::rollback(self, None).await.map(|_| ())
    }

    fn is_pending(&self) -> bool {
        !self.is_clean()
    }

    fn describe(&self) -> String {
        format!("{} {:?}", self.table(), self.key())
    }
}

/// An ordered batch of changes committed as a unit.
pub struct Transaction {
    queue: Vec<Box<dyn Commit>>,
    done: watch::Sender<bool>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members: Vec<String> = self.queue.iter().map(|m| m.describe()).collect();
        f.debug_struct("Transaction")
            .field("members", &members)
            .field("done", &self.done())
            .finish()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        debug!("begin transaction");
        Self {
            queue: Vec::new(),
            done: watch::Sender::new(false),
        }
    }

    /// Queue a member at the end.
    pub fn push(&mut self, member: impl Commit + 'static) -> &mut Self {
        self.append(Box::new(member))
    }

    /// Queue a boxed member at the end.
    pub fn append(&mut self, member: Box<dyn Commit>) -> &mut Self {
        debug!(member = %member.describe(), "queue");
        self.queue.push(member);
        self
    }

    /// Queue a member at `index`.
    pub fn insert(&mut self, index: usize, member: Box<dyn Commit>) -> Result<&mut Self> {
        if index > self.queue.len() {
            return Err(Error::invalid_value(
                "index",
                format!("{index} past the end ({})", self.queue.len()),
            ));
        }
        debug!(index, member = %member.describe(), "insert");
        self.queue.insert(index, member);
        Ok(self)
    }

    /// Remove the member at `index`, or the last one.
    pub fn pop(&mut self, index: Option<usize>) -> Option<Box<dyn Commit>> {
        let index = index.unwrap_or(self.queue.len().checked_sub(1)?);
        if index >= self.queue.len() {
            return None;
        }
        debug!(index, "pop");
        Some(self.queue.remove(index))
    }

    /// Drop every queued member.
    pub fn cancel(&mut self) {
        debug!("cancel transaction");
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Commit every member in order.
    ///
    /// On failure, members committed so far are rolled back in reverse and
    /// the original error is returned; rollback failures are attached as
    /// [`Error::Rollback`].
    pub async fn commit(&self) -> Result<()> {
        debug!(members = self.queue.len(), "commit");
        let result = self.commit_members().await;
        self.done.send_replace(true);
        result
    }

    async fn commit_members(&self) -> Result<()> {
        let mut committed: Vec<&dyn Commit> = Vec::new();
        for member in &self.queue {
            let pending = member.is_pending();
            match member.commit().await {
                Ok(()) => {
                    if pending {
                        committed.push(member.as_ref());
                    }
                }
                Err(e) => {
                    warn!(member = %member.describe(), error = %e, "transaction failed, rolling back");
                    let mut errors = Vec::new();
                    for done in committed.into_iter().rev() {
                        if let Err(r) = done.rollback().await {
                            warn!(member = %done.describe(), error = %r, "rollback failed");
                            errors.push(r);
                        }
                    }
                    return Err(chain_rollback(e, errors));
                }
            }
        }
        Ok(())
    }

    /// Wait until [`commit`](Self::commit) has finished.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Check whether [`commit`](Self::commit) has finished.
    pub fn done(&self) -> bool {
        *self.done.borrow()
    }
}

/// Attach rollback failures to the error that caused the rollback.
fn chain_rollback(error: Error, mut errors: Vec<Error>) -> Error {
    if errors.is_empty() {
        return error;
    }
    match error {
        Error::Rollback { source, rollback } => {
            let mut all = rollback;
            all.append(&mut errors);
            Error::Rollback {
                source,
                rollback: all,
            }
        }
        error => Error::Rollback {
            source: Box::new(error),
            rollback: errors,
        },
    }
}

// ============================================================================
// External checks
// ============================================================================

/// Run a command; a non-zero exit fails the transaction.
///
/// The command line is split on whitespace; there is no shell quoting.
#[derive(Debug, Clone)]
pub struct CheckProcess {
    command: String,
    timeout: Option<Duration>,
}

impl CheckProcess {
    pub fn new(command: impl Into<String>) -> Result<Self> {
        let command = command.into();
        if command.split_whitespace().next().is_none() {
            return Err(Error::invalid_value("command", "must not be empty"));
        }
        Ok(Self {
            command,
            timeout: None,
        })
    }

    /// Kill the command and fail if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command once.
    pub async fn run(&self) -> Result<()> {
        let mut args = self.command.split_whitespace();
        let program = args
            .next()
            .ok_or_else(|| Error::invalid_value("command", "must not be empty"))?;
        debug!(command = %self.command, "process check");
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| {
                    debug!(command = %self.command, "process timeout expired");
                    Error::CheckFailed(format!("{}: timed out after {timeout:?}", self.command))
                })??,
            None => child.wait_with_output().await?,
        };
        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "process output"
        );
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::CheckFailed(format!("{}: {}", self.command, output.status)))
        }
    }
}

#[async_trait]
impl Commit for CheckProcess {
    async fn commit(&self) -> Result<()> {
        self.run().await
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("check {:?}", self.command)
    }
}

/// Check that an address answers one ping.
#[derive(Debug, Clone)]
pub struct PingAddress {
    check: CheckProcess,
}

impl PingAddress {
    /// Ping with a one second deadline.
    pub fn new(address: impl fmt::Display) -> Self {
        Self::with_timeout(address, 1)
    }

    pub fn with_timeout(address: impl fmt::Display, seconds: u32) -> Self {
        Self {
            check: CheckProcess {
                command: format!("ping -c 1 -W {seconds} {address}"),
                timeout: None,
            },
        }
    }

    pub fn command(&self) -> &str {
        self.check.command()
    }
}

#[async_trait]
impl Commit for PingAddress {
    async fn commit(&self) -> Result<()> {
        self.check.run().await
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        self.check.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records commits and rollbacks into a shared journal.
    struct Step {
        name: &'static str,
        fail: bool,
        fail_rollback: bool,
        journal: Arc<Mutex<Vec<String>>>,
    }

    impl Step {
        fn new(name: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                fail: false,
                fail_rollback: false,
                journal: journal.clone(),
            }
        }
    }

    #[async_trait]
    impl Commit for Step {
        async fn commit(&self) -> Result<()> {
            self.journal.lock().unwrap().push(format!("commit {}", self.name));
            if self.fail {
                return Err(Error::CheckFailed(self.name.into()));
            }
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            self.journal.lock().unwrap().push(format!("rollback {}", self.name));
            if self.fail_rollback {
                return Err(Error::InvalidState(self.name.into()));
            }
            Ok(())
        }

        fn describe(&self) -> String {
            self.name.into()
        }
    }

    #[tokio::test]
    async fn test_commit_in_order() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut tx = Transaction::new();
        tx.push(Step::new("a", &journal)).push(Step::new("b", &journal));
        assert!(!tx.done());
        tx.commit().await.unwrap();
        assert!(tx.done());
        tx.wait().await;
        assert_eq!(*journal.lock().unwrap(), vec!["commit a", "commit b"]);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_in_reverse() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut tx = Transaction::new();
        let mut bad = Step::new("c", &journal);
        bad.fail = true;
        tx.push(Step::new("a", &journal))
            .push(Step::new("b", &journal))
            .push(bad)
            .push(Step::new("d", &journal));

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, Error::CheckFailed(ref name) if name == "c"));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["commit a", "commit b", "commit c", "rollback b", "rollback a"]
        );
        assert!(tx.done());
    }

    #[tokio::test]
    async fn test_rollback_failure_is_chained() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut tx = Transaction::new();
        let mut fragile = Step::new("a", &journal);
        fragile.fail_rollback = true;
        let mut bad = Step::new("b", &journal);
        bad.fail = true;
        tx.push(fragile).push(bad);

        match tx.commit().await.unwrap_err() {
            Error::Rollback { source, rollback } => {
                assert!(matches!(*source, Error::CheckFailed(_)));
                assert_eq!(rollback.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_queue_editing() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut tx = Transaction::new();
        tx.push(Step::new("a", &journal));
        tx.insert(0, Box::new(Step::new("b", &journal))).unwrap();
        assert!(tx.insert(5, Box::new(Step::new("c", &journal))).is_err());
        assert_eq!(tx.len(), 2);
        assert_eq!(tx.pop(Some(0)).unwrap().describe(), "b");
        assert_eq!(tx.pop(None).unwrap().describe(), "a");
        assert!(tx.pop(None).is_none());
        tx.push(Step::new("a", &journal));
        tx.cancel();
        assert!(tx.is_empty());
    }

    #[test]
    fn test_ping_command() {
        let ping = PingAddress::new("10.0.0.1");
        assert_eq!(ping.command(), "ping -c 1 -W 1 10.0.0.1");
        assert!(CheckProcess::new("   ").is_err());
    }

    #[tokio::test]
    async fn test_check_process_exit_status() {
        CheckProcess::new("true").unwrap().run().await.unwrap();
        let err = CheckProcess::new("false").unwrap().run().await.unwrap_err();
        assert!(matches!(err, Error::CheckFailed(_)));
        let err = CheckProcess::new("sleep 5")
            .unwrap()
            .timeout(Duration::from_millis(50))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CheckFailed(_)));
    }
}
