//! Event sources.
//!
//! A [`Source`] owns one [`Transport`] to one kernel (the local system, a
//! network namespace, a remote host). It flushes its target, announces the
//! zero interface, dumps every family, waits until the engine has loaded the
//! dump and then forwards broadcast events until it is closed. A persistent
//! source reconnects after a backoff when the transport fails.
//!
//! # Example
//!
//! ```ignore
//! use ndb::source::{SourceKind, SourceSpec};
//!
//! let spec = SourceSpec::new("ns1").kind(SourceKind::Netns).netns("ns1");
//! let source = ndb.sources().add(spec).await?;
//! assert_eq!(source.state(), SourceState::Running);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::secs;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, IFF_UP, RTM_NEWLINK};
use crate::queue::{Control, EventQueue, Message};
use crate::report::RecordSet;
use crate::transport::{Connector, Request, Transport, Verb};
use crate::value::{Attrs, Value};

/// Interface name of the placeholder interface with index 0.
pub const ZERO_IFNAME: &str = "ndb/zero";

/// How many times an API call waits for a reconnecting transport.
const API_RETRIES: u32 = 30;

/// Kind of system a source talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Local,
    Netns,
    Remote,
}

/// Source life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Init,
    Connecting,
    Loading,
    Running,
    Restart,
    Stopped,
    Failed,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Connecting => "connecting",
            Self::Loading => "loading",
            Self::Running => "running",
            Self::Restart => "restart",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn default_true() -> bool {
    true
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_errors() -> i32 {
    3
}

/// Source specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Target name; unique among sources.
    pub target: String,
    #[serde(default)]
    pub kind: SourceKind,
    /// Reconnect after failures.
    #[serde(default = "default_true")]
    pub persistent: bool,
    /// Pause between reconnects.
    #[serde(default = "default_backoff", with = "secs")]
    pub backoff: Duration,
    /// Consecutive failures tolerated before giving up; negative means no limit.
    #[serde(default = "default_max_errors")]
    pub max_errors: i32,
    /// Namespace name or path for namespace sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netns: Option<String>,
    /// Host name for remote sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Connector overriding the database default.
    #[serde(skip)]
    pub connector: Option<Arc<dyn Connector>>,
}

impl SourceSpec {
    /// A local, persistent source.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kind: SourceKind::Local,
            persistent: true,
            backoff: default_backoff(),
            max_errors: default_max_errors(),
            netns: None,
            hostname: None,
            connector: None,
        }
    }

    /// Parse a JSON spec.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_errors(mut self, max_errors: i32) -> Self {
        self.max_errors = max_errors;
        self
    }

    pub fn netns(mut self, netns: impl Into<String>) -> Self {
        self.netns = Some(netns.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Infer the kind from `netns` / `hostname` when left local.
    fn with_defaults(mut self) -> Self {
        if self.kind == SourceKind::Local {
            if self.hostname.is_some() {
                self.kind = SourceKind::Remote;
            } else if self.netns.is_some() {
                self.kind = SourceKind::Netns;
            }
        }
        self
    }
}

/// The placeholder interface every target carries, so rows referring to
/// interface 0 have a parent.
pub fn zero_interface(target: &str) -> Event {
    Event::new(RTM_NEWLINK)
        .target(target)
        .field("family", 0)
        .field("index", 0)
        .field("flags", IFF_UP)
        .attr("ifname", ZERO_IFNAME)
        .attr("address", "00:00:00:00:00:00")
}

struct SourceInner {
    spec: SourceSpec,
    queue: EventQueue,
    connector: Arc<dyn Connector>,
    state: watch::Sender<SourceState>,
    shutdown: watch::Sender<bool>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    loaded: Arc<Notify>,
    errors: AtomicU32,
    start_timeout: Duration,
    restart_lock: tokio::sync::Mutex<()>,
}

/// A running source. Cheap to clone.
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("target", &self.inner.spec.target)
            .field("kind", &self.inner.spec.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl SourceInner {
    fn target(&self) -> &str {
        &self.spec.target
    }

    fn set_state(&self, state: SourceState) {
        self.state.send_replace(state);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Put a message, giving up when the source is closed.
    async fn put(&self, msg: Message) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => Err(Error::Shutdown),
            result = self.queue.put(msg) => result,
        }
    }

    /// Sleep, waking early on shutdown. Returns false on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn tag(&self, events: &mut [Event]) {
        for event in events {
            event.header.target = self.spec.target.clone();
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.is_shutdown() {
                break;
            }
            match self.session().await {
                Ok(()) => break,
                Err(_) if self.is_shutdown() => break,
                Err(e) => {
                    let errors = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(error = %e, errors, "source failed");
                    if let Some(transport) = self.transport_take() {
                        transport.close().await;
                    }
                    let _ = self
                        .put(Message::Control(Control::MarkFailed(self.spec.target.clone())))
                        .await;
                    let may_restart =
                        self.spec.max_errors < 0 || errors <= self.spec.max_errors as u32;
                    if self.spec.persistent && may_restart {
                        self.set_state(SourceState::Restart);
                        if self.pause(self.spec.backoff).await {
                            continue;
                        }
                        break;
                    }
                    self.set_state(SourceState::Failed);
                    return;
                }
            }
        }
        self.set_state(SourceState::Stopped);
        debug!("source stopped");
    }

    fn transport_take(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().ok().and_then(|mut t| t.take())
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().ok().and_then(|t| t.clone())
    }

    async fn session(&self) -> Result<()> {
        self.set_state(SourceState::Connecting);
        let transport = self.connector.connect(&self.spec).await?;
        if let Ok(mut slot) = self.transport.lock() {
            *slot = Some(transport.clone());
        }
        self.set_state(SourceState::Loading);
        transport.bind().await?;

        let target = self.spec.target.clone();
        self.put(Message::Control(Control::Flush(target.clone())))
            .await?;
        let mut events = vec![zero_interface(&target)];
        for kind in EventKind::DUMP_ORDER {
            if kind == EventKind::NetNs && self.spec.kind != SourceKind::Local {
                continue;
            }
            events.extend(transport.request(Request::dump(kind)).await?);
        }
        self.tag(&mut events);
        debug!(count = events.len(), "initial dump");
        self.put(Message::Events {
            source: Some(target.clone()),
            events,
        })
        .await?;
        self.sync().await?;
        self.errors.store(0, Ordering::SeqCst);
        self.set_state(SourceState::Running);
        info!("source running");

        let mut shutdown = self.shutdown.subscribe();
        loop {
            let mut batch = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => return Ok(()),
                batch = transport.recv() => batch?,
            };
            if let Some(errno) = batch.iter().find_map(|e| e.header.error) {
                return Err(Error::SourceFailed {
                    target,
                    message: std::io::Error::from_raw_os_error(errno).to_string(),
                });
            }
            self.tag(&mut batch);
            self.put(Message::Events {
                source: Some(target.clone()),
                events: batch,
            })
            .await?;
        }
    }

    /// Put a sync barrier and wait until the engine reaches it.
    async fn sync(&self) -> Result<()> {
        let notified = self.loaded.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.put(Message::Control(Control::Sync {
            target: self.spec.target.clone(),
            notify: self.loaded.clone(),
        }))
        .await?;
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => Err(Error::Shutdown),
            _ = notified => Ok(()),
        }
    }
}

impl Source {
    pub(crate) fn new(
        spec: SourceSpec,
        queue: EventQueue,
        connector: Arc<dyn Connector>,
        start_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SourceState::Init);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SourceInner {
                spec,
                queue,
                connector,
                state,
                shutdown,
                transport: Mutex::new(None),
                task: Mutex::new(None),
                loaded: Arc::new(Notify::new()),
                errors: AtomicU32::new(0),
                start_timeout,
                restart_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Target name.
    pub fn target(&self) -> &str {
        self.inner.target()
    }

    /// Source specification.
    pub fn spec(&self) -> &SourceSpec {
        &self.inner.spec
    }

    /// Current state.
    pub fn state(&self) -> SourceState {
        *self.inner.state.borrow()
    }

    /// Failures since the last successful load.
    pub fn errors(&self) -> u32 {
        self.inner.errors.load(Ordering::SeqCst)
    }

    /// Wait until the source reaches `state`.
    pub async fn wait_state(&self, state: SourceState, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| *s == state)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout(format!(
                "source {} did not reach {state}",
                self.target()
            ))),
        }
    }

    /// Start the receiver task and wait until the initial dump is loaded.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        self.inner.shutdown.send_replace(false);
        self.inner.set_state(SourceState::Init);
        let span = info_span!("source", target = %self.target());
        let task = tokio::spawn(self.inner.clone().run().instrument(span));
        if let Ok(mut slot) = self.inner.task.lock() {
            *slot = Some(task);
        }

        let settled = state.wait_for(|s| {
            matches!(
                s,
                SourceState::Running | SourceState::Failed | SourceState::Stopped
            )
        });
        let state = match tokio::time::timeout(self.inner.start_timeout, settled).await {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => return Err(Error::Shutdown),
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "source {} did not start",
                    self.target()
                )));
            }
        };
        match state {
            SourceState::Running => Ok(()),
            other => Err(Error::SourceFailed {
                target: self.target().to_string(),
                message: format!("source {other}"),
            }),
        }
    }

    /// Stop the receiver task and close the transport. Idempotent.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        if let Some(transport) = self.inner.transport_take() {
            transport.close().await;
        }
        let task = self.inner.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(target = %self.target(), error = %e, "source task");
            }
        }
        self.inner.set_state(SourceState::Stopped);
    }

    /// Close and start again, keeping readers off the store meanwhile.
    pub async fn restart(&self, reason: &str) -> Result<()> {
        let _guard = self.inner.restart_lock.lock().await;
        info!(target = %self.target(), reason, "restarting source");
        let target = self.target().to_string();
        self.inner
            .queue
            .put_control(Control::ReadLock(target.clone()))
            .await?;
        self.close().await;
        let result = self.start().await;
        self.inner
            .queue
            .put_control(Control::ReadUnlock(target))
            .await?;
        result
    }

    /// Send a request to the kernel.
    ///
    /// The response messages are queued for the engine as well. While the
    /// transport is reconnecting the call waits and retries.
    pub async fn api(&self, kind: EventKind, verb: Verb, fields: Attrs) -> Result<Vec<Event>> {
        let request = Request::new(kind, verb, fields);
        let mut retries = 0;
        loop {
            let result = match self.inner.transport() {
                Some(transport) => transport.request(request.clone()).await,
                None => Err(Error::Transport("not connected".into())),
            };
            match result {
                Ok(mut events) => {
                    self.inner.tag(&mut events);
                    if !events.is_empty() {
                        self.inner
                            .queue
                            .put_events(Some(self.target()), events.clone())
                            .await?;
                    }
                    return Ok(events);
                }
                Err(Error::Transport(message)) if retries < API_RETRIES => {
                    retries += 1;
                    debug!(target = %self.target(), %kind, %verb, message, "api retry");
                    if self.inner.is_shutdown() {
                        return Err(Error::Shutdown);
                    }
                    self.inner.pause(self.inner.spec.backoff.min(Duration::from_secs(1))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Dump every family again; the results are queued for the engine.
    pub async fn dump_all(&self) -> Result<()> {
        for kind in EventKind::DUMP_ORDER {
            if kind == EventKind::NetNs && self.spec().kind != SourceKind::Local {
                continue;
            }
            self.api(kind, Verb::Dump, Attrs::new()).await?;
        }
        Ok(())
    }

    /// Drop the target's rows and load them again from a fresh dump.
    ///
    /// Returns once the engine has loaded the dump, or after `timeout`.
    pub async fn resync(&self, timeout: Duration) -> Result<()> {
        let target = self.target().to_string();
        debug!(target, "resync");
        let queue = &self.inner.queue;
        queue.put_control(Control::Flush(target.clone())).await?;
        queue
            .put_events(Some(&target), vec![zero_interface(&target)])
            .await?;
        self.dump_all().await?;

        let notify = Arc::new(Notify::new());
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        queue
            .put_control(Control::Sync {
                target,
                notify: notify.clone(),
            })
            .await?;
        let _ = tokio::time::timeout(timeout, notified).await;
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

struct SourcesInner {
    map: Mutex<BTreeMap<String, Source>>,
    queue: EventQueue,
    connector: Option<Arc<dyn Connector>>,
    start_timeout: Duration,
}

/// Registry of sources by target. Cheap to clone.
#[derive(Clone)]
pub struct Sources {
    inner: Arc<SourcesInner>,
}

impl fmt::Debug for Sources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sources").field("targets", &self.targets()).finish()
    }
}

impl Sources {
    pub(crate) fn new(
        queue: EventQueue,
        connector: Option<Arc<dyn Connector>>,
        start_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SourcesInner {
                map: Mutex::new(BTreeMap::new()),
                queue,
                connector,
                start_timeout,
            }),
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Source>> {
        self.inner
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register and start a source, waiting for its initial load.
    pub async fn add(&self, spec: SourceSpec) -> Result<Source> {
        if self.inner.queue.is_closed() {
            return Err(Error::Shutdown);
        }
        let spec = spec.with_defaults();
        let connector = spec
            .connector
            .clone()
            .or_else(|| self.inner.connector.clone())
            .ok_or_else(|| Error::invalid_value("connector", format!("none for {}", spec.target)))?;
        let target = spec.target.clone();
        let source = Source::new(
            spec,
            self.inner.queue.clone(),
            connector,
            self.inner.start_timeout,
        );
        {
            let mut map = self.map();
            if map.contains_key(&target) {
                return Err(Error::ObjectExists(format!("source {target}")));
            }
            map.insert(target.clone(), source.clone());
        }
        if let Err(e) = source.start().await {
            self.map().remove(&target);
            source.close().await;
            return Err(e);
        }
        Ok(source)
    }

    /// Close a source and flush its rows.
    pub async fn remove(&self, target: &str) -> Result<()> {
        let source = self
            .map()
            .remove(target)
            .ok_or_else(|| Error::SourceNotFound(target.to_string()))?;
        source.close().await;
        self.inner
            .queue
            .put_control(Control::Flush(target.to_string()))
            .await
    }

    /// Look up a source.
    pub fn get(&self, target: &str) -> Result<Source> {
        self.map()
            .get(target)
            .cloned()
            .ok_or_else(|| Error::SourceNotFound(target.to_string()))
    }

    /// Check whether a source is registered.
    pub fn contains(&self, target: &str) -> bool {
        self.map().contains_key(target)
    }

    /// Registered targets.
    pub fn targets(&self) -> Vec<String> {
        self.map().keys().cloned().collect()
    }

    /// Registered sources.
    pub fn list(&self) -> Vec<Source> {
        self.map().values().cloned().collect()
    }

    /// One record per source: state, name, spec.
    pub fn summary(&self) -> RecordSet {
        let rows = self
            .list()
            .into_iter()
            .map(|s| {
                let spec = serde_json::to_string(s.spec()).unwrap_or_default();
                vec![
                    Value::from(s.state().to_string()),
                    Value::from(s.target()),
                    Value::from(spec),
                ]
            })
            .collect();
        RecordSet::new(vec!["state".into(), "name".into(), "spec".into()], rows)
    }

    /// Take every source out of the registry (shutdown).
    pub(crate) fn drain(&self) -> Vec<Source> {
        std::mem::take(&mut *self.map()).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, spec: &SourceSpec) -> Result<Arc<dyn Transport>> {
            Err(Error::Transport(format!("{} unreachable", spec.target)))
        }
    }

    #[test]
    fn test_spec_defaults() {
        let spec = SourceSpec::from_json(r#"{"target": "ns1", "netns": "ns1"}"#)
            .unwrap()
            .with_defaults();
        assert_eq!(spec.kind, SourceKind::Netns);
        assert!(spec.persistent);
        assert_eq!(spec.backoff, Duration::from_secs(1));
        assert_eq!(spec.max_errors, 3);

        let spec = SourceSpec::new("r1").hostname("r1.example").with_defaults();
        assert_eq!(spec.kind, SourceKind::Remote);
    }

    #[test]
    fn test_zero_interface() {
        let event = zero_interface("localhost");
        assert_eq!(event.get_int("index"), Some(0));
        assert_eq!(event.get_int("flags"), Some(IFF_UP));
        assert_eq!(event.header.target, "localhost");
    }

    #[tokio::test]
    async fn test_non_persistent_failure() {
        let (queue, mut rx) = EventQueue::new(16);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let sources = Sources::new(queue, Some(Arc::new(Unreachable)), Duration::from_secs(5));

        let err = sources
            .add(SourceSpec::new("localhost").persistent(false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceFailed { .. }));
        assert!(!sources.contains("localhost"));
    }

    #[tokio::test]
    async fn test_persistent_gives_up_after_max_errors() {
        let (queue, mut rx) = EventQueue::new(16);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let sources = Sources::new(queue, Some(Arc::new(Unreachable)), Duration::from_secs(5));

        let spec = SourceSpec::new("localhost")
            .backoff(Duration::from_millis(1))
            .max_errors(2);
        let err = sources.add(spec).await.unwrap_err();
        assert!(matches!(err, Error::SourceFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_connector() {
        let (queue, _rx) = EventQueue::new(4);
        let sources = Sources::new(queue, None, Duration::from_secs(1));
        let err = sources.add(SourceSpec::new("localhost")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
    }
}
