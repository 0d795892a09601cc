//! The single-writer engine.
//!
//! The engine task owns the [`Store`]. It drains the [`EventQueue`],
//! dispatches every event to the handlers registered for its family,
//! answers store [`Command`]s from the API side, and periodically collects
//! garbage (idle cached objects, orphaned snapshots, GC-marked routes).
//!
//! # Handler outcomes
//!
//! | Outcome | Effect |
//! |---|---|
//! | [`Outcome::Continue`] | nothing |
//! | [`Outcome::Reschedule`] | event retried with the next queue item, at most three times |
//! | [`Outcome::Invalidate`] | handler removed |
//! | [`Outcome::Shutdown`] | engine stops after the current item |
//! | [`Outcome::Fatal`] | engine stops immediately |
//!
//! Any error returned by a handler is logged and the event dropped for that
//! handler.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::config::NdbConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::gate::Gates;
use crate::handlers;
use crate::queue::{Control, EventQueue, EventReceiver, Message};
use crate::schema::TableId;
use crate::source::Sources;
use crate::store::{Filter, Row, SnapshotToken, Store, StoreStats, TFLAGS_FAILED, TxId};
use crate::view::Caches;

/// How often an event may be rescheduled before it is dropped.
pub const MAX_RESCHEDULE: u8 = 3;

/// What a handler asks the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Reschedule,
    Invalidate,
    Shutdown,
    Fatal,
}

/// An event handler: `(store, target, event) -> outcome`.
pub type Handler = Box<dyn FnMut(&mut Store, &str, &Event) -> Result<Outcome> + Send>;

/// Identifier of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

/// Ordered handler lists per event family.
#[derive(Default)]
pub struct HandlerRegistry {
    next: u64,
    handlers: BTreeMap<EventKind, Vec<(HandlerId, Handler)>>,
}

impl HandlerRegistry {
    /// Append a handler for a family.
    pub fn register(&mut self, kind: EventKind, handler: Handler) -> HandlerId {
        self.next += 1;
        let id = HandlerId(self.next);
        self.handlers.entry(kind).or_default().push((id, handler));
        id
    }

    /// Remove a handler.
    pub fn unregister(&mut self, kind: EventKind, id: HandlerId) -> bool {
        let Some(list) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != id);
        before != list.len()
    }

    /// Number of handlers registered for a family.
    pub fn count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<&EventKind, usize> =
            self.handlers.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("HandlerRegistry").field("handlers", &counts).finish()
    }
}

/// Reply channel of a command.
pub type Reply<T> = oneshot::Sender<T>;

/// Store requests executed on the engine task.
pub enum Command {
    Fetch {
        table: TableId,
        filter: Filter,
        reply: Reply<Vec<Row>>,
    },
    Count {
        table: TableId,
        filter: Filter,
        reply: Reply<usize>,
    },
    Snapshot {
        txid: TxId,
        owner: Weak<SnapshotToken>,
        table: TableId,
        filter: Filter,
        reply: Reply<Option<Row>>,
    },
    SnapshotMissing {
        txid: TxId,
        exclude: TableId,
        reply: Reply<Vec<Row>>,
    },
    SnapshotRows {
        txid: TxId,
        table: TableId,
        filter: Filter,
        reply: Reply<Vec<Row>>,
    },
    Release {
        txid: TxId,
    },
    Register {
        kind: EventKind,
        handler: Handler,
        reply: Reply<HandlerId>,
    },
    Unregister {
        kind: EventKind,
        id: HandlerId,
    },
    Export {
        reply: Reply<Result<String>>,
    },
    Stats {
        reply: Reply<StoreStats>,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch { table, filter, .. } => {
                f.debug_struct("Fetch").field("table", table).field("filter", filter).finish()
            }
            Self::Count { table, filter, .. } => {
                f.debug_struct("Count").field("table", table).field("filter", filter).finish()
            }
            Self::Snapshot { txid, table, .. } => {
                f.debug_struct("Snapshot").field("txid", txid).field("table", table).finish()
            }
            Self::SnapshotMissing { txid, .. } => {
                f.debug_struct("SnapshotMissing").field("txid", txid).finish()
            }
            Self::SnapshotRows { txid, table, .. } => f
                .debug_struct("SnapshotRows")
                .field("txid", txid)
                .field("table", table)
                .finish(),
            Self::Release { txid } => f.debug_struct("Release").field("txid", txid).finish(),
            Self::Register { kind, .. } => f.debug_struct("Register").field("kind", kind).finish(),
            Self::Unregister { kind, id } => f
                .debug_struct("Unregister")
                .field("kind", kind)
                .field("id", id)
                .finish(),
            Self::Export { .. } => f.write_str("Export"),
            Self::Stats { .. } => f.write_str("Stats"),
        }
    }
}

/// API-side handle for sending commands to the engine.
#[derive(Debug, Clone)]
pub(crate) struct EngineHandle {
    queue: EventQueue,
    gates: Gates,
    gate_timeout: Duration,
}

impl EngineHandle {
    pub(crate) fn new(queue: EventQueue, gates: Gates, gate_timeout: Duration) -> Self {
        Self {
            queue,
            gates,
            gate_timeout,
        }
    }

    /// Run a read command, waiting for the read gate first.
    pub(crate) async fn query<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        self.gates.read.wait(self.gate_timeout).await?;
        self.execute(build).await
    }

    /// Run a command.
    pub(crate) async fn execute<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.queue.put(Message::Request(build(tx))).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Send a command without waiting for a reply.
    pub(crate) async fn send(&self, command: Command) -> Result<()> {
        self.queue.put(Message::Request(command)).await
    }

    pub(crate) fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub(crate) fn gates(&self) -> &Gates {
        &self.gates
    }

    pub(crate) fn gate_timeout(&self) -> Duration {
        self.gate_timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
    Fatal,
}

/// The engine.
pub struct Engine {
    store: Store,
    registry: HandlerRegistry,
    rx: EventReceiver,
    queue: EventQueue,
    sources: Sources,
    caches: Caches,
    gates: Gates,
    config: Arc<NdbConfig>,
    reschedule: Vec<Event>,
}

impl Engine {
    /// Create an engine with the default handlers installed.
    pub(crate) fn new(
        rx: EventReceiver,
        queue: EventQueue,
        sources: Sources,
        caches: Caches,
        gates: Gates,
        config: Arc<NdbConfig>,
    ) -> Self {
        let mut registry = HandlerRegistry::default();
        handlers::install(&mut registry, config.auto_netns.then(|| sources.clone()));
        Self {
            store: Store::new(config.rtnl_log),
            registry,
            rx,
            queue,
            sources,
            caches,
            gates,
            config,
            reschedule: Vec::new(),
        }
    }

    /// Handler registry, for registering handlers before the engine runs.
    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Run until shutdown. Returns the store when it was kept for debugging.
    pub async fn run(mut self) -> Option<Store> {
        info!(capacity = self.config.queue_capacity, "engine started");
        let mut gc = tokio::time::interval(self.config.gc_interval.max(Duration::from_millis(10)));
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);
        gc.tick().await;

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    match self.dispatch(msg) {
                        Flow::Continue => {}
                        Flow::Stop => break,
                        Flow::Fatal => {
                            error!("fatal handler outcome, stopping engine");
                            break;
                        }
                    }
                }
                _ = gc.tick() => self.collect_garbage(),
            }
        }
        self.finish().await
    }

    fn dispatch(&mut self, msg: Message) -> Flow {
        match msg {
            Message::Events { source, events } => {
                let carried = std::mem::take(&mut self.reschedule);
                self.process(source.as_deref(), events.into_iter().chain(carried))
            }
            Message::Control(Control::Shutdown) => Flow::Stop,
            Message::Control(control) => {
                // Retries go first so a sync barrier covers them.
                let carried = std::mem::take(&mut self.reschedule);
                let flow = self.process(None, carried.into_iter());
                if flow == Flow::Continue {
                    self.control(control);
                }
                flow
            }
            Message::Request(command) => {
                self.execute(command);
                Flow::Continue
            }
        }
    }

    fn process(&mut self, source: Option<&str>, events: impl Iterator<Item = Event>) -> Flow {
        let mut flow = Flow::Continue;
        for event in events {
            match self.handle(source, event) {
                Flow::Continue => {}
                Flow::Stop => flow = Flow::Stop,
                Flow::Fatal => return Flow::Fatal,
            }
        }
        flow
    }

    fn handle(&mut self, source: Option<&str>, mut event: Event) -> Flow {
        let target = if event.header.target.is_empty() {
            source.unwrap_or(self.config.localhost.as_str()).to_string()
        } else {
            event.header.target.clone()
        };
        let handlers = event
            .kind()
            .and_then(|kind| self.registry.handlers.get_mut(&kind))
            .filter(|list| !list.is_empty());
        let Some(handlers) = handlers else {
            default_handler(&target, &event);
            return Flow::Continue;
        };

        let mut flow = Flow::Continue;
        let mut reschedule = false;
        let mut invalid = Vec::new();
        for (id, handler) in handlers.iter_mut() {
            match handler(&mut self.store, &target, &event) {
                Ok(Outcome::Continue) => {}
                Ok(Outcome::Reschedule) => reschedule = true,
                Ok(Outcome::Invalidate) => invalid.push(*id),
                Ok(Outcome::Shutdown) => flow = Flow::Stop,
                Ok(Outcome::Fatal) => return Flow::Fatal,
                Err(e) => error!(
                    target = %target,
                    msg_type = event.header.msg_type,
                    error = %e,
                    "handler failed"
                ),
            }
        }
        if !invalid.is_empty() {
            handlers.retain(|(id, _)| !invalid.contains(id));
            trace!(count = invalid.len(), "handlers invalidated");
        }
        if reschedule {
            if event.header.rcounter < MAX_RESCHEDULE {
                event.header.rcounter += 1;
                self.reschedule.push(event);
            } else {
                warn!(
                    target = %target,
                    msg_type = event.header.msg_type,
                    "event dropped after {MAX_RESCHEDULE} reschedules"
                );
            }
        }
        flow
    }

    fn control(&mut self, control: Control) {
        match control {
            Control::Sync { target, notify } => {
                trace!(target, "sync");
                notify.notify_one();
            }
            Control::Flush(target) => {
                self.store.flush(&target);
            }
            Control::MarkFailed(target) => {
                let count = self.store.mark_target(&target, TFLAGS_FAILED);
                warn!(target, count, "source failed, rows marked");
            }
            Control::ReadLock(target) => {
                debug!(target, "read lock");
                self.gates.read.close();
            }
            Control::ReadUnlock(target) => {
                debug!(target, "read unlock");
                self.gates.read.open();
            }
            Control::Shutdown => {}
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Fetch {
                table,
                filter,
                reply,
            } => {
                let _ = reply.send(self.store.fetch(table, &filter));
            }
            Command::Count {
                table,
                filter,
                reply,
            } => {
                let _ = reply.send(self.store.count(table, &filter));
            }
            Command::Snapshot {
                txid,
                owner,
                table,
                filter,
                reply,
            } => {
                let _ = reply.send(self.store.snapshot(txid, owner, table, &filter));
            }
            Command::SnapshotMissing {
                txid,
                exclude,
                reply,
            } => {
                let _ = reply.send(self.store.snapshot_missing(txid, exclude));
            }
            Command::SnapshotRows {
                txid,
                table,
                filter,
                reply,
            } => {
                let rows = self
                    .store
                    .snapshot_rows(txid, table)
                    .into_iter()
                    .filter(|r| filter.matches(r))
                    .collect();
                let _ = reply.send(rows);
            }
            Command::Release { txid } => {
                if self.store.release(txid) {
                    trace!(txid = txid.mark(), "snapshot released");
                }
            }
            Command::Register {
                kind,
                handler,
                reply,
            } => {
                let _ = reply.send(self.registry.register(kind, handler));
            }
            Command::Unregister { kind, id } => {
                self.registry.unregister(kind, id);
            }
            Command::Export { reply } => {
                let _ = reply.send(self.store.export());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.store.stats());
            }
        }
    }

    fn collect_garbage(&mut self) {
        let objects = self.caches.sweep(self.config.cache_expire);
        let snapshots = self.store.purge_snapshots();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let routes = self
            .store
            .collect_routes(now, self.config.route_gc_grace.as_secs() as i64);
        if objects + snapshots + routes > 0 {
            debug!(objects, snapshots, routes, "garbage collected");
        }
    }

    async fn finish(mut self) -> Option<Store> {
        self.queue.shutdown();
        for source in self.sources.drain() {
            source.close().await;
            if self.config.db_cleanup {
                self.store.flush(source.target());
            }
        }
        self.caches.clear();
        self.gates.read.open();
        info!("engine stopped");
        if self.config.db_cleanup {
            None
        } else {
            debug!("keeping the store for debugging");
            Some(self.store)
        }
    }
}

fn default_handler(target: &str, event: &Event) {
    match event.header.error {
        Some(errno) => error!(
            target,
            msg_type = event.header.msg_type,
            errno,
            "error message from source"
        ),
        None => trace!(target, msg_type = event.header.msg_type, "no handler"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{IFF_UP, RTM_NEWLINK, RTM_NEWRULE};
    use crate::value::Value;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn setup(config: NdbConfig) -> (Engine, EngineHandle) {
        let (queue, rx) = EventQueue::new(config.queue_capacity);
        let gates = Gates::default();
        let sources = Sources::new(queue.clone(), None, config.start_timeout);
        let engine = Engine::new(
            rx,
            queue.clone(),
            sources,
            Caches::default(),
            gates.clone(),
            Arc::new(config),
        );
        let handle = EngineHandle::new(queue, gates, Duration::from_secs(1));
        (engine, handle)
    }

    async fn sync(handle: &EngineHandle) {
        let notify = Arc::new(Notify::new());
        handle
            .queue()
            .put_control(Control::Sync {
                target: "test".into(),
                notify: notify.clone(),
            })
            .await
            .unwrap();
        notify.notified().await;
    }

    fn rule(seq: u32) -> Event {
        Event::new(RTM_NEWRULE).target("localhost").sequence(seq)
    }

    #[tokio::test]
    async fn test_reschedule_order() {
        let (mut engine, handle) = setup(NdbConfig::default());
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut refused = false;
        {
            let applied = applied.clone();
            engine.registry_mut().register(
                EventKind::Rule,
                Box::new(move |_, _, event| {
                    if event.header.sequence == 2 && !refused {
                        refused = true;
                        return Ok(Outcome::Reschedule);
                    }
                    applied.lock().unwrap().push(event.header.sequence);
                    Ok(Outcome::Continue)
                }),
            );
        }
        let task = tokio::spawn(engine.run());

        handle
            .queue()
            .put_events(Some("localhost"), vec![rule(1), rule(2), rule(3)])
            .await
            .unwrap();
        sync(&handle).await;
        assert_eq!(*applied.lock().unwrap(), vec![1, 3, 2]);

        handle.queue().shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reschedule_limit() {
        let (mut engine, handle) = setup(NdbConfig::default());
        let attempts = Arc::new(Mutex::new(0));
        {
            let attempts = attempts.clone();
            engine.registry_mut().register(
                EventKind::Rule,
                Box::new(move |_, _, _| {
                    *attempts.lock().unwrap() += 1;
                    Ok(Outcome::Reschedule)
                }),
            );
        }
        let task = tokio::spawn(engine.run());
        handle.queue().put_events(None, vec![rule(1)]).await.unwrap();
        for _ in 0..5 {
            sync(&handle).await;
        }
        // First attempt plus three retries.
        assert_eq!(*attempts.lock().unwrap(), 1 + MAX_RESCHEDULE as usize);

        handle.queue().shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_removes_handler() {
        let (engine, handle) = setup(NdbConfig::default());
        let task = tokio::spawn(engine.run());

        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let id = handle
            .execute(|reply| Command::Register {
                kind: EventKind::Rule,
                handler: Box::new(move |_, _, _| {
                    *counter.lock().unwrap() += 1;
                    Ok(Outcome::Invalidate)
                }),
                reply,
            })
            .await
            .unwrap();
        assert!(id > HandlerId(0));

        handle.queue().put_events(None, vec![rule(1), rule(2)]).await.unwrap();
        sync(&handle).await;
        assert_eq!(*calls.lock().unwrap(), 1);

        handle.queue().shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_shutdown_drains_batch() {
        let (mut engine, handle) = setup(NdbConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            engine.registry_mut().register(
                EventKind::Rule,
                Box::new(move |_, _, event| {
                    seen.lock().unwrap().push(event.header.sequence);
                    if event.header.sequence == 1 {
                        Ok(Outcome::Shutdown)
                    } else {
                        Ok(Outcome::Continue)
                    }
                }),
            );
        }
        let task = tokio::spawn(engine.run());
        handle
            .queue()
            .put_events(None, vec![rule(1), rule(2)])
            .await
            .unwrap();
        task.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert!(handle.queue().is_closed());
    }

    #[tokio::test]
    async fn test_default_handlers_and_fetch() {
        let (engine, handle) = setup(NdbConfig::default());
        let task = tokio::spawn(engine.run());

        let link = Event::new(RTM_NEWLINK)
            .target("localhost")
            .field("index", 2)
            .field("flags", IFF_UP)
            .attr("ifname", "eth0");
        handle.queue().put_events(None, vec![link]).await.unwrap();

        let rows = handle
            .query(|reply| Command::Fetch {
                table: TableId::Interfaces,
                filter: Filter::new().eq("ifname", "eth0"),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("state"), Some(&Value::from("up")));

        handle
            .queue()
            .put_control(Control::Flush("localhost".into()))
            .await
            .unwrap();
        let count = handle
            .query(|reply| Command::Count {
                table: TableId::Interfaces,
                filter: Filter::new(),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(count, 0);

        handle.queue().shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_lock() {
        let (engine, handle) = setup(NdbConfig::default());
        let task = tokio::spawn(engine.run());

        handle
            .queue()
            .put_control(Control::ReadLock("localhost".into()))
            .await
            .unwrap();
        sync(&handle).await;
        assert!(!handle.gates().read.is_open());
        handle
            .queue()
            .put_control(Control::ReadUnlock("localhost".into()))
            .await
            .unwrap();
        sync(&handle).await;
        assert!(handle.gates().read.is_open());

        handle.queue().shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_store_kept_without_cleanup() {
        let config = NdbConfig {
            db_cleanup: false,
            ..Default::default()
        };
        let (engine, handle) = setup(config);
        let task = tokio::spawn(engine.run());
        handle.queue().shutdown();
        assert!(task.await.unwrap().is_some());
    }
}
