//! The database handle.
//!
//! [`Ndb`] starts the engine task and the configured sources, and hands out
//! views, transactions and maintenance operations. Clones share one engine;
//! [`Ndb::close`] (or dropping the last clone) shuts it down.
//!
//! ```ignore
//! use ndb::Ndb;
//!
//! let ndb = Ndb::builder().connector(connector).build().await?;
//! for record in ndb.interfaces().summary().await? {
//!     println!("{:?}", record.get("ifname"));
//! }
//! ndb.close().await?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::auth::{AuthManager, AuthSet, Permission};
use crate::config::NdbConfig;
use crate::engine::{Command, Engine, EngineHandle, Handler, HandlerId};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::gate::{Gates, ReadOnlyGuard};
use crate::object::Rows;
use crate::objects;
use crate::queue::{Control, EventQueue};
use crate::schema::TableId;
use crate::source::{SourceKind, SourceSpec, Sources};
use crate::store::{Filter, Row, Store, StoreStats, TFLAGS_LIVE};
use crate::transaction::Transaction;
use crate::transport::Connector;
use crate::view::{Caches, View};

/// Shared state of the API side.
pub(crate) struct Context {
    pub(crate) engine: EngineHandle,
    pub(crate) sources: Sources,
    pub(crate) config: Arc<NdbConfig>,
    pub(crate) caches: Caches,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("sources", &self.sources)
            .field("caches", &self.caches)
            .finish()
    }
}

impl Context {
    /// Fetch live or snapshot rows.
    pub(crate) async fn fetch(&self, rows: Rows, table: TableId, filter: Filter) -> Result<Vec<Row>> {
        match rows {
            Rows::Live => {
                let filter = filter.eq("tflags", TFLAGS_LIVE);
                self.engine
                    .query(|reply| Command::Fetch {
                        table,
                        filter,
                        reply,
                    })
                    .await
            }
            Rows::Snapshot(txid) => {
                self.engine
                    .query(|reply| Command::SnapshotRows {
                        txid,
                        table,
                        filter,
                        reply,
                    })
                    .await
            }
        }
    }

    /// Count live rows.
    pub(crate) async fn count(&self, table: TableId, filter: Filter) -> Result<usize> {
        let filter = filter.eq("tflags", TFLAGS_LIVE);
        self.engine
            .query(|reply| Command::Count {
                table,
                filter,
                reply,
            })
            .await
    }
}

struct Shared {
    ctx: Arc<Context>,
    task: Mutex<Option<JoinHandle<Option<Store>>>>,
    kept: Mutex<Option<Store>>,
    closed: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.ctx.engine.queue().shutdown();
    }
}

/// Builder for [`Ndb`].
pub struct NdbBuilder {
    config: NdbConfig,
    connector: Option<Arc<dyn Connector>>,
    sources: Vec<SourceSpec>,
    handlers: Vec<(EventKind, Handler)>,
}

impl fmt::Debug for NdbBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdbBuilder")
            .field("config", &self.config)
            .field("connector", &self.connector)
            .field("sources", &self.sources)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl NdbBuilder {
    fn new() -> Self {
        Self {
            config: NdbConfig::default(),
            connector: None,
            sources: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Replace the configuration.
    pub fn config(mut self, config: NdbConfig) -> Self {
        self.config = config;
        self
    }

    /// Default connector for sources without their own.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Add a source, on top of the configured ones.
    pub fn source(mut self, spec: SourceSpec) -> Self {
        self.sources.push(spec);
        self
    }

    /// Register an event handler before the engine starts.
    pub fn handler(mut self, kind: EventKind, handler: Handler) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    /// Start the engine and the sources; returns once every source has
    /// loaded its initial dump.
    pub async fn build(self) -> Result<Ndb> {
        let config = Arc::new(self.config);
        let (queue, rx) = EventQueue::new(config.queue_capacity);
        let gates = Gates::default();
        let caches = Caches::default();
        let sources = Sources::new(queue.clone(), self.connector, config.start_timeout);

        let mut engine = Engine::new(
            rx,
            queue.clone(),
            sources.clone(),
            caches.clone(),
            gates.clone(),
            config.clone(),
        );
        for (kind, handler) in self.handlers {
            engine.registry_mut().register(kind, handler);
        }
        let task = tokio::spawn(engine.run().instrument(info_span!("ndb_engine")));

        let ctx = Arc::new(Context {
            engine: EngineHandle::new(queue, gates, config.gate_timeout),
            sources: sources.clone(),
            config: config.clone(),
            caches,
        });
        let ndb = Ndb {
            shared: Arc::new(Shared {
                ctx,
                task: Mutex::new(Some(task)),
                kept: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
            auth: AuthSet::default(),
        };

        let mut specs = config.sources.clone();
        specs.extend(self.sources);
        if specs.is_empty() {
            specs.push(SourceSpec::new(config.localhost.clone()));
        }
        for spec in specs {
            let target = spec.target.clone();
            if let Err(e) = sources.add(spec).await {
                warn!(target, error = %e, "source did not start");
                ndb.close().await?;
                return Err(e);
            }
        }
        info!(sources = sources.targets().len(), "database ready");
        Ok(ndb)
    }
}

/// Handle to a network-state database. Cheap to clone.
#[derive(Clone)]
pub struct Ndb {
    shared: Arc<Shared>,
    auth: AuthSet,
}

impl fmt::Debug for Ndb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ndb")
            .field("ctx", &self.shared.ctx)
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Ndb {
    /// Start building a database.
    pub fn builder() -> NdbBuilder {
        NdbBuilder::new()
    }

    /// Start a database from a configuration and a default connector.
    pub async fn new(config: NdbConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::builder().config(config).connector(connector).build().await
    }

    fn ctx(&self) -> &Arc<Context> {
        &self.shared.ctx
    }

    /// Configuration in use.
    pub fn config(&self) -> &NdbConfig {
        &self.ctx().config
    }

    // ------------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------------

    /// View of a table holding objects.
    pub fn view(&self, table: TableId) -> Result<View> {
        let class = objects::class_for(table)
            .ok_or_else(|| Error::invalid_value("table", format!("no objects in {table}")))?;
        Ok(View::new(self.ctx().clone(), class, self.auth.clone(), None))
    }

    fn table_view(&self, class: &'static dyn crate::object::ObjectClass) -> View {
        View::new(self.ctx().clone(), class, self.auth.clone(), None)
    }

    pub fn interfaces(&self) -> View {
        self.table_view(&objects::interface::Interface)
    }

    pub fn addresses(&self) -> View {
        self.table_view(&objects::address::Address)
    }

    pub fn routes(&self) -> View {
        self.table_view(&objects::route::Route)
    }

    pub fn neighbours(&self) -> View {
        self.table_view(&objects::neighbour::Neighbour)
    }

    /// Bridge forwarding database.
    pub fn fdb(&self) -> View {
        self.table_view(&objects::neighbour::Fdb)
    }

    pub fn rules(&self) -> View {
        self.table_view(&objects::rule::Rule)
    }

    pub fn netns(&self) -> View {
        self.table_view(&objects::netns::Netns)
    }

    /// Live rows of any table.
    pub async fn fetch(&self, table: TableId, filter: Filter) -> Result<Vec<Row>> {
        let target = filter
            .terms()
            .find(|(name, _)| *name == "target")
            .and_then(|(_, value)| value.as_str().map(str::to_string))
            .unwrap_or_else(|| self.config().localhost.clone());
        self.auth.check(table, &target, Permission::List)?;
        self.ctx().fetch(Rows::Live, table, filter).await
    }

    // ------------------------------------------------------------------------
    // Sources and maintenance
    // ------------------------------------------------------------------------

    /// Source registry.
    pub fn sources(&self) -> &Sources {
        &self.ctx().sources
    }

    /// Start a transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::new()
    }

    /// Keep the database read-only while the guard lives. Applies wait on
    /// the write gate and fail with [`Error::Timeout`] if it stays closed.
    pub fn readonly(&self) -> ReadOnlyGuard {
        ReadOnlyGuard::new(self.ctx().engine.gates().write.clone())
    }

    /// Restart the sources of the given kinds; all sources when empty.
    pub async fn reload(&self, kinds: &[SourceKind]) -> Result<()> {
        for source in self.sources().list() {
            if kinds.is_empty() || kinds.contains(&source.spec().kind) {
                source.restart("reload").await?;
            }
        }
        Ok(())
    }

    /// Wait until everything queued for `target` so far is loaded.
    pub async fn sync(&self, target: &str) -> Result<()> {
        let notify = Arc::new(Notify::new());
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.ctx()
            .engine
            .queue()
            .put_control(Control::Sync {
                target: target.to_string(),
                notify: notify.clone(),
            })
            .await?;
        tokio::time::timeout(self.ctx().engine.gate_timeout(), notified)
            .await
            .map_err(|_| Error::Timeout(format!("sync {target}")))
    }

    /// Text dump of every table.
    ///
    /// After [`close`](Self::close) with `db_cleanup` off, the kept store
    /// is dumped.
    pub async fn export(&self) -> Result<String> {
        let target = &self.config().localhost;
        for table in TableId::ALL {
            self.auth.check(table, target, Permission::List)?;
        }
        if let Some(store) = self.shared.kept.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return store.export();
        }
        self.ctx()
            .engine
            .execute(|reply| Command::Export { reply })
            .await?
    }

    /// Row counts per table.
    pub async fn stats(&self) -> Result<StoreStats> {
        self.ctx()
            .engine
            .execute(|reply| Command::Stats { reply })
            .await
    }

    /// Register an event handler.
    pub async fn register_handler(&self, kind: EventKind, handler: Handler) -> Result<HandlerId> {
        self.ctx()
            .engine
            .execute(|reply| Command::Register {
                kind,
                handler,
                reply,
            })
            .await
    }

    /// Remove an event handler.
    pub async fn unregister_handler(&self, kind: EventKind, id: HandlerId) -> Result<()> {
        self.ctx()
            .engine
            .send(Command::Unregister { kind, id })
            .await
    }

    /// A handle whose operations are checked by `manager`, on top of this
    /// handle's own managers. Objects are cached per handle.
    pub fn auth_proxy(&self, manager: Arc<dyn AuthManager>) -> Ndb {
        Ndb {
            shared: self.shared.clone(),
            auth: self.auth.with(manager),
        }
    }

    /// Shut the engine down: close every source, flush their rows (unless
    /// `db_cleanup` is off) and wait for the engine to stop. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing database");
        self.ctx().engine.queue().shutdown();
        let task = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let store = task
                .await
                .map_err(|e| Error::Transport(format!("engine task: {e}")))?;
            *self.shared.kept.lock().unwrap_or_else(PoisonError::into_inner) = store;
        }
        info!("database closed");
        Ok(())
    }

    /// Check whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}
