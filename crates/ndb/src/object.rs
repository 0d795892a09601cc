//! Transactional objects.
//!
//! An [`RtnlObject`] is one interface, address, route, neighbour, rule or
//! namespace entry. Callers change its fields locally and then
//! [`commit`](RtnlObject::commit) the changes: the object sends one request
//! to the kernel through its source and waits until the change shows up in
//! the store, resyncing the target when it does not. A failed commit rolls
//! the kernel back to the snapshot taken before the request.
//!
//! # States
//!
//! | State | Meaning | Verb |
//! |---|---|---|
//! | `invalid` | does not exist in the kernel | create |
//! | `system` | exists and is loaded | modify |
//! | `remove` | marked for deletion | delete |
//! | `setns` | moving to another namespace | modify |
//! | `replace` | key fields change: create the new key, delete the old one | create |
//!
//! A change is confirmed when the last state transition is one of
//! [`LEGAL_TRANSITIONS`] and no changed field is left unconfirmed.
//!
//! # Example
//!
//! ```ignore
//! let eth0 = ndb.interfaces().get("eth0").await?;
//! eth0.set("mtu", 1400)?.set("state", "up")?;
//! eth0.commit().await?;
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::auth::{AuthSet, Permission};
use crate::db::Context;
use crate::engine::{Command, Handler, HandlerId, Outcome};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::handlers::column_value;
use crate::objects::{self, interface::DeferredOp};
use crate::queue::Message;
use crate::schema::TableId;
use crate::source::Source;
use crate::store::{Filter, Row, SnapshotToken, Store, TFLAGS_LIVE, TxId};
use crate::transport::Verb;
use crate::value::{Attrs, Fields, Value, format_fields};
use crate::view::{Selector, View};

/// Object state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    Invalid,
    System,
    Remove,
    Setns,
    Replace,
}

impl ObjectState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::System => "system",
            Self::Remove => "remove",
            Self::Setns => "setns",
            Self::Replace => "replace",
        }
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transitions that confirm an apply.
pub const LEGAL_TRANSITIONS: [(ObjectState, ObjectState); 5] = [
    (ObjectState::Invalid, ObjectState::System),
    (ObjectState::Remove, ObjectState::Invalid),
    (ObjectState::Setns, ObjectState::Invalid),
    (ObjectState::Setns, ObjectState::System),
    (ObjectState::Replace, ObjectState::System),
];

const STATE_LOG_DEPTH: usize = 8;

/// Recent states of an object; repeated states are recorded once.
#[derive(Debug, Clone, Default)]
pub struct StateLog(Vec<ObjectState>);

impl StateLog {
    pub fn new(state: ObjectState) -> Self {
        Self(vec![state])
    }

    pub fn set(&mut self, state: ObjectState) {
        if self.0.last() != Some(&state) {
            if self.0.len() == STATE_LOG_DEPTH {
                self.0.remove(0);
            }
            self.0.push(state);
        }
    }

    pub fn get(&self) -> ObjectState {
        self.0.last().copied().unwrap_or(ObjectState::Invalid)
    }

    /// The last two states.
    pub fn transition(&self) -> Option<(ObjectState, ObjectState)> {
        match self.0.as_slice() {
            [.., prev, last] => Some((*prev, *last)),
            _ => None,
        }
    }
}

/// Where an object reads its rows from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rows {
    Live,
    Snapshot(TxId),
}

/// Recovery action for an ignorable kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fallback {
    /// Treat as success.
    Ignore,
    /// The object exists already: send the fields as a modify request.
    ModifyThenReload,
    /// Create without `master`, then set it.
    CreateWithoutMaster,
    /// Dump the family so the existing entry gets loaded.
    Dump,
}

/// Errors every family tolerates.
pub(crate) fn default_fallback(verb: Verb, errno: i32) -> Option<Fallback> {
    match (verb, errno) {
        (Verb::Create, libc::EEXIST) => Some(Fallback::ModifyThenReload),
        (Verb::Create, libc::EAGAIN) => Some(Fallback::Ignore),
        (Verb::Modify, libc::ENODEV) => Some(Fallback::Ignore),
        (Verb::Delete, libc::ENODEV | libc::ENOENT | libc::ESRCH | libc::EADDRNOTAVAIL) => {
            Some(Fallback::Ignore)
        }
        _ => None,
    }
}

/// Per-family behaviour of objects.
#[async_trait]
pub(crate) trait ObjectClass: Send + Sync + fmt::Debug {
    fn table(&self) -> TableId;

    fn kind(&self) -> EventKind;

    /// Fields that identify an object whose index is not known yet.
    fn key_extra_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Key changes turn into create-new, delete-old.
    fn replace_on_key_change(&self) -> bool {
        false
    }

    /// Fields of a string selector, e.g. `"eth0"` or `"10.0.0.0/24"`.
    fn parse(&self, selector: &str) -> Result<Fields>;

    /// Fields of an integer selector.
    fn parse_index(&self, index: i64) -> Result<Fields> {
        Err(Error::invalid_value(
            self.table().name(),
            format!("no integer selectors ({index})"),
        ))
    }

    /// Complete or rewrite selector fields.
    fn normalize(&self, _fields: &mut Fields) {}

    /// Normalize a field value on assignment.
    fn normalize_value(&self, _name: &str, value: Value) -> Value {
        value
    }

    /// Compare an expected value with a loaded one.
    fn same_value(&self, _name: &str, expected: &Value, loaded: &Value) -> bool {
        expected == loaded
    }

    /// Whether a non-column field is loaded back, so it can be confirmed.
    fn is_loadable(&self, _name: &str, _fields: &Fields) -> bool {
        false
    }

    /// Fields naming an interface, resolved to its index before apply.
    fn references(&self) -> &'static [&'static str] {
        &[]
    }

    /// Reject incomplete create specs.
    fn check_create(&self, _fields: &Fields) -> Result<()> {
        Ok(())
    }

    fn fallback(&self, verb: Verb, errno: i32, _request: &Attrs) -> Option<Fallback> {
        default_fallback(verb, errno)
    }

    /// Fields a chained object inherits from its parent interface.
    fn chain_context(&self, _chain: &Fields) -> Fields {
        Fields::new()
    }

    /// Rows of a chained view.
    fn chain_filter(&self, _chain: &Fields) -> Filter {
        Filter::new()
    }

    /// Fields a rollback restores when they drifted from the snapshot.
    fn restore_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Last touch to an outgoing request.
    fn adjust_request(&self, _state: ObjectState, _fields: &Fields, _request: &mut Attrs) {}

    /// Summary columns; `ifname` is joined from `interfaces`.
    fn summary_columns(&self) -> &'static [&'static str];

    /// Column joined against `interfaces.index` for `ifname` in summaries.
    fn ifname_join(&self) -> Option<&'static str> {
        None
    }

    /// Fields from dependent tables merged into the object.
    async fn load_extra(
        &self,
        _ctx: &Context,
        _rows: Rows,
        _row: &Row,
        _fields: &mut Fields,
    ) -> Result<()> {
        Ok(())
    }

    /// Keys of same-family objects captured with a snapshot.
    async fn dependents(&self, _ctx: &Context, _fields: &Fields) -> Result<Vec<Fields>> {
        Ok(Vec::new())
    }
}

/// Index fields (plus target) of `fields`, with key-extra fields while the
/// index is incomplete.
pub(crate) fn key_of(class: &dyn ObjectClass, fields: &Fields) -> Fields {
    let desc = class.table().descriptor();
    let mut key = Fields::new();
    if let Some(target) = fields.get("target") {
        key.insert("target".into(), target.clone());
    }
    let mut complete = true;
    for name in desc.index {
        match fields.get(*name).filter(|v| !v.is_null()) {
            Some(value) => {
                key.insert(name.to_string(), desc.coerce(name, value.clone()));
            }
            None => complete = false,
        }
    }
    if !complete {
        for name in class.key_extra_fields() {
            if let Some(value) = fields.get(*name).filter(|v| !v.is_null()) {
                key.insert(name.to_string(), value.clone());
            }
        }
    }
    key
}

/// Object fields of a row: every column plus the class extras, without
/// bookkeeping columns.
pub(crate) async fn row_fields(
    ctx: &Context,
    class: &dyn ObjectClass,
    rows: Rows,
    row: &Row,
) -> Result<Fields> {
    let mut fields = row.to_fields();
    fields.remove("tflags");
    for name in row.table.descriptor().internal {
        fields.remove(*name);
    }
    class.load_extra(ctx, rows, row, &mut fields).await?;
    Ok(fields)
}

/// Index of the interface named `ifname`.
pub(crate) async fn resolve_ifname(
    ctx: &Context,
    target: &str,
    field: &str,
    ifname: &str,
) -> Result<i64> {
    let rows = ctx
        .fetch(
            Rows::Live,
            TableId::Interfaces,
            Filter::new().eq("target", target).eq("ifname", ifname),
        )
        .await?;
    rows.first()
        .and_then(|r| r.get("index"))
        .and_then(Value::as_int)
        .ok_or_else(|| Error::Unresolved {
            field: field.to_string(),
            reference: ifname.to_string(),
        })
}

/// Replace interface names in reference fields with indices.
pub(crate) async fn resolve_references(
    ctx: &Context,
    class: &dyn ObjectClass,
    target: &str,
    fields: &mut Fields,
) -> Result<()> {
    for name in class.references() {
        if let Some(Value::Str(ifname)) = fields.get(*name) {
            let index = resolve_ifname(ctx, target, name, ifname).await?;
            fields.insert(name.to_string(), Value::Int(index));
        }
    }
    Ok(())
}

// ============================================================================
// Snapshots
// ============================================================================

/// Point-in-time copy of an object and everything depending on it.
///
/// The copy lives in the store until the snapshot is dropped.
pub struct Snapshot {
    token: Arc<SnapshotToken>,
    table: TableId,
    fields: Fields,
    changed: BTreeSet<String>,
    deps: Vec<(RtnlObject, SavePoint)>,
}

impl Snapshot {
    pub fn txid(&self) -> TxId {
        self.token.txid()
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    /// Captured object fields.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Same-family objects captured alongside, e.g. bridge ports.
    pub fn deps(&self) -> impl Iterator<Item = &RtnlObject> {
        self.deps.iter().map(|(obj, _)| obj)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("txid", &self.txid())
            .field("table", &self.table)
            .field("fields", &format_fields(&self.fields))
            .field("deps", &self.deps.len())
            .finish()
    }
}

/// What a rollback restores.
#[derive(Debug, Clone)]
pub enum SavePoint {
    /// The object did not exist; rolling back removes it.
    Missing,
    Snapshot(Arc<Snapshot>),
}

// ============================================================================
// Objects
// ============================================================================

struct ObjectData {
    fields: Fields,
    changed: BTreeSet<String>,
    state: StateLog,
    last_save: Option<SavePoint>,
    replace: Option<RtnlObject>,
    script: Vec<DeferredOp>,
    script_saves: Vec<(RtnlObject, SavePoint)>,
    errors: Vec<String>,
    atime: Instant,
    // Bumped by every engine-side refresh; older store reads are dropped.
    epoch: u64,
}

pub(crate) struct ObjectInner {
    class: &'static dyn ObjectClass,
    ctx: Arc<Context>,
    auth: AuthSet,
    chain: Option<RtnlObject>,
    data: Mutex<ObjectData>,
    loaded: Notify,
    apply_lock: tokio::sync::Mutex<()>,
    handler: Mutex<Option<HandlerId>>,
}

impl Drop for ObjectInner {
    fn drop(&mut self) {
        let handler = self.handler.get_mut().ok().and_then(|h| h.take());
        if let Some(id) = handler {
            let _ = self
                .ctx
                .engine
                .queue()
                .try_put(Message::Request(Command::Unregister {
                    kind: self.class.kind(),
                    id,
                }));
        }
    }
}

/// A transactional network object. Clones share state.
#[derive(Clone)]
pub struct RtnlObject {
    inner: Arc<ObjectInner>,
}

impl fmt::Debug for RtnlObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        f.debug_struct("RtnlObject")
            .field("table", &self.inner.class.table())
            .field("key", &format_fields(&key_of(self.inner.class, &data.fields)))
            .field("state", &data.state.get())
            .field("changed", &data.changed)
            .finish()
    }
}

impl RtnlObject {
    pub(crate) fn new(
        class: &'static dyn ObjectClass,
        ctx: Arc<Context>,
        auth: AuthSet,
        chain: Option<RtnlObject>,
        fields: Fields,
    ) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                class,
                ctx,
                auth,
                chain,
                data: Mutex::new(ObjectData {
                    fields,
                    changed: BTreeSet::new(),
                    state: StateLog::new(ObjectState::Invalid),
                    last_save: None,
                    replace: None,
                    script: Vec::new(),
                    script_saves: Vec::new(),
                    errors: Vec::new(),
                    atime: Instant::now(),
                    epoch: 0,
                }),
                loaded: Notify::new(),
                apply_lock: tokio::sync::Mutex::new(()),
                handler: Mutex::new(None),
            }),
        }
    }

    fn data(&self) -> MutexGuard<'_, ObjectData> {
        self.inner
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn detached(&self, fields: Fields, state: ObjectState) -> Self {
        let obj = Self::new(
            self.inner.class,
            self.inner.ctx.clone(),
            self.inner.auth.clone(),
            None,
            fields,
        );
        obj.data().state.set(state);
        obj
    }

    pub(crate) fn class(&self) -> &'static dyn ObjectClass {
        self.inner.class
    }

    pub(crate) fn ctx(&self) -> &Arc<Context> {
        &self.inner.ctx
    }

    pub(crate) fn auth(&self) -> &AuthSet {
        &self.inner.auth
    }

    // ------------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------------

    /// Table of the object.
    pub fn table(&self) -> TableId {
        self.inner.class.table()
    }

    /// Target the object lives on.
    pub fn target(&self) -> String {
        self.get("target")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| self.inner.ctx.config.localhost.clone())
    }

    /// Get a field.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.data().fields.get(name).cloned()
    }

    /// Get an integer field.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.as_int())
    }

    /// All fields.
    pub fn fields(&self) -> Fields {
        self.data().fields.clone()
    }

    /// Key fields identifying the object.
    pub fn key(&self) -> Fields {
        key_of(self.inner.class, &self.data().fields)
    }

    /// Current state.
    pub fn state(&self) -> ObjectState {
        self.data().state.get()
    }

    /// The last state transition.
    pub fn transition(&self) -> Option<(ObjectState, ObjectState)> {
        self.data().state.transition()
    }

    /// Fields changed locally and not confirmed yet.
    pub fn changed(&self) -> BTreeSet<String> {
        self.data().changed.clone()
    }

    /// Failures collected while restoring dependent rows in a rollback.
    pub fn errors(&self) -> Vec<String> {
        self.data().errors.clone()
    }

    /// The save point of the last apply.
    pub fn last_save(&self) -> Option<SavePoint> {
        self.data().last_save.clone()
    }

    /// Nothing to commit.
    pub fn is_clean(&self) -> bool {
        let data = self.data();
        data.state.get() == ObjectState::System && data.changed.is_empty() && data.script.is_empty()
    }

    /// Check whether two handles refer to the same object.
    pub fn ptr_eq(&self, other: &RtnlObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Set a field. The change is local until committed.
    ///
    /// Changing a key field of an existing object fails with
    /// [`Error::KeyFieldChange`] unless the family replaces objects on key
    /// change.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<&Self> {
        let class = self.inner.class;
        let value = class.normalize_value(name, value.into());
        let desc = class.table().descriptor();
        let mut data = self.data();
        if data.fields.get(name).is_some_and(|v| *v == value) {
            return Ok(self);
        }
        if data.state.get() == ObjectState::System && desc.is_index(name) {
            if !class.replace_on_key_change() {
                return Err(Error::KeyFieldChange(name.to_string()));
            }
            if data.replace.is_none() {
                debug!(table = %desc.id, key = %format_fields(&key_of(class, &data.fields)), "prepare replace");
                data.replace = Some(self.detached(data.fields.clone(), ObjectState::System));
            }
            data.state.set(ObjectState::Replace);
        }
        if name == "net_ns_fd" {
            data.state.set(ObjectState::Setns);
        }
        if name != "target" {
            data.changed.insert(name.to_string());
        }
        data.fields.insert(name.to_string(), value);
        Ok(self)
    }

    /// Mark the object for removal.
    pub fn remove(&self) -> &Self {
        self.data().state.set(ObjectState::Remove);
        self
    }

    /// The object's fields as pretty JSON.
    pub fn show(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.fields())?)
    }

    pub(crate) fn touch(&self) {
        self.data().atime = Instant::now();
    }

    /// Held by nobody but the cache, clean and idle for longer than `expire`.
    pub(crate) fn is_evictable(&self, expire: Duration) -> bool {
        if Arc::strong_count(&self.inner) > 1 {
            return false;
        }
        let Ok(data) = self.inner.data.try_lock() else {
            return false;
        };
        data.changed.is_empty() && data.script.is_empty() && data.atime.elapsed() > expire
    }

    pub(crate) fn push_op(&self, op: DeferredOp) {
        self.data().script.push(op);
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    fn load_value(class: &dyn ObjectClass, data: &mut ObjectData, name: &str, value: &Value) {
        if !data.changed.contains(name) {
            data.fields.insert(name.to_string(), value.clone());
            return;
        }
        let expected = data.fields.get(name).cloned().unwrap_or_default();
        if expected == *value || class.same_value(name, &expected, value) {
            data.changed.remove(name);
            data.fields.insert(name.to_string(), value.clone());
        }
    }

    fn apply_loaded(&self, loaded: Option<&Fields>) {
        let class = self.inner.class;
        let mut data = self.data();
        match loaded {
            None => {
                if data.state.get() != ObjectState::Invalid {
                    data.state.set(ObjectState::Invalid);
                    data.changed.clear();
                }
            }
            Some(fields) => {
                if !matches!(data.state.get(), ObjectState::Remove | ObjectState::Setns) {
                    for (name, value) in fields {
                        Self::load_value(class, &mut data, name, value);
                    }
                    data.state.set(ObjectState::System);
                }
            }
        }
    }

    /// Reload the object from the store.
    pub(crate) async fn load(&self) -> Result<bool> {
        let class = self.inner.class;
        let ctx = &self.inner.ctx;
        let key = self.key();
        let epoch = self.data().epoch;
        let rows = ctx
            .fetch(Rows::Live, class.table(), Filter::from_fields(class.table(), &key))
            .await?;
        let loaded = match rows.first() {
            Some(row) => Some(row_fields(ctx, class, Rows::Live, row).await?),
            None => None,
        };
        if self.data().epoch != epoch {
            trace!(table = %class.table(), "newer event applied, dropping reload");
            return Ok(self.state() != ObjectState::Invalid);
        }
        self.apply_loaded(loaded.as_ref());
        Ok(loaded.is_some())
    }

    /// Engine-side refresh on a matching event.
    fn on_event(&self, store: &Store, target: &str, event: &Event) {
        let class = self.inner.class;
        let table = class.table();
        let desc = table.descriptor();
        let key = self.key();
        for (name, value) in &key {
            let matches = if name == "target" {
                value.as_str() == Some(target)
            } else {
                let path = desc.column(name).map_or(&[][..], |c| c.path);
                column_value(table, event, name, path) == *value
            };
            if !matches {
                return;
            }
        }
        self.data().epoch += 1;
        if event.is_delete() {
            let mut data = self.data();
            data.state.set(ObjectState::Invalid);
            data.changed.clear();
        } else {
            let filter = Filter::from_fields(table, &key).eq("tflags", TFLAGS_LIVE);
            if let Some(row) = store.fetch_one(table, &filter) {
                let mut fields = row.to_fields();
                fields.remove("tflags");
                for name in desc.internal {
                    fields.remove(*name);
                }
                self.apply_loaded(Some(&fields));
            }
        }
        self.inner.loaded.notify_one();
    }

    /// Subscribe to the family's events.
    pub(crate) async fn register(&self) -> Result<()> {
        if self
            .inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.inner);
        let handler: Handler = Box::new(move |store, target, event| {
            let Some(inner) = weak.upgrade() else {
                return Ok(Outcome::Invalidate);
            };
            RtnlObject { inner }.on_event(store, target, event);
            Ok(Outcome::Continue)
        });
        let kind = self.inner.class.kind();
        let id = self
            .inner
            .ctx
            .engine
            .execute(|reply| Command::Register {
                kind,
                handler,
                reply,
            })
            .await?;
        *self
            .inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);
        Ok(())
    }

    /// Reload and check whether the pending change is confirmed.
    pub async fn check(&self) -> Result<bool> {
        self.load().await?;
        let data = self.data();
        let legal = data
            .state
            .transition()
            .is_some_and(|t| LEGAL_TRANSITIONS.contains(&t));
        Ok(legal && data.changed.is_empty())
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// Capture the object and its dependents.
    ///
    /// Returns [`SavePoint::Missing`] when the object is not in the store.
    pub async fn snapshot(&self) -> Result<SavePoint> {
        let class = self.inner.class;
        let ctx = &self.inner.ctx;
        let table = class.table();
        let (key, changed) = {
            let data = self.data();
            let key = match &data.replace {
                Some(old) => old.key(),
                None => key_of(class, &data.fields),
            };
            (key, data.changed.clone())
        };
        let token = Arc::new(SnapshotToken::new(TxId::next(), ctx.engine.queue().clone()));
        let txid = token.txid();
        let owner = Arc::downgrade(&token);
        let filter = Filter::from_fields(table, &key);
        let row = ctx
            .engine
            .query(|reply| Command::Snapshot {
                txid,
                owner,
                table,
                filter,
                reply,
            })
            .await?;
        let Some(row) = row else {
            return Ok(SavePoint::Missing);
        };
        let fields = row_fields(ctx, class, Rows::Snapshot(txid), &row).await?;

        let mut deps = Vec::new();
        let view = View::new(ctx.clone(), class, self.inner.auth.clone(), None);
        for dep_key in class.dependents(ctx, &fields).await? {
            let dep = match view.get(Selector::Fields(dep_key)).await {
                Ok(dep) => dep,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let save = Box::pin(dep.snapshot()).await?;
            deps.push((dep, save));
        }
        debug!(txid = txid.mark(), %table, deps = deps.len(), "snapshot");
        Ok(SavePoint::Snapshot(Arc::new(Snapshot {
            token,
            table,
            fields,
            changed,
            deps,
        })))
    }

    // ------------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------------

    async fn resolve(&self) -> Result<()> {
        let class = self.inner.class;
        if let Some(chain) = &self.inner.chain {
            let context = class.chain_context(&chain.fields());
            let mut data = self.data();
            for (name, value) in context {
                if data.fields.get(&name).is_none_or(Value::is_null) {
                    data.fields.insert(name, value);
                }
            }
        }
        let target = self.target();
        let mut fields = self.fields();
        resolve_references(&self.inner.ctx, class, &target, &mut fields).await?;
        let mut data = self.data();
        for name in class.references() {
            if let Some(value) = fields.remove(*name) {
                data.fields.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    fn build_request(&self) -> (ObjectState, Verb, Attrs) {
        let class = self.inner.class;
        let desc = class.table().descriptor();
        let data = self.data();
        let state = data.state.get();

        let mut request = Attrs::new();
        for name in desc.index {
            if let Some(value) = data.fields.get(*name).filter(|v| !v.is_null()) {
                request.set(*name, value.clone());
            }
        }
        let prime = request.clone();
        for name in &data.changed {
            if let Some(value) = data.fields.get(name) {
                request.set(name.as_str(), value.clone());
            }
        }
        let verb = match state {
            ObjectState::Invalid | ObjectState::Replace => {
                for (name, value) in &data.fields {
                    if value.is_null()
                        || name == "target"
                        || desc.internal.contains(&name.as_str())
                        || request.contains(name)
                    {
                        continue;
                    }
                    request.set(name.as_str(), value.clone());
                }
                Verb::Create
            }
            ObjectState::System | ObjectState::Setns => Verb::Modify,
            ObjectState::Remove => {
                request = prime;
                Verb::Delete
            }
        };
        class.adjust_request(state, &data.fields, &mut request);
        (state, verb, request)
    }

    async fn send(&self, source: &Source, verb: Verb, request: Attrs) -> Result<()> {
        let class = self.inner.class;
        let kind = class.kind();
        let err = match source.api(kind, verb, request.clone()).await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        let Some(fallback) = err.errno().and_then(|errno| class.fallback(verb, errno, &request))
        else {
            return Err(err);
        };
        debug!(%kind, %verb, error = %err, ?fallback, "kernel error, falling back");
        match fallback {
            Fallback::Ignore => {}
            Fallback::ModifyThenReload => {
                if let Err(e) = source.api(kind, Verb::Modify, request).await {
                    debug!(%kind, error = %e, "fallback modify failed");
                }
            }
            Fallback::Dump => {
                source.api(kind, Verb::Dump, Attrs::new()).await?;
            }
            Fallback::CreateWithoutMaster => {
                let mut request = request;
                let master = request.remove("master");
                source.api(kind, Verb::Create, request.clone()).await?;
                if let Some(master) = master {
                    let mut modify = Attrs::new();
                    if let Some(ifname) = request.get("ifname") {
                        modify.set("ifname", ifname.clone());
                    }
                    modify.set("master", master);
                    source.api(kind, Verb::Modify, modify).await?;
                }
            }
        }
        Ok(())
    }

    /// Forget changed fields the kernel never reports back.
    fn drop_transient(&self) {
        let class = self.inner.class;
        let desc = class.table().descriptor();
        let mut data = self.data();
        let fields = data.fields.clone();
        data.changed
            .retain(|name| desc.has_column(name) || class.is_loadable(name, &fields));
    }

    async fn confirm(&self, source: &Source) -> Result<()> {
        let ctx = &self.inner.ctx;
        let apply = &ctx.config.apply;
        for attempt in 0..apply.attempts {
            let wait = apply.wait_time(attempt + 1, ctx.engine.queue().depth());
            let _ = tokio::time::timeout(wait, self.inner.loaded.notified()).await;
            if self.check().await? {
                return Ok(());
            }
        }
        let table = self.table();
        for attempt in 0..apply.resync_attempts {
            warn!(%table, key = %format_fields(&self.key()), attempt, "change not confirmed, resyncing");
            source.resync(apply.wait_max * apply.attempts.max(1)).await?;
            if self.check().await? {
                return Ok(());
            }
        }
        Err(Error::CouldNotApply {
            table: table.name().to_string(),
            key: format_fields(&self.key()),
        })
    }

    async fn run_script(&self) -> Result<()> {
        let ops = std::mem::take(&mut self.data().script);
        for op in ops {
            let saves = Box::pin(op.run(self)).await?;
            self.data().script_saves.extend(saves);
        }
        Ok(())
    }

    /// Send the pending change and wait until the kernel confirms it.
    ///
    /// Unlike [`commit`](Self::commit), a failure is not rolled back.
    pub async fn apply(&self) -> Result<&Self> {
        self.apply_with(false).await?;
        Ok(self)
    }

    async fn apply_with(&self, rollback: bool) -> Result<()> {
        let inner = &self.inner;
        let ctx = &inner.ctx;
        let table = inner.class.table();
        let _guard = inner.apply_lock.lock().await;
        if !rollback {
            self.data().last_save = None;
        }
        ctx.engine
            .gates()
            .write
            .wait(ctx.engine.gate_timeout())
            .await?;
        let target = self.target();
        inner.auth.check(table, &target, Permission::Modify)?;
        self.register().await?;

        self.resolve().await?;
        if !rollback {
            let save = match self.state() {
                ObjectState::Invalid => SavePoint::Missing,
                _ => self.snapshot().await?,
            };
            self.data().last_save = Some(save);
        }

        if self.state() == ObjectState::System {
            let filter = Filter::from_fields(table, &self.key());
            if ctx.count(table, filter).await? == 0 {
                self.data().state.set(ObjectState::Invalid);
            }
        }

        let (state, verb, request) = self.build_request();
        debug!(%table, %target, %state, %verb, request = %request, "apply");
        let source = ctx.sources.get(&target)?;
        self.send(&source, verb, request).await?;
        self.drop_transient();
        self.confirm(&source).await?;

        if state == ObjectState::Replace {
            let old = self.data().replace.clone();
            if let Some(old) = old {
                old.remove();
                Box::pin(old.apply_with(false)).await?;
            }
        }
        if !rollback {
            self.run_script().await?;
        }
        debug!(%table, %target, "applied");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Commit and rollback
    // ------------------------------------------------------------------------

    /// Apply the pending changes, rolling back on failure.
    ///
    /// A clean object is left alone. A new object that fails to apply gets
    /// its fields back; anything else is rolled back to the snapshot taken
    /// before the request, and a failing rollback is chained to the error.
    pub async fn commit(&self) -> Result<&Self> {
        if self.is_clean() {
            return Ok(self);
        }
        if let Some(chain) = &self.inner.chain {
            Box::pin(chain.commit()).await?;
        }
        if self.state() == ObjectState::Invalid {
            let saved = self.fields();
            if let Err(e) = self.apply_with(false).await {
                self.data().fields = saved;
                return Err(e);
            }
            return Ok(self);
        }
        match self.apply_with(false).await {
            Ok(()) => {
                self.data().replace = None;
                Ok(self)
            }
            Err(e) if self.last_save().is_none() => Err(e),
            Err(e) => {
                warn!(table = %self.table(), error = %e, "commit failed, rolling back");
                match Box::pin(self.rollback(None)).await {
                    Ok(_) => Err(e),
                    Err(Error::Rollback { rollback, .. }) => Err(Error::Rollback {
                        source: Box::new(e),
                        rollback,
                    }),
                    Err(r) => Err(Error::Rollback {
                        source: Box::new(e),
                        rollback: vec![r],
                    }),
                }
            }
        }
    }

    /// Restore the kernel state captured by `save`, or by the last apply.
    ///
    /// Deferred operations are undone first, newest first. Then the object
    /// itself, the dependents captured with it, and finally rows that
    /// vanished with it (addresses, routes) are recreated.
    pub async fn rollback(&self, save: Option<SavePoint>) -> Result<&Self> {
        let save = match save.or_else(|| self.last_save()) {
            Some(save) => save,
            None => return Err(Error::InvalidState("nothing to roll back".into())),
        };
        let class = self.inner.class;
        let ctx = &self.inner.ctx;
        let table = class.table();
        let mut errors = Vec::new();

        let script_saves = std::mem::take(&mut self.data().script_saves);
        for (obj, save) in script_saves.into_iter().rev() {
            if let Err(e) = Box::pin(obj.rollback(Some(save))).await {
                warn!(table = %obj.table(), error = %e, "deferred rollback failed");
                errors.push(e);
            }
        }

        match &save {
            SavePoint::Missing => {
                self.data().changed.clear();
                if self.load().await? {
                    debug!(%table, "rollback: removing created object");
                    self.remove();
                    self.apply_with(true).await?;
                }
            }
            SavePoint::Snapshot(snapshot) => {
                let replaced = self.data().replace.take();
                let live = ctx
                    .fetch(
                        Rows::Live,
                        table,
                        Filter::from_fields(table, &key_of(class, &snapshot.fields)),
                    )
                    .await?;
                let mut changed = snapshot.changed.clone();
                let state = match live.first() {
                    Some(row) => {
                        for name in class.restore_fields() {
                            let saved = snapshot.fields.get(*name).cloned().unwrap_or_default();
                            if !class.same_value(name, &saved, &row.field(name)) {
                                changed.insert(name.to_string());
                            }
                        }
                        ObjectState::System
                    }
                    None => ObjectState::Invalid,
                };
                let restorer = self.detached(snapshot.fields.clone(), state);
                restorer.data().changed = changed;
                debug!(%table, %state, "rollback: restoring snapshot");
                Box::pin(restorer.apply_with(true)).await?;

                if replaced.is_some() {
                    let current = self.detached(self.fields(), ObjectState::System);
                    current.remove();
                    if let Err(e) = Box::pin(current.apply_with(true)).await {
                        errors.push(e);
                    }
                    self.data().fields = snapshot.fields.clone();
                }

                for (dep, dep_save) in &snapshot.deps {
                    if let Err(e) = Box::pin(dep.rollback(Some(dep_save.clone()))).await {
                        warn!(table = %dep.table(), error = %e, "dependent rollback failed");
                        errors.push(e);
                    }
                }

                let txid = snapshot.txid();
                let missing = ctx
                    .engine
                    .query(|reply| Command::SnapshotMissing {
                        txid,
                        exclude: table,
                        reply,
                    })
                    .await?;
                for row in missing {
                    let Some(row_class) = objects::class_for(row.table) else {
                        continue;
                    };
                    let fields = row_fields(ctx, row_class, Rows::Snapshot(txid), &row).await?;
                    let obj = RtnlObject::new(
                        row_class,
                        ctx.clone(),
                        self.inner.auth.clone(),
                        None,
                        fields,
                    );
                    if let Err(e) = Box::pin(obj.apply_with(true)).await {
                        warn!(table = %row.table, error = %e, "could not restore dependent row");
                        self.data().errors.push(format!("{}: {e}", row.table));
                    }
                }
                self.data().changed.clear();
                self.load().await?;
            }
        }

        if errors.is_empty() {
            Ok(self)
        } else {
            Err(Error::Rollback {
                source: Box::new(Error::InvalidState("rollback incomplete".into())),
                rollback: errors,
            })
        }
    }

    /// A view restricted to this object, e.g. the addresses of an interface.
    pub(crate) fn chained_view(&self, table: TableId) -> Result<View> {
        let class = objects::class_for(table)
            .ok_or_else(|| Error::invalid_value("table", format!("no objects in {table}")))?;
        Ok(View::new(
            self.inner.ctx.clone(),
            class,
            self.inner.auth.clone(),
            Some(self.clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_log() {
        let mut log = StateLog::new(ObjectState::Invalid);
        assert_eq!(log.transition(), None);
        log.set(ObjectState::System);
        log.set(ObjectState::System);
        assert_eq!(
            log.transition(),
            Some((ObjectState::Invalid, ObjectState::System))
        );
        log.set(ObjectState::Remove);
        log.set(ObjectState::Invalid);
        assert_eq!(log.get(), ObjectState::Invalid);
        assert!(LEGAL_TRANSITIONS.contains(&log.transition().unwrap()));

        for _ in 0..20 {
            log.set(ObjectState::System);
            log.set(ObjectState::Remove);
        }
        assert_eq!(
            log.transition(),
            Some((ObjectState::System, ObjectState::Remove))
        );
    }

    #[test]
    fn test_default_fallbacks() {
        assert_eq!(
            default_fallback(Verb::Create, libc::EEXIST),
            Some(Fallback::ModifyThenReload)
        );
        assert_eq!(default_fallback(Verb::Delete, libc::ESRCH), Some(Fallback::Ignore));
        assert_eq!(
            default_fallback(Verb::Delete, libc::EADDRNOTAVAIL),
            Some(Fallback::Ignore)
        );
        assert_eq!(default_fallback(Verb::Modify, libc::ENODEV), Some(Fallback::Ignore));
        assert_eq!(default_fallback(Verb::Modify, libc::EPERM), None);
        assert_eq!(default_fallback(Verb::Create, libc::EINVAL), None);
    }

    #[test]
    fn test_key_of() {
        let class = objects::class_for(TableId::Interfaces).unwrap();
        let mut fields = Fields::new();
        fields.insert("target".into(), "localhost".into());
        fields.insert("ifname".into(), "dummy0".into());
        fields.insert("mtu".into(), 1500.into());
        let key = key_of(class, &fields);
        assert_eq!(key.len(), 2);
        assert_eq!(key.get("ifname"), Some(&Value::from("dummy0")));

        fields.insert("index".into(), 7.into());
        let key = key_of(class, &fields);
        assert_eq!(key.get("index"), Some(&Value::Int(7)));
        assert!(!key.contains_key("ifname"));
    }
}
