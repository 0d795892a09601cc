//! Views and the object cache.
//!
//! A [`View`] is the entry point to one table: keyed lookup returning cached
//! [`RtnlObject`]s, creation of new objects, and flat dumps that never build
//! objects. Views obtained from an interface
//! ([`RtnlObject::ipaddr`] and friends) are restricted to that interface and
//! fill in its index when creating objects.
//!
//! ```ignore
//! let eth0 = ndb.interfaces().get("eth0").await?;
//! let same = ndb.interfaces().get(Spec::new().with("index", eth0.get_int("index"))).await?;
//! assert!(eth0.ptr_eq(&same));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::auth::{AuthSet, Permission};
use crate::db::Context;
use crate::error::{Error, Result};
use crate::object::{ObjectClass, RtnlObject, Rows, key_of, resolve_references};
use crate::report::RecordSet;
use crate::schema::TableId;
use crate::store::{Filter, Row};
use crate::value::{Fields, Value, format_fields};

/// Selector fields built up by hand.
///
/// ```ignore
/// let spec = Spec::new().with("ifname", "vlan101").with("kind", "vlan").with("link", "eth0");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Spec(Fields);

impl Spec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn into_fields(self) -> Fields {
        self.0
    }
}

/// How to find (or describe) an object.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Family-specific string: an interface name, `"10.0.0.1/24"`, `"default"`.
    Name(String),
    /// Interface index, rule priority.
    Index(i64),
    /// Explicit fields.
    Fields(Fields),
}

impl From<&str> for Selector {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Selector {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<i32> for Selector {
    fn from(index: i32) -> Self {
        Self::Index(index.into())
    }
}

impl From<i64> for Selector {
    fn from(index: i64) -> Self {
        Self::Index(index)
    }
}

impl From<u32> for Selector {
    fn from(index: u32) -> Self {
        Self::Index(index.into())
    }
}

impl From<Fields> for Selector {
    fn from(fields: Fields) -> Self {
        Self::Fields(fields)
    }
}

impl From<Spec> for Selector {
    fn from(spec: Spec) -> Self {
        Self::Fields(spec.0)
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct CacheKey {
    auth: u64,
    table: TableId,
    key: Vec<(String, Value)>,
}

impl CacheKey {
    fn new(auth: u64, table: TableId, key: &Fields) -> Self {
        Self {
            auth,
            table,
            key: key.iter().map(|(n, v)| (n.clone(), v.clone())).collect(),
        }
    }
}

/// Objects handed out by views, one per key and authorization set.
#[derive(Clone, Default)]
pub(crate) struct Caches {
    map: Arc<Mutex<BTreeMap<CacheKey, RtnlObject>>>,
}

impl fmt::Debug for Caches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caches").field("len", &self.len()).finish()
    }
}

impl Caches {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<CacheKey, RtnlObject>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, key: &CacheKey) -> Option<RtnlObject> {
        self.lock().get(key).cloned()
    }

    /// Insert `obj` unless another task got there first; returns the cached one.
    fn insert(&self, key: CacheKey, obj: RtnlObject) -> RtnlObject {
        self.lock().entry(key).or_insert(obj).clone()
    }

    /// Drop objects only the cache holds that are clean and idle for longer
    /// than `expire`.
    pub(crate) fn sweep(&self, expire: Duration) -> usize {
        let evicted: Vec<RtnlObject> = {
            let mut map = self.lock();
            let keys: Vec<CacheKey> = map
                .iter()
                .filter(|(_, obj)| obj.is_evictable(expire))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| map.remove(k)).collect()
        };
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted cached objects");
        }
        evicted.len()
    }

    pub(crate) fn clear(&self) {
        let objects = std::mem::take(&mut *self.lock());
        drop(objects);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn count(&self, auth: u64, table: TableId) -> usize {
        self.lock()
            .keys()
            .filter(|k| k.auth == auth && k.table == table)
            .count()
    }
}

// ============================================================================
// Views
// ============================================================================

/// Entry point to one table. Cheap to clone.
#[derive(Clone)]
pub struct View {
    ctx: Arc<Context>,
    class: &'static dyn ObjectClass,
    auth: AuthSet,
    chain: Option<RtnlObject>,
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("table", &self.class.table())
            .field("chain", &self.chain)
            .finish()
    }
}

impl View {
    pub(crate) fn new(
        ctx: Arc<Context>,
        class: &'static dyn ObjectClass,
        auth: AuthSet,
        chain: Option<RtnlObject>,
    ) -> Self {
        Self {
            ctx,
            class,
            auth,
            chain,
        }
    }

    /// Table of the view.
    pub fn table(&self) -> TableId {
        self.class.table()
    }

    pub(crate) fn class(&self) -> &'static dyn ObjectClass {
        self.class
    }

    fn default_target(&self) -> String {
        match &self.chain {
            Some(chain) => chain.target(),
            None => self.ctx.config.localhost.clone(),
        }
    }

    /// Parse and normalize a selector, without defaults.
    pub(crate) fn selector_fields(&self, selector: Selector) -> Result<Fields> {
        let mut fields = match selector {
            Selector::Name(name) => self.class.parse(&name)?,
            Selector::Index(index) => self.class.parse_index(index)?,
            Selector::Fields(fields) => fields,
        };
        self.class.normalize(&mut fields);
        Ok(fields)
    }

    /// Selector fields with the target and chain context filled in.
    fn prepare(&self, selector: Selector) -> Result<Fields> {
        let mut fields = self.selector_fields(selector)?;
        fields
            .entry("target".to_string())
            .or_insert_with(|| Value::Str(self.default_target()));
        if let Some(chain) = &self.chain {
            for (name, value) in self.class.chain_context(&chain.fields()) {
                fields.entry(name).or_insert(value);
            }
        }
        Ok(fields)
    }

    fn chain_filter(&self) -> Filter {
        let mut filter = Filter::new();
        if let Some(chain) = &self.chain {
            let fields = chain.fields();
            filter = self.class.chain_filter(&fields);
            filter.push("target", Value::Str(chain.target()));
        }
        filter
    }

    fn target_of(fields: &Fields) -> String {
        fields
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// Complete `fields` to a full key from the store, if a row matches.
    async fn complete_key(&self, fields: &Fields) -> Result<Option<Fields>> {
        let table = self.table();
        let desc = table.descriptor();
        let present: Fields = fields
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(n, v)| (n.clone(), desc.coerce(n, v.clone())))
            .collect();
        let rows = self
            .ctx
            .fetch(Rows::Live, table, Filter::from_fields(table, &present))
            .await?;
        Ok(rows.first().map(|row| {
            let mut complete = present.clone();
            complete.insert("target".into(), Value::Str(row.target.clone()));
            for name in desc.index {
                complete.insert(name.to_string(), row.field(name));
            }
            complete
        }))
    }

    /// Look an object up, returning the cached instance for its key.
    ///
    /// Fails with [`Error::KeyNotFound`] when no row matches.
    pub async fn get(&self, selector: impl Into<Selector>) -> Result<RtnlObject> {
        let table = self.table();
        let mut fields = self.prepare(selector.into())?;
        let target = Self::target_of(&fields);
        self.auth.check(table, &target, Permission::Read)?;
        resolve_references(&self.ctx, self.class, &target, &mut fields).await?;

        let complete = self
            .complete_key(&fields)
            .await?
            .ok_or_else(|| Error::KeyNotFound(format!("{table} {}", format_fields(&fields))))?;
        let key = key_of(self.class, &complete);
        let cache_key = CacheKey::new(self.auth.id(), table, &key);
        if let Some(obj) = self.ctx.caches.get(&cache_key) {
            obj.touch();
            return Ok(obj);
        }

        self.ctx.caches.sweep(self.ctx.config.cache_expire);
        let obj = RtnlObject::new(
            self.class,
            self.ctx.clone(),
            self.auth.clone(),
            self.chain.clone(),
            key,
        );
        obj.load().await?;
        obj.register().await?;
        debug!(%table, key = %format_fields(&obj.key()), "cached");
        Ok(self.ctx.caches.insert(cache_key, obj))
    }

    /// Start a new object. Nothing is sent until it is committed.
    ///
    /// Fails with [`Error::ObjectExists`] when the spec matches a live row.
    pub async fn create(&self, spec: impl Into<Selector>) -> Result<RtnlObject> {
        let table = self.table();
        let mut fields = self.prepare(spec.into())?;
        let target = Self::target_of(&fields);
        self.auth.check(table, &target, Permission::Modify)?;
        self.class.check_create(&fields)?;

        let mut lookup = fields.clone();
        if resolve_references(&self.ctx, self.class, &target, &mut lookup)
            .await
            .is_ok()
            && lookup.keys().any(|name| name != "target")
            && self.complete_key(&lookup).await?.is_some()
        {
            return Err(Error::ObjectExists(format!(
                "{table} {}",
                format_fields(&lookup)
            )));
        }

        let base = Fields::from([("target".to_string(), Value::Str(target))]);
        fields.remove("target");
        let obj = RtnlObject::new(
            self.class,
            self.ctx.clone(),
            self.auth.clone(),
            self.chain.clone(),
            base,
        );
        for (name, value) in fields {
            obj.set(&name, value)?;
        }
        obj.register().await?;
        Ok(obj)
    }

    /// Check whether a row matches the selector.
    pub async fn exists(&self, selector: impl Into<Selector>) -> Result<bool> {
        let mut fields = self.prepare(selector.into())?;
        let target = Self::target_of(&fields);
        self.auth.check(self.table(), &target, Permission::Read)?;
        match resolve_references(&self.ctx, self.class, &target, &mut fields).await {
            Ok(()) => {}
            Err(Error::Unresolved { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        Ok(self.complete_key(&fields).await?.is_some())
    }

    async fn rows(&self) -> Result<Vec<Row>> {
        let target = self.default_target();
        self.auth.check(self.table(), &target, Permission::List)?;
        self.ctx
            .fetch(Rows::Live, self.table(), self.chain_filter())
            .await
    }

    /// Every column of every row.
    pub async fn dump(&self) -> Result<RecordSet> {
        let rows = self.rows().await?;
        let desc = self.table().descriptor();
        let mut names = vec!["target".to_string(), "tflags".to_string()];
        names.extend(desc.columns.iter().map(|c| c.name.to_string()));
        let records = rows
            .into_iter()
            .map(|row| {
                let mut values = vec![Value::Str(row.target), Value::Int(row.tflags)];
                values.extend(row.values);
                values
            })
            .collect();
        Ok(RecordSet::new(names, records))
    }

    /// The family's summary columns, with interface names joined in.
    pub async fn summary(&self) -> Result<RecordSet> {
        let rows = self.rows().await?;
        let mut ifnames: BTreeMap<(String, i64), Value> = BTreeMap::new();
        if let Some(join) = self.class.ifname_join() {
            let interfaces = self
                .ctx
                .fetch(Rows::Live, TableId::Interfaces, Filter::new())
                .await?;
            for iface in interfaces {
                if let Some(index) = iface.get("index").and_then(Value::as_int) {
                    ifnames.insert((iface.target.clone(), index), iface.field("ifname"));
                }
            }
            debug!(table = %self.table(), join, "summary join");
        }

        let columns = self.class.summary_columns();
        let mut names = vec!["target".to_string(), "tflags".to_string()];
        names.extend(columns.iter().map(|c| c.to_string()));
        let records = rows
            .into_iter()
            .map(|row| {
                let mut values = vec![Value::Str(row.target.clone()), Value::Int(row.tflags)];
                for column in columns {
                    let value = match (self.class.ifname_join(), *column) {
                        (Some(join), "ifname") => row
                            .get(join)
                            .and_then(Value::as_int)
                            .and_then(|index| ifnames.get(&(row.target.clone(), index)).cloned())
                            .unwrap_or_default(),
                        _ => row.field(column),
                    };
                    values.push(value);
                }
                values
            })
            .collect();
        Ok(RecordSet::new(names, records))
    }

    /// Number of live rows.
    pub async fn count(&self) -> Result<usize> {
        let target = self.default_target();
        self.auth.check(self.table(), &target, Permission::List)?;
        self.ctx.count(self.table(), self.chain_filter()).await
    }

    /// Objects of this table held in the cache for this view's credentials.
    pub fn cached(&self) -> usize {
        self.ctx.caches.count(self.auth.id(), self.table())
    }
}
