//! In-memory relational store.
//!
//! The store holds one table per [`TableId`]. Rows are keyed by
//! `(target, tflags, index values)`, so the same object can exist once as
//! live state (`tflags == 0`), once marked as failed (`tflags == 1`) and
//! temporarily under a snapshot marker. Only the engine task owns a
//! `Store`; everything else reaches it through [`Command`](crate::engine::Command)s.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Weak;

use serde::Serialize;
use tracing::{debug, trace};

use crate::engine::Command;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::queue::{EventQueue, Message};
use crate::schema::{OnDelete, TableDescriptor, TableId};
use crate::value::{Fields, Value};

/// Transaction flag of live rows.
pub const TFLAGS_LIVE: i64 = 0;
/// Transaction flag of rows whose source failed.
pub const TFLAGS_FAILED: i64 = 1;

/// A stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub table: TableId,
    pub target: String,
    pub tflags: i64,
    /// Column values, in descriptor order.
    pub values: Vec<Value>,
}

impl Row {
    /// Get a column value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let pos = self.table.descriptor().position(name)?;
        self.values.get(pos)
    }

    /// Get any field, including `target` and `tflags`. Unknown names are null.
    pub fn field(&self, name: &str) -> Value {
        match name {
            "target" => Value::Str(self.target.clone()),
            "tflags" => Value::Int(self.tflags),
            _ => self.get(name).cloned().unwrap_or_default(),
        }
    }

    /// All fields as a map, including `target` and `tflags`.
    pub fn to_fields(&self) -> Fields {
        let mut fields: Fields = self
            .table
            .descriptor()
            .columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| (c.name.to_string(), v.clone()))
            .collect();
        fields.insert("target".into(), Value::Str(self.target.clone()));
        fields.insert("tflags".into(), Value::Int(self.tflags));
        fields
    }

    fn key(&self) -> IndexKey {
        IndexKey::new(self.table.descriptor(), &self.target, self.tflags, &self.values)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey {
    target: String,
    tflags: i64,
    values: Vec<Value>,
}

impl IndexKey {
    fn new(desc: &TableDescriptor, target: &str, tflags: i64, values: &[Value]) -> Self {
        let values = desc
            .index
            .iter()
            .map(|name| {
                desc.position(name)
                    .and_then(|pos| values.get(pos).cloned())
                    .unwrap_or_default()
            })
            .collect();
        Self {
            target: target.to_string(),
            tflags,
            values,
        }
    }
}

/// Equality filter over row fields.
///
/// # Example
///
/// ```ignore
/// let filter = Filter::new().eq("target", "localhost").eq("index", 2);
/// let rows = store.fetch(TableId::Addresses, &filter);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(Vec<(String, Value)>);

impl Filter {
    /// Create an empty (match-all) filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality term.
    pub fn eq(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(name, value);
        self
    }

    /// Add or replace an equality term.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.0.push((name, value)),
        }
    }

    /// Build a filter from the fields of `fields` that are columns of `table`
    /// (plus `target` and `tflags`).
    pub fn from_fields(table: TableId, fields: &Fields) -> Self {
        let desc = table.descriptor();
        let mut filter = Self::new();
        for (name, value) in fields {
            if name == "target" || name == "tflags" || desc.has_column(name) {
                filter.push(name.clone(), value.clone());
            }
        }
        filter
    }

    /// Check a row against every term.
    pub fn matches(&self, row: &Row) -> bool {
        self.0.iter().all(|(name, value)| row.field(name) == *value)
    }

    /// Iterate over the terms.
    pub fn terms(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// Snapshot identifier, also used as the transaction flag that marks rows
/// while they are copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(i64);

impl TxId {
    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        static NEXT: AtomicI64 = AtomicI64::new(0x10000);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The transaction flag value.
    pub fn mark(self) -> i64 {
        self.0
    }
}

/// Ownership token of a snapshot.
///
/// The store keeps a weak reference; dropping the last strong reference
/// asks the engine to release the snapshot, and the garbage collector
/// catches any release that could not be queued.
#[derive(Debug)]
pub struct SnapshotToken {
    txid: TxId,
    queue: EventQueue,
}

impl SnapshotToken {
    pub(crate) fn new(txid: TxId, queue: EventQueue) -> Self {
        Self { txid, queue }
    }

    /// Snapshot identifier.
    pub fn txid(&self) -> TxId {
        self.txid
    }
}

impl Drop for SnapshotToken {
    fn drop(&mut self) {
        let _ = self
            .queue
            .try_put(Message::Request(Command::Release { txid: self.txid }));
    }
}

#[derive(Debug)]
struct SnapshotSet {
    owner: Weak<SnapshotToken>,
    tables: BTreeMap<TableId, Vec<Row>>,
}

/// A logged raw event.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub table: TableId,
    pub event: Event,
}

/// Row counts, for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub rows: BTreeMap<String, usize>,
    pub snapshots: usize,
    pub log: usize,
}

/// The relational store.
#[derive(Debug)]
pub struct Store {
    tables: BTreeMap<TableId, BTreeMap<IndexKey, Row>>,
    snapshots: BTreeMap<TxId, SnapshotSet>,
    log: Option<Vec<LogEntry>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Store {
    /// Create an empty store. With `rtnl_log`, every loaded event is kept.
    pub fn new(rtnl_log: bool) -> Self {
        Self {
            tables: TableId::ALL.into_iter().map(|t| (t, BTreeMap::new())).collect(),
            snapshots: BTreeMap::new(),
            log: rtnl_log.then(Vec::new),
        }
    }

    fn table(&self, table: TableId) -> impl Iterator<Item = &Row> {
        self.tables.get(&table).into_iter().flat_map(|rows| rows.values())
    }

    fn table_mut(&mut self, table: TableId) -> &mut BTreeMap<IndexKey, Row> {
        self.tables.entry(table).or_default()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Fetch all rows matching `filter`.
    pub fn fetch(&self, table: TableId, filter: &Filter) -> Vec<Row> {
        self.table(table).filter(|r| filter.matches(r)).cloned().collect()
    }

    /// Fetch the first row matching `filter`.
    pub fn fetch_one(&self, table: TableId, filter: &Filter) -> Option<Row> {
        self.table(table).find(|r| filter.matches(r)).cloned()
    }

    /// Count rows matching `filter`.
    pub fn count(&self, table: TableId, filter: &Filter) -> usize {
        self.table(table).filter(|r| filter.matches(r)).count()
    }

    /// Row counts per table.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            rows: self
                .tables
                .iter()
                .map(|(t, rows)| (t.name().to_string(), rows.len()))
                .collect(),
            snapshots: self.snapshots.len(),
            log: self.log.as_ref().map_or(0, Vec::len),
        }
    }

    /// Logged raw events, if logging is enabled.
    pub fn log_entries(&self) -> &[LogEntry] {
        self.log.as_deref().unwrap_or_default()
    }

    /// Text dump of every table, one JSON object per row.
    pub fn export(&self) -> Result<String> {
        let mut out = String::new();
        for (table, rows) in &self.tables {
            out.push_str(&format!("table {} ({} rows)\n", table.name(), rows.len()));
            for row in rows.values() {
                out.push_str(&serde_json::to_string(&row.to_fields())?);
                out.push('\n');
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Keep a copy of a raw event when logging is enabled.
    pub fn log_event(&mut self, table: TableId, event: &Event) {
        if let Some(log) = self.log.as_mut() {
            log.push(LogEntry {
                table,
                event: event.clone(),
            });
        }
    }

    /// Insert a live row, or update the existing row with the same key in place.
    ///
    /// Fails with [`Error::ForeignKey`] when a cascading parent is missing.
    pub fn upsert(&mut self, table: TableId, target: &str, values: Vec<Value>) -> Result<()> {
        let desc = table.descriptor();
        if values.len() != desc.columns.len() {
            return Err(Error::invalid_value(
                table.name(),
                format!("expected {} values, got {}", desc.columns.len(), values.len()),
            ));
        }
        self.check_parents(desc, target, TFLAGS_LIVE, &values)?;
        let row = Row {
            table,
            target: target.to_string(),
            tflags: TFLAGS_LIVE,
            values,
        };
        let key = row.key();
        match self.table_mut(table).get_mut(&key) {
            Some(existing) => existing.values = row.values,
            None => {
                self.table_mut(table).insert(key, row);
            }
        }
        Ok(())
    }

    fn check_parents(
        &self,
        desc: &TableDescriptor,
        target: &str,
        tflags: i64,
        values: &[Value],
    ) -> Result<()> {
        for fk in desc.foreign_keys {
            if fk.on_delete != OnDelete::Cascade {
                continue;
            }
            let refs: Vec<&Value> = fk
                .fields
                .iter()
                .filter_map(|f| desc.position(f).and_then(|p| values.get(p)))
                .collect();
            if refs.len() != fk.fields.len() || refs.iter().any(|v| v.is_null()) {
                continue;
            }
            let found = self.table(fk.parent).any(|parent| {
                parent.target == target
                    && parent.tflags == tflags
                    && fk
                        .parent_fields
                        .iter()
                        .zip(&refs)
                        .all(|(f, v)| parent.field(f) == **v)
            });
            if !found {
                return Err(Error::ForeignKey {
                    table: desc.id.name(),
                    parent: fk.parent.name(),
                });
            }
        }
        Ok(())
    }

    /// Set one column on every row matching `filter`.
    ///
    /// Index columns are not updatable this way.
    pub fn update(&mut self, table: TableId, filter: &Filter, column: &str, value: Value) -> usize {
        let desc = table.descriptor();
        let Some(pos) = desc.position(column).filter(|_| !desc.is_index(column)) else {
            return 0;
        };
        let mut count = 0;
        for row in self.table_mut(table).values_mut() {
            if filter.matches(row) {
                row.values[pos] = value.clone();
                count += 1;
            }
        }
        count
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Delete rows matching `filter` (any transaction flag), cascading to
    /// dependent rows. Returns the number of rows removed from `table`.
    pub fn delete(&mut self, table: TableId, filter: &Filter) -> usize {
        let removed = self.remove_rows(table, |r| filter.matches(r));
        let count = removed.len();
        self.cascade_delete(table, &removed);
        count
    }

    fn remove_rows(&mut self, table: TableId, pred: impl Fn(&Row) -> bool) -> Vec<Row> {
        let rows = self.table_mut(table);
        let keys: Vec<IndexKey> = rows
            .iter()
            .filter(|(_, r)| pred(r))
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter().filter_map(|k| rows.remove(k)).collect()
    }

    fn cascade_delete(&mut self, table: TableId, removed: &[Row]) {
        if removed.is_empty() {
            return;
        }
        for (child, fk) in table.children() {
            if fk.on_delete != OnDelete::Cascade {
                continue;
            }
            for parent in removed {
                let refs: Vec<Value> = fk.parent_fields.iter().map(|f| parent.field(f)).collect();
                if refs.iter().any(Value::is_null) {
                    continue;
                }
                let gone = self.remove_rows(child, |r| {
                    r.target == parent.target
                        && r.tflags == parent.tflags
                        && fk.fields.iter().zip(&refs).all(|(f, v)| r.field(f) == *v)
                });
                if !gone.is_empty() {
                    trace!(table = %child, count = gone.len(), "cascade delete");
                }
                self.cascade_delete(child, &gone);
            }
        }
    }

    /// Drop every row of a target.
    pub fn flush(&mut self, target: &str) -> usize {
        let mut count = 0;
        for rows in self.tables.values_mut() {
            let before = rows.len();
            rows.retain(|k, _| k.target != target);
            count += before - rows.len();
        }
        debug!(target, count, "flushed target");
        count
    }

    /// Delete routes whose garbage-collection mark is older than `now - grace`.
    pub fn collect_routes(&mut self, now: i64, grace: i64) -> usize {
        let removed = self.remove_rows(TableId::Routes, |r| {
            r.get("gc_mark")
                .and_then(Value::as_int)
                .is_some_and(|mark| mark + grace < now)
        });
        let count = removed.len();
        self.cascade_delete(TableId::Routes, &removed);
        count
    }

    // ========================================================================
    // Marking and snapshots
    // ========================================================================

    fn rekey(&mut self, table: TableId, pred: impl Fn(&Row) -> bool, tflags: i64) -> Vec<Row> {
        let mut moved = self.remove_rows(table, pred);
        let rows = self.table_mut(table);
        for row in &mut moved {
            row.tflags = tflags;
            rows.insert(row.key(), row.clone());
        }
        moved
    }

    /// Set the transaction flag of every row of a target.
    pub fn mark_target(&mut self, target: &str, tflags: i64) -> usize {
        TableId::ALL
            .into_iter()
            .map(|t| self.rekey(t, |r| r.target == target, tflags).len())
            .sum()
    }

    /// Move matching rows from `from` to `to`, following every foreign key
    /// to dependent rows.
    pub fn mark_cascade(&mut self, table: TableId, filter: &Filter, from: i64, to: i64) -> usize {
        let moved = self.rekey(table, |r| r.tflags == from && filter.matches(r), to);
        let mut count = moved.len();
        for (child, fk) in table.children() {
            for parent in &moved {
                let refs: Vec<Value> = fk.parent_fields.iter().map(|f| parent.field(f)).collect();
                if refs.iter().any(Value::is_null) {
                    continue;
                }
                let mut child_filter = Filter::new().eq("target", parent.target.as_str());
                for (f, v) in fk.fields.iter().zip(refs) {
                    child_filter.push(*f, v);
                }
                count += self.mark_cascade(child, &child_filter, from, to);
            }
        }
        count
    }

    /// Copy the live row matching `filter` and all its dependents into a
    /// snapshot set identified by `txid`.
    ///
    /// Returns the copy of the object row, or `None` if no live row matches.
    pub fn snapshot(
        &mut self,
        txid: TxId,
        owner: Weak<SnapshotToken>,
        table: TableId,
        filter: &Filter,
    ) -> Option<Row> {
        let mark = txid.mark();
        let marked = self.mark_cascade(table, filter, TFLAGS_LIVE, mark);
        if marked == 0 {
            return None;
        }
        let mut tables = BTreeMap::new();
        for t in TableId::ALL {
            let copies: Vec<Row> = self
                .table(t)
                .filter(|r| r.tflags == mark)
                .map(|r| Row {
                    tflags: TFLAGS_LIVE,
                    ..r.clone()
                })
                .collect();
            if !copies.is_empty() {
                tables.insert(t, copies);
            }
            self.rekey(t, |r| r.tflags == mark, TFLAGS_LIVE);
        }
        let row = tables
            .get(&table)
            .and_then(|rows: &Vec<Row>| rows.iter().find(|r| filter.matches(r)).cloned());
        debug!(txid = mark, rows = marked, %table, "snapshot");
        self.snapshots.insert(txid, SnapshotSet { owner, tables });
        row
    }

    /// Rows captured by a snapshot that have no live counterpart, excluding
    /// the `exclude` table.
    pub fn snapshot_missing(&self, txid: TxId, exclude: TableId) -> Vec<Row> {
        let Some(set) = self.snapshots.get(&txid) else {
            return Vec::new();
        };
        let mut missing = Vec::new();
        for (table, rows) in &set.tables {
            if *table == exclude {
                continue;
            }
            let live = self.tables.get(table);
            for row in rows {
                if !live.is_some_and(|l| l.contains_key(&row.key())) {
                    missing.push(row.clone());
                }
            }
        }
        missing
    }

    /// Rows of one table held by a snapshot.
    pub fn snapshot_rows(&self, txid: TxId, table: TableId) -> Vec<Row> {
        self.snapshots
            .get(&txid)
            .and_then(|set| set.tables.get(&table))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop a snapshot.
    pub fn release(&mut self, txid: TxId) -> bool {
        self.snapshots.remove(&txid).is_some()
    }

    /// Drop snapshots whose owner is gone.
    pub fn purge_snapshots(&mut self) -> usize {
        let before = self.snapshots.len();
        self.snapshots.retain(|_, set| set.owner.strong_count() > 0);
        before - self.snapshots.len()
    }

    /// Number of snapshots held.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}
