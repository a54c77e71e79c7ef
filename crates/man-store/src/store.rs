//! The row-store capability interface consumed by the rest of the core.
//! Grounded on `original_source/orchestrator/providers/database/base.py`: a
//! single `select`/`select_one`/`insert`/`upsert`/`update`/`delete` surface,
//! replacing the source's duck-typed "database provider" protocol (spec.md
//! §9 Design Notes). Every call site in this workspace uses exactly this
//! trait; the in-memory implementation below backs tests and the `test`
//! CLI mode, and a real deployment wires in an adapter over its table store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// An equality filter set: a row matches when every key is present with an
/// equal value. An absent key in the filter set means "don't care".
pub type Filters = BTreeMap<String, Value>;

/// One opaque record. Tables in this workspace store one JSON object per
/// row under well-known keys (`id`, `tenant_id`, `idempotency_key`, ...).
pub type Row = Map<String, Value>;

fn row_matches(row: &Row, filters: &Filters) -> bool {
    filters.iter().all(|(k, v)| row.get(k) == Some(v))
}

/// The narrow store contract §6 requires: `select`, `select_one`, `insert`,
/// `upsert(record, conflict_columns)`, `update(filters, updates)`, `delete`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn select(&self, table: &str, filters: &Filters) -> anyhow::Result<Vec<Row>>;

    async fn select_one(&self, table: &str, filters: &Filters) -> anyhow::Result<Option<Row>>;

    async fn insert(&self, table: &str, record: Row) -> anyhow::Result<Row>;

    /// Insert `record`, or replace the existing row whose `conflict_columns`
    /// all match, whichever applies. Treats `Value::Null` conflict-column
    /// values as equal, matching the `man_policies` unique index semantics
    /// in spec.md §6.
    async fn upsert(&self, table: &str, record: Row, conflict_columns: &[&str]) -> anyhow::Result<Row>;

    /// Apply `updates` to every row matching `filters`; returns the first
    /// updated row, or `None` if nothing matched.
    async fn update(&self, table: &str, filters: &Filters, updates: Row) -> anyhow::Result<Option<Row>>;

    async fn delete(&self, table: &str, filters: &Filters) -> anyhow::Result<u64>;
}

/// Process-local, mutex-guarded implementation used by the `test` CLI mode
/// and by this workspace's integration tests. Not meant to survive a
/// restart; a production deployment implements `Store` over its own table
/// engine instead.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn select(&self, table: &str, filters: &Filters) -> anyhow::Result<Vec<Row>> {
        let tables = self.tables.lock().unwrap();
        let rows = tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| row_matches(r, filters)).cloned().collect())
            .unwrap_or_default();
        Ok(rows)
    }

    async fn select_one(&self, table: &str, filters: &Filters) -> anyhow::Result<Option<Row>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| row_matches(r, filters)).cloned()))
    }

    async fn insert(&self, table: &str, record: Row) -> anyhow::Result<Row> {
        let mut tables = self.tables.lock().unwrap();
        tables.entry(table.to_string()).or_default().push(record.clone());
        Ok(record)
    }

    async fn upsert(&self, table: &str, record: Row, conflict_columns: &[&str]) -> anyhow::Result<Row> {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        let conflict_matches = |row: &Row| {
            conflict_columns.iter().all(|col| {
                let existing = row.get(*col).unwrap_or(&Value::Null);
                let incoming = record.get(*col).unwrap_or(&Value::Null);
                existing == incoming
            })
        };
        if let Some(slot) = rows.iter_mut().find(|r| conflict_matches(r)) {
            *slot = record.clone();
            return Ok(record);
        }
        rows.push(record.clone());
        Ok(record)
    }

    async fn update(&self, table: &str, filters: &Filters, updates: Row) -> anyhow::Result<Option<Row>> {
        let mut tables = self.tables.lock().unwrap();
        let mut first_updated = None;
        if let Some(rows) = tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| row_matches(r, filters)) {
                for (k, v) in &updates {
                    row.insert(k.clone(), v.clone());
                }
                if first_updated.is_none() {
                    first_updated = Some(row.clone());
                }
            }
        }
        Ok(first_updated)
    }

    async fn delete(&self, table: &str, filters: &Filters) -> anyhow::Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !row_matches(r, filters));
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[tokio::test]
    async fn insert_then_select_roundtrips() {
        let store = InMemoryStore::new();
        store
            .insert("widgets", row(&[("id", json!("w1")), ("color", json!("red"))]))
            .await
            .unwrap();

        let mut filters = Filters::new();
        filters.insert("color".to_string(), json!("red"));
        let found = store.select("widgets", &filters).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], json!("w1"));
    }

    #[tokio::test]
    async fn upsert_replaces_on_conflict_columns() {
        let store = InMemoryStore::new();
        store
            .upsert(
                "widgets",
                row(&[("id", json!("w1")), ("tenant", json!("t1")), ("color", json!("red"))]),
                &["tenant", "id"],
            )
            .await
            .unwrap();
        store
            .upsert(
                "widgets",
                row(&[("id", json!("w1")), ("tenant", json!("t1")), ("color", json!("blue"))]),
                &["tenant", "id"],
            )
            .await
            .unwrap();

        let all = store.select("widgets", &Filters::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["color"], json!("blue"));
    }

    #[tokio::test]
    async fn update_only_touches_matching_rows() {
        let store = InMemoryStore::new();
        store.insert("widgets", row(&[("id", json!("w1")), ("status", json!("PENDING"))])).await.unwrap();
        store.insert("widgets", row(&[("id", json!("w2")), ("status", json!("PENDING"))])).await.unwrap();

        let mut filters = Filters::new();
        filters.insert("id".to_string(), json!("w1"));
        let updated = store
            .update("widgets", &filters, row(&[("status", json!("APPROVED"))]))
            .await
            .unwrap();
        assert_eq!(updated.unwrap()["status"], json!("APPROVED"));

        let mut check = Filters::new();
        check.insert("id".to_string(), json!("w2"));
        let untouched = store.select_one("widgets", &check).await.unwrap().unwrap();
        assert_eq!(untouched["status"], json!("PENDING"));
    }

    #[tokio::test]
    async fn delete_returns_count_removed() {
        let store = InMemoryStore::new();
        store.insert("widgets", row(&[("id", json!("w1"))])).await.unwrap();
        store.insert("widgets", row(&[("id", json!("w2"))])).await.unwrap();

        let removed = store.delete("widgets", &Filters::new()).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.select("widgets", &Filters::new()).await.unwrap().is_empty());
    }
}
